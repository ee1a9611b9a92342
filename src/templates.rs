//! Template store for prompt axes.
//!
//! One JSON document per axis lives under
//! `<template_root>/<data_task>/<problem_task>/`. Each document is an
//! arbitrarily nested object whose leaves are template strings; a selector
//! such as `persona-expert` walks the object one dash-separated key at a time.

use crate::render::RenderError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the outer prompt document at the template root
pub const GENERAL_PROMPT_FILE: &str = "classification_general_prompt.json";

/// Errors raised while loading or resolving templates
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Template directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Template document for axis {0} is not loaded")]
    MissingDocument(Axis),

    #[error("Cannot resolve {axis} selector `{selector}`: key `{key}` not found")]
    Resolution {
        axis: Axis,
        selector: String,
        key: String,
    },

    #[error("{axis} selector `{selector}` does not point at a template string")]
    NotALeaf { axis: Axis, selector: String },

    #[error("Invalid label definitions for selector `{selector}`: {source}")]
    InvalidLabelDefinitions {
        selector: String,
        #[source]
        source: RenderError,
    },

    #[error("Template rendering failed: {0}")]
    Render(#[from] RenderError),

    #[error("Failed to parse template document {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// One independent dimension of prompt construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    SystemInstruction,
    TaskQuery,
    PromptStrategy,
    ContextInput,
    LabelDef,
    OutputIndicator,
}

impl Axis {
    /// All axes in prompt order
    pub const ALL: [Self; 6] = [
        Self::SystemInstruction,
        Self::TaskQuery,
        Self::PromptStrategy,
        Self::ContextInput,
        Self::LabelDef,
        Self::OutputIndicator,
    ];

    /// File name of the axis document
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::SystemInstruction => "System_Instruction.json",
            Self::TaskQuery => "Task_Query.json",
            Self::PromptStrategy => "Prompt_Strategy.json",
            Self::ContextInput => "Context_Input.json",
            Self::LabelDef => "Label_Def.json",
            Self::OutputIndicator => "Output_Indicator.json",
        }
    }

    /// Short flag name used on the command line
    #[must_use]
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::SystemInstruction => "SI",
            Self::TaskQuery => "TQ",
            Self::PromptStrategy => "PS",
            Self::ContextInput => "CT",
            Self::LabelDef => "LD",
            Self::OutputIndicator => "OI",
        }
    }

    fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|axis| axis.file_name() == name)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Separator between keys of a selector
pub const SELECTOR_SEPARATOR: char = '-';

/// Axis documents for one (data task, problem task) pair
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    documents: HashMap<Axis, Value>,
}

impl TemplateStore {
    /// Load every axis document found under `<root>/<data_task>/<problem_task>/`
    ///
    /// # Errors
    ///
    /// Returns an error if the directory does not exist or a document is not
    /// valid JSON.
    pub fn load<P: AsRef<Path>>(
        root: P,
        data_task: &str,
        problem_task: &str,
    ) -> Result<Self, TemplateError> {
        let dir: PathBuf = root.as_ref().join(data_task).join(problem_task);
        if !dir.is_dir() {
            return Err(TemplateError::DirectoryNotFound(dir.display().to_string()));
        }

        let mut documents = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(axis) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(Axis::from_file_name)
            else {
                continue;
            };

            let content = std::fs::read_to_string(&path)?;
            let document =
                serde_json::from_str(&content).map_err(|source| TemplateError::Json {
                    path: path.display().to_string(),
                    source,
                })?;
            documents.insert(axis, document);
        }

        tracing::debug!(
            dir = %dir.display(),
            documents = documents.len(),
            "Loaded template store"
        );

        Ok(Self { documents })
    }

    /// Build a store from in-memory documents
    #[must_use]
    pub fn from_documents(documents: HashMap<Axis, Value>) -> Self {
        Self { documents }
    }

    /// Check whether the document for an axis is loaded
    #[must_use]
    pub fn has_axis(&self, axis: Axis) -> bool {
        self.documents.contains_key(&axis)
    }

    /// Resolve a selector to the template string at its path
    ///
    /// # Errors
    ///
    /// Returns `TemplateError::Resolution` if any key on the path is absent,
    /// `TemplateError::NotALeaf` if the path ends on something other than a
    /// string, or `TemplateError::MissingDocument` if the axis has no document.
    pub fn resolve(&self, axis: Axis, selector: &str) -> Result<&str, TemplateError> {
        let mut node = self
            .documents
            .get(&axis)
            .ok_or(TemplateError::MissingDocument(axis))?;

        for key in selector.split(SELECTOR_SEPARATOR) {
            node = node
                .as_object()
                .and_then(|object| object.get(key))
                .ok_or_else(|| TemplateError::Resolution {
                    axis,
                    selector: selector.to_string(),
                    key: key.to_string(),
                })?;
        }

        node.as_str().ok_or_else(|| TemplateError::NotALeaf {
            axis,
            selector: selector.to_string(),
        })
    }

    /// List every selector that resolves to a template string on an axis
    #[must_use]
    pub fn selectors(&self, axis: Axis) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(document) = self.documents.get(&axis) {
            collect_leaf_paths(document, &mut Vec::new(), &mut out);
        }
        out.sort();
        out
    }
}

fn collect_leaf_paths<'a>(node: &'a Value, path: &mut Vec<&'a str>, out: &mut Vec<String>) {
    match node {
        Value::String(_) if !path.is_empty() => {
            out.push(path.join(&SELECTOR_SEPARATOR.to_string()));
        }
        Value::Object(object) => {
            for (key, child) in object {
                path.push(key);
                collect_leaf_paths(child, path, out);
                path.pop();
            }
        }
        _ => {}
    }
}

/// System and user wrapper templates for one shot regime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTemplates {
    /// Wraps `{system_instruction}` and `{task_query}`
    pub system: String,
    /// Wraps `{few_shot}`, `{prompt_strategy}`, `{context}`, `{label_def}`, `{output_indicator}`
    pub user: String,
}

/// Fixed outer prompt that embeds the assembled axes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralPrompt {
    /// Wrapper used when no shots are injected
    pub zero_shot: RoleTemplates,
    /// Wrapper used when the run carries shot memory
    pub few_shot: RoleTemplates,
}

impl GeneralPrompt {
    /// Load the outer prompt document from the template root
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(template_root: P) -> Result<Self, TemplateError> {
        let path = template_root.as_ref().join(GENERAL_PROMPT_FILE);
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|source| TemplateError::Json {
            path: path.display().to_string(),
            source,
        })
    }

    /// Select the wrapper for a run with `shot` in-context examples
    #[must_use]
    pub const fn for_shots(&self, shot: usize) -> &RoleTemplates {
        if shot > 0 {
            &self.few_shot
        } else {
            &self.zero_shot
        }
    }
}

impl Default for GeneralPrompt {
    fn default() -> Self {
        let templates = RoleTemplates {
            system: "{system_instruction}{task_query}".to_string(),
            user: "{few_shot}{prompt_strategy}{context}{label_def}{output_indicator}".to_string(),
        };
        Self {
            zero_shot: templates.clone(),
            few_shot: templates,
        }
    }
}

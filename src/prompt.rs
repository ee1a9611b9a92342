//! Prompt assembly.
//!
//! A [`PromptGenerator`] holds the resolved template of every axis for one
//! selector tuple and turns an [`Example`] into a [`PromptRecord`].

use crate::dataset::Example;
use crate::render::{conditional_format, format_strict, parse_literal_mapping, render_mapping, FieldValue};
use crate::templates::{Axis, RoleTemplates, TemplateError, TemplateStore};
use serde::{Deserialize, Serialize};

/// Template of the few-shot slot
const FEW_SHOT_TEMPLATE: &str = "{shot_memory}";

/// Conjunction marker inside compound label names such as `anger & disgust`
const LABEL_CONJUNCTION: char = '&';

/// One selector per axis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisSelectors {
    /// System instruction (`SI`)
    #[serde(rename = "SI")]
    pub system_instruction: String,
    /// Task query (`TQ`)
    #[serde(rename = "TQ")]
    pub task_query: String,
    /// Prompt strategy (`PS`)
    #[serde(rename = "PS")]
    pub prompt_strategy: String,
    /// Context framing (`CT`)
    #[serde(rename = "CT")]
    pub context: String,
    /// Label definitions (`LD`)
    #[serde(rename = "LD")]
    pub label_def: String,
    /// Output indicator (`OI`)
    #[serde(rename = "OI")]
    pub output_indicator: String,
}

impl AxisSelectors {
    /// Selector for an axis
    #[must_use]
    pub fn get(&self, axis: Axis) -> &str {
        match axis {
            Axis::SystemInstruction => &self.system_instruction,
            Axis::TaskQuery => &self.task_query,
            Axis::PromptStrategy => &self.prompt_strategy,
            Axis::ContextInput => &self.context,
            Axis::LabelDef => &self.label_def,
            Axis::OutputIndicator => &self.output_indicator,
        }
    }
}

/// How a record is being built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShotMode {
    /// The item currently being queried
    #[default]
    Basic,
    /// An exemplar going into shot memory
    FewShot,
}

/// Label definitions restricted to an example's candidate labels
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LabelDef {
    /// No candidate label has a definition; renders as the empty string
    #[default]
    Empty,
    /// Definitions in candidate label order
    Mapping(Vec<(String, String)>),
}

impl LabelDef {
    /// Text substituted for `{label_def}`
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Mapping(pairs) => render_mapping(pairs),
        }
    }

    /// Whether no definition survived the restriction
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Structured prompt for one example
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRecord {
    pub few_shot: String,
    pub system_instruction: String,
    pub task_query: String,
    pub prompt_strategy: String,
    pub context: String,
    pub label_def: LabelDef,
    pub output_indicator: String,
}

impl PromptRecord {
    /// Wrap the record in the outer system and user templates
    ///
    /// # Errors
    ///
    /// Returns an error if a wrapper names a placeholder outside the record.
    pub fn split(&self, wrapper: &RoleTemplates) -> Result<(String, String), TemplateError> {
        let system = format_strict(
            &wrapper.system,
            &[
                ("system_instruction", self.system_instruction.as_str()),
                ("task_query", self.task_query.as_str()),
            ],
        )?;
        let label_def = self.label_def.render();
        let user = format_strict(
            &wrapper.user,
            &[
                ("few_shot", self.few_shot.as_str()),
                ("prompt_strategy", self.prompt_strategy.as_str()),
                ("context", self.context.as_str()),
                ("label_def", label_def.as_str()),
                ("output_indicator", self.output_indicator.as_str()),
            ],
        )?;
        Ok((system, user))
    }

    /// Plain concatenation used for teacher-forced shots
    ///
    /// Label definitions are not part of a flattened shot.
    #[must_use]
    pub fn flatten(&self) -> (String, String) {
        let system = format!("{}{}", self.system_instruction, self.task_query);
        let user = format!(
            "{}{}{}{}",
            self.few_shot, self.prompt_strategy, self.context, self.output_indicator
        );
        (system, user)
    }
}

/// Resolved templates for one selector tuple
#[derive(Debug, Clone)]
pub struct PromptGenerator {
    system_instruction: String,
    task_query: String,
    prompt_strategy: String,
    context: String,
    label_definitions: Vec<(String, String)>,
    output_indicator: String,
}

impl PromptGenerator {
    /// Resolve every selector against the store
    ///
    /// # Errors
    ///
    /// Returns `TemplateError::Resolution` if any selector path is absent and
    /// `TemplateError::InvalidLabelDefinitions` if the label definition
    /// template is not a literal mapping.
    pub fn new(store: &TemplateStore, selectors: &AxisSelectors) -> Result<Self, TemplateError> {
        let resolve = |axis: Axis| -> Result<String, TemplateError> {
            store.resolve(axis, selectors.get(axis)).map(ToString::to_string)
        };

        let label_source = resolve(Axis::LabelDef)?;
        let label_definitions = if label_source.trim().is_empty() {
            Vec::new()
        } else {
            parse_literal_mapping(&label_source).map_err(|source| {
                TemplateError::InvalidLabelDefinitions {
                    selector: selectors.label_def.clone(),
                    source,
                }
            })?
        };

        Ok(Self {
            system_instruction: resolve(Axis::SystemInstruction)?,
            task_query: resolve(Axis::TaskQuery)?,
            prompt_strategy: resolve(Axis::PromptStrategy)?,
            context: resolve(Axis::ContextInput)?,
            label_definitions,
            output_indicator: resolve(Axis::OutputIndicator)?,
        })
    }

    /// Build the record for one example.
    ///
    /// In [`ShotMode::FewShot`] the system instruction, task query, strategy
    /// and output indicator are blank and the context slot is rendered from
    /// the strategy template. In [`ShotMode::Basic`] the context slot uses
    /// the context template and the strategy is dropped once any shot has
    /// been accumulated (`shot_count > 0`).
    ///
    /// # Errors
    ///
    /// Returns an error if a template has unbalanced braces.
    pub fn generate(
        &self,
        example: &Example,
        shot_memory: &str,
        mode: ShotMode,
        shot_count: usize,
    ) -> Result<PromptRecord, TemplateError> {
        let context = example.context_field();
        let label_text = example.label_text_field();
        let label_list = example.label_list_field();
        let subject = example.subject_field();
        let fields = [
            ("context", Some(&context)),
            ("subject", subject.as_ref()),
            ("label_list", Some(&label_list)),
            ("label_text", Some(&label_text)),
        ];
        let fill = |template: &str| conditional_format(template, &fields);

        let memory = FieldValue::from(shot_memory);
        let few_shot = conditional_format(FEW_SHOT_TEMPLATE, &[("shot_memory", Some(&memory))])?;
        let label_def = self.restrict_label_definitions(&example.label_list);

        let record = match mode {
            ShotMode::FewShot => PromptRecord {
                few_shot,
                system_instruction: String::new(),
                task_query: String::new(),
                prompt_strategy: String::new(),
                context: fill(&self.prompt_strategy)?,
                label_def,
                output_indicator: String::new(),
            },
            ShotMode::Basic => PromptRecord {
                few_shot,
                system_instruction: fill(&self.system_instruction)?,
                task_query: fill(&self.task_query)?,
                prompt_strategy: if shot_count == 0 {
                    fill(&self.prompt_strategy)?
                } else {
                    String::new()
                },
                context: fill(&self.context)?,
                label_def,
                output_indicator: fill(&self.output_indicator)?,
            },
        };

        Ok(record)
    }

    /// Keep only definitions of labels that occur in `label_list`.
    ///
    /// Compound names are split on `&` and trimmed before matching.
    fn restrict_label_definitions(&self, label_list: &[String]) -> LabelDef {
        let pairs: Vec<(String, String)> = label_list
            .iter()
            .flat_map(|item| item.split(LABEL_CONJUNCTION).map(str::trim))
            .filter_map(|name| {
                self.label_definitions
                    .iter()
                    .find(|(label, _)| label == name)
                    .cloned()
            })
            .collect();

        if pairs.is_empty() {
            LabelDef::Empty
        } else {
            LabelDef::Mapping(dedup_keep_last(pairs))
        }
    }
}

/// Collapse repeated keys the way a literal dict does: first position, last value
fn dedup_keep_last(pairs: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        if let Some(slot) = out.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            out.push((key, value));
        }
    }
    out
}

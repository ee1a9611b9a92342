//! Chat backends.
//!
//! Every backend turns a (system, user) prompt pair into one completion:
//!
//! - hosted chat APIs (`OpenAI`, Anthropic, Gemini) over HTTPS
//! - a local Ollama daemon over loopback HTTP
//! - a locally installed inference command run as a subprocess
//!
//! Backends are described by serializable [`BackendSpec`]s so the harness
//! configuration can add entries to the built-in registry.

use crate::config::Credentials;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on a single HTTP exchange, independent of the retry timeout
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors raised by a single backend call
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend invocation failed: {0}")]
    Invocation(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response from backend: {0}")]
    InvalidResponse(String),

    #[error("CLI tool not found: {0}")]
    ToolNotFound(String),

    #[error("No credential configured for backend {0}")]
    MissingCredential(String),

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A model that answers a system/user prompt pair
pub trait ChatBackend: Send + Sync {
    /// Registry name of the backend
    fn name(&self) -> &str;

    /// Run one completion
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails or the response has no text.
    fn chat(&self, system: &str, user: &str) -> Result<String, BackendError>;
}

// =============================================================================
// Specifications
// =============================================================================

fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_anthropic_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_gemini_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_pipeline_command() -> String {
    "llama-cli".to_string()
}

const fn default_temperature() -> f64 {
    0.0
}

const fn default_anthropic_max_tokens() -> u32 {
    1000
}

const fn default_gemini_max_output_tokens() -> u32 {
    256
}

const fn default_top_p() -> f64 {
    0.9
}

const fn default_gemini_pause_ms() -> u64 {
    250
}

const fn default_num_predict() -> u32 {
    128
}

const fn default_max_new_tokens() -> u32 {
    512
}

const fn default_pipeline_temperature() -> f64 {
    0.1
}

/// Arguments for a role-separated pipeline call
pub const PIPELINE_CHAT_ARGS: &str = "-hf {model} -n {max_new_tokens} --temp {temperature} --top-p {top_p} -no-cnv --no-display-prompt -sys {system} -p {user}";

/// Arguments for a pipeline that takes one combined user turn
pub const PIPELINE_COMBINED_ARGS: &str =
    "-hf {model} -n {max_new_tokens} --temp {temperature} --top-p {top_p} -no-cnv --no-display-prompt -p {prompt}";

/// Description of how to reach one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendSpec {
    /// `OpenAI` chat completions
    OpenAi {
        model: String,
        #[serde(default = "default_openai_url")]
        base_url: String,
        #[serde(default = "default_temperature")]
        temperature: f64,
    },
    /// Anthropic messages API
    Anthropic {
        model: String,
        #[serde(default = "default_anthropic_url")]
        base_url: String,
        #[serde(default = "default_temperature")]
        temperature: f64,
        #[serde(default = "default_anthropic_max_tokens")]
        max_tokens: u32,
    },
    /// Gemini `generateContent`
    Gemini {
        model: String,
        #[serde(default = "default_gemini_url")]
        base_url: String,
        #[serde(default = "default_temperature")]
        temperature: f64,
        #[serde(default = "default_gemini_max_output_tokens")]
        max_output_tokens: u32,
        #[serde(default = "default_top_p")]
        top_p: f64,
        /// Pause after every call, successful or not
        #[serde(default = "default_gemini_pause_ms")]
        pause_ms: u64,
    },
    /// Local Ollama daemon
    Ollama {
        model: String,
        #[serde(default = "default_ollama_host")]
        host: String,
        #[serde(default = "default_temperature")]
        temperature: f64,
        #[serde(default = "default_num_predict")]
        num_predict: u32,
    },
    /// Locally installed inference command; one synchronous call, no retry
    Pipeline {
        model: String,
        #[serde(default = "default_pipeline_command")]
        command: String,
        args_template: String,
        /// Send system and user text as one user turn
        #[serde(default)]
        combine_roles: bool,
        #[serde(default = "default_max_new_tokens")]
        max_new_tokens: u32,
        #[serde(default = "default_pipeline_temperature")]
        temperature: f64,
        #[serde(default = "default_top_p")]
        top_p: f64,
    },
}

impl BackendSpec {
    /// Short kind label
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::OpenAi { .. } => "open_ai",
            Self::Anthropic { .. } => "anthropic",
            Self::Gemini { .. } => "gemini",
            Self::Ollama { .. } => "ollama",
            Self::Pipeline { .. } => "pipeline",
        }
    }

    /// Model identifier sent to the backend
    #[must_use]
    pub fn model(&self) -> &str {
        match self {
            Self::OpenAi { model, .. }
            | Self::Anthropic { model, .. }
            | Self::Gemini { model, .. }
            | Self::Ollama { model, .. }
            | Self::Pipeline { model, .. } => model,
        }
    }

    /// Whether calls go through the bounded retry loop
    #[must_use]
    pub const fn uses_retry(&self) -> bool {
        !matches!(self, Self::Pipeline { .. })
    }

    /// Whether the backend needs an API key
    #[must_use]
    pub const fn needs_credential(&self) -> bool {
        matches!(
            self,
            Self::OpenAi { .. } | Self::Anthropic { .. } | Self::Gemini { .. }
        )
    }

    /// Construct a live backend
    ///
    /// # Errors
    ///
    /// Returns `BackendError::MissingCredential` if a hosted backend has no
    /// key, or an HTTP error if the client cannot be built.
    pub fn build(
        &self,
        name: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ChatBackend>, BackendError> {
        let key = || {
            credentials
                .get(name)
                .map(ToString::to_string)
                .ok_or_else(|| BackendError::MissingCredential(name.to_string()))
        };

        let backend: Arc<dyn ChatBackend> = match self.clone() {
            Self::OpenAi {
                model,
                base_url,
                temperature,
            } => Arc::new(OpenAiBackend {
                http: HttpBackend::new(name, key()?)?,
                model,
                base_url,
                temperature,
            }),
            Self::Anthropic {
                model,
                base_url,
                temperature,
                max_tokens,
            } => Arc::new(AnthropicBackend {
                http: HttpBackend::new(name, key()?)?,
                model,
                base_url,
                temperature,
                max_tokens,
            }),
            Self::Gemini {
                model,
                base_url,
                temperature,
                max_output_tokens,
                top_p,
                pause_ms,
            } => Arc::new(GeminiBackend {
                http: HttpBackend::new(name, key()?)?,
                model,
                base_url,
                temperature,
                max_output_tokens,
                top_p,
                pause: Duration::from_millis(pause_ms),
            }),
            Self::Ollama {
                model,
                host,
                temperature,
                num_predict,
            } => Arc::new(OllamaBackend {
                http: HttpBackend::new(name, String::new())?,
                model,
                host,
                temperature,
                num_predict,
            }),
            Self::Pipeline {
                model,
                command,
                args_template,
                combine_roles,
                max_new_tokens,
                temperature,
                top_p,
            } => Arc::new(PipelineBackend {
                name: name.to_string(),
                model,
                command,
                args_template,
                combine_roles,
                max_new_tokens,
                temperature,
                top_p,
            }),
        };

        Ok(backend)
    }
}

// =============================================================================
// Registry
// =============================================================================

fn ollama(model: &str) -> BackendSpec {
    BackendSpec::Ollama {
        model: model.to_string(),
        host: default_ollama_host(),
        temperature: default_temperature(),
        num_predict: default_num_predict(),
    }
}

fn pipeline(model: &str, combine_roles: bool) -> BackendSpec {
    BackendSpec::Pipeline {
        model: model.to_string(),
        command: default_pipeline_command(),
        args_template: if combine_roles {
            PIPELINE_COMBINED_ARGS
        } else {
            PIPELINE_CHAT_ARGS
        }
        .to_string(),
        combine_roles,
        max_new_tokens: default_max_new_tokens(),
        temperature: default_pipeline_temperature(),
        top_p: default_top_p(),
    }
}

/// Built-in backends keyed by registry name
#[must_use]
pub fn builtin_backends() -> BTreeMap<String, BackendSpec> {
    let mut specs = BTreeMap::new();

    specs.insert(
        "GPT4o".to_string(),
        BackendSpec::OpenAi {
            model: "gpt-4o".to_string(),
            base_url: default_openai_url(),
            temperature: default_temperature(),
        },
    );
    specs.insert(
        "Sonnet".to_string(),
        BackendSpec::Anthropic {
            model: "claude-3-5-sonnet-20240620".to_string(),
            base_url: default_anthropic_url(),
            temperature: default_temperature(),
            max_tokens: default_anthropic_max_tokens(),
        },
    );
    specs.insert(
        "Gemini".to_string(),
        BackendSpec::Gemini {
            model: "gemini-1.5-pro".to_string(),
            base_url: default_gemini_url(),
            temperature: default_temperature(),
            max_output_tokens: default_gemini_max_output_tokens(),
            top_p: default_top_p(),
            pause_ms: default_gemini_pause_ms(),
        },
    );

    for (name, model) in [
        ("Ollama_Llama", "llama3.1:8b-instruct-q8_0"),
        ("Ollama_Qwen", "qwen2:7b-instruct-q8_0"),
        ("Ollama_Gemma", "gemma2:9b-instruct-q4_0"),
        ("Ollama_Mistral", "mistral:7b-instruct-v0.3-q8_0"),
        ("Ollama_Phi", "phi3:14b-medium-4k-instruct-q4_0"),
        ("Ollama_Qwen32B", "qwen:32b-chat-v1.5-q4_0"),
        ("OllamaPhi3_5", "phi3.5:3.8b-mini-instruct-fp16"),
    ] {
        specs.insert(name.to_string(), ollama(model));
    }

    specs.insert(
        "Llama".to_string(),
        pipeline("bartowski/Meta-Llama-3-8B-Instruct-GGUF:Q8_0", false),
    );
    specs.insert(
        "Qwen".to_string(),
        pipeline("Qwen/Qwen2-7B-Instruct-GGUF:Q8_0", false),
    );
    specs.insert(
        "Gemma".to_string(),
        pipeline("bartowski/gemma-2-9b-it-GGUF:Q8_0", true),
    );

    specs
}

/// Named backend specifications
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    specs: BTreeMap<String, BackendSpec>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self {
            specs: builtin_backends(),
        }
    }
}

impl BackendRegistry {
    /// Built-in registry extended or overridden by configured entries
    #[must_use]
    pub fn with_overrides(overrides: &BTreeMap<String, BackendSpec>) -> Self {
        let mut registry = Self::default();
        for (name, spec) in overrides {
            registry.specs.insert(name.clone(), spec.clone());
        }
        registry
    }

    /// Look up a backend by name
    ///
    /// # Errors
    ///
    /// Returns `BackendError::UnknownBackend` for names outside the registry.
    pub fn get(&self, name: &str) -> Result<&BackendSpec, BackendError> {
        self.specs
            .get(name)
            .ok_or_else(|| BackendError::UnknownBackend(name.to_string()))
    }

    /// Iterate over entries in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &BackendSpec)> {
        self.specs.iter()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

// =============================================================================
// HTTP backends
// =============================================================================

/// Shared blocking client plus credential
struct HttpBackend {
    name: String,
    api_key: String,
    client: reqwest::blocking::Client,
}

impl HttpBackend {
    fn new(name: &str, api_key: String) -> Result<Self, BackendError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            name: name.to_string(),
            api_key,
            client,
        })
    }

    /// Send a request and decode a successful JSON body
    fn send(&self, request: reqwest::blocking::RequestBuilder) -> Result<Value, BackendError> {
        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(BackendError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json()?)
    }
}

/// Pull a non-null string out of a JSON response
fn text_at(body: &Value, pointer: &str) -> Result<String, BackendError> {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| BackendError::InvalidResponse(format!("no text at {pointer}")))
}

struct OpenAiBackend {
    http: HttpBackend,
    model: String,
    base_url: String,
    temperature: f64,
}

impl ChatBackend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.http.name
    }

    fn chat(&self, system: &str, user: &str) -> Result<String, BackendError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": self.temperature,
        });
        let request = self
            .http
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.http.api_key)
            .json(&body);
        let response = self.http.send(request)?;
        text_at(&response, "/choices/0/message/content")
    }
}

struct AnthropicBackend {
    http: HttpBackend,
    model: String,
    base_url: String,
    temperature: f64,
    max_tokens: u32,
}

impl ChatBackend for AnthropicBackend {
    fn name(&self) -> &str {
        &self.http.name
    }

    fn chat(&self, system: &str, user: &str) -> Result<String, BackendError> {
        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "system": system,
            "messages": [{"role": "user", "content": user}],
            "max_tokens": self.max_tokens,
        });
        let request = self
            .http
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.http.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body);
        let response = self.http.send(request)?;
        text_at(&response, "/content/0/text")
    }
}

/// Safety categories relaxed for Gemini calls.
/// The retired `HARM_CATEGORY_DANGEROUS` is left out; the API rejects it.
const GEMINI_SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

struct GeminiBackend {
    http: HttpBackend,
    model: String,
    base_url: String,
    temperature: f64,
    max_output_tokens: u32,
    top_p: f64,
    pause: Duration,
}

impl GeminiBackend {
    fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        let safety: Vec<Value> = GEMINI_SAFETY_CATEGORIES
            .iter()
            .map(|category| json!({"category": category, "threshold": "BLOCK_NONE"}))
            .collect();
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "candidateCount": 1,
                "maxOutputTokens": self.max_output_tokens,
                "temperature": self.temperature,
                "topP": self.top_p,
            },
            "safetySettings": safety,
        });
        let request = self
            .http
            .client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, self.model
            ))
            .query(&[("key", self.http.api_key.as_str())])
            .json(&body);
        let response = self.http.send(request)?;

        let parts = response
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                let reason = response
                    .pointer("/promptFeedback/blockReason")
                    .and_then(Value::as_str)
                    .unwrap_or("no candidates");
                BackendError::InvalidResponse(format!("prompt blocked: {reason}"))
            })?;

        Ok(parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect())
    }
}

impl ChatBackend for GeminiBackend {
    fn name(&self) -> &str {
        &self.http.name
    }

    fn chat(&self, system: &str, user: &str) -> Result<String, BackendError> {
        let result = self.generate(&format!("{system}{user}"));
        std::thread::sleep(self.pause);
        result
    }
}

struct OllamaBackend {
    http: HttpBackend,
    model: String,
    host: String,
    temperature: f64,
    num_predict: u32,
}

impl ChatBackend for OllamaBackend {
    fn name(&self) -> &str {
        &self.http.name
    }

    fn chat(&self, system: &str, user: &str) -> Result<String, BackendError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "stream": false,
            "options": {"temperature": self.temperature, "num_predict": self.num_predict},
        });
        let request = self
            .http
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&body);
        let response = self.http.send(request)?;
        text_at(&response, "/message/content")
    }
}

// =============================================================================
// Subprocess pipeline
// =============================================================================

/// Local inference command run once per prompt
struct PipelineBackend {
    name: String,
    model: String,
    command: String,
    args_template: String,
    combine_roles: bool,
    max_new_tokens: u32,
    temperature: f64,
    top_p: f64,
}

impl PipelineBackend {
    /// Check if the command is on `PATH`
    fn is_available(&self) -> bool {
        Command::new("which")
            .arg(&self.command)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    /// Split the argument template, then fill placeholders per argument
    fn arguments(&self, system: &str, user: &str) -> Result<Vec<String>, BackendError> {
        let combined = format!("{system}{user}");
        let (system, user) = if self.combine_roles {
            ("", combined.as_str())
        } else {
            (system, user)
        };
        let max_new_tokens = self.max_new_tokens.to_string();
        let temperature = self.temperature.to_string();
        let top_p = self.top_p.to_string();

        let words = shell_words::split(&self.args_template)
            .map_err(|e| BackendError::Invocation(format!("bad argument template: {e}")))?;

        let values = [
            ("model", self.model.as_str()),
            ("max_new_tokens", max_new_tokens.as_str()),
            ("temperature", temperature.as_str()),
            ("top_p", top_p.as_str()),
            ("system", system),
            ("user", user),
            ("prompt", combined.as_str()),
        ];
        let args = words
            .iter()
            .map(|word| fill_placeholders(word, &values))
            .collect();
        Ok(args)
    }
}

/// Replace `{key}` occurrences in one pass so substituted text is never rescanned
fn fill_placeholders(word: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(word.len());
    let mut rest = word;

    'scan: while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        for (key, value) in values {
            if let Some(after) = tail
                .strip_prefix('{')
                .and_then(|t| t.strip_prefix(key))
                .and_then(|t| t.strip_prefix('}'))
            {
                out.push_str(value);
                rest = after;
                continue 'scan;
            }
        }
        out.push('{');
        rest = &tail[1..];
    }

    out.push_str(rest);
    out
}

impl ChatBackend for PipelineBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn chat(&self, system: &str, user: &str) -> Result<String, BackendError> {
        if !self.is_available() {
            return Err(BackendError::ToolNotFound(self.command.clone()));
        }

        // Both pipes drain concurrently; a chatty stderr cannot stall stdout
        let output = Command::new(&self.command)
            .args(self.arguments(system, user)?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?
            .wait_with_output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Invocation(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        let response = String::from_utf8_lossy(&output.stdout);
        Ok(response.trim().to_string())
    }
}

//! Model adapter: prompt normalization plus the invocation policy.
//!
//! Hosted and daemon backends run under a bounded retry loop. Each attempt
//! executes on its own thread and is waited on for at most the attempt
//! timeout; a late call is abandoned, never cancelled, and may still finish
//! in the background. When every attempt fails the adapter answers with
//! [`SENTINEL_ANSWER`] instead of an error so the run can move on.

use crate::backends::{BackendError, ChatBackend};
use crate::prompt::PromptRecord;
use crate::templates::{GeneralPrompt, RoleTemplates, TemplateError};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Answer recorded when every attempt failed
pub const SENTINEL_ANSWER: &str = "Failed to get a response";

/// Errors surfaced by [`ModelAdapter::respond`]
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Prompt normalization failed: {0}")]
    Template(#[from] TemplateError),

    #[error("Backend call failed: {0}")]
    Backend(#[from] BackendError),
}

/// Attempt budget and per-attempt deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            timeout: Duration::from_secs(10),
        }
    }
}

/// How the backend is called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationPolicy {
    /// Immediate retries with a deadline per attempt, sentinel on exhaustion
    Retry(RetryPolicy),
    /// One synchronous call; its error is returned to the caller
    Single,
}

/// Flattened query text and raw completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// System prompt followed by user prompt
    pub query: String,
    /// Completion text, or the sentinel
    pub answer: String,
}

impl Exchange {
    /// Whether the answer is the retry-exhaustion sentinel
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.answer == SENTINEL_ANSWER
    }
}

/// Uniform front over one backend
pub struct ModelAdapter {
    backend: Arc<dyn ChatBackend>,
    policy: InvocationPolicy,
    wrapper: RoleTemplates,
}

impl ModelAdapter {
    /// Create an adapter; `shot` selects the zero-shot or few-shot wrapper
    #[must_use]
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        policy: InvocationPolicy,
        general: &GeneralPrompt,
        shot: usize,
    ) -> Self {
        Self {
            backend,
            policy,
            wrapper: general.for_shots(shot).clone(),
        }
    }

    /// Backend name
    #[must_use]
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Invocation policy in force
    #[must_use]
    pub const fn policy(&self) -> InvocationPolicy {
        self.policy
    }

    /// Combine a record into (system, user) text using the outer wrapper
    ///
    /// # Errors
    ///
    /// Returns an error if the wrapper names an unknown placeholder.
    pub fn normalize(&self, record: &PromptRecord) -> Result<(String, String), TemplateError> {
        record.split(&self.wrapper)
    }

    /// Normalize a record and obtain an answer
    ///
    /// # Errors
    ///
    /// Returns an error if normalization fails, or if a single-call backend
    /// fails. Retrying backends never error; they fall back to the sentinel.
    pub fn respond(&self, record: &PromptRecord) -> Result<Exchange, AdapterError> {
        let (system, user) = self.normalize(record)?;
        let answer = self.invoke(&system, &user)?;
        Ok(Exchange {
            query: format!("{system}{user}"),
            answer,
        })
    }

    /// Call the backend under the invocation policy
    ///
    /// # Errors
    ///
    /// Only [`InvocationPolicy::Single`] returns errors.
    pub fn invoke(&self, system: &str, user: &str) -> Result<String, BackendError> {
        match self.policy {
            InvocationPolicy::Single => self.backend.chat(system, user),
            InvocationPolicy::Retry(policy) => Ok(self.invoke_with_retry(system, user, policy)),
        }
    }

    fn invoke_with_retry(&self, system: &str, user: &str, policy: RetryPolicy) -> String {
        for attempt in 1..=policy.attempts {
            match call_with_timeout(&self.backend, system, user, policy.timeout) {
                Ok(answer) if !answer.is_empty() => return answer,
                Ok(_) => {
                    tracing::warn!(backend = %self.name(), attempt, "Empty response. Retrying...");
                }
                Err(BackendError::Timeout(limit)) => {
                    tracing::warn!(
                        backend = %self.name(),
                        attempt,
                        timeout = ?limit,
                        "Timeout. Retrying..."
                    );
                }
                Err(e) => {
                    tracing::warn!(backend = %self.name(), attempt, error = %e, "Backend call failed");
                }
            }
        }

        tracing::error!(
            backend = %self.name(),
            attempts = policy.attempts,
            "All attempts failed; recording sentinel answer"
        );
        SENTINEL_ANSWER.to_string()
    }
}

/// Run one call on a fresh thread and wait up to `timeout` for it
fn call_with_timeout(
    backend: &Arc<dyn ChatBackend>,
    system: &str,
    user: &str,
    timeout: Duration,
) -> Result<String, BackendError> {
    let (tx, rx) = mpsc::channel();
    let backend = Arc::clone(backend);
    let system = system.to_string();
    let user = user.to_string();

    thread::Builder::new()
        .name(format!("{}-call", backend.name()))
        .spawn(move || {
            tx.send(backend.chat(&system, &user)).ok();
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(BackendError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(BackendError::Invocation(
            "backend call ended without a result".to_string(),
        )),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::prompt::LabelDef;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls, then answers
    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
        answer: String,
    }

    impl Flaky {
        fn new(failures: usize, answer: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
                answer: answer.to_string(),
            }
        }
    }

    impl ChatBackend for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn chat(&self, _system: &str, _user: &str) -> Result<String, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(BackendError::Invocation(format!("failure {n}")))
            } else {
                Ok(self.answer.clone())
            }
        }
    }

    struct Slow {
        delay: Duration,
    }

    impl ChatBackend for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn chat(&self, _system: &str, _user: &str) -> Result<String, BackendError> {
            thread::sleep(self.delay);
            Ok("late".to_string())
        }
    }

    fn record() -> PromptRecord {
        PromptRecord {
            few_shot: String::new(),
            system_instruction: "You are careful. ".to_string(),
            task_query: "Classify.".to_string(),
            prompt_strategy: String::new(),
            context: "Text: hello".to_string(),
            label_def: LabelDef::Empty,
            output_indicator: String::new(),
        }
    }

    fn adapter(backend: Arc<dyn ChatBackend>, policy: InvocationPolicy) -> ModelAdapter {
        ModelAdapter::new(backend, policy, &GeneralPrompt::default(), 0)
    }

    fn fast_retry() -> InvocationPolicy {
        InvocationPolicy::Retry(RetryPolicy {
            attempts: 5,
            timeout: Duration::from_secs(5),
        })
    }

    // =========================================================================
    // Retry loop
    // =========================================================================

    #[test]
    fn test_succeeds_on_fifth_attempt() {
        let backend = Arc::new(Flaky::new(4, "label: yes"));
        let adapter = adapter(backend.clone(), fast_retry());

        let exchange = adapter.respond(&record()).unwrap();
        assert_eq!(exchange.answer, "label: yes");
        assert!(!exchange.is_sentinel());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_sentinel_after_exhaustion() {
        let backend = Arc::new(Flaky::new(usize::MAX, "never"));
        let adapter = adapter(backend.clone(), fast_retry());

        let exchange = adapter.respond(&record()).unwrap();
        assert_eq!(exchange.answer, SENTINEL_ANSWER);
        assert!(exchange.is_sentinel());
        assert_eq!(exchange.query, "You are careful. Classify.Text: hello");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_empty_answer_is_retried() {
        struct EmptyThenText(AtomicUsize);
        impl ChatBackend for EmptyThenText {
            fn name(&self) -> &str {
                "empty"
            }
            fn chat(&self, _: &str, _: &str) -> Result<String, BackendError> {
                let n = self.0.fetch_add(1, Ordering::SeqCst);
                Ok(if n == 0 { String::new() } else { "ok".to_string() })
            }
        }

        let backend = Arc::new(EmptyThenText(AtomicUsize::new(0)));
        let adapter = adapter(backend.clone(), fast_retry());
        assert_eq!(adapter.invoke("s", "u").unwrap(), "ok");
        assert_eq!(backend.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_timeout_abandons_attempt() {
        let backend = Arc::new(Slow {
            delay: Duration::from_millis(300),
        });
        let adapter = adapter(
            backend,
            InvocationPolicy::Retry(RetryPolicy {
                attempts: 2,
                timeout: Duration::from_millis(20),
            }),
        );

        let start = std::time::Instant::now();
        let answer = adapter.invoke("s", "u").unwrap();
        assert_eq!(answer, SENTINEL_ANSWER);
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn test_call_with_timeout_reports_timeout() {
        let backend: Arc<dyn ChatBackend> = Arc::new(Slow {
            delay: Duration::from_millis(200),
        });
        let err = call_with_timeout(&backend, "s", "u", Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
    }

    // =========================================================================
    // Single-call policy
    // =========================================================================

    #[test]
    fn test_single_call_propagates_error() {
        let backend = Arc::new(Flaky::new(1, "late"));
        let adapter = adapter(backend.clone(), InvocationPolicy::Single);

        let err = adapter.respond(&record()).unwrap_err();
        assert!(matches!(err, AdapterError::Backend(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_single_call_success() {
        let backend = Arc::new(Flaky::new(0, "label: no"));
        let adapter = adapter(backend, InvocationPolicy::Single);
        assert_eq!(adapter.respond(&record()).unwrap().answer, "label: no");
    }

    // =========================================================================
    // Normalization
    // =========================================================================

    #[test]
    fn test_normalize_uses_shot_specific_wrapper() {
        let general = GeneralPrompt {
            zero_shot: RoleTemplates {
                system: "ZERO {system_instruction}".into(),
                user: "{context}".into(),
            },
            few_shot: RoleTemplates {
                system: "FEW {system_instruction}".into(),
                user: "{few_shot}{context}".into(),
            },
        };
        let backend: Arc<dyn ChatBackend> = Arc::new(Flaky::new(0, "x"));

        let zero = ModelAdapter::new(Arc::clone(&backend), fast_retry(), &general, 0);
        let few = ModelAdapter::new(backend, fast_retry(), &general, 2);

        assert!(zero.normalize(&record()).unwrap().0.starts_with("ZERO"));
        assert!(few.normalize(&record()).unwrap().0.starts_with("FEW"));
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.timeout, Duration::from_secs(10));
    }
}

//! The advisor capability - an opaque, cancellable request/response seam.
//!
//! The kernel treats the language model as a black box: it hands over a
//! textual situation prompt and expects raw reply text back. Parsing,
//! schema validation, deadlines and the circuit breaker all live on the
//! kernel side, so any transport (HTTP client, local model, test script)
//! satisfies this trait.

use crate::error::AdvisorError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Transport-independent advisor capability.
///
/// Implementations must be cancellation-safe: the caller wraps every
/// request in a deadline and drops the future when it fires.
#[async_trait]
pub trait AdvisorTransport: Send + Sync {
    /// Sends a situation prompt and returns the raw reply text.
    async fn request(&self, prompt: &str) -> Result<String, AdvisorError>;
}

/// Advisor that always fails with a transport error.
///
/// Stands in when no language model is configured; the decision pipeline
/// falls back to its deterministic rule cascade.
pub struct UnavailableAdvisor;

#[async_trait]
impl AdvisorTransport for UnavailableAdvisor {
    async fn request(&self, _prompt: &str) -> Result<String, AdvisorError> {
        Err(AdvisorError::transport("no advisor configured"))
    }
}

/// Deterministic advisor that replays a scripted sequence of outcomes.
///
/// Each queued entry is either a canned reply or an error; once the script
/// is exhausted the last entry repeats. Used by breaker and pipeline tests
/// to drive exact failure sequences.
pub struct ScriptedAdvisor {
    script: Mutex<VecDeque<Result<String, AdvisorError>>>,
    last: Mutex<Option<Result<String, AdvisorError>>>,
}

impl ScriptedAdvisor {
    /// Creates an advisor from an outcome script.
    pub fn new(outcomes: Vec<Result<String, AdvisorError>>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            last: Mutex::new(None),
        }
    }

    /// Creates an advisor that always returns the same reply.
    pub fn always(reply: impl Into<String>) -> Self {
        Self::new(vec![Ok(reply.into())])
    }

    /// Creates an advisor that always fails with the given error.
    pub fn failing(err: AdvisorError) -> Self {
        Self::new(vec![Err(err)])
    }
}

#[async_trait]
impl AdvisorTransport for ScriptedAdvisor {
    async fn request(&self, _prompt: &str) -> Result<String, AdvisorError> {
        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            Some(outcome) => {
                *self.last.lock().unwrap() = Some(outcome.clone());
                outcome
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err(AdvisorError::transport("empty script"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_advisor_always_fails() {
        let advisor = UnavailableAdvisor;
        assert!(matches!(
            advisor.request("prompt").await,
            Err(AdvisorError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_scripted_advisor_replays_then_repeats() {
        let advisor = ScriptedAdvisor::new(vec![
            Ok("first".to_string()),
            Err(AdvisorError::Timeout(800)),
        ]);

        assert_eq!(advisor.request("p").await.unwrap(), "first");
        assert_eq!(
            advisor.request("p").await.unwrap_err(),
            AdvisorError::Timeout(800)
        );
        // Script exhausted: last outcome repeats
        assert_eq!(
            advisor.request("p").await.unwrap_err(),
            AdvisorError::Timeout(800)
        );
    }
}

//! Generation with repetition-aware retries.
//!
//! Each attempt sends the whole conversation, checks the reply for
//! repetition loops and either accepts it or retries with slightly hotter
//! sampling. The choice between those is made by [`decide`], a pure function
//! of the attempt counter and the attempt's outcome.
//!
//! Transport failures are never retried: a server that times out or errors on
//! one attempt is not expected to recover within the same item.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::client::{ChatBackend, ChatRequest, Conversation, SamplingParams};
use crate::error::LlmError;
use crate::metrics::MetricsCollector;
use crate::quality::{Detection, RepetitionCheck, RepetitionDetector};

/// Attempts per generation call, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Pause before a retry.
pub const DEFAULT_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Added to temperature and top_p on every retry.
pub const SAMPLING_STEP: f64 = 0.05;

pub const MAX_TEMPERATURE: f64 = 1.0;
pub const MAX_TOP_P: f64 = 0.95;

/// Sampling parameters for successive attempts: each retry raises
/// temperature and top_p by a fixed step, up to their ceilings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingSchedule {
    pub base: SamplingParams,
    pub step: f64,
    pub max_temperature: f64,
    pub max_top_p: f64,
}

impl SamplingSchedule {
    pub fn new(base: SamplingParams) -> Self {
        Self {
            base,
            step: SAMPLING_STEP,
            max_temperature: MAX_TEMPERATURE,
            max_top_p: MAX_TOP_P,
        }
    }

    /// Parameters for the 1-based `attempt`. A base value already above its
    /// ceiling is kept as is.
    pub fn params_for_attempt(&self, attempt: u32) -> SamplingParams {
        let bump = f64::from(attempt.saturating_sub(1)) * self.step;
        SamplingParams {
            temperature: raise(self.base.temperature, bump, self.max_temperature),
            top_p: raise(self.base.top_p, bump, self.max_top_p),
        }
    }
}

fn raise(base: f64, bump: f64, ceiling: f64) -> f64 {
    (base + bump).min(ceiling.max(base))
}

/// Token budget, sampling and timeout for one kind of generation call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallProfile {
    /// Label used in logs and metrics.
    pub name: &'static str,
    pub max_tokens: u32,
    pub sampling: SamplingParams,
    pub timeout: Duration,
}

impl CallProfile {
    /// Image plus prompt, long free-form answer.
    pub const fn image_chat() -> Self {
        Self {
            name: "image_chat",
            max_tokens: 4096,
            sampling: SamplingParams::new(0.7, 0.8),
            timeout: Duration::from_secs(600),
        }
    }

    /// Short follow-up turn in an existing conversation.
    pub const fn continuation() -> Self {
        Self {
            name: "continuation",
            max_tokens: 256,
            sampling: SamplingParams::new(0.3, 0.8),
            timeout: Duration::from_secs(120),
        }
    }

    /// Text-only request to a language model.
    pub const fn text_only() -> Self {
        Self {
            name: "text_only",
            max_tokens: 2048,
            sampling: SamplingParams::new(0.7, 0.9),
            timeout: Duration::from_secs(300),
        }
    }
}

/// What one attempt produced.
#[derive(Debug)]
pub enum AttemptOutcome {
    Completed { text: String, detection: Detection },
    TransportFailure(LlmError),
}

impl AttemptOutcome {
    fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Completed { detection, .. } if detection.is_repetitive => "repetitive",
            AttemptOutcome::Completed { .. } => "clean",
            AttemptOutcome::TransportFailure(_) => "transport_error",
        }
    }
}

/// Next step after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Clean output.
    Accept,
    /// Still repetitive but out of attempts; return it anyway.
    AcceptDegraded,
    /// Repetitive with attempts left.
    Retry,
    /// Transport failure; give up on this call.
    Abort,
}

/// Decides what to do after the 1-based `attempt` out of `max_attempts`.
pub fn decide(attempt: u32, max_attempts: u32, outcome: &AttemptOutcome) -> RetryDecision {
    match outcome {
        AttemptOutcome::TransportFailure(_) => RetryDecision::Abort,
        AttemptOutcome::Completed { detection, .. } if !detection.is_repetitive => {
            RetryDecision::Accept
        }
        AttemptOutcome::Completed { .. } if attempt < max_attempts => RetryDecision::Retry,
        AttemptOutcome::Completed { .. } => RetryDecision::AcceptDegraded,
    }
}

/// An accepted generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Attempts used, including the accepted one.
    pub attempts: u32,
    /// True when the text was accepted despite a repetition finding.
    pub degraded: bool,
    /// Sampling used for the accepted attempt.
    pub sampling: SamplingParams,
}

/// Issues chat requests and retries repetitive output.
#[derive(Clone)]
pub struct RetryingGenerator {
    backend: Arc<dyn ChatBackend>,
    detector: Arc<dyn RepetitionCheck>,
    max_attempts: u32,
    retry_pause: Duration,
    metrics: MetricsCollector,
}

impl RetryingGenerator {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            detector: Arc::new(RepetitionDetector::default()),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_pause: DEFAULT_RETRY_PAUSE,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn RepetitionCheck>) -> Self {
        self.detector = detector;
        self
    }

    /// At least one attempt is always made.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Generates a reply to `conversation`.
    ///
    /// # Errors
    ///
    /// Returns the transport error of the first attempt that failed to reach
    /// the server or got an unusable response.
    pub async fn generate(
        &self,
        conversation: &Conversation,
        profile: &CallProfile,
    ) -> Result<Generation, LlmError> {
        let schedule = SamplingSchedule::new(profile.sampling);
        let messages = conversation.to_messages();
        let mut attempt = 1;

        loop {
            let sampling = schedule.params_for_attempt(attempt);
            let request = ChatRequest::new(&messages, profile.max_tokens, sampling);

            let started = Instant::now();
            let outcome = match self.backend.complete(&request, profile.timeout).await {
                Ok(text) => {
                    let detection = self.detector.check(&text);
                    AttemptOutcome::Completed { text, detection }
                }
                Err(err) => AttemptOutcome::TransportFailure(err),
            };
            self.metrics.record_generation_attempt(
                profile.name,
                outcome.label(),
                started.elapsed().as_secs_f64(),
            );

            match (decide(attempt, self.max_attempts, &outcome), outcome) {
                (RetryDecision::Abort, AttemptOutcome::TransportFailure(err)) => {
                    tracing::warn!(call = profile.name, attempt, error = %err, "Generation failed");
                    return Err(err);
                }
                (RetryDecision::Retry, AttemptOutcome::Completed { detection, .. }) => {
                    tracing::warn!(
                        call = profile.name,
                        attempt,
                        max_attempts = self.max_attempts,
                        pattern = detection.pattern.as_deref().unwrap_or(""),
                        count = detection.count,
                        "Repetition detected, retrying with higher temperature"
                    );
                    tokio::time::sleep(self.retry_pause).await;
                    attempt += 1;
                }
                (RetryDecision::AcceptDegraded, AttemptOutcome::Completed { text, detection }) => {
                    tracing::warn!(
                        call = profile.name,
                        attempts = attempt,
                        pattern = detection.pattern.as_deref().unwrap_or(""),
                        count = detection.count,
                        "Repetition persists after final attempt, keeping output"
                    );
                    return Ok(Generation {
                        text,
                        attempts: attempt,
                        degraded: true,
                        sampling,
                    });
                }
                (RetryDecision::Accept, AttemptOutcome::Completed { text, .. }) => {
                    return Ok(Generation {
                        text,
                        attempts: attempt,
                        degraded: false,
                        sampling,
                    });
                }
                // `decide` pairs every transport failure with `Abort`.
                (_, AttemptOutcome::TransportFailure(err)) => return Err(err),
                (RetryDecision::Abort, AttemptOutcome::Completed { .. }) => {
                    return Err(LlmError::RequestFailed(format!(
                        "{} aborted after attempt {attempt}",
                        profile.name
                    )));
                }
            }
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cxr_shared::{GeneratedReport, PatientContext, Provenance};

use super::assembler::{Draft, assemble};
use super::client::{GenerationError, GenerationParams, TextGenerator};
use super::fallback::{FALLBACK_MODEL, fallback_report};
use super::prompt::build_prompt;
use crate::config::{ReportConfig, ReportLanguage, RetryConfig};
use crate::gate::EligiblePrediction;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub warmup_delay: Duration,
    pub warmup_max_delay: Duration,
    pub transient_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            warmup_delay: Duration::from_secs(config.warmup_delay_secs),
            warmup_max_delay: Duration::from_secs(config.warmup_max_delay_secs),
            transient_delay: Duration::from_secs(config.transient_delay_secs),
        }
    }
}

impl RetryPolicy {
    /// Wait before the next attempt, or `None` to stop. `attempt` is 1-based
    /// and counts the attempt that just failed.
    pub fn delay_after(&self, error: &GenerationError, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts || !error.is_transient() {
            return None;
        }
        match error {
            GenerationError::WarmingUp => Some(
                self.warmup_delay
                    .checked_mul(attempt)
                    .unwrap_or(self.warmup_max_delay)
                    .min(self.warmup_max_delay),
            ),
            _ => Some(self.transient_delay),
        }
    }
}

pub struct ReportGenerator {
    client: Arc<dyn TextGenerator>,
    params: GenerationParams,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    language: ReportLanguage,
}

struct RemoteFailure {
    error: GenerationError,
    attempts: u32,
}

impl ReportGenerator {
    pub fn new(client: Arc<dyn TextGenerator>, config: &ReportConfig) -> Self {
        Self {
            client,
            params: GenerationParams::from(config),
            policy: RetryPolicy::from(&config.retry),
            attempt_timeout: config.attempt_timeout(),
            language: config.language,
        }
    }

    pub fn model_id(&self) -> &str {
        self.client.model_id()
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_configured()
    }

    pub fn language(&self) -> ReportLanguage {
        self.language
    }

    /// Always yields a report: remote text when the service cooperates,
    /// the deterministic template otherwise.
    pub async fn generate(
        &self,
        eligible: &EligiblePrediction,
        patient: &PatientContext,
    ) -> GeneratedReport {
        let generated_at = Utc::now();
        let draft = match self.remote_draft(eligible, patient, generated_at).await {
            Ok(draft) => draft,
            Err(failure) => {
                log::warn!(
                    "Report service failed after {} attempt(s) ({}), using fallback template",
                    failure.attempts,
                    failure.error
                );
                Draft {
                    text: fallback_report(eligible, generated_at, self.language),
                    provenance: Provenance::Fallback,
                    model: FALLBACK_MODEL.to_string(),
                    attempts: failure.attempts,
                    generated_at,
                    language: self.language,
                }
            }
        };
        assemble(draft, eligible)
    }

    async fn remote_draft(
        &self,
        eligible: &EligiblePrediction,
        patient: &PatientContext,
        generated_at: DateTime<Utc>,
    ) -> Result<Draft, RemoteFailure> {
        if !self.client.is_configured() {
            return Err(RemoteFailure {
                error: GenerationError::Unconfigured,
                attempts: 0,
            });
        }

        let prompt = build_prompt(eligible.prediction(), patient, generated_at, self.language);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::time::timeout(
                self.attempt_timeout,
                self.client.generate(&prompt, &self.params),
            )
            .await
            .unwrap_or(Err(GenerationError::Timeout));

            match result {
                Ok(text) => {
                    return Ok(Draft {
                        text,
                        provenance: Provenance::Remote,
                        model: self.client.model_id().to_string(),
                        attempts: attempt,
                        generated_at,
                        language: self.language,
                    });
                }
                Err(error) => match self.policy.delay_after(&error, attempt) {
                    Some(delay) => {
                        log::warn!(
                            "Report attempt {}/{} failed: {}. Retrying in {:?}",
                            attempt,
                            self.policy.max_attempts,
                            error,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(RemoteFailure {
                            error,
                            attempts: attempt,
                        });
                    }
                },
            }
        }
    }
}

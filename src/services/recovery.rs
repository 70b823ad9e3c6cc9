//! Turns free-text model output into a schema-valid analysis result.
//!
//! Strategies run cheapest first and stop at the first one that parses:
//! the raw text, the text inside a code fence, and the outermost JSON span.
//! Whatever parses must pass the `ContentAnalysis` gate. If it does not, or
//! nothing parses, a cheaper model is asked to repair the formatting.

use async_trait::async_trait;
use serde_json::Value;

use crate::models::analysis::ContentAnalysis;
use crate::services::backend::{AnalysisBackend, GenerateRequest, ModelTier, ServiceError};
use crate::services::credentials::Credential;
use crate::services::prompts;

const FENCE: &str = "```";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RecoveryStage {
    Direct,
    FenceStripped,
    SpanExtracted,
    Repaired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recovered {
    pub value: Value,
    pub stage: RecoveryStage,
    /// Repair calls made before the value was recovered
    pub repair_attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("Could not recover a structured result from the model output after {attempts} repair attempt(s): {reason}. Raw output: {raw}")]
    Unrecoverable {
        raw: String,
        attempts: u32,
        reason: String,
    },
}

/// Formatting-only fixer for malformed model output.
#[async_trait]
pub trait Repairer: Send + Sync {
    async fn repair(&self, text: &str) -> Result<String, ServiceError>;
}

/// Repairs through the backend's repair-tier model.
pub struct ModelRepairer<'a> {
    backend: &'a dyn AnalysisBackend,
    credential: &'a Credential,
}

impl<'a> ModelRepairer<'a> {
    pub fn new(backend: &'a dyn AnalysisBackend, credential: &'a Credential) -> Self {
        Self {
            backend,
            credential,
        }
    }
}

#[async_trait]
impl Repairer for ModelRepairer<'_> {
    async fn repair(&self, text: &str) -> Result<String, ServiceError> {
        let prompt = prompts::repair_prompt(text);
        self.backend
            .generate(
                GenerateRequest {
                    tier: ModelTier::Repair,
                    media: None,
                    prompt: &prompt,
                },
                self.credential,
            )
            .await
    }
}

fn parse(text: &str) -> Option<Value> {
    serde_json::from_str(text.trim()).ok()
}

/// Bodies of every code fence in order, language tags dropped. An
/// unterminated fence yields everything after its opener.
pub fn fence_bodies(text: &str) -> Vec<&str> {
    let mut bodies = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find(FENCE) {
        let after_open = &rest[open + FENCE.len()..];
        let body = match after_open.find('\n') {
            Some(eol) if is_language_tag(after_open[..eol].trim()) => &after_open[eol + 1..],
            _ => after_open,
        };
        match body.find(FENCE) {
            Some(close) => {
                bodies.push(&body[..close]);
                rest = &body[close + FENCE.len()..];
            }
            None => {
                bodies.push(body);
                break;
            }
        }
    }
    bodies
}

fn is_language_tag(line: &str) -> bool {
    line.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '.'))
}

/// Slice from the earliest `{` or `[` to the latest `}` or `]`.
pub fn extract_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let end = text.rfind(['}', ']'])?;
    (start < end).then(|| &text[start..=end])
}

/// Run the parse stages in order and return the first value that parses.
fn first_parse(text: &str) -> Option<(Value, RecoveryStage)> {
    if let Some(value) = parse(text) {
        return Some((value, RecoveryStage::Direct));
    }

    let fenced = fence_bodies(text);
    if let Some(value) = fenced.iter().find_map(|body| parse(body)) {
        return Some((value, RecoveryStage::FenceStripped));
    }

    // A fence may hold an example while the payload sits in the prose around
    // it, so the whole text is the last place to look.
    fenced
        .into_iter()
        .chain(std::iter::once(text))
        .find_map(|candidate| extract_span(candidate).and_then(parse))
        .map(|value| (value, RecoveryStage::SpanExtracted))
}

/// Recover a schema-valid result from `raw`, escalating to `repairer` for at
/// most `max_repairs` calls when the cheap stages fail.
pub async fn recover(
    raw: &str,
    repairer: Option<&dyn Repairer>,
    max_repairs: u32,
) -> Result<Recovered, RecoveryError> {
    let mut reason = match first_parse(raw) {
        Some((value, stage)) => match ContentAnalysis::check(&value) {
            Ok(()) => {
                return Ok(Recovered {
                    value,
                    stage,
                    repair_attempts: 0,
                })
            }
            Err(reason) => format!("output does not match the analysis schema ({})", reason),
        },
        None => "output is not valid JSON".to_string(),
    };

    let Some(repairer) = repairer else {
        return Err(RecoveryError::Unrecoverable {
            raw: raw.to_string(),
            attempts: 0,
            reason,
        });
    };

    let mut input = raw.to_string();
    let mut attempts = 0;
    while attempts < max_repairs {
        attempts += 1;
        match repairer.repair(&input).await {
            Ok(output) => match first_parse(&output) {
                Some((value, _)) => match ContentAnalysis::check(&value) {
                    Ok(()) => {
                        return Ok(Recovered {
                            value,
                            stage: RecoveryStage::Repaired,
                            repair_attempts: attempts,
                        })
                    }
                    Err(why) => {
                        tracing::warn!(attempt = attempts, error = %why, "Repaired output failed schema validation");
                        reason = format!("repaired output does not match the analysis schema ({})", why);
                        break;
                    }
                },
                None => {
                    tracing::warn!(attempt = attempts, "Repaired output is still not valid JSON");
                    reason = "repaired output is still not valid JSON".to_string();
                    input = output;
                }
            },
            Err(e) if e.is_transient() => {
                tracing::warn!(attempt = attempts, error = %e, "Repair call failed transiently");
                reason = e.to_string();
            }
            Err(e) => {
                tracing::warn!(attempt = attempts, error = %e, "Repair call failed");
                reason = e.to_string();
                break;
            }
        }
    }

    Err(RecoveryError::Unrecoverable {
        raw: raw.to_string(),
        attempts,
        reason,
    })
}

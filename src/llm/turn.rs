//! Turn generator: one generator call per turn, parsed into a structured
//! result, with a canned fallback on any failure.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::flow::phase::FlowPhase;
use crate::flow::state::{ContextDelta, Role as TurnRole, Turn};
use crate::governance::GovernanceConfig;

use super::provider::{ChatMessage, CompletionRequest, LlmProvider};

/// Tunables for generator calls.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Hard limit for one call; exceeding it is a failure, not a retry.
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            max_tokens: 600,
            temperature: 0.4,
        }
    }
}

/// Optional sub-scores the generator may report alongside readiness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubScores {
    pub clarity: Option<f64>,
    pub emotional_processing: Option<f64>,
    pub specificity: Option<f64>,
}

/// Parsed generator output.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutput {
    pub content: String,
    /// Already clamped into 0.0..=1.0.
    pub readiness: f64,
    /// Advisory only; the controller decides transitions.
    pub next_phase: Option<String>,
    pub signals: Option<SubScores>,
    pub context_updates: ContextDelta,
}

/// The result of a turn, generated or canned.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedTurn {
    pub output: TurnOutput,
    pub fell_back: bool,
}

/// Calls the generator and degrades to canned replies on failure.
pub struct TurnGenerator {
    llm: Option<Arc<dyn LlmProvider>>,
    governance: Arc<GovernanceConfig>,
    config: GeneratorConfig,
}

impl TurnGenerator {
    pub fn new(
        llm: Option<Arc<dyn LlmProvider>>,
        governance: Arc<GovernanceConfig>,
        config: GeneratorConfig,
    ) -> Self {
        Self {
            llm,
            governance,
            config,
        }
    }

    /// Generate a reply. Never fails: errors become the phase's canned reply.
    pub async fn generate(
        &self,
        phase: FlowPhase,
        instructions: &str,
        history: &[Turn],
        user_input: &str,
    ) -> GeneratedTurn {
        match self.try_generate(instructions, history, user_input).await {
            Ok(output) => GeneratedTurn {
                output,
                fell_back: false,
            },
            Err(e) => {
                warn!(phase = %phase, error = %e, "Generator failed, using fallback reply");
                GeneratedTurn {
                    output: self.fallback(phase),
                    fell_back: true,
                }
            }
        }
    }

    /// The canned reply for `phase`.
    pub fn fallback(&self, phase: FlowPhase) -> TurnOutput {
        let (reply, readiness) = self.governance.fallback_for(phase);
        TurnOutput {
            content: reply.to_string(),
            readiness,
            next_phase: None,
            signals: None,
            context_updates: ContextDelta::default(),
        }
    }

    async fn try_generate(
        &self,
        instructions: &str,
        history: &[Turn],
        user_input: &str,
    ) -> Result<TurnOutput, LlmError> {
        let llm = self.llm.as_ref().ok_or_else(|| LlmError::RequestFailed {
            provider: "none".to_string(),
            reason: "no generator configured".to_string(),
        })?;

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(instructions));
        for turn in history {
            messages.push(match turn.role {
                TurnRole::User => ChatMessage::user(&turn.content),
                TurnRole::Assistant => ChatMessage::assistant(&turn.content),
            });
        }
        messages.push(ChatMessage::user(user_input));

        let request = CompletionRequest::new(messages)
            .with_max_tokens(self.config.max_tokens)
            .with_temperature(self.config.temperature);

        let response = tokio::time::timeout(self.config.timeout, llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: llm.model_name().to_string(),
                timeout: self.config.timeout,
            })??;

        debug!(
            model = llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Generator responded"
        );

        parse_turn_output(llm.model_name(), &response.content)
    }
}

/// Parse the generator's JSON object.
///
/// `content` (or `reply`) and `readiness` are required. Readiness may be a
/// number or a numeric string and is clamped into 0.0..=1.0.
pub fn parse_turn_output(provider: &str, raw: &str) -> Result<TurnOutput, LlmError> {
    let invalid = |reason: &str| LlmError::InvalidResponse {
        provider: provider.to_string(),
        reason: reason.to_string(),
    };

    let json = extract_json_object(raw).ok_or_else(|| invalid("no JSON object in output"))?;
    let value: Value = serde_json::from_str(json)?;
    let obj = value
        .as_object()
        .ok_or_else(|| invalid("output is not a JSON object"))?;

    let content = obj
        .get("content")
        .or_else(|| obj.get("reply"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("missing content"))?
        .to_string();

    let readiness = match obj.get("readiness") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid("missing or non-numeric readiness"))?;
    if !readiness.is_finite() {
        return Err(invalid("readiness is not finite"));
    }

    let next_phase = obj
        .get("next_phase")
        .and_then(Value::as_str)
        .map(str::to_string);

    let signals = obj
        .get("signals")
        .and_then(|v| serde_json::from_value::<SubScores>(v.clone()).ok());

    let context_updates = match obj.get("context_updates") {
        Some(v) if !v.is_null() => serde_json::from_value::<ContextDelta>(v.clone()).unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring malformed context_updates");
            ContextDelta::default()
        }),
        _ => ContextDelta::default(),
    };

    Ok(TurnOutput {
        content,
        readiness: readiness.clamp(0.0, 1.0),
        next_phase,
        signals,
        context_updates,
    })
}

/// Find the JSON object in output that may be fenced or wrapped in prose.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }

    // Fenced block
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return Some(inner);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

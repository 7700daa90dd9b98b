//! The per-turn pipeline: detect signals, retrieve snippets, compose or
//! generate a reply, run the phase controller, persist, trace.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::deepthink::DeepThinkJob;
use crate::error::{ConfigError, DatabaseError, Error, FlowError, Result};
use crate::governance::{GovernanceConfig, PromptInput, build_instructions};
use crate::llm::{GeneratorConfig, LlmProvider, TurnGenerator};
use crate::snippets::composer::{ComposerContext, compose, render};
use crate::snippets::model::{RankedSnippet, SnippetKind};
use crate::snippets::ranker::{RetrievalQuery, SnippetRetriever};
use crate::store::{
    Database, DeepThinkQueue, PhaseConfigStore, SessionRecord, SessionStore, TraceRecord, TraceSink,
};

use super::controller::{self, Decision, ReplySource};
use super::phase::{FlowPhase, Phase7Step};
use super::phase_config::{PhaseCfg, PhaseConfigResolver, PhaseTable};
use super::phase7::ChosenPath;
use super::signals::{self, SignalSnapshot, heuristic_readiness};
use super::state::{ContextDelta, FlowState, SessionStatus, Turn};

/// One user turn.
///
/// `flow_state` and `current_phase` may be carried by the client; when
/// absent the stored session (or a fresh one) is used.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub session_id: String,
    pub user_input: String,
    #[serde(default)]
    pub current_phase: Option<FlowPhase>,
    #[serde(default)]
    pub flow_state: Option<FlowState>,
    /// Explicit forward jump; the only way to skip the successor phase.
    #[serde(default)]
    pub jump_to: Option<FlowPhase>,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, user_input: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_input: user_input.into(),
            current_phase: None,
            flow_state: None,
            jump_to: None,
        }
    }

    pub fn with_state(mut self, phase: FlowPhase, state: FlowState) -> Self {
        self.current_phase = Some(phase);
        self.flow_state = Some(state);
        self
    }

    pub fn with_jump(mut self, target: FlowPhase) -> Self {
        self.jump_to = Some(target);
        self
    }
}

/// The engine's answer to one turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub content: String,
    pub current_phase: FlowPhase,
    pub phase_advanced: bool,
    pub readiness: f64,
    pub flow_state: FlowState,
    pub decision: Decision,
    pub source: ReplySource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub substate: Option<Phase7Step>,
    pub status: SessionStatus,
    pub snippet_ids: Vec<String>,
}

/// A reply before the controller and persistence run.
#[derive(Debug, Clone)]
pub(super) struct Reply {
    pub content: String,
    pub readiness: f64,
    pub source: ReplySource,
    pub snippet_ids: Vec<String>,
    pub context_updates: ContextDelta,
    pub proposed_next_phase: Option<String>,
}

impl Reply {
    pub(super) fn scripted(content: impl Into<String>, readiness: f64) -> Self {
        Self {
            content: content.into(),
            readiness,
            source: ReplySource::Script,
            snippet_ids: Vec::new(),
            context_updates: ContextDelta::default(),
            proposed_next_phase: None,
        }
    }
}

/// What processing a turn produced.
#[derive(Debug)]
pub(super) struct TurnOutcome {
    pub reply: Reply,
    pub decision: Decision,
    /// Phase the session is in after the turn.
    pub phase: FlowPhase,
    pub context_fields: Vec<String>,
    /// Deep Think was chosen; enqueue a job once the state is saved.
    pub pause: bool,
}

/// The Flow Engine. Holds no per-session state; everything mutable lives
/// in `FlowState`.
pub struct FlowEngine {
    pub(super) resolver: PhaseConfigResolver,
    pub(super) retriever: SnippetRetriever,
    pub(super) generator: TurnGenerator,
    pub(super) governance: Arc<GovernanceConfig>,
    pub(super) sessions: Arc<dyn SessionStore>,
    pub(super) traces: Option<Arc<dyn TraceSink>>,
    pub(super) deepthink: Arc<dyn DeepThinkQueue>,
    pub(super) deepthink_delay: Duration,
}

impl FlowEngine {
    /// An engine with built-in phase policy, no retrieval and no generator
    /// (every generated turn uses the canned fallback).
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        deepthink: Arc<dyn DeepThinkQueue>,
        governance: Arc<GovernanceConfig>,
    ) -> Self {
        Self {
            resolver: PhaseConfigResolver::builtin(),
            retriever: SnippetRetriever::disabled(),
            generator: TurnGenerator::new(None, Arc::clone(&governance), GeneratorConfig::default()),
            governance,
            sessions,
            traces: None,
            deepthink,
            deepthink_delay: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Wire every collaborator to one backend.
    pub fn from_database<D: Database + 'static>(
        db: Arc<D>,
        llm: Option<Arc<dyn LlmProvider>>,
        governance: Arc<GovernanceConfig>,
        config: &EngineConfig,
    ) -> Self {
        let generator_config = GeneratorConfig {
            timeout: config.generator_timeout,
            ..Default::default()
        };
        let phase_store: Arc<dyn PhaseConfigStore> = db.clone();
        Self::new(db.clone(), db.clone(), governance)
            .with_resolver(PhaseConfigResolver::new(Some(phase_store), PhaseTable::builtin()))
            .with_retriever(SnippetRetriever::new(
                db.clone(),
                config.retrieval_enabled,
                config.retrieval_limit,
            ))
            .with_traces(db)
            .with_generator(llm, generator_config)
            .with_deepthink_delay(config.deepthink_delay)
    }

    pub fn with_resolver(mut self, resolver: PhaseConfigResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_retriever(mut self, retriever: SnippetRetriever) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn with_generator(mut self, llm: Option<Arc<dyn LlmProvider>>, config: GeneratorConfig) -> Self {
        self.generator = TurnGenerator::new(llm, Arc::clone(&self.governance), config);
        self
    }

    pub fn with_traces(mut self, traces: Arc<dyn TraceSink>) -> Self {
        self.traces = Some(traces);
        self
    }

    pub fn with_deepthink_delay(mut self, delay: Duration) -> Self {
        self.deepthink_delay = delay;
        self
    }

    pub fn governance(&self) -> &GovernanceConfig {
        &self.governance
    }

    /// The phase policy as it would apply to the next turn.
    pub async fn phase_table(&self) -> PhaseTable {
        self.resolver.load().await
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.load_session(session_id).await?)
    }

    /// Process one user turn end to end.
    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnResponse> {
        let session_id = request.session_id.trim().to_string();
        if session_id.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "sessionId".into(),
                message: "must not be empty".into(),
            }
            .into());
        }
        let input = request.user_input.trim().to_string();

        let table = self.resolver.load().await;
        let (from, mut state) = self.starting_point(&session_id, &request, &table).await?;
        match state.status {
            SessionStatus::Paused => return Err(FlowError::SessionPaused { session_id }.into()),
            SessionStatus::Complete => return Err(FlowError::SessionComplete { session_id }.into()),
            SessionStatus::Active => {}
        }
        let expected_version = state.version;
        let turn_index = state.turn_count;

        let mut phase = from;
        let mut jumped = false;
        if let Some(target) = request.jump_to.filter(|t| *t != from) {
            phase = controller::validate_jump(&table, from, target)?;
            state.reset_reprompts();
            state.previous_phase = Some(from);
            state.substate = None;
            jumped = true;
            info!(session_id = %session_id, from = %from, to = %phase, "Explicit phase jump");
        }
        let cfg = table.resolve(phase)?.clone();

        // Phrases and template values are collected from every turn.
        state
            .context
            .phase7
            .user_language
            .absorb(signals::extract_user_language(&input));
        let template_values = ContextDelta {
            last_feeling: signals::first_feeling(&input),
            last_value: signals::extract_value(&input),
            ..Default::default()
        };
        let mut context_fields: Vec<String> = state
            .context
            .merge(&template_values)
            .into_iter()
            .map(String::from)
            .collect();

        let snapshot = SignalSnapshot::analyze(
            &input,
            &state.conversation_history,
            phase,
            state.previous_phase,
            state.readiness,
        );
        debug!(session_id = %session_id, phase = %phase, signals = ?snapshot, "Signals detected");

        let outcome = if phase.is_terminal() {
            self.message_turn(&cfg, &mut state, &snapshot, &input, jumped)
                .await
        } else {
            self.phase_turn(&table, &cfg, &mut state, &snapshot, &input, jumped)
                .await
        };
        context_fields.extend(outcome.context_fields.iter().cloned());

        let reply = outcome.reply;
        state.set_readiness(reply.readiness);
        state.previous_phase = Some(phase);
        if outcome.pause {
            state.status = SessionStatus::Paused;
        }
        state.record_exchange(phase, &input, &reply.content);

        // Enqueue before saving: a stored paused session always has a job.
        // A job whose save loses the version race is dropped by the sweeper.
        let job = if outcome.pause {
            let job = DeepThinkJob::new(&session_id, state.clone(), self.deepthink_delay);
            self.deepthink.enqueue_deepthink(&job).await?;
            Some(job)
        } else {
            None
        };

        let record = SessionRecord {
            session_id: session_id.clone(),
            current_phase: outcome.phase,
            state: state.clone(),
            updated_at: Utc::now(),
        };
        state.version = self
            .sessions
            .save_session(&record, expected_version)
            .await
            .map_err(storage_error)?;

        if let Some(job) = &job {
            info!(session_id = %session_id, job_id = %job.id, due_at = %job.due_at, "Session paused for Deep Think");
        }

        self.dispatch_trace(TraceRecord {
            id: Uuid::new_v4(),
            session_id: session_id.clone(),
            turn_index,
            phase,
            substate: state.substate,
            user_input: input,
            ai_response: reply.content.clone(),
            readiness: state.readiness,
            decision: outcome.decision,
            source: reply.source,
            snippet_ids: reply.snippet_ids.clone(),
            proposed_next_phase: reply.proposed_next_phase.clone(),
            context_fields,
            created_at: Utc::now(),
        });

        info!(
            session_id = %session_id,
            from = %from,
            to = %outcome.phase,
            decision = %outcome.decision,
            readiness = state.readiness,
            source = reply.source.as_str(),
            "Turn processed"
        );

        Ok(TurnResponse {
            content: reply.content,
            current_phase: outcome.phase,
            phase_advanced: outcome.phase != from,
            readiness: state.readiness,
            substate: state.substate,
            status: state.status,
            decision: outcome.decision,
            source: reply.source,
            snippet_ids: reply.snippet_ids,
            flow_state: state,
        })
    }

    /// Where this turn starts: the client's state if it sent one, else the
    /// stored session, else a fresh session at the first enabled phase.
    async fn starting_point(
        &self,
        session_id: &str,
        request: &TurnRequest,
        table: &PhaseTable,
    ) -> Result<(FlowPhase, FlowState)> {
        let stored = self.sessions.load_session(session_id).await?;
        let stored_phase = stored.as_ref().map(|r| r.current_phase);
        let state = match (&request.flow_state, stored) {
            (Some(state), _) => state.clone(),
            (None, Some(record)) => record.state,
            (None, None) => FlowState::default(),
        };
        let phase = request
            .current_phase
            .or(stored_phase)
            .or_else(|| table.first_phase())
            .ok_or_else(|| ConfigError::UnknownPhase {
                phase: "(no enabled phases)".into(),
            })?;
        Ok((phase, state))
    }

    /// A turn in any phase before `message`.
    async fn phase_turn(
        &self,
        table: &PhaseTable,
        cfg: &PhaseCfg,
        state: &mut FlowState,
        signals: &SignalSnapshot,
        input: &str,
        jumped: bool,
    ) -> TurnOutcome {
        let phase = cfg.phase;
        let ranked = self
            .retriever
            .retrieve(&retrieval_query(phase, state, signals, input))
            .await;
        let composer_ctx = ComposerContext::new(phase, &state.context, signals);

        let reply = match compose_shortcut(phase, state, signals, &ranked, &composer_ctx, input) {
            Some(reply) => reply,
            None if phase.is_exploratory() && signals.wants_containment() => {
                debug!(phase = %phase, "No containment snippets, using governance copy");
                Reply::scripted(
                    self.governance.containment_for(phase),
                    heuristic_readiness(signals, input),
                )
            }
            None => self.generate(phase, None, state, signals, &ranked, input).await,
        };
        let mut context_fields: Vec<String> = state
            .context
            .merge(&reply.context_updates)
            .into_iter()
            .map(String::from)
            .collect();

        let next = table.effective_next(phase);
        let (decision, to) = if jumped {
            (Decision::Jump, phase)
        } else {
            let decision = controller::decide(cfg, next, reply.readiness, state.reprompt_count);
            (decision, controller::apply(state, phase, decision, next).to)
        };

        if to != phase {
            if state.context.summary_for(phase).is_none() {
                let fallback_summary = ContextDelta::for_phase(phase, input);
                context_fields.extend(state.context.merge(&fallback_summary).into_iter().map(String::from));
            }
            if to.is_terminal() {
                state.substate = table
                    .resolve(to)
                    .ok()
                    .and_then(|c| c.substate_order.first().copied())
                    .or(Some(Phase7Step::Integrate));
            }
            info!(from = %phase, to = %to, decision = %decision, readiness = reply.readiness, "Phase advanced");
        }

        TurnOutcome {
            reply,
            decision,
            phase: to,
            context_fields,
            pause: false,
        }
    }

    /// Ask the generator for a reply.
    pub(super) async fn generate(
        &self,
        phase: FlowPhase,
        substate: Option<Phase7Step>,
        state: &FlowState,
        signals: &SignalSnapshot,
        ranked: &[RankedSnippet],
        input: &str,
    ) -> Reply {
        let instructions = build_instructions(
            &self.governance,
            &PromptInput {
                phase,
                substate,
                context: &state.context,
                snippets: ranked,
                signals,
                reprompt_count: state.reprompt_count,
            },
        );
        let generated = self
            .generator
            .generate(phase, &instructions, &state.conversation_history, input)
            .await;
        let (source, snippet_ids) = if generated.fell_back {
            (ReplySource::Fallback, Vec::new())
        } else {
            (
                ReplySource::Generator,
                ranked
                    .iter()
                    .filter(|r| r.snippet.is_approved())
                    .map(|r| r.snippet.id.clone())
                    .collect(),
            )
        };
        Reply {
            content: generated.output.content,
            readiness: generated.output.readiness,
            source,
            snippet_ids,
            context_updates: generated.output.context_updates,
            proposed_next_phase: generated.output.next_phase,
        }
    }

    pub(super) fn dispatch_trace(&self, trace: TraceRecord) {
        let Some(sink) = self.traces.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = sink.record_trace(&trace).await {
                warn!(session_id = %trace.session_id, turn = trace.turn_index, error = %e, "Trace write failed");
            }
        });
    }

    /// Restore a Deep Think snapshot and make the session active again at
    /// the co-author step.
    pub async fn resume_deep_think(&self, job: &DeepThinkJob) -> Result<()> {
        let Some(current) = self.sessions.load_session(&job.session_id).await? else {
            return Err(FlowError::NothingToResume {
                session_id: job.session_id.clone(),
            }
            .into());
        };
        if current.state.status != SessionStatus::Paused {
            return Err(FlowError::NothingToResume {
                session_id: job.session_id.clone(),
            }
            .into());
        }

        let mut state = job.snapshot.clone();
        state.status = SessionStatus::Active;
        state.substate = Some(Phase7Step::CoAuthor);
        state.context.phase7.deepthink_offered = false;
        if state.context.phase7.chosen_option == Some(ChosenPath::DeepThink) {
            state.context.phase7.chosen_option = None;
        }
        let greeting = self.governance.phase7.deepthink_resumed.clone();
        state.last_response = Some(greeting.clone());
        state.push_turn(Turn::assistant(greeting, FlowPhase::Message));

        let record = SessionRecord {
            session_id: job.session_id.clone(),
            current_phase: current.current_phase,
            state,
            updated_at: Utc::now(),
        };
        self.sessions
            .save_session(&record, current.state.version)
            .await
            .map_err(storage_error)?;
        info!(session_id = %job.session_id, job_id = %job.id, "Deep Think session resumed");
        Ok(())
    }

    /// Claim due Deep Think jobs and resume their sessions. Returns how
    /// many sessions were resumed.
    pub async fn resume_due_deep_think(&self, now: DateTime<Utc>, limit: usize) -> usize {
        let jobs = match self.deepthink.claim_due_deepthink(now, limit).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Failed to claim Deep Think jobs");
                return 0;
            }
        };

        let mut resumed = 0;
        for job in jobs {
            let finished = match self.resume_deep_think(&job).await {
                Ok(()) => {
                    resumed += 1;
                    true
                }
                Err(Error::Flow(FlowError::NothingToResume { .. })) => {
                    warn!(session_id = %job.session_id, job_id = %job.id, "Session no longer paused, dropping Deep Think job");
                    true
                }
                Err(e) => {
                    warn!(session_id = %job.session_id, job_id = %job.id, error = %e, "Deep Think resume failed");
                    false
                }
            };
            if finished {
                if let Err(e) = self.deepthink.complete_deepthink(job.id).await {
                    warn!(job_id = %job.id, error = %e, "Failed to mark Deep Think job done");
                }
            }
        }
        resumed
    }
}

/// Version conflicts are a session-level integrity error.
fn storage_error(e: DatabaseError) -> Error {
    match e {
        DatabaseError::VersionConflict {
            session_id,
            expected,
            found,
        } => FlowError::VersionConflict {
            session_id,
            expected,
            found,
        }
        .into(),
        other => other.into(),
    }
}

pub(super) fn retrieval_query(
    phase: FlowPhase,
    state: &FlowState,
    signals: &SignalSnapshot,
    input: &str,
) -> RetrievalQuery {
    let mut tags = vec![phase.as_str().to_string()];
    if signals.wants_containment() {
        tags.push("containment".into());
    }
    if signals.bridge {
        tags.push("phase_transition".into());
    }
    if signals.nudge {
        tags.push("child_impact".into());
    }
    let p7 = &state.context.phase7;
    RetrievalQuery {
        text: input.to_string(),
        phase,
        tags,
        closure: signals.closure,
        boundary: signals.boundary,
        intensity: signals.intensity,
        has_seed: p7.draft_message.is_some(),
        missing_required: phase.is_terminal() && !p7.user_language.has_required(),
    }
}

/// Answer from snippets alone when that is what the turn calls for:
/// containment in phases 1–5, and the first presentation of options.
fn compose_shortcut(
    phase: FlowPhase,
    state: &FlowState,
    signals: &SignalSnapshot,
    ranked: &[RankedSnippet],
    ctx: &ComposerContext,
    input: &str,
) -> Option<Reply> {
    let applies = match phase {
        p if p.is_exploratory() => signals.wants_containment(),
        FlowPhase::Options => !signals.wants_containment() && state.context.options.is_empty(),
        _ => false,
    };
    if !applies {
        return None;
    }
    let composition = compose(ranked, ctx)?;

    let mut context_updates = ContextDelta::default();
    if phase == FlowPhase::Options {
        let invitations: Vec<String> = composition
            .snippet_ids
            .iter()
            .zip(&composition.kinds)
            .filter(|(_, kind)| **kind == SnippetKind::OptionInvitation)
            .filter_map(|(id, _)| ranked.iter().find(|r| &r.snippet.id == id))
            .filter_map(|r| render(&r.snippet.content, ctx).ok())
            .collect();
        context_updates.options = Some(invitations);
    }

    debug!(phase = %phase, snippets = ?composition.snippet_ids, "Reply composed from snippets");
    Some(Reply {
        content: composition.text,
        readiness: heuristic_readiness(signals, input),
        source: ReplySource::Composer,
        snippet_ids: composition.snippet_ids,
        context_updates,
        proposed_next_phase: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snippets::model::FlowSnippet;

    fn ranked(snippet: FlowSnippet) -> RankedSnippet {
        RankedSnippet {
            snippet,
            similarity: 0.5,
            score: 0.5,
        }
    }

    #[test]
    fn query_tags_follow_signals() {
        let state = FlowState::default();
        let signals = SignalSnapshot {
            closure: true,
            bridge: true,
            ..Default::default()
        };
        let q = retrieval_query(FlowPhase::Feelings, &state, &signals, "I'm done");
        assert_eq!(q.tags, vec!["feelings", "containment", "phase_transition"]);
        assert!(q.closure);
        assert!(!q.missing_required);

        let q = retrieval_query(FlowPhase::Message, &state, &SignalSnapshot::default(), "ok");
        assert!(q.missing_required);
        assert!(!q.has_seed);
    }

    #[test]
    fn shortcut_only_for_containment_in_early_phases() {
        let state = FlowState::default();
        let snippets = vec![
            ranked(FlowSnippet::new("c1", SnippetKind::Containment, None, "We can pause here.")),
            ranked(FlowSnippet::new("p1", SnippetKind::Prompt, None, "What happened?")),
        ];
        let calm = SignalSnapshot::default();
        let ctx = ComposerContext::new(FlowPhase::Issue, &state.context, &calm);
        assert!(compose_shortcut(FlowPhase::Issue, &state, &calm, &snippets, &ctx, "hi").is_none());

        let done = SignalSnapshot {
            closure: true,
            ..Default::default()
        };
        let ctx = ComposerContext::new(FlowPhase::Issue, &state.context, &done);
        let reply = compose_shortcut(FlowPhase::Issue, &state, &done, &snippets, &ctx, "that's it").unwrap();
        assert_eq!(reply.content, "We can pause here.");
        assert_eq!(reply.source, ReplySource::Composer);
        assert!((reply.readiness - 0.75).abs() < 1e-9);
    }

    #[test]
    fn options_shortcut_records_invitations() {
        let state = FlowState::default();
        let snippets = vec![
            ranked(FlowSnippet::new("o1", SnippetKind::OptionInvitation, Some(FlowPhase::Options), "You could talk to {coparent_name}.")),
            ranked(FlowSnippet::new("o2", SnippetKind::OptionInvitation, Some(FlowPhase::Options), "You could wait a week.")),
        ];
        let signals = SignalSnapshot::default();
        let ctx = ComposerContext::new(FlowPhase::Options, &state.context, &signals);
        let reply = compose_shortcut(FlowPhase::Options, &state, &signals, &snippets, &ctx, "ok").unwrap();
        assert_eq!(
            reply.context_updates.options,
            Some(vec![
                "You could talk to your co-parent.".to_string(),
                "You could wait a week.".to_string()
            ])
        );

        let mut seen = FlowState::default();
        seen.context.options = vec!["x".into()];
        assert!(compose_shortcut(FlowPhase::Options, &seen, &signals, &snippets, &ctx, "ok").is_none());
    }

    #[test]
    fn version_conflicts_become_flow_errors() {
        let e = storage_error(DatabaseError::VersionConflict {
            session_id: "s".into(),
            expected: 1,
            found: 2,
        });
        assert!(matches!(e, Error::Flow(FlowError::VersionConflict { found: 2, .. })));
        let e = storage_error(DatabaseError::Query("boom".into()));
        assert!(matches!(e, Error::Database(_)));
    }
}

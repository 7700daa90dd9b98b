//! The `message` phase sub-flow: one sub-state per turn, from integrating
//! what was shared through to containment.

use tracing::{debug, info, warn};

use crate::snippets::composer::{ComposerContext, Composition, compose, render};
use crate::snippets::model::RankedSnippet;

use super::controller::{Decision, ReplySource};
use super::engine::{FlowEngine, Reply, TurnOutcome, retrieval_query};
use super::phase::{FlowPhase, Phase7Step};
use super::phase_config::PhaseCfg;
use super::phase7::{self, ChosenPath, Phase7Action};
use super::signals::{SignalSnapshot, detect_emotional_intensity, heuristic_readiness};
use super::state::{ContextDelta, FlowState, Role, SessionStatus};

/// Recent user turns considered when gauging peak intensity.
const INTENSITY_WINDOW: usize = 4;

impl FlowEngine {
    pub(super) async fn message_turn(
        &self,
        cfg: &PhaseCfg,
        state: &mut FlowState,
        signals: &SignalSnapshot,
        input: &str,
        jumped: bool,
    ) -> TurnOutcome {
        let order = if cfg.substate_order.is_empty() {
            Phase7Step::DEFAULT_ORDER.to_vec()
        } else {
            cfg.substate_order.clone()
        };
        let first = order.first().copied().unwrap_or(Phase7Step::Integrate);
        let step = state.substate.filter(|s| order.contains(s)).unwrap_or(first);
        state.substate = Some(step);

        let harvested = phase7::harvest_user_language(state);
        state.context.phase7.user_language.absorb(harvested);

        let ranked = self
            .retriever
            .retrieve(&retrieval_query(FlowPhase::Message, state, signals, input))
            .await;
        let readiness = heuristic_readiness(signals, input);

        let offer = step == Phase7Step::Option
            && phase7::should_offer_deepthink(
                cfg.allow_deepthink,
                peak_intensity(state, input),
                phase7::complexity_score(state),
            );
        let action = phase7::plan(step, &state.context.phase7, input, offer);
        debug!(step = %step, action = ?action, "Message sub-state");

        let (reply, mut decision) = match action {
            Phase7Action::Integrate => (
                self.integrate(state, signals, &ranked, input, readiness).await,
                Decision::Substate,
            ),
            Phase7Action::PresentOptions { offer_deepthink } => (
                self.present_options(state, offer_deepthink, readiness),
                Decision::Substate,
            ),
            Phase7Action::PauseForDeepThink => {
                state.context.phase7.chosen_option = Some(ChosenPath::DeepThink);
                (
                    Reply::scripted(&self.governance.phase7.deepthink_paused, readiness),
                    Decision::Pause,
                )
            }
            Phase7Action::CoAuthor { path } => {
                self.co_author(cfg, state, signals, &ranked, path, readiness)
            }
            Phase7Action::FitCheck => (
                self.fit_check(state, signals, &ranked, input, readiness).await,
                Decision::Substate,
            ),
            Phase7Action::Contain => (self.contain(state, input, readiness), Decision::Complete),
        };

        let context_fields = state
            .context
            .merge(&reply.context_updates)
            .into_iter()
            .map(String::from)
            .collect();

        match decision {
            Decision::Substate => match step.next_in(&order) {
                Some(next) => state.substate = Some(next),
                // A custom order without `contain` ends after its last step.
                None => decision = Decision::Complete,
            },
            Decision::Stay => state.increment_reprompts(),
            _ => {}
        }
        if decision == Decision::Complete {
            state.status = SessionStatus::Complete;
            info!(path = ?state.context.phase7.chosen_option, ready_to_send = state.context.phase7.ready_to_send, "Message sub-flow complete");
        }
        let pause = decision == Decision::Pause;
        if jumped && decision == Decision::Substate {
            decision = Decision::Jump;
        }

        TurnOutcome {
            reply,
            decision,
            phase: FlowPhase::Message,
            context_fields,
            pause,
        }
    }

    async fn integrate(
        &self,
        state: &mut FlowState,
        signals: &SignalSnapshot,
        ranked: &[RankedSnippet],
        input: &str,
        readiness: f64,
    ) -> Reply {
        let insights = phase7::integrate_insights(&state.context);
        state.context.phase7.integrated_insights = insights.clone();

        let generated = self
            .generate(FlowPhase::Message, Some(Phase7Step::Integrate), state, signals, ranked, input)
            .await;
        if generated.source == ReplySource::Generator {
            return generated;
        }

        let copy = &self.governance.phase7;
        let mut text = copy.integrate_intro.clone();
        for insight in &insights {
            text.push_str("\n- ");
            text.push_str(insight);
        }
        text.push_str("\n\n");
        text.push_str(&copy.integrate_check);
        Reply::scripted(text, readiness)
    }

    fn present_options(&self, state: &mut FlowState, offer_deepthink: bool, readiness: f64) -> Reply {
        state.context.phase7.deepthink_offered = offer_deepthink;
        let copy = &self.governance.phase7;
        let mut paths = vec![copy.outward_option.as_str(), copy.inward_option.as_str()];
        if offer_deepthink {
            paths.push(&copy.deepthink_option);
        }
        Reply::scripted(
            format!("{}\n\n{}\n\n{}", copy.options_intro, paths.join("\n"), copy.options_prompt),
            readiness,
        )
    }

    /// Collect the user's own phrases, then draft (outward) or reflect
    /// (inward) with them.
    fn co_author(
        &self,
        cfg: &PhaseCfg,
        state: &mut FlowState,
        signals: &SignalSnapshot,
        ranked: &[RankedSnippet],
        path: ChosenPath,
        readiness: f64,
    ) -> (Reply, Decision) {
        let copy = &self.governance.phase7;
        state.context.phase7.chosen_option = Some(path);
        let ctx = ComposerContext::new(FlowPhase::Message, &state.context, signals);

        let p7 = &mut state.context.phase7;
        if !p7.user_language.has_required() {
            if p7.collection_requests >= cfg.max_reprompts {
                info!(missing = ?p7.user_language.missing(), "Phrases never arrived, closing without a draft");
                return (Reply::scripted(&copy.unfinished_closer, readiness), Decision::Complete);
            }
            p7.collection_requests += 1;
            let reply = match compose(ranked, &ctx) {
                Some(composition) => composed(composition, readiness),
                None => Reply::scripted(&copy.collection_request, readiness),
            };
            return (reply, Decision::Stay);
        }

        if path == ChosenPath::Inward {
            let reflection = render(&copy.reflection_template, &ctx).unwrap_or_else(|e| {
                warn!(error = %e, "Reflection template failed to render");
                plain_reflection(&ctx)
            });
            let mut reply = Reply::scripted(reflection.clone(), readiness);
            reply.context_updates = ContextDelta {
                final_reflection: Some(reflection),
                ..Default::default()
            };
            return (reply, Decision::Substate);
        }

        let reply = match compose(ranked, &ctx) {
            Some(composition) => composed(composition, readiness),
            None => Reply::scripted(self.render_draft(&ctx), readiness),
        };
        p7.draft_message = Some(reply.content.clone());
        (reply, Decision::Substate)
    }

    /// The draft template, plus the clarity line when the user voiced an ask.
    fn render_draft(&self, ctx: &ComposerContext) -> String {
        let copy = &self.governance.phase7;
        let mut draft = render(&copy.draft_template, ctx).unwrap_or_else(|e| {
            warn!(error = %e, "Draft template failed to render");
            plain_reflection(ctx)
        });
        if ctx.ask_phrase.is_some() {
            if let Ok(clarity) = render(&copy.clarity_template, ctx) {
                draft.push(' ');
                draft.push_str(&clarity);
            }
        }
        draft
    }

    async fn fit_check(
        &self,
        state: &mut FlowState,
        signals: &SignalSnapshot,
        ranked: &[RankedSnippet],
        input: &str,
        readiness: f64,
    ) -> Reply {
        if let Some(tone) = phase7::tone_from_text(input) {
            state.context.phase7.tone_preference = Some(tone);
        }
        let generated = self
            .generate(FlowPhase::Message, Some(Phase7Step::FitCheck), state, signals, ranked, input)
            .await;
        if generated.source == ReplySource::Generator {
            return generated;
        }
        Reply::scripted(&self.governance.phase7.fit_check_prompt, readiness)
    }

    fn contain(&self, state: &mut FlowState, input: &str, readiness: f64) -> Reply {
        let copy = &self.governance.phase7;
        let p7 = &mut state.context.phase7;
        if let Some(tone) = phase7::tone_from_text(input) {
            p7.tone_preference = Some(tone);
        }
        p7.ready_to_send =
            p7.draft_message.is_some() && p7.chosen_option != Some(ChosenPath::Inward);

        if p7.ready_to_send {
            let mut reply = Reply::scripted(&copy.containment_closer, readiness);
            if state.context.final_reflection.is_none() {
                reply.context_updates.final_reflection = p7.draft_message.clone();
            }
            reply
        } else if state.context.final_reflection.is_some() {
            Reply::scripted(&copy.inward_closer, readiness)
        } else {
            Reply::scripted(&copy.unfinished_closer, readiness)
        }
    }
}

fn composed(composition: Composition, readiness: f64) -> Reply {
    Reply {
        content: composition.text,
        readiness,
        source: ReplySource::Composer,
        snippet_ids: composition.snippet_ids,
        context_updates: ContextDelta::default(),
        proposed_next_phase: None,
    }
}

fn plain_reflection(ctx: &ComposerContext) -> String {
    format!(
        "This matters because {}. I need {}.",
        ctx.why_phrase.as_deref().unwrap_or_default(),
        ctx.need_phrase.as_deref().unwrap_or_default()
    )
}

/// Highest intensity across the latest input and recent user turns.
fn peak_intensity(state: &FlowState, input: &str) -> f64 {
    state
        .conversation_history
        .iter()
        .rev()
        .filter(|t| t.role == Role::User)
        .take(INTENSITY_WINDOW)
        .map(|t| detect_emotional_intensity(&t.content))
        .fold(detect_emotional_intensity(input), f64::max)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::flow::phase_config::PhaseTable;
    use crate::flow::state::Turn;
    use crate::governance::GovernanceConfig;
    use crate::store::LibSqlBackend;

    async fn engine() -> FlowEngine {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        FlowEngine::new(db.clone(), db, Arc::new(GovernanceConfig::builtin()))
    }

    /// Mirrors the engine: phrases from the current input are captured
    /// before the sub-state runs.
    async fn step(engine: &FlowEngine, cfg: &PhaseCfg, state: &mut FlowState, input: &str) -> TurnOutcome {
        state
            .context
            .phase7
            .user_language
            .absorb(crate::flow::signals::extract_user_language(input));
        engine
            .message_turn(cfg, state, &SignalSnapshot::default(), input, false)
            .await
    }

    fn message_cfg() -> PhaseCfg {
        PhaseTable::builtin()
            .resolve(FlowPhase::Message)
            .unwrap()
            .clone()
    }

    fn at(step: Phase7Step) -> FlowState {
        FlowState {
            substate: Some(step),
            ..Default::default()
        }
    }

    #[test]
    fn peak_intensity_looks_back_over_user_turns() {
        let mut state = FlowState::default();
        state.push_turn(Turn::user("I was furious and devastated", FlowPhase::Options));
        state.push_turn(Turn::assistant("That sounds like a lot", FlowPhase::Options));
        let peak = peak_intensity(&state, "okay");
        assert!(peak >= detect_emotional_intensity("I was furious and devastated"));
        assert_eq!(peak_intensity(&FlowState::default(), "okay"), 0.0);
    }

    #[tokio::test]
    async fn integrate_falls_back_to_scripted_summary() {
        let engine = engine().await;
        let mut state = at(Phase7Step::Integrate);
        state.context.issue = Some("pickup times keep changing".into());
        let out = step(&engine, &message_cfg(), &mut state, "ok").await;
        assert_eq!(out.reply.source, ReplySource::Script);
        assert!(out.reply.content.contains("- Naming the issue: pickup times keep changing"));
        assert_eq!(out.decision, Decision::Substate);
        assert_eq!(state.substate, Some(Phase7Step::Option));
        assert_eq!(state.context.phase7.integrated_insights.len(), 1);
    }

    #[tokio::test]
    async fn options_hide_deepthink_when_calm_and_simple() {
        let engine = engine().await;
        let mut state = at(Phase7Step::Option);
        let out = step(&engine, &message_cfg(), &mut state, "yes").await;
        assert!(out.reply.content.contains("1. Draft a message"));
        assert!(!out.reply.content.contains("Deep Think"));
        assert!(!state.context.phase7.deepthink_offered);
        assert_eq!(state.substate, Some(Phase7Step::CoAuthor));
    }

    #[tokio::test]
    async fn options_offer_deepthink_when_intense() {
        let engine = engine().await;
        let mut state = at(Phase7Step::Option);
        let out = step(&engine, &message_cfg(), &mut state, "I'm furious and devastated and overwhelmed").await;
        assert!(out.reply.content.contains("Deep Think"));
        assert!(state.context.phase7.deepthink_offered);
    }

    #[tokio::test]
    async fn co_author_asks_for_phrases_then_gives_up() {
        let engine = engine().await;
        let cfg = message_cfg();
        let mut state = at(Phase7Step::CoAuthor);

        for attempt in 1..=cfg.max_reprompts {
            let out = step(&engine, &cfg, &mut state, "send a message").await;
            assert_eq!(out.decision, Decision::Stay);
            assert_eq!(state.context.phase7.collection_requests, attempt);
            assert_eq!(state.substate, Some(Phase7Step::CoAuthor));
        }

        let out = step(&engine, &cfg, &mut state, "not sure").await;
        assert_eq!(out.decision, Decision::Complete);
        assert_eq!(state.status, SessionStatus::Complete);
        assert!(state.context.phase7.draft_message.is_none());
        assert_eq!(out.reply.content, GovernanceConfig::builtin().phase7.unfinished_closer);
    }

    #[tokio::test]
    async fn outward_draft_uses_the_users_words() {
        let engine = engine().await;
        let mut state = at(Phase7Step::CoAuthor);
        state.context.coparent_name = Some("Sam".into());
        state.context.phase7.chosen_option = Some(ChosenPath::Outward);
        let out = step(&engine, &message_cfg(), &mut state, "It matters because the kids need routine. I need a fixed pickup time. Could we agree on 5pm").await;
        let draft = state.context.phase7.draft_message.clone().unwrap();
        assert_eq!(out.reply.content, draft);
        assert!(draft.starts_with("Hi Sam,"));
        assert!(draft.contains("the kids need routine"));
        assert!(draft.contains("a fixed pickup time"));
        assert!(draft.contains("agree on 5pm"));
        assert_eq!(state.substate, Some(Phase7Step::FitCheck));
    }

    #[tokio::test]
    async fn inward_path_records_a_reflection() {
        let engine = engine().await;
        let mut state = at(Phase7Step::CoAuthor);
        state.context.phase7.chosen_option = Some(ChosenPath::Inward);
        step(&engine, &message_cfg(), &mut state, "because I want calm evenings and I need some space").await;
        assert!(state.context.phase7.draft_message.is_none());
        let reflection = state.context.final_reflection.clone().unwrap();
        assert!(reflection.contains("I want calm evenings"));

        state.substate = Some(Phase7Step::Contain);
        let out = step(&engine, &message_cfg(), &mut state, "thanks").await;
        assert_eq!(out.reply.content, GovernanceConfig::builtin().phase7.inward_closer);
        assert!(!state.context.phase7.ready_to_send);
    }

    #[tokio::test]
    async fn deepthink_choice_pauses_only_when_offered() {
        let engine = engine().await;
        let mut state = at(Phase7Step::CoAuthor);
        state.context.phase7.deepthink_offered = true;
        let out = step(&engine, &message_cfg(), &mut state, "deep think please").await;
        assert!(out.pause);
        assert_eq!(out.decision, Decision::Pause);
        assert_eq!(state.context.phase7.chosen_option, Some(ChosenPath::DeepThink));

        let mut state = at(Phase7Step::CoAuthor);
        let out = step(&engine, &message_cfg(), &mut state, "deep think please").await;
        assert!(!out.pause);
        assert_eq!(state.context.phase7.chosen_option, Some(ChosenPath::Outward));
    }

    #[tokio::test]
    async fn contain_marks_draft_ready_and_completes() {
        let engine = engine().await;
        let mut state = at(Phase7Step::Contain);
        state.context.phase7.chosen_option = Some(ChosenPath::Outward);
        state.context.phase7.draft_message = Some("Hi Sam".into());
        let out = step(&engine, &message_cfg(), &mut state, "make it softer").await;
        assert_eq!(out.decision, Decision::Complete);
        assert!(state.context.phase7.ready_to_send);
        assert_eq!(state.context.phase7.tone_preference.as_deref(), Some("gentle"));
        assert_eq!(state.context.final_reflection.as_deref(), Some("Hi Sam"));
        assert_eq!(state.status, SessionStatus::Complete);
    }

    #[tokio::test]
    async fn custom_order_without_contain_completes_after_last_step() {
        let engine = engine().await;
        let mut cfg = message_cfg();
        cfg.substate_order = vec![Phase7Step::Integrate];
        let mut state = FlowState::default();
        let out = step(&engine, &cfg, &mut state, "ok").await;
        assert_eq!(out.decision, Decision::Complete);
        assert_eq!(state.status, SessionStatus::Complete);
    }
}

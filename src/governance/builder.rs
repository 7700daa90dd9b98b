//! Builds the instruction string handed to the turn generator.
//!
//! Section order is fixed: governance rules and output contract first, then
//! phase guidance, then retrieved snippets labelled as advisory.

use crate::flow::phase::{FlowPhase, Phase7Step};
use crate::flow::signals::SignalSnapshot;
use crate::flow::state::FlowContext;
use crate::snippets::composer::{ComposerContext, render};
use crate::snippets::model::RankedSnippet;

use super::config::GovernanceConfig;

/// Heading that introduces the advisory snippet section.
pub const ASSISTIVE_HEADING: &str = "## Assistive context (advisory)";

/// Inputs for one instruction string.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub phase: FlowPhase,
    pub substate: Option<Phase7Step>,
    pub context: &'a FlowContext,
    pub snippets: &'a [RankedSnippet],
    pub signals: &'a SignalSnapshot,
    pub reprompt_count: u32,
}

/// Assemble the full instruction string.
pub fn build_instructions(config: &GovernanceConfig, input: &PromptInput<'_>) -> String {
    let mut out = String::new();

    out.push_str(&config.stance);
    out.push_str("\n\n## Rules\n");
    for rule in &config.rules {
        out.push_str(&format!("- {rule}\n"));
    }
    out.push_str(&format!("- {}\n", config.pronoun_rule));
    match input.context.coparent_pronouns.as_deref() {
        Some(pronouns) => out.push_str(&format!("Co-parent pronouns: {pronouns}. Mirror them.\n")),
        None => out.push_str("Co-parent pronouns: not yet specified.\n"),
    }

    out.push_str("\n## Output format\n");
    out.push_str(&config.output_contract);
    out.push('\n');

    out.push_str(&phase_section(config, input));
    out.push_str(&shared_section(input.context));
    out.push_str(&assistive_section(config, input));

    out
}

fn phase_section(config: &GovernanceConfig, input: &PromptInput<'_>) -> String {
    let phase = input.phase;
    let mut out = format!("\n## Current phase: {} ({})\n", phase.label(), phase);

    if let Some(g) = config.guidance(phase) {
        out.push_str(&format!("Focus: {}\n", g.focus));
        out.push_str(&format!("Ready to advance when: {}\n", g.ready_when));
        out.push_str(&format!("Low readiness example: {}\n", g.low_readiness_example));
        out.push_str(&format!("High readiness example: {}\n", g.high_readiness_example));
    }

    if let Some(step) = input.substate {
        out.push_str(&format!("Current step: {step}\n"));
        if let Some(guidance) = config.step_guidance(step) {
            out.push_str(&format!("{guidance}\n"));
        }
    }

    let signals = input.signals;
    if signals.wants_containment() {
        out.push_str("The user has said they are done or set a boundary. Do not ask further questions. Acknowledge and gently close this thread.\n");
    }
    if signals.bridge {
        out.push_str("The conversation just moved on from naming the issue. Briefly bridge into how it feels.\n");
    }
    if signals.nudge {
        out.push_str("If it fits naturally, invite the user to consider how this lands for their child.\n");
    }
    if input.reprompt_count > 0 {
        out.push_str(&format!(
            "You have already asked about this {} time(s). Try a different angle.\n",
            input.reprompt_count
        ));
    }
    out
}

fn shared_section(context: &FlowContext) -> String {
    let captured = context.captured();
    let draft = context.phase7.draft_message.as_deref();
    if captured.is_empty() && context.options.is_empty() && draft.is_none() {
        return String::new();
    }
    let mut out = String::from("\n## What the user has shared\n");
    for (phase, summary) in captured {
        out.push_str(&format!("- {}: {}\n", phase.label(), summary));
    }
    if !context.options.is_empty() {
        out.push_str(&format!("- Options considered: {}\n", context.options.join("; ")));
    }
    if let Some(draft) = draft {
        out.push_str(&format!("- Current draft: {draft}\n"));
    }
    if let Some(tone) = context.phase7.tone_preference.as_deref() {
        out.push_str(&format!("- Preferred tone: {tone}\n"));
    }
    out
}

/// Snippets are rendered first; any that cannot be rendered are left out.
fn assistive_section(config: &GovernanceConfig, input: &PromptInput<'_>) -> String {
    let composer_ctx = ComposerContext::new(input.phase, input.context, input.signals);
    let lines: Vec<String> = input
        .snippets
        .iter()
        .filter(|r| r.snippet.is_approved())
        .filter_map(|r| {
            render(&r.snippet.content, &composer_ctx)
                .ok()
                .map(|text| format!("- [{}] {}", r.snippet.kind, text))
        })
        .collect();

    if lines.is_empty() {
        return String::new();
    }
    format!(
        "\n{ASSISTIVE_HEADING}\n{}\n{}\n",
        config.advisory_label,
        lines.join("\n")
    )
}

//! Snippet retrieval and contextual boosting.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::flow::phase::FlowPhase;
use crate::flow::signals::HIGH_INTENSITY_THRESHOLD;
use crate::store::SnippetSource;

use super::model::{Candidate, FlowSnippet, RankedSnippet, SnippetKind, StewardTier};

const PRIMARY_STEWARD_BOOST: f64 = 0.15;
const SECONDARY_STEWARD_BOOST: f64 = 0.08;
const PHASE_MATCH_BOOST: f64 = 0.10;
const CLOSURE_CONTAINMENT_BOOST: f64 = 0.10;
const BOUNDARY_CONTAINMENT_BOOST: f64 = 0.15;
const INTENSITY_CONTAINMENT_BOOST: f64 = 0.10;
const FEELINGS_TRANSITION_BOOST: f64 = 0.06;
const COACHING_BOOST: f64 = 0.08;

/// Candidates fetched per requested result, before ranking.
const OVERFETCH: usize = 4;

/// Everything the ranker needs to know about the current turn.
#[derive(Debug, Clone, Default)]
pub struct RetrievalQuery {
    pub text: String,
    pub phase: FlowPhase,
    pub tags: Vec<String>,
    pub closure: bool,
    pub boundary: bool,
    pub intensity: f64,
    /// A co-author seed already exists (message phase).
    pub has_seed: bool,
    /// Required user-language variables are missing (message phase).
    pub missing_required: bool,
}

/// Contextual boost for one snippet.
///
/// The closure and boundary containment boosts are alternatives: the larger
/// applicable one is used, never both.
pub fn boost(snippet: &FlowSnippet, query: &RetrievalQuery) -> f64 {
    let mut total = match snippet.steward_tier() {
        StewardTier::Primary => PRIMARY_STEWARD_BOOST,
        StewardTier::Secondary => SECONDARY_STEWARD_BOOST,
        StewardTier::Other => 0.0,
    };

    if snippet.phase == Some(query.phase) {
        total += PHASE_MATCH_BOOST;
    }

    if snippet.is_containment() {
        let closure_boost = match (query.boundary, query.closure) {
            (true, _) => BOUNDARY_CONTAINMENT_BOOST,
            (false, true) => CLOSURE_CONTAINMENT_BOOST,
            (false, false) => 0.0,
        };
        total += closure_boost;
        if query.intensity >= HIGH_INTENSITY_THRESHOLD {
            total += INTENSITY_CONTAINMENT_BOOST;
        }
    }

    if query.phase == FlowPhase::Feelings && snippet.has_tag("phase_transition") {
        total += FEELINGS_TRANSITION_BOOST;
    }

    if snippet.has_tag("coaching") {
        total += COACHING_BOOST;
    }

    total + kind_boost(snippet.kind, query)
}

/// Phase-specific kind boosts for the options and message phases.
fn kind_boost(kind: SnippetKind, query: &RetrievalQuery) -> f64 {
    match query.phase {
        FlowPhase::Options => match kind {
            SnippetKind::WhyRecap => 0.12,
            SnippetKind::OptionInvitation => 0.08,
            SnippetKind::Bridge | SnippetKind::LensTie | SnippetKind::ReEngagement => 0.06,
            SnippetKind::ConfirmWhy => 0.05,
            _ => 0.0,
        },
        FlowPhase::Message => match kind {
            SnippetKind::CoAuthorSeed => 0.10,
            SnippetKind::ClarityFrame if query.has_seed => 0.05,
            SnippetKind::Containment => 0.04,
            SnippetKind::CollectionRequest if query.missing_required => 0.06,
            _ => 0.0,
        },
        _ => 0.0,
    }
}

/// Drop unapproved snippets, boost, sort descending and keep the top `k`.
///
/// Ties break on snippet id so the order is deterministic.
pub fn rank(candidates: Vec<Candidate>, query: &RetrievalQuery, k: usize) -> Vec<RankedSnippet> {
    let mut ranked: Vec<RankedSnippet> = candidates
        .into_iter()
        .filter(|c| c.snippet.is_approved())
        .map(|c| {
            let similarity = if c.similarity.is_finite() {
                c.similarity.clamp(0.0, 1.0)
            } else {
                0.0
            };
            let score = similarity * c.snippet.weight + boost(&c.snippet, query);
            RankedSnippet {
                snippet: c.snippet,
                similarity,
                score,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.snippet.id.cmp(&b.snippet.id))
    });
    ranked.truncate(k);
    ranked
}

/// Fetches and ranks snippets. Never fails: a disabled or broken source
/// yields an empty list.
pub struct SnippetRetriever {
    source: Option<Arc<dyn SnippetSource>>,
    enabled: bool,
    limit: usize,
}

impl SnippetRetriever {
    pub fn new(source: Arc<dyn SnippetSource>, enabled: bool, limit: usize) -> Self {
        Self {
            source: Some(source),
            enabled,
            limit,
        }
    }

    /// A retriever that always returns nothing.
    pub fn disabled() -> Self {
        Self {
            source: None,
            enabled: false,
            limit: 0,
        }
    }

    pub async fn retrieve(&self, query: &RetrievalQuery) -> Vec<RankedSnippet> {
        let Some(source) = self.source.as_ref().filter(|_| self.enabled) else {
            debug!("Snippet retrieval disabled");
            return Vec::new();
        };

        let fetch_limit = self.limit.saturating_mul(OVERFETCH).max(self.limit);
        match source
            .fetch_snippets(&query.text, query.phase, &query.tags, fetch_limit)
            .await
        {
            Ok(candidates) => {
                let fetched = candidates.len();
                let ranked = rank(candidates, query, self.limit);
                debug!(
                    phase = %query.phase,
                    fetched,
                    kept = ranked.len(),
                    "Retrieved snippets"
                );
                ranked
            }
            Err(e) => {
                warn!(phase = %query.phase, error = %e, "Snippet retrieval failed, continuing without context");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetrievalError;
    use crate::snippets::model::SnippetStatus;
    use async_trait::async_trait;

    fn query(phase: FlowPhase) -> RetrievalQuery {
        RetrievalQuery {
            text: "pickup".into(),
            phase,
            ..Default::default()
        }
    }

    fn candidate(snippet: FlowSnippet, similarity: f64) -> Candidate {
        Candidate { snippet, similarity }
    }

    #[test]
    fn steward_and_phase_boosts() {
        let q = query(FlowPhase::Issue);
        let plain = FlowSnippet::new("a", SnippetKind::Prompt, None, "x");
        assert_eq!(boost(&plain, &q), 0.0);

        let stewarded = FlowSnippet::new("b", SnippetKind::Prompt, Some(FlowPhase::Issue), "x")
            .with_steward("steward");
        assert!((boost(&stewarded, &q) - 0.25).abs() < 1e-9);

        let admin = FlowSnippet::new("c", SnippetKind::Prompt, Some(FlowPhase::Why), "x")
            .with_steward("admin");
        assert!((boost(&admin, &q) - 0.08).abs() < 1e-9);
    }

    #[test]
    fn closure_boosts_take_the_larger() {
        let containment = FlowSnippet::new("a", SnippetKind::Containment, None, "x");
        let mut q = query(FlowPhase::Why);
        q.closure = true;
        assert!((boost(&containment, &q) - 0.10).abs() < 1e-9);
        q.boundary = true;
        assert!((boost(&containment, &q) - 0.15).abs() < 1e-9);
        q.intensity = 0.8;
        assert!((boost(&containment, &q) - 0.25).abs() < 1e-9);

        let prompt = FlowSnippet::new("b", SnippetKind::Prompt, None, "x");
        assert_eq!(boost(&prompt, &q), 0.0);
    }

    #[test]
    fn tag_boosts() {
        let transition = FlowSnippet::new("a", SnippetKind::Bridge, None, "x")
            .with_tags(&["phase_transition", "coaching"]);
        assert!((boost(&transition, &query(FlowPhase::Feelings)) - 0.14).abs() < 1e-9);
        assert!((boost(&transition, &query(FlowPhase::Why)) - 0.08).abs() < 1e-9);
    }

    #[test]
    fn options_and_message_kind_boosts() {
        let recap = FlowSnippet::new("a", SnippetKind::WhyRecap, None, "x");
        assert!((boost(&recap, &query(FlowPhase::Options)) - 0.12).abs() < 1e-9);
        assert_eq!(boost(&recap, &query(FlowPhase::Issue)), 0.0);

        let clarity = FlowSnippet::new("b", SnippetKind::ClarityFrame, None, "x");
        let mut q = query(FlowPhase::Message);
        assert_eq!(boost(&clarity, &q), 0.0);
        q.has_seed = true;
        assert!((boost(&clarity, &q) - 0.05).abs() < 1e-9);

        let collect = FlowSnippet::new("c", SnippetKind::CollectionRequest, None, "x");
        assert_eq!(boost(&collect, &q), 0.0);
        q.missing_required = true;
        assert!((boost(&collect, &q) - 0.06).abs() < 1e-9);
    }

    #[test]
    fn rank_filters_unapproved_and_sorts() {
        let q = query(FlowPhase::Issue);
        let ranked = rank(
            vec![
                candidate(FlowSnippet::new("low", SnippetKind::Prompt, None, "x"), 0.2),
                candidate(
                    FlowSnippet::new("hidden", SnippetKind::Prompt, None, "x")
                        .with_status(SnippetStatus::Pending),
                    1.0,
                ),
                candidate(FlowSnippet::new("high", SnippetKind::Prompt, None, "x"), 0.9),
                candidate(
                    FlowSnippet::new("boosted", SnippetKind::Prompt, Some(FlowPhase::Issue), "x"),
                    0.5,
                ),
            ],
            &q,
            10,
        );
        let ids: Vec<&str> = ranked.iter().map(|r| r.snippet.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "boosted", "low"]);
    }

    #[test]
    fn rank_truncates_and_breaks_ties_by_id() {
        let q = query(FlowPhase::Issue);
        let ranked = rank(
            vec![
                candidate(FlowSnippet::new("b", SnippetKind::Prompt, None, "x"), 0.5),
                candidate(FlowSnippet::new("a", SnippetKind::Prompt, None, "x"), 0.5),
                candidate(FlowSnippet::new("c", SnippetKind::Prompt, None, "x"), 0.1),
            ],
            &q,
            2,
        );
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].snippet.id, "a");
        assert_eq!(ranked[1].snippet.id, "b");
    }

    #[test]
    fn weight_scales_similarity() {
        let q = query(FlowPhase::Issue);
        let ranked = rank(
            vec![candidate(
                FlowSnippet::new("a", SnippetKind::Prompt, None, "x").with_weight(0.5),
                0.8,
            )],
            &q,
            1,
        );
        assert!((ranked[0].score - 0.4).abs() < 1e-9);
    }

    struct BrokenSource;

    #[async_trait]
    impl SnippetSource for BrokenSource {
        async fn fetch_snippets(
            &self,
            _query: &str,
            _phase: FlowPhase,
            _tags: &[String],
            _limit: usize,
        ) -> Result<Vec<Candidate>, RetrievalError> {
            Err(RetrievalError::Backend("timeout".into()))
        }
    }

    struct FixedSource(Vec<Candidate>);

    #[async_trait]
    impl SnippetSource for FixedSource {
        async fn fetch_snippets(
            &self,
            _query: &str,
            _phase: FlowPhase,
            _tags: &[String],
            _limit: usize,
        ) -> Result<Vec<Candidate>, RetrievalError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn retriever_absorbs_failures() {
        let retriever = SnippetRetriever::new(Arc::new(BrokenSource), true, 5);
        assert!(retriever.retrieve(&query(FlowPhase::Issue)).await.is_empty());
    }

    #[tokio::test]
    async fn disabled_retriever_returns_nothing() {
        let source = FixedSource(vec![candidate(
            FlowSnippet::new("a", SnippetKind::Prompt, None, "x"),
            1.0,
        )]);
        let retriever = SnippetRetriever::new(Arc::new(source), false, 5);
        assert!(retriever.retrieve(&query(FlowPhase::Issue)).await.is_empty());
        assert!(SnippetRetriever::disabled().retrieve(&query(FlowPhase::Issue)).await.is_empty());
    }

    #[tokio::test]
    async fn retriever_never_surfaces_unapproved() {
        let source = FixedSource(vec![
            candidate(
                FlowSnippet::new("bad", SnippetKind::Prompt, None, "x").with_status(SnippetStatus::Rejected),
                1.0,
            ),
            candidate(FlowSnippet::new("ok", SnippetKind::Prompt, None, "x"), 0.1),
        ]);
        let retriever = SnippetRetriever::new(Arc::new(source), true, 5);
        let ranked = retriever.retrieve(&query(FlowPhase::Issue)).await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].snippet.id, "ok");
    }
}

//! Content snippets: taxonomy, retrieval/ranking, and composition.

pub mod composer;
pub mod model;
pub mod ranker;

pub use composer::{ComposerContext, Composition, compose};
pub use model::{Candidate, FlowSnippet, RankedSnippet, SnippetKind, SnippetStatus};
pub use ranker::{RetrievalQuery, SnippetRetriever};

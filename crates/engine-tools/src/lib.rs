//! Capability layer: search backends and the reasoner-facing tools that need
//! nothing beyond network access (`web_search`, `latest_finder`). Tools that
//! need the entity/fact store or a nested agent run (`knowledge_query`,
//! `evaluate_plausibility`) live in `engine-core::tools`.

pub mod extract;
pub mod latest_finder;
pub mod search;
pub mod web_search;

pub use latest_finder::LatestFinder;
pub use search::{backend_from_env, SearchBackend, SearchError, SearchHit, SearchOptions};
pub use web_search::WebSearch;

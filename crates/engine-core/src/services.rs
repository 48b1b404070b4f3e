//! Wires the config-constructed components into one value threaded through
//! the HTTP layer and the agent loop — the redesign-note replacement for the
//! teacher's ambient global singletons (spec §9).

use crate::config::Config;
use crate::entity::EntityResolver;
use crate::fact::FactStore;
use crate::history::History;
use crate::memory::LongTermMemory;
use crate::reasoner::{OpenAiCompatibleReasoner, Reasoner};
use engine_tools::SearchBackend;
use std::sync::Arc;
use std::time::Duration;

/// Abstracts `Utc::now()` so finalisation timestamps are overridable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> chrono::DateTime<chrono::Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}

pub struct Services {
    pub config: Config,
    pub entities: EntityResolver,
    pub facts: FactStore,
    pub history: History,
    pub memory: LongTermMemory,
    /// Main reasoner used by the agent loop's reason-act steps; a longer
    /// timeout since it may carry a full tool-use turn.
    pub reasoner: Arc<dyn Reasoner>,
    /// Cheaper-model reasoner for C5/C6's single strict-JSON calls.
    pub aux_reasoner: Arc<dyn Reasoner>,
    pub search: Arc<dyn SearchBackend>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let entities = EntityResolver::new(&config.database_url)?;
        let facts = FactStore::new(&config.database_url)?;
        let history = History::new(config.chat_memory_window);
        let memory = LongTermMemory::new(&config.database_url)?;
        let search = engine_tools::backend_from_env()?;

        let reasoner: Arc<dyn Reasoner> = Arc::new(OpenAiCompatibleReasoner::new(
            config.openai_api_url.clone(),
            config.openai_api_key.clone(),
            config.openai_model.clone(),
            Duration::from_secs(60),
        ));
        let aux_reasoner: Arc<dyn Reasoner> = Arc::new(OpenAiCompatibleReasoner::new(
            config.openai_api_url.clone(),
            config.openai_api_key.clone(),
            config.openai_inference_model.clone(),
            Duration::from_secs(30),
        ));

        Ok(Self {
            config,
            entities,
            facts,
            history,
            memory,
            reasoner,
            aux_reasoner,
            search,
            clock: Arc::new(SystemClock),
        })
    }
}

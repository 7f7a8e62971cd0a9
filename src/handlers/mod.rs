//! Handler trait and registry
//!
//! A handler turns a sub-task plus the session into one outcome. Handlers
//! keep no state between calls; everything they know comes from the
//! session they are given.

use crate::models::{HandlerId, HandlerOutcome};
use crate::oracle::ReasoningOracle;
use crate::session::Session;
use crate::tools::ToolRegistry;
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod dispatcher;
pub mod specialist;

pub use dispatcher::DispatcherHandler;
pub use specialist::{SpecialistHandler, SpecialistProfile, PROFILES};

#[async_trait]
pub trait Handler: Send + Sync {
    fn id(&self) -> HandlerId;

    /// Keywords (lowercase word prefixes) this handler responds to
    fn capabilities(&self) -> Vec<String>;

    async fn handle(&self, sub_task: &str, session: &Session) -> Result<HandlerOutcome>;
}

/// Handlers keyed by capability tag
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<HandlerId, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.id(), handler);
    }

    pub fn get(&self, id: HandlerId) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&id).cloned()
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        self.handlers.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<HandlerId> {
        self.handlers.keys().copied().collect()
    }

    pub fn capability_sets(&self) -> Vec<(HandlerId, Vec<String>)> {
        self.handlers
            .iter()
            .map(|(id, handler)| (*id, handler.capabilities()))
            .collect()
    }
}

/// All seven specialists plus the dispatcher, sharing one oracle
pub fn create_default_handlers(
    oracle: Arc<dyn ReasoningOracle>,
    tools: &ToolRegistry,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    for profile in PROFILES {
        registry.register(Arc::new(SpecialistHandler::new(
            profile,
            oracle.clone(),
            tools,
        )));
    }

    registry.register(Arc::new(DispatcherHandler::new(oracle)));
    registry
}

//! Registry of the engines installed for a chain

use super::{Bootstrapper, Engine, StateSyncer};
use crate::context::{EngineType, State};
use std::sync::Arc;

/// An engine registered under a specific role. The same instance is kept
/// both as its role trait object and as a plain [`Engine`].
struct Registered<T: ?Sized> {
    role: Arc<T>,
    engine: Arc<dyn Engine>,
}

/// Engines of one engine type, keyed by lifecycle state
#[derive(Default)]
pub struct Engines {
    state_syncer: Option<Registered<dyn StateSyncer>>,
    bootstrapper: Option<Registered<dyn Bootstrapper>>,
    consensus: Option<Arc<dyn Engine>>,
}

impl Engines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state_syncer<S>(mut self, state_syncer: Arc<S>) -> Self
    where
        S: StateSyncer + 'static,
    {
        self.state_syncer = Some(Registered {
            role: state_syncer.clone(),
            engine: state_syncer,
        });
        self
    }

    pub fn with_bootstrapper<B>(mut self, bootstrapper: Arc<B>) -> Self
    where
        B: Bootstrapper + 'static,
    {
        self.bootstrapper = Some(Registered {
            role: bootstrapper.clone(),
            engine: bootstrapper,
        });
        self
    }

    /// Engine used once the chain reaches normal operation
    pub fn with_consensus<E>(mut self, consensus: Arc<E>) -> Self
    where
        E: Engine + 'static,
    {
        self.consensus = Some(consensus);
        self
    }

    /// Engine handling messages while the chain is in `state`
    pub fn get(&self, state: State) -> Option<Arc<dyn Engine>> {
        match state {
            State::StateSyncing => self.state_syncer.as_ref().map(|r| r.engine.clone()),
            State::Bootstrapping => self.bootstrapper.as_ref().map(|r| r.engine.clone()),
            State::NormalOp => self.consensus.clone(),
        }
    }

    pub fn state_syncer(&self) -> Option<Arc<dyn StateSyncer>> {
        self.state_syncer.as_ref().map(|r| r.role.clone())
    }

    pub fn bootstrapper(&self) -> Option<Arc<dyn Bootstrapper>> {
        self.bootstrapper.as_ref().map(|r| r.role.clone())
    }
}

/// Engines of a chain for every engine type it has run
#[derive(Default)]
pub struct EngineManager {
    avalanche: Option<Engines>,
    snowman: Option<Engines>,
}

impl EngineManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_avalanche(mut self, engines: Engines) -> Self {
        self.avalanche = Some(engines);
        self
    }

    pub fn with_snowman(mut self, engines: Engines) -> Self {
        self.snowman = Some(engines);
        self
    }

    /// Engines of `engine_type`. Never matches [`EngineType::Unspecified`].
    pub fn get(&self, engine_type: EngineType) -> Option<&Engines> {
        match engine_type {
            EngineType::Avalanche => self.avalanche.as_ref(),
            EngineType::Snowman => self.snowman.as_ref(),
            EngineType::Unspecified => None,
        }
    }

    /// Engine registered for the `(engine_type, state)` pair
    pub fn engine(&self, engine_type: EngineType, state: State) -> Option<Arc<dyn Engine>> {
        self.get(engine_type).and_then(|engines| engines.get(state))
    }
}

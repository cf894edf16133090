use std::fmt;
use std::sync::Arc;

use forge_protocol::{AgentBrain, AgentId, Environment, SessionConfig};

use crate::brain::LogisticsBrain;
use crate::warehouse::{Warehouse, WarehouseConfig};

pub type EnvFactory = Arc<dyn Fn(&SessionConfig) -> Box<dyn Environment> + Send + Sync>;
pub type BrainFactory = Arc<dyn Fn(&AgentId, &SessionConfig) -> Box<dyn AgentBrain> + Send + Sync>;

/// What a session simulates: one environment per setup and one brain per
/// agent per start.
#[derive(Clone)]
pub struct Scenario {
    pub environment: EnvFactory,
    pub brain: BrainFactory,
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario").finish_non_exhaustive()
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self::warehouse()
    }
}

impl Scenario {
    pub fn new(environment: EnvFactory, brain: BrainFactory) -> Self {
        Self { environment, brain }
    }

    pub fn warehouse() -> Self {
        Self {
            environment: Arc::new(|config: &SessionConfig| -> Box<dyn Environment> {
                Box::new(Warehouse::new(WarehouseConfig::from(config)))
            }),
            brain: Arc::new(|_: &AgentId, config: &SessionConfig| -> Box<dyn AgentBrain> {
                Box::new(LogisticsBrain::new(config.grid_size))
            }),
        }
    }

    pub fn with_environment(mut self, environment: EnvFactory) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_brain(mut self, brain: BrainFactory) -> Self {
        self.brain = brain;
        self
    }
}

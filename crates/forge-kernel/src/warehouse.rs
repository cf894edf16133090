//! Reference logistics environment.
//!
//! Layout on a `size x size` grid: the pickup column is `x = 0`, the dropoff
//! column is `x = size - 1` and the charger row is `y = size - 1`. Agents
//! spawn in the interior columns without sharing a cell.

use std::collections::{BTreeMap, HashSet};

use forge_protocol::{
    Action, AgentId, AgentState, Environment, HarnessError, HarnessResult, Position,
    SessionConfig, StepOutcome,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{Map, Value, json};

pub const PICKUP: &str = "PICKUP";
pub const DROPOFF: &str = "DROPOFF";
pub const CHARGE: &str = "CHARGE";

const FULL_BATTERY: f64 = 100.0;
const CHARGE_PER_STEP: f64 = 10.0;
const SPAWN_ATTEMPTS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct WarehouseConfig {
    pub size: i64,
    pub battery_drain: f64,
    /// Clamp moves at the walls. Without rails agents can leave the grid and
    /// the auditor flags them.
    pub safety_rails: bool,
    pub seed: Option<u64>,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            size: 10,
            battery_drain: 0.2,
            safety_rails: true,
            seed: None,
        }
    }
}

impl From<&SessionConfig> for WarehouseConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            size: config.grid_size,
            battery_drain: config.battery_drain,
            safety_rails: config.safety_rails,
            seed: config.stress.seed,
        }
    }
}

#[derive(Debug)]
pub struct Warehouse {
    config: WarehouseConfig,
    rng: ChaCha8Rng,
    agents: BTreeMap<AgentId, AgentState>,
}

impl Warehouse {
    pub fn new(config: WarehouseConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            config,
            rng,
            agents: BTreeMap::new(),
        }
    }

    pub fn is_pickup(&self, position: Position) -> bool {
        position.x == 0 && (0..self.config.size).contains(&position.y)
    }

    pub fn is_dropoff(&self, position: Position) -> bool {
        position.x == self.config.size - 1 && (0..self.config.size).contains(&position.y)
    }

    pub fn is_charger(&self, position: Position) -> bool {
        position.y == self.config.size - 1 && (0..self.config.size).contains(&position.x)
    }

    fn spawn_position(&mut self, occupied: &HashSet<Position>) -> Position {
        let size = self.config.size.max(1);
        let (x_min, x_max) = if size > 2 { (1, size - 2) } else { (0, size - 1) };
        let draw = |rng: &mut ChaCha8Rng| {
            Position::new(rng.gen_range(x_min..=x_max), rng.gen_range(0..size))
        };
        for _ in 0..SPAWN_ATTEMPTS {
            let candidate = draw(&mut self.rng);
            if !occupied.contains(&candidate) {
                return candidate;
            }
        }
        draw(&mut self.rng)
    }
}

fn carrying(state: &AgentState) -> bool {
    state.field("carrying").is_some_and(|value| !value.is_null())
}

impl Environment for Warehouse {
    fn name(&self) -> &str {
        "warehouse"
    }

    fn reset(&mut self, agent_ids: &[AgentId]) -> BTreeMap<AgentId, AgentState> {
        self.agents.clear();
        let mut occupied = HashSet::new();
        for agent_id in agent_ids {
            let position = self.spawn_position(&occupied);
            occupied.insert(position);
            let state = AgentState::new(agent_id.clone(), position, FULL_BATTERY)
                .with_field("carrying", Value::Null);
            self.agents.insert(agent_id.clone(), state);
        }
        self.agents.clone()
    }

    fn state(&self, agent_id: &AgentId) -> Option<AgentState> {
        self.agents.get(agent_id).cloned()
    }

    fn step(&mut self, agent_id: &AgentId, action: &Action) -> HarnessResult<StepOutcome> {
        let current = self
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| HarnessError::UnknownAgent(agent_id.to_string()))?;

        let old = current.position;
        let mut next = current.clone();
        let mut reward = -0.1;
        let mut info = Map::new();
        info.insert("valid_action".to_owned(), json!(true));
        info.insert("old_pos".to_owned(), json!([old.x, old.y]));

        next.battery -= self.config.battery_drain;

        let mut target = old;
        match action.as_str() {
            "UP" => target.y += 1,
            "DOWN" => target.y -= 1,
            "RIGHT" => target.x += 1,
            "LEFT" => target.x -= 1,
            PICKUP => {
                if self.is_pickup(old) && !carrying(&current) {
                    next.custom_fields
                        .insert("carrying".to_owned(), json!("package"));
                    reward += 1.0;
                    info.insert("event".to_owned(), json!("picked_up"));
                } else {
                    reward -= 0.5;
                    info.insert("valid_action".to_owned(), json!(false));
                }
            }
            DROPOFF => {
                if self.is_dropoff(old) && carrying(&current) {
                    next.custom_fields.insert("carrying".to_owned(), Value::Null);
                    reward += 10.0;
                    info.insert("event".to_owned(), json!("delivered"));
                } else {
                    reward -= 0.5;
                    info.insert("valid_action".to_owned(), json!(false));
                }
            }
            CHARGE => {
                if self.is_charger(old) {
                    next.battery = (next.battery + CHARGE_PER_STEP).min(FULL_BATTERY);
                } else {
                    reward -= 0.5;
                    info.insert("valid_action".to_owned(), json!(false));
                }
            }
            _ => {}
        }

        if self.config.safety_rails && !target.within(self.config.size) {
            target = old;
            reward -= 1.0;
            info.insert("blocked".to_owned(), json!(true));
        }
        next.position = target;

        let done = next.battery <= 0.0;
        if done {
            reward -= 10.0;
            info.insert("event".to_owned(), json!("battery_depleted"));
        }

        self.agents.insert(agent_id.clone(), next.clone());
        Ok(StepOutcome {
            state: next,
            reward,
            done,
            info,
        })
    }
}

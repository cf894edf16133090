mod config;
mod engine;
mod gate;

pub use config::EngineConfig;
pub use engine::SimulationEngine;
pub use gate::{Gate, PauseGate};

// The blackboard orchestrator and the action selector.

pub mod actions;
pub mod orchestrator;

pub use actions::{path_matches, ActionSelector};
pub use orchestrator::{Engine, EngineBuilder};

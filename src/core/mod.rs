pub mod config;
pub mod lifecycle;
pub mod orchestrator;
pub mod pipeline;
pub mod store;
pub mod terminal;

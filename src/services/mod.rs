pub mod agents;
pub mod archive;
pub mod cache;
pub mod diagnostics;
pub mod matching;
pub mod model;
pub mod orchestrator;
pub mod pdf;
pub mod queue;
pub mod repair;
pub mod schema;
pub mod storage;

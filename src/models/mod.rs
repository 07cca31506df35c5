pub mod data_layer;
pub mod extraction;
pub mod job;
pub mod schema;
pub mod supplier;

//! Code generation module
//!
//! Both generators consume the same `TypedRule`:
//! - `RealTimeCodegen` composes a closure tree for single-record checks
//! - `BatchCodegen` builds a relational query plan for QC sweeps

pub mod batch_codegen;
pub mod realtime_codegen;

pub use batch_codegen::{BatchCodegen, BatchCodegenOptions};
pub use realtime_codegen::RealTimeCodegen;

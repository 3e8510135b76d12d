//! Intermediate Representation (IR) for TrialCheck
//!
//! Compiled artifacts produced from a typed rule:
//! - `RealTimeValidator`: closure tree over the primitive whitelist
//! - `BatchQuery`: relational query plan for QC sweeps

pub mod batch;
pub mod primitive;
pub mod realtime;

pub use batch::{
    BatchQuery, Column, QueryShape, Relation, RowExpr, TableLayout, ViolationCandidate,
};
pub use primitive::Primitive;
pub use realtime::{
    read_field, CompiledFn, Eval, EvalContext, EvaluationStatus, Halt, RealTimeValidator, Record,
    ValidationResult,
};

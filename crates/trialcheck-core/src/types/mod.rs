//! Type system for TrialCheck
//!
//! This module contains:
//! - Runtime values
//! - The field catalog that rules are checked against

pub mod catalog;
pub mod value;

pub use catalog::{FieldCatalog, FieldDefinition, FieldType, DEFAULT_TABLE};
pub use value::Value;

//! Main compiler
//!
//! Provides a unified interface for turning authored rules into compiled
//! artifacts: parse, validate, then generate code for the rule's context.

use crate::codegen::{BatchCodegen, BatchCodegenOptions, RealTimeCodegen};
use crate::error::{CompileError, Result, SemanticError};
use crate::semantic::SemanticAnalyzer;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use trialcheck_core::ast::{RuleContext, TypedRule};
use trialcheck_core::ir::{BatchQuery, RealTimeValidator, TableLayout};
use trialcheck_core::types::FieldCatalog;
use trialcheck_core::Rule;
use trialcheck_parser::{RuleParser, SyntaxError};

/// Compiler options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    /// Table listing the expected (subject, visit) pairs for completeness checks
    pub expected_visits_table: String,
    /// Column names shared by observation tables
    pub layout: TableLayout,
    /// Log every generated batch plan at debug level
    pub log_plans: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            expected_visits_table: "expected_visits".to_string(),
            layout: TableLayout::default(),
            log_plans: true,
        }
    }
}

impl CompilerOptions {
    pub fn with_expected_visits_table(mut self, table: impl Into<String>) -> Self {
        self.expected_visits_table = table.into();
        self
    }

    pub fn with_layout(mut self, layout: TableLayout) -> Self {
        self.layout = layout;
        self
    }
}

/// Artifacts compiled for one rule
#[derive(Debug)]
pub struct CompiledRule {
    /// Validated typed rule both artifacts were generated from
    pub typed: TypedRule,
    /// Present for real-time rules
    pub realtime: Option<RealTimeValidator>,
    /// Present for batch rules
    pub batch: Option<BatchQuery>,
}

impl CompiledRule {
    pub fn rule_id(&self) -> &str {
        self.typed.id()
    }

    pub fn content_hash(&self) -> &str {
        &self.typed.content_hash
    }
}

/// Author-facing outcome of compiling a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Expected-constraint text the rule will report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syntax_error: Option<SyntaxError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub semantic_errors: Vec<SemanticError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_error: Option<String>,
}

impl CompileResult {
    pub fn ok(compiled: &CompiledRule) -> Self {
        Self {
            success: true,
            content_hash: Some(compiled.typed.content_hash.clone()),
            description: Some(compiled.typed.description.clone()),
            syntax_error: None,
            semantic_errors: Vec::new(),
            internal_error: None,
        }
    }

    pub fn from_error(err: &CompileError) -> Self {
        let mut result = Self {
            success: false,
            content_hash: None,
            description: None,
            syntax_error: None,
            semantic_errors: Vec::new(),
            internal_error: None,
        };
        match err {
            CompileError::Syntax(e) => result.syntax_error = Some(e.clone()),
            CompileError::Semantic(errors) => result.semantic_errors = errors.clone(),
            CompileError::Internal(message) => result.internal_error = Some(message.clone()),
        }
        result
    }

    /// One line per problem, positions resolved against the rule text
    pub fn messages(&self, source: &str) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(e) = &self.syntax_error {
            lines.push(e.describe(source));
        }
        for e in &self.semantic_errors {
            let (line, column) = e.span.line_col(source);
            lines.push(format!("line {}, column {}: {}: {}", line, column, e.kind, e.message));
        }
        if let Some(message) = &self.internal_error {
            lines.push(format!("internal error: {}", message));
        }
        lines
    }
}

impl From<&Result<CompiledRule>> for CompileResult {
    fn from(result: &Result<CompiledRule>) -> Self {
        match result {
            Ok(compiled) => CompileResult::ok(compiled),
            Err(e) => CompileResult::from_error(e),
        }
    }
}

/// The main TrialCheck compiler
pub struct Compiler {
    /// Compiler options
    options: CompilerOptions,
    /// Semantic analyzer
    semantic_analyzer: SemanticAnalyzer,
    /// Batch codegen options derived from `options`
    batch_options: BatchCodegenOptions,
}

impl Compiler {
    /// Create a new compiler instance with default options
    pub fn new() -> Self {
        Self::with_options(CompilerOptions::default())
    }

    /// Create a new compiler instance with custom options
    pub fn with_options(options: CompilerOptions) -> Self {
        let batch_options = BatchCodegenOptions {
            expected_table: options.expected_visits_table.clone(),
            layout: options.layout.clone(),
        };
        Self {
            options,
            semantic_analyzer: SemanticAnalyzer::new(),
            batch_options,
        }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    /// Parse and semantically validate a rule
    pub fn validate(&self, rule: &Rule, catalog: &FieldCatalog) -> Result<TypedRule> {
        let ast = RuleParser::parse(&rule.text, rule.context)?;
        self.semantic_analyzer
            .analyze(&ast, catalog, rule)
            .map_err(CompileError::Semantic)
    }

    /// Generate a real-time validator from a typed rule
    pub fn compile_realtime(&self, typed: &TypedRule) -> Result<RealTimeValidator> {
        let validator = RealTimeCodegen::compile(typed).inspect_err(|e| {
            error!("Real-time codegen failed for rule '{}': {}", typed.id(), e);
        })?;
        debug!(
            "Compiled real-time validator for '{}' ({} primitives)",
            typed.id(),
            validator.call_graph().len()
        );
        Ok(validator)
    }

    /// Generate a batch query plan from a typed rule
    pub fn compile_batch(&self, typed: &TypedRule) -> Result<BatchQuery> {
        let plan = BatchCodegen::new(&self.batch_options)
            .compile(typed)
            .inspect_err(|e| {
                error!("Batch codegen failed for rule '{}': {}", typed.id(), e);
            })?;
        if self.options.log_plans {
            match serde_json::to_string(&plan) {
                Ok(json) => debug!("Batch plan for '{}': {}", typed.id(), json),
                Err(e) => debug!("Batch plan for '{}' not serializable: {}", typed.id(), e),
            }
        }
        Ok(plan)
    }

    /// Validate a rule and generate the artifact its context calls for
    pub fn compile(&self, rule: &Rule, catalog: &FieldCatalog) -> Result<CompiledRule> {
        let typed = self.validate(rule, catalog)?;

        let (realtime, batch) = match rule.context {
            RuleContext::RealTime => (Some(self.compile_realtime(&typed)?), None),
            RuleContext::Batch => (None, Some(self.compile_batch(&typed)?)),
        };

        Ok(CompiledRule {
            typed,
            realtime,
            batch,
        })
    }

    /// Get a reference to the semantic analyzer
    pub fn semantic_analyzer(&self) -> &SemanticAnalyzer {
        &self.semantic_analyzer
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

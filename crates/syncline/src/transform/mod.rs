//! Transformation pipeline engine: a write-once registry of row operators,
//! whole-pipeline validation, sequential execution with lineage recording,
//! and optional delegation to a distributed SQL backend.

mod engine;
mod lineage;
pub mod ops;
mod translate;

use std::{collections::HashMap, fmt::Debug, sync::Arc};

pub use engine::{
    ExecutionContext, LookupProvider, Pipeline, PipelineStep, TransformationEngine,
};
pub use lineage::{LineageSink, MemoryLineage, TransformationRecord};
pub use translate::translate_pipeline;

use crate::row::{Row, Value};

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("unknown transformation type: {0}")]
    UnknownType(String),
    #[error("invalid config for {operator}: {message}")]
    InvalidConfig {
        operator: &'static str,
        message: String,
    },
    #[error("{operator} failed: {message}")]
    Execution {
        operator: &'static str,
        message: String,
    },
    #[error("lookup table {0} is not loaded")]
    LookupUnavailable(String),
    #[error(transparent)]
    Join(#[from] crate::join::JoinError),
}

impl TransformError {
    pub fn invalid(operator: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            operator,
            message: message.into(),
        }
    }

    pub fn execution(operator: &'static str, message: impl Into<String>) -> Self {
        Self::Execution {
            operator,
            message: message.into(),
        }
    }
}

/// Per-pipeline state handed to each step: the lookup cache is populated
/// once per pipeline invocation and read-only afterwards.
#[derive(Debug, Default)]
pub struct StepContext {
    pub lookup_cache: HashMap<String, Arc<Vec<Row>>>,
}

/// One row-level operator. Operators are side-effect-free on their inputs;
/// the engine owns batch ownership and may reuse memory between steps.
pub trait Transformation: Send + Sync + Debug {
    fn type_name(&self) -> &'static str;

    /// Check a step config without touching data. Pipelines are validated
    /// as a whole before any step executes.
    fn validate(&self, config: &Value) -> Result<(), TransformError>;

    fn execute(
        &self,
        rows: Vec<Row>,
        config: &Value,
        ctx: &mut StepContext,
    ) -> Result<Vec<Row>, TransformError>;
}

/// Operator registry. Mutable but write-once: registration happens at
/// startup before any pipeline runs.
#[derive(Debug, Default)]
pub struct TransformationRegistry {
    operators: HashMap<&'static str, Box<dyn Transformation>>,
}

impl TransformationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in operator library.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for operator in ops::builtin_operators() {
            registry.register(operator);
        }
        registry
    }

    pub fn register(&mut self, operator: Box<dyn Transformation>) {
        let type_name = operator.type_name();
        if self.operators.insert(type_name, operator).is_some() {
            tracing::warn!(type_name, "replacing already-registered transformation");
        }
    }

    pub fn get(&self, type_name: &str) -> Option<&dyn Transformation> {
        self.operators.get(type_name).map(Box::as_ref)
    }

    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.operators.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

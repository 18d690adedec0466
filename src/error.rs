use std::time::Duration;

use crate::tensor::DataType;

/// Errors from a backend transport (metadata query or inference call).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by backend")]
    Closed,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("malformed backend message: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Whether the failure may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Connect(_)
                | TransportError::Timeout(_)
                | TransportError::Io(_)
                | TransportError::Closed
                | TransportError::Unavailable(_)
        )
    }
}

/// Errors from the module and pipeline registries.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("module {0} already exists")]
    DuplicateModule(String),
    #[error("module {0} not found")]
    UnknownModule(String),
    #[error("module {0} is being modified by another request")]
    ModuleBusy(String),
    #[error("module {0} was registered again with a different signature")]
    SignatureChanged(String),
    #[error("module {module}: no backend addresses provided")]
    NoBackends { module: String },
    #[error("module {module}: backend {address} already attached")]
    DuplicateBackend { module: String, address: String },
    #[error("module {module}: metadata mismatch between {first} and {other}: {detail}")]
    SignatureMismatch {
        module: String,
        first: String,
        other: String,
        detail: String,
    },
    #[error("module {module}: invalid metadata from {address}: {detail}")]
    InvalidSignature {
        module: String,
        address: String,
        detail: String,
    },
    #[error("module {module}: backend {address} unreachable: {source}")]
    BackendUnreachable {
        module: String,
        address: String,
        #[source]
        source: TransportError,
    },
    #[error("module {module} is used by pipeline(s) {}", pipelines.join(", "))]
    ModuleInUse {
        module: String,
        pipelines: Vec<String>,
    },
    #[error("pipeline {0} already exists")]
    DuplicatePipeline(String),
    #[error("pipeline {0} not found")]
    UnknownPipeline(String),
}

/// Errors from building a pipeline graph.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("pipeline {0} already exists")]
    DuplicatePipeline(String),
    #[error("stage {stage}: module {module} not found")]
    UnknownModule { stage: String, module: String },
    #[error("stage {stage}: module {module} changed signature during the build")]
    ModuleChanged { stage: String, module: String },
    #[error("stage {stage}: module {module} has no {direction} tensor '{tensor}'")]
    UnknownModuleTensor {
        stage: String,
        module: String,
        tensor: String,
        direction: &'static str,
    },
    #[error("stage {stage}: tensor '{tensor}' is neither a pipeline input nor produced by an earlier stage")]
    UnresolvedBinding { stage: String, tensor: String },
    #[error("stage {stage}: tensor '{tensor}' is already produced by {existing}")]
    DuplicateProducer {
        stage: String,
        tensor: String,
        existing: String,
    },
    #[error("stage {stage}: module input '{tensor}' is not bound")]
    MissingStageInput { stage: String, tensor: String },
    #[error("stage {stage}: tensor '{tensor}' is {found} but the module expects {expected}")]
    TensorTypeMismatch {
        stage: String,
        tensor: String,
        expected: DataType,
        found: DataType,
    },
    #[error("pipeline {pipeline}: output(s) {} not produced by any stage", missing.join(", "))]
    UnboundOutput {
        pipeline: String,
        missing: Vec<String>,
    },
    #[error("stage name {0} declared twice")]
    DuplicateStage(String),
    #[error("pipeline tensor '{0}' declared twice")]
    DuplicateTensor(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from dispatching a single module invocation.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("module {module}: no backends available")]
    NoBackends { module: String },
    #[error("module {module}: invalid inputs: {detail}")]
    InputContractViolation { module: String, detail: String },
    #[error("module {module}: backend {address} violated output contract: {detail}")]
    OutputContractViolation {
        module: String,
        address: String,
        detail: String,
    },
    #[error("module {module}: backend {address} failed after {attempts} attempt(s): {source}")]
    BackendInvocationError {
        module: String,
        address: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
}

/// Errors from executing a pipeline invocation.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("pipeline {0} not found")]
    UnknownPipeline(String),
    #[error("pipeline {pipeline}: missing input(s) {}", missing.join(", "))]
    MissingInput {
        pipeline: String,
        missing: Vec<String>,
    },
    #[error("pipeline {pipeline}: unexpected input(s) {}", unexpected.join(", "))]
    UnexpectedInput {
        pipeline: String,
        unexpected: Vec<String>,
    },
    #[error("pipeline {pipeline}: stage {stage} failed: {source}")]
    StageFailed {
        pipeline: String,
        stage: String,
        #[source]
        source: DispatchError,
    },
    #[error("pipeline {pipeline}: stage {stage} aborted: {reason}")]
    StageAborted {
        pipeline: String,
        stage: String,
        reason: String,
    },
    #[error("pipeline {pipeline}: invocation {invocation_id} exceeded {budget:?}")]
    PipelineTimeout {
        pipeline: String,
        invocation_id: u64,
        budget: Duration,
    },
}

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level error.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("build error: {0}")]
    Build(#[from] BuildError),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("execution error: {0}")]
    Execute(#[from] ExecuteError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, PipelineError>;

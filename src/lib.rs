pub mod client;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod module;
pub mod policy;
pub mod protocol;
pub mod registry;
#[cfg(feature = "tcp")]
pub mod tcp;
pub mod tensor;

pub use client::BackendClient;
pub use config::{DispatchConfig, EngineConfig, ExecutorConfig, RetryPolicy};
pub use dispatcher::{Dispatcher, InvokeOptions};
pub use engine::Engine;
pub use error::{
    BuildError, ConfigError, DispatchError, ExecuteError, PipelineError, RegistryError, Result,
    TransportError,
};
pub use executor::{InferenceResult, InvocationId, InvocationState, PipelineExecutor};
pub use graph::{
    GraphBuilder, PipelineDefinition, PipelineGraph, PipelineTensors, StageDefinition, StageNode,
    TensorRef, TensorSource,
};
pub use module::{BackendEndpoint, ModuleRecord, ModuleSignature};
pub use policy::{
    LeastInFlight, PreferInstanceType, RandomChoice, RequestContext, RoundRobin, SelectionPolicy,
};
pub use protocol::{BackendRequest, BackendResponse};
pub use registry::{ModuleRegistry, PipelineClaim, PipelineRegistry};
pub use tensor::{DataType, Dim, Tensor, TensorMap, TensorSpec};

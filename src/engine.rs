use std::sync::Arc;

use tracing::info;

use crate::client::BackendClient;
use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, InvokeOptions};
use crate::error::{BuildError, ExecuteError, PipelineError, RegistryError};
use crate::executor::{InferenceResult, PipelineExecutor};
use crate::graph::{GraphBuilder, PipelineDefinition, PipelineGraph};
use crate::module::{BackendEndpoint, ModuleRecord};
use crate::policy::{RoundRobin, SelectionPolicy};
use crate::registry::{ModuleRegistry, PipelineRegistry};
use crate::tensor::TensorMap;

/// Owns the module and pipeline registries, the dispatcher and the executor.
///
/// Construct one per process (or per test) and share it by reference or `Arc`.
/// Dropping it releases everything; there is no global state.
pub struct Engine {
    config: EngineConfig,
    client: Arc<dyn BackendClient>,
    modules: Arc<ModuleRegistry>,
    pipelines: PipelineRegistry,
    dispatcher: Arc<Dispatcher>,
    executor: PipelineExecutor,
}

impl Engine {
    /// Engine with round-robin backend selection.
    pub fn new(config: EngineConfig, client: Arc<dyn BackendClient>) -> Self {
        Self::with_policy(config, client, Arc::new(RoundRobin::new()))
    }

    pub fn with_policy(
        config: EngineConfig,
        client: Arc<dyn BackendClient>,
        policy: Arc<dyn SelectionPolicy>,
    ) -> Self {
        let modules = Arc::new(ModuleRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            client.clone(),
            policy,
            config.dispatch.clone(),
        ));
        let executor =
            PipelineExecutor::new(dispatcher.clone(), modules.clone(), config.executor.clone());
        info!(
            max_retries = config.dispatch.retry.max_retries,
            call_timeout_ms = config.dispatch.call_timeout.as_millis() as u64,
            invocation_timeout_ms = config.executor.invocation_timeout.as_millis() as u64,
            "engine initialized"
        );
        Self {
            config,
            client,
            modules,
            pipelines: PipelineRegistry::new(),
            dispatcher,
            executor,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Register a module served by `backends`, fetching its signature from each.
    pub async fn register_module(
        &self,
        name: &str,
        backends: Vec<BackendEndpoint>,
    ) -> crate::error::Result<Arc<ModuleRecord>> {
        Ok(self
            .modules
            .register(
                name,
                backends,
                self.client.as_ref(),
                self.config.dispatch.call_timeout,
            )
            .await?)
    }

    /// Attach more backends to a registered module.
    pub async fn add_backends(
        &self,
        name: &str,
        backends: Vec<BackendEndpoint>,
    ) -> crate::error::Result<Arc<ModuleRecord>> {
        Ok(self
            .modules
            .add_backends(
                name,
                backends,
                self.client.as_ref(),
                self.config.dispatch.call_timeout,
            )
            .await?)
    }

    /// Stored signature and backends of a module.
    pub fn module(&self, name: &str) -> crate::error::Result<Arc<ModuleRecord>> {
        Ok(self.modules.lookup(name)?)
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.names()
    }

    /// Remove a module no pipeline references.
    pub fn remove_module(&self, name: &str) -> crate::error::Result<()> {
        self.modules.remove(name)?;
        self.dispatcher.forget_module(name, &self.modules.addresses());
        Ok(())
    }

    /// Validate `definition` and store the resulting graph.
    ///
    /// Atomic: on any error no pipeline is stored and no module gains a reference.
    pub fn build_pipeline(
        &self,
        definition: &PipelineDefinition,
    ) -> crate::error::Result<Arc<PipelineGraph>> {
        let claim = self
            .pipelines
            .claim(&definition.name)
            .map_err(|_| BuildError::DuplicatePipeline(definition.name.clone()))?;

        let graph = GraphBuilder::new(&self.modules).build(definition)?;

        // A module may have been removed or replaced while the graph was being built.
        self.modules
            .attach_pipeline(graph.name(), &graph.module_signatures())
            .map_err(|e| -> PipelineError {
                let stage_using = |module: &str| {
                    graph
                        .stages()
                        .iter()
                        .find(|s| s.module.name == module)
                        .map(|s| s.name.clone())
                        .unwrap_or_default()
                };
                match e {
                    RegistryError::UnknownModule(module) => BuildError::UnknownModule {
                        stage: stage_using(&module),
                        module,
                    }
                    .into(),
                    RegistryError::SignatureChanged(module) => BuildError::ModuleChanged {
                        stage: stage_using(&module),
                        module,
                    }
                    .into(),
                    other => other.into(),
                }
            })?;

        let graph = claim.commit(graph);
        info!(
            pipeline = %graph.name(),
            stages = graph.stages().len(),
            inputs = graph.inputs().len(),
            outputs = graph.outputs().len(),
            "pipeline built"
        );
        Ok(graph)
    }

    pub fn pipeline(&self, name: &str) -> crate::error::Result<Arc<PipelineGraph>> {
        Ok(self.pipelines.get(name)?)
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.pipelines.names()
    }

    /// Remove a pipeline and release its module references.
    pub fn remove_pipeline(&self, name: &str) -> crate::error::Result<()> {
        let graph = self.pipelines.remove(name)?;
        self.modules
            .detach_pipeline(graph.name(), &graph.module_names());
        info!(pipeline = %name, "pipeline removed");
        Ok(())
    }

    /// Run a pipeline on `inputs`, returning exactly its declared outputs.
    pub async fn execute(
        &self,
        pipeline: &str,
        inputs: TensorMap,
    ) -> crate::error::Result<InferenceResult> {
        let graph = self.lookup_for_execution(pipeline)?;
        Ok(self.executor.execute(&graph, inputs).await?)
    }

    /// Like [`execute`](Self::execute), preferring backends of `instance_type`
    /// when the selection policy honours hints.
    pub async fn execute_with_hint(
        &self,
        pipeline: &str,
        inputs: TensorMap,
        instance_type: &str,
    ) -> crate::error::Result<InferenceResult> {
        let graph = self.lookup_for_execution(pipeline)?;
        Ok(self
            .executor
            .execute_with(&graph, inputs, Some(instance_type))
            .await?)
    }

    /// Invoke a single module directly, outside any pipeline.
    pub async fn infer_module(
        &self,
        module: &str,
        inputs: TensorMap,
    ) -> crate::error::Result<TensorMap> {
        let record = self.modules.lookup(module)?;
        Ok(self
            .dispatcher
            .invoke(&record, inputs, &InvokeOptions::default())
            .await?)
    }

    fn lookup_for_execution(
        &self,
        pipeline: &str,
    ) -> std::result::Result<Arc<PipelineGraph>, ExecuteError> {
        self.pipelines
            .get(pipeline)
            .map_err(|_| ExecuteError::UnknownPipeline(pipeline.to_string()))
    }
}

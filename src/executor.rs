use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::dispatcher::{Dispatcher, InvokeOptions};
use crate::error::{DispatchError, ExecuteError};
use crate::graph::PipelineGraph;
use crate::registry::ModuleRegistry;
use crate::tensor::{Tensor, TensorMap};

/// Unique identifier for a pipeline invocation.
pub type InvocationId = u64;

/// Lifecycle of one invocation.
///
/// `Pending -> Running -> Completed | Failed`. An invocation whose inputs are
/// rejected never starts and stays `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Outputs of a completed invocation.
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub invocation_id: InvocationId,
    /// Exactly the pipeline's declared outputs.
    pub outputs: TensorMap,
}

/// Runs pipeline graphs against the dispatcher.
///
/// Each invocation owns its tensor table. Stages run as separate tasks and
/// report back over a channel to the invocation's coordinator, which is the
/// only writer of that table.
pub struct PipelineExecutor {
    dispatcher: Arc<Dispatcher>,
    modules: Arc<ModuleRegistry>,
    config: ExecutorConfig,
}

impl PipelineExecutor {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        modules: Arc<ModuleRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            dispatcher,
            modules,
            config,
        }
    }

    pub async fn execute(
        &self,
        graph: &PipelineGraph,
        inputs: TensorMap,
    ) -> std::result::Result<InferenceResult, ExecuteError> {
        self.execute_with(graph, inputs, None).await
    }

    /// Execute `graph`, passing `instance_type_hint` to the selection policy
    /// for every stage.
    ///
    /// Fails as a whole if any stage fails: stages already in flight run to
    /// completion but their results are dropped. Subject to
    /// `ExecutorConfig::invocation_timeout`, after which in-flight backend
    /// calls are cancelled.
    pub async fn execute_with(
        &self,
        graph: &PipelineGraph,
        inputs: TensorMap,
        instance_type_hint: Option<&str>,
    ) -> std::result::Result<InferenceResult, ExecuteError> {
        let mut invocation = Invocation::new(graph, instance_type_hint);
        if let Err(e) = invocation.accept_inputs(inputs) {
            warn!(
                pipeline = %graph.name(),
                invocation_id = invocation.id,
                error = %e,
                "invocation rejected"
            );
            return Err(e);
        }

        let budget = self.config.invocation_timeout;
        let outcome = tokio::time::timeout(budget, invocation.run(self)).await;

        match outcome {
            Ok(Ok(outputs)) => {
                invocation.transition(InvocationState::Completed);
                info!(
                    pipeline = %graph.name(),
                    invocation_id = invocation.id,
                    "invocation complete"
                );
                Ok(InferenceResult {
                    invocation_id: invocation.id,
                    outputs,
                })
            }
            Ok(Err(e)) => {
                invocation.transition(InvocationState::Failed);
                let discarded = invocation.detach_in_flight();
                error!(
                    pipeline = %graph.name(),
                    invocation_id = invocation.id,
                    discarded,
                    error = %e,
                    "invocation failed"
                );
                Err(e)
            }
            Err(_) => {
                invocation.transition(InvocationState::Failed);
                let cancelled = invocation.abort_in_flight();
                error!(
                    pipeline = %graph.name(),
                    invocation_id = invocation.id,
                    cancelled,
                    budget_ms = budget.as_millis() as u64,
                    "invocation timed out"
                );
                Err(ExecuteError::PipelineTimeout {
                    pipeline: graph.name().to_string(),
                    invocation_id: invocation.id,
                    budget,
                })
            }
        }
    }
}

/// Outcome a stage task posts back to its coordinator.
enum StageOutcome {
    Done(std::result::Result<TensorMap, DispatchError>),
    Aborted,
}

/// Posts `Aborted` if the stage task unwinds before reporting.
struct StageReport {
    stage: usize,
    tx: mpsc::UnboundedSender<(usize, StageOutcome)>,
    sent: bool,
}

impl StageReport {
    fn send(mut self, result: std::result::Result<TensorMap, DispatchError>) {
        self.sent = true;
        // The coordinator is gone once the invocation has failed; results are dropped.
        let _ = self.tx.send((self.stage, StageOutcome::Done(result)));
    }
}

impl Drop for StageReport {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self.tx.send((self.stage, StageOutcome::Aborted));
        }
    }
}

/// Per-invocation bookkeeping. Never shared between invocations.
struct Invocation<'g> {
    id: InvocationId,
    graph: &'g PipelineGraph,
    state: InvocationState,
    instance_type_hint: Option<String>,
    values: HashMap<String, Tensor>,
    /// Unfinished producer stages per stage.
    waiting_on: Vec<usize>,
    tasks: HashMap<usize, JoinHandle<()>>,
}

impl<'g> Invocation<'g> {
    fn new(graph: &'g PipelineGraph, instance_type_hint: Option<&str>) -> Self {
        let id = rand::random::<u64>();
        debug!(pipeline = %graph.name(), invocation_id = id, "invocation pending");
        Self {
            id,
            graph,
            state: InvocationState::Pending,
            instance_type_hint: instance_type_hint.map(str::to_string),
            values: HashMap::new(),
            waiting_on: graph.stages().iter().map(|s| s.dependencies.len()).collect(),
            tasks: HashMap::new(),
        }
    }

    fn transition(&mut self, to: InvocationState) {
        debug!(
            invocation_id = self.id,
            from = ?self.state,
            to = ?to,
            "invocation state"
        );
        self.state = to;
    }

    /// The provided inputs must cover exactly the declared pipeline inputs.
    /// Leaves the state untouched.
    fn accept_inputs(&mut self, inputs: TensorMap) -> std::result::Result<(), ExecuteError> {
        let graph = self.graph;
        let declared = graph.inputs();
        let missing: Vec<String> = declared
            .iter()
            .filter(|name| !inputs.contains_key(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ExecuteError::MissingInput {
                pipeline: graph.name().to_string(),
                missing,
            });
        }
        let unexpected: Vec<String> = inputs
            .keys()
            .filter(|name| !declared.contains(*name))
            .cloned()
            .collect();
        if !unexpected.is_empty() {
            return Err(ExecuteError::UnexpectedInput {
                pipeline: graph.name().to_string(),
                unexpected,
            });
        }
        self.values.extend(inputs);
        Ok(())
    }

    async fn run(
        &mut self,
        executor: &PipelineExecutor,
    ) -> std::result::Result<TensorMap, ExecuteError> {
        self.transition(InvocationState::Running);
        let graph = self.graph;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let total = graph.stages().len();
        for &idx in graph.topological_order() {
            if self.waiting_on[idx] == 0 {
                self.launch(executor, idx, &tx)?;
            }
        }

        let mut completed = 0;
        while completed < total {
            let Some((idx, outcome)) = rx.recv().await else {
                break;
            };
            self.tasks.remove(&idx);
            let stage = &graph.stages()[idx];
            let outputs = match outcome {
                StageOutcome::Done(Ok(outputs)) => outputs,
                StageOutcome::Done(Err(source)) => {
                    return Err(ExecuteError::StageFailed {
                        pipeline: graph.name().to_string(),
                        stage: stage.name.clone(),
                        source,
                    });
                }
                StageOutcome::Aborted => {
                    return Err(ExecuteError::StageAborted {
                        pipeline: graph.name().to_string(),
                        stage: stage.name.clone(),
                        reason: "stage task terminated without a result".into(),
                    });
                }
            };

            completed += 1;
            debug!(
                invocation_id = self.id,
                stage = %stage.name,
                completed,
                total,
                "stage complete"
            );
            // Module outputs with no binding are not needed downstream.
            for (module_tensor, tensor) in outputs {
                if let Some(pipeline_tensor) = stage.output_bindings.get(&module_tensor) {
                    self.values.insert(pipeline_tensor.clone(), tensor);
                }
            }
            for &next in graph.dependents(idx) {
                self.waiting_on[next] -= 1;
                if self.waiting_on[next] == 0 {
                    self.launch(executor, next, &tx)?;
                }
            }
        }

        let mut result = TensorMap::new();
        for name in graph.outputs() {
            let value = self.values.get(name).cloned().ok_or_else(|| {
                ExecuteError::StageAborted {
                    pipeline: graph.name().to_string(),
                    stage: "<none>".into(),
                    reason: format!("output '{name}' was never produced"),
                }
            })?;
            result.insert(name.clone(), value);
        }
        Ok(result)
    }

    /// Spawn stage `idx` with its resolved inputs.
    fn launch(
        &mut self,
        executor: &PipelineExecutor,
        idx: usize,
        tx: &mpsc::UnboundedSender<(usize, StageOutcome)>,
    ) -> std::result::Result<(), ExecuteError> {
        let graph = self.graph;
        let stage = &graph.stages()[idx];

        let mut inputs = TensorMap::new();
        for (module_tensor, pipeline_tensor) in &stage.input_bindings {
            let value = self.values.get(pipeline_tensor).cloned().ok_or_else(|| {
                ExecuteError::StageAborted {
                    pipeline: graph.name().to_string(),
                    stage: stage.name.clone(),
                    reason: format!("input '{pipeline_tensor}' not resolved at launch"),
                }
            })?;
            inputs.insert(module_tensor.clone(), value);
        }

        // Pick up backends attached after the graph was built.
        let record = executor
            .modules
            .lookup(&stage.module.name)
            .unwrap_or_else(|_| stage.module.clone());
        let dispatcher = executor.dispatcher.clone();
        let options = InvokeOptions {
            stage: Some(stage.name.clone()),
            instance_type_hint: self.instance_type_hint.clone(),
        };
        let report = StageReport {
            stage: idx,
            tx: tx.clone(),
            sent: false,
        };

        debug!(
            invocation_id = self.id,
            stage = %stage.name,
            module = %record.name,
            "stage dispatched"
        );
        let handle = tokio::spawn(async move {
            let result = dispatcher.invoke(&record, inputs, &options).await;
            report.send(result);
        });
        self.tasks.insert(idx, handle);
        Ok(())
    }

    /// Let in-flight stages finish on their own; their results go nowhere.
    fn detach_in_flight(&mut self) -> usize {
        let n = self.tasks.len();
        if n > 0 {
            warn!(invocation_id = self.id, in_flight = n, "discarding results of in-flight stages");
        }
        self.tasks.clear();
        n
    }

    /// Cancel in-flight stages, dropping their pending backend calls.
    fn abort_in_flight(&mut self) -> usize {
        let n = self.tasks.len();
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
        n
    }
}

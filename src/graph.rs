use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BuildError;
use crate::module::{ModuleRecord, ModuleSignature};
use crate::registry::ModuleRegistry;
use crate::tensor::DataType;

/// A pipeline as submitted by a client, before validation.
///
/// Mirrors the JSON request body:
///
/// ```json
/// {
///   "name": "test_pipeline",
///   "tensors": {"inputs": [{"name": "p_image"}], "outputs": [{"name": "p_whs"}]},
///   "stages": [
///     {"name": "detector", "module": "detection_module",
///      "inputs": {"BATCH_IMAGE": "p_image"}, "outputs": {"BOXES": "p_boxes"}}
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub tensors: PipelineTensors,
    pub stages: Vec<StageDefinition>,
}

/// Pipeline-level input and output tensor declarations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineTensors {
    pub inputs: Vec<TensorRef>,
    pub outputs: Vec<TensorRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRef {
    pub name: String,
}

/// One stage: a module plus bindings from module tensor names to pipeline tensor names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub module: String,
    /// module input name -> pipeline tensor name
    pub inputs: BTreeMap<String, String>,
    /// module output name -> pipeline tensor name
    pub outputs: BTreeMap<String, String>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>, inputs: &[&str], outputs: &[&str]) -> Self {
        let refs = |names: &[&str]| {
            names
                .iter()
                .map(|n| TensorRef {
                    name: n.to_string(),
                })
                .collect()
        };
        Self {
            name: name.into(),
            tensors: PipelineTensors {
                inputs: refs(inputs),
                outputs: refs(outputs),
            },
            stages: Vec::new(),
        }
    }

    /// Append a stage. Bindings are `(module_tensor, pipeline_tensor)` pairs.
    pub fn stage(
        mut self,
        name: &str,
        module: &str,
        inputs: &[(&str, &str)],
        outputs: &[(&str, &str)],
    ) -> Self {
        let bindings = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(m, p)| (m.to_string(), p.to_string()))
                .collect()
        };
        self.stages.push(StageDefinition {
            name: name.to_string(),
            module: module.to_string(),
            inputs: bindings(inputs),
            outputs: bindings(outputs),
        });
        self
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, BuildError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> std::result::Result<String, BuildError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Where a pipeline tensor's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorSource {
    PipelineInput,
    Stage { stage: usize, module_tensor: String },
}

/// A validated stage inside a [`PipelineGraph`].
#[derive(Debug, Clone)]
pub struct StageNode {
    pub name: String,
    pub module: Arc<ModuleRecord>,
    pub input_bindings: BTreeMap<String, String>,
    pub output_bindings: BTreeMap<String, String>,
    /// Indices of stages whose outputs this stage consumes.
    pub dependencies: Vec<usize>,
}

/// A validated, immutable pipeline dataflow graph.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    stages: Vec<StageNode>,
    producers: HashMap<String, TensorSource>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl PipelineGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn stages(&self) -> &[StageNode] {
        &self.stages
    }

    pub fn stage(&self, idx: usize) -> Option<&StageNode> {
        self.stages.get(idx)
    }

    /// Stage indices in execution order. Every stage follows its producers.
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Stages consuming at least one output of stage `idx`.
    pub fn dependents(&self, idx: usize) -> &[usize] {
        self.dependents.get(idx).map_or(&[], Vec::as_slice)
    }

    pub fn producer(&self, tensor: &str) -> Option<&TensorSource> {
        self.producers.get(tensor)
    }

    /// Names of every module referenced by a stage.
    pub fn module_names(&self) -> BTreeSet<String> {
        self.stages.iter().map(|s| s.module.name.clone()).collect()
    }

    /// Signature each referenced module had when the graph was validated.
    pub fn module_signatures(&self) -> BTreeMap<String, ModuleSignature> {
        self.stages
            .iter()
            .map(|s| (s.module.name.clone(), s.module.signature.clone()))
            .collect()
    }
}

/// Builds [`PipelineGraph`]s against the modules registered in a [`ModuleRegistry`].
///
/// Stages may only consume pipeline inputs or outputs of stages declared
/// before them, so declaration order is a valid topological order and the
/// graph cannot contain a cycle.
pub struct GraphBuilder<'a> {
    modules: &'a ModuleRegistry,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(modules: &'a ModuleRegistry) -> Self {
        Self { modules }
    }

    /// Validate `def` and build its graph. Has no side effects.
    pub fn build(&self, def: &PipelineDefinition) -> std::result::Result<PipelineGraph, BuildError> {
        let mut producers: HashMap<String, TensorSource> = HashMap::new();
        // Datatype each pipeline input is consumed as, fixed by its first consumer.
        let mut input_types: HashMap<String, (DataType, String)> = HashMap::new();

        let mut inputs = Vec::with_capacity(def.tensors.inputs.len());
        for t in &def.tensors.inputs {
            if producers
                .insert(t.name.clone(), TensorSource::PipelineInput)
                .is_some()
            {
                return Err(BuildError::DuplicateTensor(t.name.clone()));
            }
            inputs.push(t.name.clone());
        }

        let mut outputs = Vec::with_capacity(def.tensors.outputs.len());
        for t in &def.tensors.outputs {
            if outputs.contains(&t.name) {
                return Err(BuildError::DuplicateTensor(t.name.clone()));
            }
            outputs.push(t.name.clone());
        }

        let mut stages: Vec<StageNode> = Vec::with_capacity(def.stages.len());
        let mut dependents: Vec<Vec<usize>> = Vec::with_capacity(def.stages.len());

        for (idx, stage_def) in def.stages.iter().enumerate() {
            if stages.iter().any(|s| s.name == stage_def.name) {
                return Err(BuildError::DuplicateStage(stage_def.name.clone()));
            }
            let module = self
                .modules
                .lookup(&stage_def.module)
                .map_err(|_| BuildError::UnknownModule {
                    stage: stage_def.name.clone(),
                    module: stage_def.module.clone(),
                })?;

            let mut dependencies = BTreeSet::new();
            for (module_tensor, pipeline_tensor) in &stage_def.inputs {
                let spec =
                    module
                        .input(module_tensor)
                        .ok_or_else(|| BuildError::UnknownModuleTensor {
                            stage: stage_def.name.clone(),
                            module: module.name.clone(),
                            tensor: module_tensor.clone(),
                            direction: "input",
                        })?;
                let source = producers.get(pipeline_tensor).ok_or_else(|| {
                    BuildError::UnresolvedBinding {
                        stage: stage_def.name.clone(),
                        tensor: pipeline_tensor.clone(),
                    }
                })?;

                let found = match source {
                    TensorSource::PipelineInput => {
                        let (dtype, _) = input_types
                            .entry(pipeline_tensor.clone())
                            .or_insert_with(|| (spec.datatype, stage_def.name.clone()));
                        *dtype
                    }
                    TensorSource::Stage {
                        stage,
                        module_tensor: produced_as,
                    } => {
                        dependencies.insert(*stage);
                        stages[*stage]
                            .module
                            .output(produced_as)
                            .map(|s| s.datatype)
                            .unwrap_or(spec.datatype)
                    }
                };
                if found != spec.datatype {
                    return Err(BuildError::TensorTypeMismatch {
                        stage: stage_def.name.clone(),
                        tensor: pipeline_tensor.clone(),
                        expected: spec.datatype,
                        found,
                    });
                }
            }

            if let Some(unbound) = module
                .signature
                .inputs
                .iter()
                .find(|s| !stage_def.inputs.contains_key(&s.name))
            {
                return Err(BuildError::MissingStageInput {
                    stage: stage_def.name.clone(),
                    tensor: unbound.name.clone(),
                });
            }

            for (module_tensor, pipeline_tensor) in &stage_def.outputs {
                if module.output(module_tensor).is_none() {
                    return Err(BuildError::UnknownModuleTensor {
                        stage: stage_def.name.clone(),
                        module: module.name.clone(),
                        tensor: module_tensor.clone(),
                        direction: "output",
                    });
                }
                if let Some(existing) = producers.get(pipeline_tensor) {
                    let existing = match existing {
                        TensorSource::PipelineInput => "pipeline input".to_string(),
                        TensorSource::Stage { stage, .. } if *stage == idx => {
                            format!("stage {}", stage_def.name)
                        }
                        TensorSource::Stage { stage, .. } => {
                            format!("stage {}", stages[*stage].name)
                        }
                    };
                    return Err(BuildError::DuplicateProducer {
                        stage: stage_def.name.clone(),
                        tensor: pipeline_tensor.clone(),
                        existing,
                    });
                }
                producers.insert(
                    pipeline_tensor.clone(),
                    TensorSource::Stage {
                        stage: idx,
                        module_tensor: module_tensor.clone(),
                    },
                );
            }

            for &dep in &dependencies {
                dependents[dep].push(idx);
            }
            dependents.push(Vec::new());
            stages.push(StageNode {
                name: stage_def.name.clone(),
                module,
                input_bindings: stage_def.inputs.clone(),
                output_bindings: stage_def.outputs.clone(),
                dependencies: dependencies.into_iter().collect(),
            });
        }

        let missing: Vec<String> = outputs
            .iter()
            .filter(|o| !producers.contains_key(*o))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::UnboundOutput {
                pipeline: def.name.clone(),
                missing,
            });
        }

        let order = (0..stages.len()).collect();
        debug!(pipeline = %def.name, stages = stages.len(), "pipeline graph validated");

        Ok(PipelineGraph {
            name: def.name.clone(),
            inputs,
            outputs,
            stages,
            producers,
            dependents,
            order,
        })
    }
}

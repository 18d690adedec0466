use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tensor::TensorSpec;

/// A network-addressable backend instance serving a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendEndpoint {
    /// Hardware class the instance runs on (e.g. `g4dn.xlarge`).
    pub instance_type: String,
    pub address: String,
}

impl BackendEndpoint {
    pub fn new(instance_type: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            instance_type: instance_type.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for BackendEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.instance_type)
    }
}

/// Input/output tensor signature reported by a backend's metadata endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModuleSignature {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl ModuleSignature {
    /// Reject signatures that declare the same tensor name twice on one side.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (side, specs) in [("input", &self.inputs), ("output", &self.outputs)] {
            let mut seen = BTreeSet::new();
            for spec in specs {
                if !seen.insert(spec.name.as_str()) {
                    return Err(format!("{side} tensor '{}' declared twice", spec.name));
                }
            }
        }
        Ok(())
    }

    /// Describe the first structural difference from `other`, ignoring declaration order.
    pub fn diff(&self, other: &ModuleSignature) -> Option<String> {
        diff_specs("input", &self.inputs, &other.inputs)
            .or_else(|| diff_specs("output", &self.outputs, &other.outputs))
    }
}

fn diff_specs(side: &str, ours: &[TensorSpec], theirs: &[TensorSpec]) -> Option<String> {
    for spec in ours {
        match theirs.iter().find(|t| t.name == spec.name) {
            None => return Some(format!("{side} '{}' missing", spec.name)),
            Some(t) if t.datatype != spec.datatype => {
                return Some(format!(
                    "{side} '{}' datatype {} vs {}",
                    spec.name, spec.datatype, t.datatype
                ))
            }
            Some(t) if t.shape != spec.shape => {
                return Some(format!(
                    "{side} '{}' shape {:?} vs {:?}",
                    spec.name,
                    shape_of(spec),
                    shape_of(t)
                ))
            }
            Some(_) => {}
        }
    }
    theirs
        .iter()
        .find(|t| !ours.iter().any(|s| s.name == t.name))
        .map(|t| format!("{side} '{}' unexpected", t.name))
}

fn shape_of(spec: &TensorSpec) -> Vec<i64> {
    spec.shape.iter().map(|&d| i64::from(d)).collect()
}

/// A registered inference module and the backends serving it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub name: String,
    pub signature: ModuleSignature,
    pub backends: Vec<BackendEndpoint>,
}

impl ModuleRecord {
    pub fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.signature.inputs.iter().find(|s| s.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorSpec> {
        self.signature.outputs.iter().find(|s| s.name == name)
    }
}

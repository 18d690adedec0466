#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use trytune::{
    BackendClient, BackendEndpoint, DataType, ModuleSignature, Tensor, TensorMap, TensorSpec,
    TransportError,
};

type Compute = Arc<dyn Fn(&TensorMap) -> TensorMap + Send + Sync>;

/// How a mock instance answers inference calls.
#[derive(Clone)]
pub enum Behaviour {
    Compute(Compute),
    /// Never answers.
    Hang,
    /// Fails with a non-transient error.
    Reject(String),
}

struct Instance {
    signatures: HashMap<String, ModuleSignature>,
    behaviours: HashMap<String, Behaviour>,
    delay: Duration,
    transient_failures: u32,
    unreachable: bool,
}

/// In-process stand-in for a fleet of model-serving backends, keyed by address.
#[derive(Default)]
pub struct MockCluster {
    instances: Mutex<HashMap<String, Instance>>,
    calls: Mutex<Vec<(String, String)>>,
    completions: Mutex<Vec<(String, String)>>,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `module` at `address` with `signature`, computing outputs with `compute`.
    pub fn serve<F>(&self, address: &str, module: &str, signature: ModuleSignature, compute: F)
    where
        F: Fn(&TensorMap) -> TensorMap + Send + Sync + 'static,
    {
        self.serve_with(address, module, signature, Behaviour::Compute(Arc::new(compute)));
    }

    pub fn serve_with(
        &self,
        address: &str,
        module: &str,
        signature: ModuleSignature,
        behaviour: Behaviour,
    ) {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .entry(address.to_string())
            .or_insert_with(|| Instance {
                signatures: HashMap::new(),
                behaviours: HashMap::new(),
                delay: Duration::ZERO,
                transient_failures: 0,
                unreachable: false,
            });
        instance.signatures.insert(module.to_string(), signature);
        instance.behaviours.insert(module.to_string(), behaviour);
    }

    pub fn set_behaviour(&self, address: &str, module: &str, behaviour: Behaviour) {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances.get_mut(address).expect("unknown mock address");
        instance.behaviours.insert(module.to_string(), behaviour);
    }

    pub fn set_delay(&self, address: &str, delay: Duration) {
        self.instances.lock().unwrap().get_mut(address).unwrap().delay = delay;
    }

    /// Fail the next `n` inference calls at `address` with a connection error.
    pub fn fail_next(&self, address: &str, n: u32) {
        self.instances
            .lock()
            .unwrap()
            .get_mut(address)
            .unwrap()
            .transient_failures = n;
    }

    pub fn set_unreachable(&self, address: &str) {
        self.instances
            .lock()
            .unwrap()
            .get_mut(address)
            .unwrap()
            .unreachable = true;
    }

    /// `(address, module)` of every inference call, in arrival order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// `(address, module)` of every call that returned outputs, in completion order.
    pub fn completions(&self) -> Vec<(String, String)> {
        self.completions.lock().unwrap().clone()
    }

    pub fn calls_to(&self, address: &str) -> usize {
        self.calls().iter().filter(|(a, _)| a == address).count()
    }
}

#[async_trait]
impl BackendClient for MockCluster {
    async fn metadata(
        &self,
        endpoint: &BackendEndpoint,
        module: &str,
    ) -> Result<ModuleSignature, TransportError> {
        let instances = self.instances.lock().unwrap();
        let instance = instances
            .get(&endpoint.address)
            .filter(|i| !i.unreachable)
            .ok_or_else(|| {
                TransportError::Connect(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ))
            })?;
        instance
            .signatures
            .get(module)
            .cloned()
            .ok_or_else(|| TransportError::Rejected(format!("model {module} not found")))
    }

    async fn infer(
        &self,
        endpoint: &BackendEndpoint,
        module: &str,
        inputs: TensorMap,
    ) -> Result<TensorMap, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint.address.clone(), module.to_string()));

        let (behaviour, delay) = {
            let mut instances = self.instances.lock().unwrap();
            let instance = instances.get_mut(&endpoint.address).ok_or_else(|| {
                TransportError::Connect(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ))
            })?;
            if instance.transient_failures > 0 {
                instance.transient_failures -= 1;
                return Err(TransportError::Connect(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                )));
            }
            let behaviour = instance
                .behaviours
                .get(module)
                .cloned()
                .ok_or_else(|| TransportError::Rejected(format!("model {module} not found")))?;
            (behaviour, instance.delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match behaviour {
            Behaviour::Compute(f) => {
                let outputs = f(&inputs);
                self.completions
                    .lock()
                    .unwrap()
                    .push((endpoint.address.clone(), module.to_string()));
                Ok(outputs)
            }
            Behaviour::Hang => std::future::pending().await,
            Behaviour::Reject(msg) => Err(TransportError::Rejected(msg)),
        }
    }
}

pub fn endpoint(address: &str) -> BackendEndpoint {
    BackendEndpoint::new("g4dn.xlarge", address)
}

pub fn detection_signature() -> ModuleSignature {
    ModuleSignature {
        inputs: vec![TensorSpec::new("BATCH_IMAGE", DataType::Fp32, &[-1, 3, 4, 4])],
        outputs: vec![
            TensorSpec::new("BOXES", DataType::Fp32, &[-1, 4]),
            TensorSpec::new("LABELS", DataType::Int64, &[-1]),
            TensorSpec::new("SCORES", DataType::Fp32, &[-1]),
        ],
    }
}

pub fn crop_signature() -> ModuleSignature {
    ModuleSignature {
        inputs: vec![
            TensorSpec::new("IMAGE", DataType::Fp32, &[-1, 3, 4, 4]),
            TensorSpec::new("BOXES", DataType::Fp32, &[-1, 4]),
            TensorSpec::new("LABELS", DataType::Int64, &[-1]),
            TensorSpec::new("SCORES", DataType::Fp32, &[-1]),
        ],
        outputs: vec![
            TensorSpec::new("CROPPED_IMAGES", DataType::Fp32, &[-1, 3, 2, 2]),
            TensorSpec::new("WHS", DataType::Int64, &[-1, 2]),
        ],
    }
}

pub fn image() -> Tensor {
    Tensor::from_f32(vec![1, 3, 4, 4], &[0.5; 48])
}

pub fn int64(shape: Vec<usize>, values: &[i64]) -> Tensor {
    let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    Tensor::new(DataType::Int64, shape, data)
}

/// Fixed detections: two boxes, labels and scores.
pub fn detect(_inputs: &TensorMap) -> TensorMap {
    TensorMap::from([
        (
            "BOXES".to_string(),
            Tensor::from_f32(vec![2, 4], &[0.0, 0.0, 2.0, 2.0, 1.0, 1.0, 3.0, 3.0]),
        ),
        ("LABELS".to_string(), int64(vec![2], &[1, 3])),
        ("SCORES".to_string(), Tensor::from_f32(vec![2], &[0.95, 0.4])),
    ])
}

/// One crop per box with score above 0.9.
pub fn crop(inputs: &TensorMap) -> TensorMap {
    let scores = &inputs["SCORES"];
    let kept = scores
        .data
        .chunks_exact(4)
        .filter(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) > 0.9)
        .count();
    TensorMap::from([
        (
            "CROPPED_IMAGES".to_string(),
            Tensor::from_f32(vec![kept, 3, 2, 2], &vec![0.5; kept * 12]),
        ),
        ("WHS".to_string(), int64(vec![kept, 2], &vec![2; kept * 2])),
    ])
}

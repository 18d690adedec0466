use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::client::BackendClient;
use crate::config::DispatchConfig;
use crate::error::{DispatchError, TransportError};
use crate::module::ModuleRecord;
use crate::policy::{RequestContext, SelectionPolicy};
use crate::tensor::{TensorMap, TensorSpec};

/// Per-call options forwarded to the selection policy.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub stage: Option<String>,
    pub instance_type_hint: Option<String>,
}

/// Sends module invocations to backend instances.
///
/// Owns the selection policy, the retry budget and one in-flight limiter per
/// backend address. Shared by every pipeline invocation.
pub struct Dispatcher {
    client: Arc<dyn BackendClient>,
    policy: Arc<dyn SelectionPolicy>,
    config: DispatchConfig,
    limits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn BackendClient>,
        policy: Arc<dyn SelectionPolicy>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            client,
            policy,
            config,
            limits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Calls currently in flight against `address`.
    pub fn in_flight(&self, address: &str) -> usize {
        let limits = self.limits.lock().unwrap_or_else(PoisonError::into_inner);
        limits.get(address).map_or(0, |sem| {
            self.config
                .max_in_flight_per_backend
                .saturating_sub(sem.available_permits())
        })
    }

    /// Backend addresses with a live in-flight limiter, sorted.
    pub fn tracked_addresses(&self) -> Vec<String> {
        let limits = self.limits.lock().unwrap_or_else(PoisonError::into_inner);
        let mut addresses: Vec<String> = limits.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Release state kept for a removed module.
    ///
    /// Limiters survive for addresses in `live_addresses` and for any address
    /// with calls still in flight.
    pub fn forget_module(&self, module: &str, live_addresses: &HashSet<String>) {
        self.policy.forget_module(module);
        let max = self.config.max_in_flight_per_backend;
        let mut limits = self.limits.lock().unwrap_or_else(PoisonError::into_inner);
        limits.retain(|address, sem| {
            live_addresses.contains(address) || sem.available_permits() < max
        });
    }

    fn limiter(&self, address: &str) -> Arc<Semaphore> {
        let mut limits = self.limits.lock().unwrap_or_else(PoisonError::into_inner);
        limits
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_in_flight_per_backend)))
            .clone()
    }

    /// Invoke `record` on one of its backends.
    ///
    /// Inputs are checked against the module signature before anything is sent.
    /// Transient transport failures are retried with exponential backoff, and each
    /// retry asks the policy again, so a round-robin policy moves to the next
    /// instance. Returned outputs must match the declared outputs exactly.
    pub async fn invoke(
        &self,
        record: &ModuleRecord,
        inputs: TensorMap,
        options: &InvokeOptions,
    ) -> std::result::Result<TensorMap, DispatchError> {
        check_tensors(&record.signature.inputs, &inputs).map_err(|detail| {
            DispatchError::InputContractViolation {
                module: record.name.clone(),
                detail,
            }
        })?;

        let retry = &self.config.retry;
        let mut attempt: u32 = 0;
        loop {
            let in_flight: Vec<usize> = record
                .backends
                .iter()
                .map(|b| self.in_flight(&b.address))
                .collect();
            let ctx = RequestContext {
                module: &record.name,
                stage: options.stage.as_deref(),
                instance_type_hint: options.instance_type_hint.as_deref(),
                in_flight: &in_flight,
                attempt,
            };
            let endpoint = self
                .policy
                .select(&record.backends, &ctx)
                .and_then(|i| record.backends.get(i))
                .ok_or_else(|| DispatchError::NoBackends {
                    module: record.name.clone(),
                })?;

            debug!(
                module = %record.name,
                address = %endpoint.address,
                attempt,
                "dispatching"
            );

            let result = {
                let limiter = self.limiter(&endpoint.address);
                match limiter.acquire_owned().await {
                    Ok(_permit) => tokio::time::timeout(
                        self.config.call_timeout,
                        self.client.infer(endpoint, &record.name, inputs.clone()),
                    )
                    .await
                    .unwrap_or(Err(TransportError::Timeout(self.config.call_timeout))),
                    Err(_) => Err(TransportError::Closed),
                }
            };

            match result {
                Ok(outputs) => {
                    check_tensors(&record.signature.outputs, &outputs).map_err(|detail| {
                        DispatchError::OutputContractViolation {
                            module: record.name.clone(),
                            address: endpoint.address.clone(),
                            detail,
                        }
                    })?;
                    return Ok(outputs);
                }
                Err(e) if e.is_transient() && attempt < retry.max_retries => {
                    let delay = retry.delay_for(attempt);
                    warn!(
                        module = %record.name,
                        address = %endpoint.address,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "backend call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(DispatchError::BackendInvocationError {
                        module: record.name.clone(),
                        address: endpoint.address.clone(),
                        attempts: attempt + 1,
                        source: e,
                    });
                }
            }
        }
    }
}

/// Check that `tensors` carries exactly the declared names, each matching its spec.
fn check_tensors(
    specs: &[TensorSpec],
    tensors: &TensorMap,
) -> std::result::Result<(), String> {
    let missing: Vec<&str> = specs
        .iter()
        .filter(|s| !tensors.contains_key(&s.name))
        .map(|s| s.name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing tensor(s) {}", missing.join(", ")));
    }
    let unexpected: Vec<&str> = tensors
        .keys()
        .filter(|name| !specs.iter().any(|s| &s.name == *name))
        .map(String::as_str)
        .collect();
    if !unexpected.is_empty() {
        return Err(format!("unexpected tensor(s) {}", unexpected.join(", ")));
    }
    for spec in specs {
        if let Some(tensor) = tensors.get(&spec.name) {
            spec.check(tensor)?;
        }
    }
    Ok(())
}

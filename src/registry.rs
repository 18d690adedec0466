use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info};

use crate::client::BackendClient;
use crate::error::{RegistryError, TransportError};
use crate::graph::PipelineGraph;
use crate::module::{BackendEndpoint, ModuleRecord, ModuleSignature};

/// Names currently being registered or modified.
///
/// Holding a claim makes writes to one name mutually exclusive without
/// blocking readers or writers of other names.
#[derive(Debug, Default)]
struct Claims {
    names: Mutex<HashSet<String>>,
}

impl Claims {
    fn try_claim(&self, name: &str) -> bool {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string())
    }

    fn is_claimed(&self, name: &str) -> bool {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    fn release(&self, name: &str) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}

/// Releases a claimed name when dropped.
struct ClaimGuard<'a> {
    claims: &'a Claims,
    name: String,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.claims.release(&self.name);
    }
}

#[derive(Debug)]
struct ModuleEntry {
    record: Arc<ModuleRecord>,
    /// Pipelines whose stages reference this module.
    users: BTreeSet<String>,
}

/// Registered modules, keyed by name.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    entries: RwLock<HashMap<String, ModuleEntry>>,
    claims: Claims,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`, fetching its signature from every backend.
    ///
    /// All backends must report the same signature. Nothing is stored on failure.
    pub async fn register(
        &self,
        name: &str,
        backends: Vec<BackendEndpoint>,
        client: &dyn BackendClient,
        fetch_timeout: Duration,
    ) -> std::result::Result<Arc<ModuleRecord>, RegistryError> {
        if backends.is_empty() {
            return Err(RegistryError::NoBackends {
                module: name.to_string(),
            });
        }
        check_distinct(name, &[], &backends)?;

        let _guard = self.claim_new(name)?;

        let first = &backends[0];
        let signature = fetch_signature(client, name, first, fetch_timeout).await?;
        for other in &backends[1..] {
            let theirs = fetch_signature(client, name, other, fetch_timeout).await?;
            if let Some(detail) = signature.diff(&theirs) {
                return Err(RegistryError::SignatureMismatch {
                    module: name.to_string(),
                    first: first.address.clone(),
                    other: other.address.clone(),
                    detail,
                });
            }
        }

        let record = Arc::new(ModuleRecord {
            name: name.to_string(),
            signature,
            backends,
        });
        self.write().insert(
            name.to_string(),
            ModuleEntry {
                record: record.clone(),
                users: BTreeSet::new(),
            },
        );
        info!(
            module = %name,
            backends = record.backends.len(),
            inputs = record.signature.inputs.len(),
            outputs = record.signature.outputs.len(),
            "module registered"
        );
        Ok(record)
    }

    /// Attach more backends to an existing module.
    ///
    /// Each new backend must report exactly the stored signature; on any
    /// failure the record is left untouched.
    pub async fn add_backends(
        &self,
        name: &str,
        backends: Vec<BackendEndpoint>,
        client: &dyn BackendClient,
        fetch_timeout: Duration,
    ) -> std::result::Result<Arc<ModuleRecord>, RegistryError> {
        if backends.is_empty() {
            return Err(RegistryError::NoBackends {
                module: name.to_string(),
            });
        }
        let _guard = self.claim_existing(name)?;
        let current = self.lookup(name)?;
        check_distinct(name, &current.backends, &backends)?;

        let reference = &current.backends[0];
        for endpoint in &backends {
            let theirs = fetch_signature(client, name, endpoint, fetch_timeout).await?;
            if let Some(detail) = current.signature.diff(&theirs) {
                return Err(RegistryError::SignatureMismatch {
                    module: name.to_string(),
                    first: reference.address.clone(),
                    other: endpoint.address.clone(),
                    detail,
                });
            }
        }

        let mut updated = (*current).clone();
        updated.backends.extend(backends);
        let updated = Arc::new(updated);
        let mut entries = self.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownModule(name.to_string()))?;
        entry.record = updated.clone();
        info!(module = %name, backends = updated.backends.len(), "module backends extended");
        Ok(updated)
    }

    pub fn lookup(&self, name: &str) -> std::result::Result<Arc<ModuleRecord>, RegistryError> {
        self.read()
            .get(name)
            .map(|e| e.record.clone())
            .ok_or_else(|| RegistryError::UnknownModule(name.to_string()))
    }

    /// Remove `name`. Rejected while any pipeline references it.
    pub fn remove(&self, name: &str) -> std::result::Result<(), RegistryError> {
        if self.claims.is_claimed(name) {
            return Err(RegistryError::ModuleBusy(name.to_string()));
        }
        let mut entries = self.write();
        let entry = entries
            .get(name)
            .ok_or_else(|| RegistryError::UnknownModule(name.to_string()))?;
        if !entry.users.is_empty() {
            return Err(RegistryError::ModuleInUse {
                module: name.to_string(),
                pipelines: entry.users.iter().cloned().collect(),
            });
        }
        entries.remove(name);
        info!(module = %name, "module removed");
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Backend addresses serving at least one registered module.
    pub fn addresses(&self) -> HashSet<String> {
        self.read()
            .values()
            .flat_map(|e| e.record.backends.iter().map(|b| b.address.clone()))
            .collect()
    }

    /// Pipelines currently referencing `name`.
    pub fn users(&self, name: &str) -> std::result::Result<Vec<String>, RegistryError> {
        self.read()
            .get(name)
            .map(|e| e.users.iter().cloned().collect())
            .ok_or_else(|| RegistryError::UnknownModule(name.to_string()))
    }

    /// Record that `pipeline` references every module in `expected`.
    ///
    /// Each module must still be registered with the signature the pipeline
    /// was validated against. All-or-nothing: fails without side effects.
    pub(crate) fn attach_pipeline(
        &self,
        pipeline: &str,
        expected: &BTreeMap<String, ModuleSignature>,
    ) -> std::result::Result<(), RegistryError> {
        let mut entries = self.write();
        for (module, signature) in expected {
            match entries.get(module) {
                None => return Err(RegistryError::UnknownModule(module.clone())),
                Some(entry) if entry.record.signature != *signature => {
                    return Err(RegistryError::SignatureChanged(module.clone()));
                }
                Some(_) => {}
            }
        }
        for module in expected.keys() {
            if let Some(entry) = entries.get_mut(module) {
                entry.users.insert(pipeline.to_string());
            }
        }
        Ok(())
    }

    pub(crate) fn detach_pipeline(&self, pipeline: &str, modules: &BTreeSet<String>) {
        let mut entries = self.write();
        for module in modules {
            if let Some(entry) = entries.get_mut(module) {
                entry.users.remove(pipeline);
            }
        }
    }

    fn claim_new(&self, name: &str) -> std::result::Result<ClaimGuard<'_>, RegistryError> {
        if self.read().contains_key(name) || !self.claims.try_claim(name) {
            return Err(RegistryError::DuplicateModule(name.to_string()));
        }
        let guard = ClaimGuard {
            claims: &self.claims,
            name: name.to_string(),
        };
        // A registration may have committed between the check and the claim.
        if self.read().contains_key(name) {
            return Err(RegistryError::DuplicateModule(name.to_string()));
        }
        Ok(guard)
    }

    fn claim_existing(&self, name: &str) -> std::result::Result<ClaimGuard<'_>, RegistryError> {
        if !self.claims.try_claim(name) {
            return Err(RegistryError::ModuleBusy(name.to_string()));
        }
        let guard = ClaimGuard {
            claims: &self.claims,
            name: name.to_string(),
        };
        if !self.read().contains_key(name) {
            return Err(RegistryError::UnknownModule(name.to_string()));
        }
        Ok(guard)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ModuleEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ModuleEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_distinct(
    module: &str,
    existing: &[BackendEndpoint],
    new: &[BackendEndpoint],
) -> std::result::Result<(), RegistryError> {
    let mut seen: HashSet<&str> = existing.iter().map(|b| b.address.as_str()).collect();
    for endpoint in new {
        if !seen.insert(endpoint.address.as_str()) {
            return Err(RegistryError::DuplicateBackend {
                module: module.to_string(),
                address: endpoint.address.clone(),
            });
        }
    }
    Ok(())
}

async fn fetch_signature(
    client: &dyn BackendClient,
    module: &str,
    endpoint: &BackendEndpoint,
    timeout: Duration,
) -> std::result::Result<ModuleSignature, RegistryError> {
    debug!(module, address = %endpoint.address, "fetching module metadata");
    let signature = tokio::time::timeout(timeout, client.metadata(endpoint, module))
        .await
        .unwrap_or(Err(TransportError::Timeout(timeout)))
        .map_err(|source| RegistryError::BackendUnreachable {
            module: module.to_string(),
            address: endpoint.address.clone(),
            source,
        })?;
    signature
        .validate()
        .map_err(|detail| RegistryError::InvalidSignature {
            module: module.to_string(),
            address: endpoint.address.clone(),
            detail,
        })?;
    Ok(signature)
}

/// Built pipelines, keyed by name.
#[derive(Debug, Default)]
pub struct PipelineRegistry {
    graphs: RwLock<HashMap<String, Arc<PipelineGraph>>>,
    claims: Claims,
}

/// Exclusive right to insert one pipeline name. Dropping it without
/// committing leaves the registry unchanged.
pub struct PipelineClaim<'a> {
    registry: &'a PipelineRegistry,
    _guard: ClaimGuard<'a>,
}

impl PipelineClaim<'_> {
    pub fn commit(self, graph: PipelineGraph) -> Arc<PipelineGraph> {
        let graph = Arc::new(graph);
        self.registry
            .graphs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(graph.name().to_string(), graph.clone());
        graph
    }
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `name` for a pipeline about to be built.
    pub fn claim(&self, name: &str) -> std::result::Result<PipelineClaim<'_>, RegistryError> {
        if self.contains(name) || !self.claims.try_claim(name) {
            return Err(RegistryError::DuplicatePipeline(name.to_string()));
        }
        let guard = ClaimGuard {
            claims: &self.claims,
            name: name.to_string(),
        };
        if self.contains(name) {
            return Err(RegistryError::DuplicatePipeline(name.to_string()));
        }
        Ok(PipelineClaim {
            registry: self,
            _guard: guard,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn get(&self, name: &str) -> std::result::Result<Arc<PipelineGraph>, RegistryError> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownPipeline(name.to_string()))
    }

    pub fn remove(&self, name: &str) -> std::result::Result<Arc<PipelineGraph>, RegistryError> {
        self.graphs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .ok_or_else(|| RegistryError::UnknownPipeline(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<PipelineGraph>>> {
        self.graphs.read().unwrap_or_else(PoisonError::into_inner)
    }
}

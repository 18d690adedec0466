use async_trait::async_trait;

use crate::error::TransportError;
use crate::module::{BackendEndpoint, ModuleSignature};
use crate::tensor::TensorMap;

/// Network seam to model-serving backends.
///
/// The engine needs exactly two calls against a backend address: a metadata
/// query and an inference call. Wire encoding is up to the implementation;
/// [`TcpBackendClient`](crate::tcp::TcpBackendClient) is the bundled one.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Fetch the input/output signature `module` has on `endpoint`.
    async fn metadata(
        &self,
        endpoint: &BackendEndpoint,
        module: &str,
    ) -> std::result::Result<ModuleSignature, TransportError>;

    /// Run `module` on `endpoint` with the given named inputs.
    ///
    /// Return [`TransportError`] variants whose [`is_transient`](TransportError::is_transient)
    /// is true only for failures a retry could fix.
    async fn infer(
        &self,
        endpoint: &BackendEndpoint,
        module: &str,
        inputs: TensorMap,
    ) -> std::result::Result<TensorMap, TransportError>;
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::BackendClient;
use crate::error::TransportError;
use crate::module::{BackendEndpoint, ModuleSignature};
use crate::protocol::{BackendRequest, BackendResponse, FrameStream};
use crate::tensor::TensorMap;

/// Strip an optional `tcp://` scheme from a backend address.
pub fn socket_address(address: &str) -> &str {
    address.strip_prefix("tcp://").unwrap_or(address)
}

/// [`BackendClient`] speaking length-prefixed JSON frames over TCP.
///
/// Opens one connection per call.
#[derive(Debug, Clone)]
pub struct TcpBackendClient {
    connect_timeout: Duration,
}

impl Default for TcpBackendClient {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl TcpBackendClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn call(
        &self,
        endpoint: &BackendEndpoint,
        request: &BackendRequest,
    ) -> std::result::Result<BackendResponse, TransportError> {
        let addr = socket_address(&endpoint.address);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(TransportError::Connect)?;
        stream.set_nodelay(true).ok();
        debug!(addr, "backend TCP connected");
        let mut frames = FrameStream::new(stream);

        let payload = request
            .to_bytes()
            .map_err(|e| TransportError::Malformed(format!("encode request: {e}")))?;
        frames.send(payload).await?;

        let frame = frames.recv().await?.ok_or(TransportError::Closed)?;
        BackendResponse::from_bytes(&frame)
            .map_err(|e| TransportError::Malformed(format!("invalid backend response: {e}")))
    }
}

#[async_trait]
impl BackendClient for TcpBackendClient {
    async fn metadata(
        &self,
        endpoint: &BackendEndpoint,
        module: &str,
    ) -> std::result::Result<ModuleSignature, TransportError> {
        let request = BackendRequest::Metadata {
            model: module.to_string(),
        };
        match self.call(endpoint, &request).await? {
            BackendResponse::Metadata { signature } => Ok(signature),
            other => Err(unexpected_response(other)),
        }
    }

    async fn infer(
        &self,
        endpoint: &BackendEndpoint,
        module: &str,
        inputs: TensorMap,
    ) -> std::result::Result<TensorMap, TransportError> {
        let request = BackendRequest::Infer {
            model: module.to_string(),
            inputs,
        };
        match self.call(endpoint, &request).await? {
            BackendResponse::Outputs { outputs } => Ok(outputs),
            other => Err(unexpected_response(other)),
        }
    }
}

fn unexpected_response(response: BackendResponse) -> TransportError {
    match response {
        BackendResponse::Error {
            message,
            retryable: true,
        } => TransportError::Unavailable(message),
        BackendResponse::Error { message, .. } => TransportError::Rejected(message),
        other => TransportError::Malformed(format!("unexpected response {other:?}")),
    }
}

/// Server-side model implementation behind [`serve_backend`].
#[async_trait]
pub trait ModelHandler: Send + Sync + 'static {
    /// Signature of `model`, or `None` if this instance does not serve it.
    fn signature(&self, model: &str) -> Option<ModuleSignature>;

    /// Run `model`. An `Err` is reported to the caller as a non-retryable error.
    async fn infer(
        &self,
        model: &str,
        inputs: TensorMap,
    ) -> std::result::Result<TensorMap, String>;
}

/// Accept connections on `listener` forever, answering requests with `handler`.
pub async fn serve_backend<H: ModelHandler>(
    listener: TcpListener,
    handler: Arc<H>,
) -> std::io::Result<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, "backend listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true).ok();
        debug!(peer = %peer, "backend accepted connection");
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, handler.as_ref()).await {
                warn!(peer = %peer, error = %e, "backend connection failed");
            }
        });
    }
}

/// Spawn [`serve_backend`] as a background task.
pub fn spawn_backend<H: ModelHandler>(
    listener: TcpListener,
    handler: Arc<H>,
) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(serve_backend(listener, handler))
}

async fn serve_connection<H: ModelHandler>(
    stream: TcpStream,
    handler: &H,
) -> std::result::Result<(), TransportError> {
    let mut frames = FrameStream::new(stream);
    while let Some(frame) = frames.recv().await? {
        let response = match BackendRequest::from_bytes(&frame) {
            Ok(BackendRequest::Metadata { model }) => match handler.signature(&model) {
                Some(signature) => BackendResponse::Metadata { signature },
                None => not_served(&model),
            },
            Ok(BackendRequest::Infer { model, inputs }) => {
                if handler.signature(&model).is_none() {
                    not_served(&model)
                } else {
                    match handler.infer(&model, inputs).await {
                        Ok(outputs) => BackendResponse::Outputs { outputs },
                        Err(message) => BackendResponse::Error {
                            message,
                            retryable: false,
                        },
                    }
                }
            }
            Err(e) => BackendResponse::Error {
                message: format!("invalid request: {e}"),
                retryable: false,
            },
        };
        let payload = response
            .to_bytes()
            .map_err(|e| TransportError::Malformed(format!("encode response: {e}")))?;
        frames.send(payload).await?;
    }
    Ok(())
}

fn not_served(model: &str) -> BackendResponse {
    BackendResponse::Error {
        message: format!("model {model} is not served here"),
        retryable: false,
    }
}

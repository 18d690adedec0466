use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::TransportError;
use crate::module::ModuleSignature;
use crate::tensor::TensorMap;

/// Upper bound on a single frame (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Messages sent from the engine to a backend instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BackendRequest {
    /// Query the input/output signature of a model.
    Metadata { model: String },
    /// Run a model on named input tensors.
    Infer { model: String, inputs: TensorMap },
}

/// Messages sent from a backend instance back to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BackendResponse {
    Metadata { signature: ModuleSignature },
    Outputs { outputs: TensorMap },
    /// Request failed. `retryable` marks overload or transient trouble.
    Error { message: String, retryable: bool },
}

impl BackendRequest {
    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

impl BackendResponse {
    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Codec for engine/backend frames: a big-endian `u32` length, then the payload.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// A byte stream carrying length-delimited frames.
pub struct FrameStream<S> {
    io: S,
    codec: LengthDelimitedCodec,
    read_buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameStream<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            codec: frame_codec(),
            read_buf: BytesMut::new(),
        }
    }

    /// Write one frame and flush it.
    pub async fn send(&mut self, payload: Bytes) -> std::result::Result<(), TransportError> {
        let mut out = BytesMut::with_capacity(payload.len() + 4);
        self.codec.encode(payload, &mut out).map_err(frame_error)?;
        self.io.write_all(&out).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Read one frame. Returns `Ok(None)` on a clean end of stream between frames.
    pub async fn recv(&mut self) -> std::result::Result<Option<Bytes>, TransportError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buf).map_err(frame_error)? {
                return Ok(Some(frame.freeze()));
            }
            if self.io.read_buf(&mut self.read_buf).await? == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::Malformed(format!(
                    "stream ended inside a frame with {} bytes buffered",
                    self.read_buf.len()
                )));
            }
        }
    }
}

/// Oversized frames are protocol errors, anything else is I/O.
fn frame_error(e: std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::InvalidInput => {
            TransportError::Malformed(e.to_string())
        }
        _ => TransportError::Io(e),
    }
}

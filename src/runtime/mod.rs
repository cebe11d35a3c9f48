//! Boundary to the container runtime.
//!
//! Everything the extraction pipeline needs from the runtime goes through
//! [`ContainerRuntime`]. [`engine::EngineClient`] implements it against the
//! Docker Engine API; tests substitute in-memory fakes.

pub mod engine;

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// A stream of raw byte chunks coming back from the runtime.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Operations the pipeline consumes from the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Look an image up by reference or id. `Ok(None)` means it is not present locally.
    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageMetadata>, RuntimeError>;

    /// Start pulling an image. The returned stream carries the runtime's
    /// concatenated JSON progress messages.
    async fn pull_image(&self, reference: &str, auth: &RegistryAuth)
    -> Result<ByteStream, RuntimeError>;

    /// Create (but never start) a container. Returns the container id.
    async fn create_container(
        &self,
        name: &str,
        config: &ContainerConfig,
    ) -> Result<String, RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError>;

    /// Stream `path` out of the container as a tar archive.
    async fn copy_from_container(&self, id: &str, path: &str) -> Result<ByteStream, RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}

/// Errors reported by a [`ContainerRuntime`].
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime could not be reached at all.
    #[error("cannot connect to container runtime at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The runtime answered with an error status.
    #[error("container runtime returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("container runtime transport error: {0}")]
    Transport(String),

    #[error("malformed response from container runtime: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid image reference {0:?}")]
    InvalidReference(String),

    #[error("unsupported runtime endpoint {0:?} (only unix:// sockets are supported)")]
    UnsupportedEndpoint(String),
}

impl RuntimeError {
    /// True when the runtime itself is unreachable, as opposed to a request being refused.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RuntimeError::Connect { .. })
    }
}

/// Registry credentials handed to a pull request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "serveraddress", skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,
}

impl RegistryAuth {
    /// No credentials at all; public images still pull.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            server_address: None,
        }
    }

    pub fn with_server_address(mut self, server: impl Into<String>) -> Self {
        self.server_address = Some(server.into());
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() && self.password.is_none()
    }
}

/// Creation parameters for the throwaway container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    pub image: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
}

impl ContainerConfig {
    /// A container that defines no entrypoint and no command, so nothing the
    /// image ships can ever run inside it.
    pub fn inert(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            entrypoint: vec![String::new()],
            cmd: vec![String::new()],
        }
    }
}

/// The runtime's record of a created container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    #[serde(rename = "Id")]
    pub id: String,
    /// Id of the image the container was created from.
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Name", default)]
    pub name: String,
}

/// The runtime's descriptive record for an image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,
    #[serde(rename = "RepoDigests", default)]
    pub repo_digests: Vec<String>,
    #[serde(rename = "Created", default)]
    pub created: Option<String>,
    #[serde(rename = "Architecture", default)]
    pub architecture: Option<String>,
    #[serde(rename = "Os", default)]
    pub os: Option<String>,
    #[serde(rename = "Size", default)]
    pub size: u64,
    /// Image config (env, labels, entrypoint, ...) kept as the runtime sent it.
    #[serde(rename = "Config", default)]
    pub config: Option<serde_json::Value>,
    #[serde(rename = "RootFS", default)]
    pub rootfs: Option<RootFs>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Layers", default)]
    pub layers: Vec<String>,
}

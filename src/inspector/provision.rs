//! Throwaway container used only to get at an image's filesystem.

use std::path::Path;
use std::sync::Arc;

use rand::RngCore;
use rand::rngs::OsRng;

use super::conduit::{self, ConduitError};
use super::materialize::MaterializeSummary;
use crate::runtime::{ContainerConfig, ContainerRuntime, ImageMetadata, RuntimeError};

pub const CONTAINER_NAME_PREFIX: &str = "image-inspector-";

/// Copied out of the container; the archive's top directory is `rootfs/`.
pub const COPY_ROOT: &str = "/";

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("unable to generate a container name: {0}")]
    Randomness(#[source] rand::Error),

    #[error("unable to create a container from {image}: {source}")]
    Create {
        image: String,
        #[source]
        source: RuntimeError,
    },

    #[error("unable to inspect container {container}: {source}")]
    InspectContainer {
        container: String,
        #[source]
        source: RuntimeError,
    },

    #[error("unable to inspect image {image}: {source}")]
    InspectImage {
        image: String,
        #[source]
        source: RuntimeError,
    },

    #[error("image {image} is not known to the runtime")]
    ImageMissing { image: String },

    #[error("unable to copy the filesystem out of container {container}: {source}")]
    Copy {
        container: String,
        #[source]
        source: RuntimeError,
        metadata: Box<ImageMetadata>,
    },

    #[error("unable to extract the filesystem of container {container}: {source}")]
    Extract {
        container: String,
        #[source]
        source: ConduitError,
        metadata: Box<ImageMetadata>,
    },
}

impl ProvisionError {
    /// Image metadata, when it was obtained before the failure.
    pub fn metadata(&self) -> Option<&ImageMetadata> {
        match self {
            ProvisionError::Copy { metadata, .. } | ProvisionError::Extract { metadata, .. } => {
                Some(metadata)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub metadata: ImageMetadata,
    pub summary: MaterializeSummary,
}

/// `image-inspector-` followed by 64 random bits in hex.
pub fn container_name() -> Result<String, ProvisionError> {
    let mut bytes = [0u8; 8];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(ProvisionError::Randomness)?;
    Ok(format!(
        "{CONTAINER_NAME_PREFIX}{:016x}",
        u64::from_be_bytes(bytes)
    ))
}

pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntime>,
    capacity: usize,
}

impl Provisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            capacity: conduit::DEFAULT_CAPACITY,
        }
    }

    /// Number of chunks buffered between the copy-out and the materializer.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Create an inert container from `image`, inspect it, and materialize its
    /// filesystem under `destination`. The container is removed afterwards
    /// whatever happened.
    pub async fn extract(
        &self,
        image: &str,
        destination: &Path,
    ) -> Result<Extraction, ProvisionError> {
        let name = container_name()?;
        let id = self
            .runtime
            .create_container(&name, &ContainerConfig::inert(image))
            .await
            .map_err(|source| ProvisionError::Create {
                image: image.to_string(),
                source,
            })?;
        tracing::info!(image, container = %id, name, "Created container");

        let result = self.extract_from(&id, destination).await;

        if let Err(err) = self.runtime.remove_container(&id).await {
            tracing::warn!(container = %id, error = %err, "Unable to remove container");
        } else {
            tracing::debug!(container = %id, "Removed container");
        }

        result
    }

    async fn extract_from(
        &self,
        id: &str,
        destination: &Path,
    ) -> Result<Extraction, ProvisionError> {
        let container = self.runtime.inspect_container(id).await.map_err(|source| {
            ProvisionError::InspectContainer {
                container: id.to_string(),
                source,
            }
        })?;

        let metadata = self
            .runtime
            .inspect_image(&container.image)
            .await
            .map_err(|source| ProvisionError::InspectImage {
                image: container.image.clone(),
                source,
            })?
            .ok_or_else(|| ProvisionError::ImageMissing {
                image: container.image.clone(),
            })?;

        let source = match self.runtime.copy_from_container(id, COPY_ROOT).await {
            Ok(source) => source,
            Err(source) => {
                return Err(ProvisionError::Copy {
                    container: id.to_string(),
                    source,
                    metadata: Box::new(metadata),
                });
            }
        };

        tracing::info!(container = %id, destination = %destination.display(), "Extracting image filesystem");
        match conduit::extract(source, destination, self.capacity).await {
            Ok(summary) => {
                tracing::info!(
                    container = %id,
                    entries = summary.entries,
                    skipped = summary.skipped,
                    bytes = summary.bytes,
                    "Extracted image filesystem"
                );
                Ok(Extraction { metadata, summary })
            }
            Err(source) => Err(ProvisionError::Extract {
                container: id.to_string(),
                source,
                metadata: Box::new(metadata),
            }),
        }
    }
}

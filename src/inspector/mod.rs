//! Image acquisition and extraction pipeline.
//!
//! [`ImageInspector`] pulls an image if the runtime does not have it yet,
//! prepares the destination directory, and copies the image's filesystem out
//! of a throwaway container onto disk.

pub mod conduit;
pub mod credentials;
pub mod destination;
pub mod materialize;
pub mod provision;
pub mod pull;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use indicatif::ProgressBar;
use serde::Serialize;

use crate::config::InspectOptions;
use crate::error::InspectError;
use crate::progress::PULL_REPORT_INTERVAL;
use crate::runtime::{ContainerRuntime, ImageMetadata};
use credentials::CredentialSet;
use destination::{DestinationDirs, FsDestinationDirs};
use materialize::MaterializeSummary;
use provision::Provisioner;
use pull::Puller;

/// Result of a completed inspection.
#[derive(Debug, Clone, Serialize)]
pub struct Inspection {
    pub image: String,
    pub destination: PathBuf,
    /// Whether the image had to be pulled first.
    pub pulled: bool,
    pub metadata: ImageMetadata,
    #[serde(skip)]
    pub summary: MaterializeSummary,
}

pub struct ImageInspector {
    runtime: Arc<dyn ContainerRuntime>,
    dirs: Box<dyn DestinationDirs>,
    capacity: usize,
    report_interval: Duration,
    progress: Option<ProgressBar>,
}

impl ImageInspector {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            dirs: Box::new(FsDestinationDirs),
            capacity: conduit::DEFAULT_CAPACITY,
            report_interval: PULL_REPORT_INTERVAL,
            progress: None,
        }
    }

    pub fn with_destination_dirs(mut self, dirs: Box<dyn DestinationDirs>) -> Self {
        self.dirs = dirs;
        self
    }

    pub fn with_conduit_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Attach a progress bar (clone of a Spinner's inner bar) for status updates.
    pub fn set_progress_bar(&mut self, bar: ProgressBar) {
        self.progress = Some(bar);
    }

    /// Run a full inspection with the credentials named by `options`.
    pub async fn inspect(&self, options: &InspectOptions) -> Result<Inspection, InspectError> {
        let credentials = options.credentials()?;
        self.inspect_with(options, &credentials).await
    }

    pub async fn inspect_with(
        &self,
        options: &InspectOptions,
        credentials: &CredentialSet,
    ) -> Result<Inspection, InspectError> {
        let image = options.image.as_str();

        let mut puller =
            Puller::new(self.runtime.clone()).with_report_interval(self.report_interval);
        if let Some(bar) = &self.progress {
            puller.set_progress_bar(bar.clone());
        }
        let outcome = puller.ensure_image(image, credentials).await?;

        let destination =
            destination::resolve(self.dirs.as_ref(), options.destination(), &options.temp_root)?;
        if let Some(bar) = &self.progress {
            bar.set_message(format!("Extracting {image} to {}", destination.display()));
        }

        let extraction = Provisioner::new(self.runtime.clone())
            .with_capacity(self.capacity)
            .extract(image, &destination)
            .await?;

        tracing::info!(image, destination = %destination.display(), "Inspection complete");

        Ok(Inspection {
            image: image.to_string(),
            destination,
            pulled: outcome.pulled(),
            metadata: extraction.metadata,
            summary: extraction.summary,
        })
    }
}

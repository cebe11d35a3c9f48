//! Authenticated pull: try each credential in order until the runtime
//! finishes a pull without reporting an error.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use indicatif::ProgressBar;
use serde::Deserialize;

use super::credentials::{Credential, CredentialSet};
use crate::progress::{self, DeltaSender, LayerProgress};
use crate::runtime::{ContainerRuntime, RuntimeError};

/// Why a single credential attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    /// The runtime put an `error` into its progress stream.
    #[error("{0}")]
    Rejected(String),

    #[error("error decoding pull progress: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("reading pull progress failed: {0}")]
    Stream(#[source] io::Error),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error("unable to check whether {image} is present: {source}")]
    Inspect {
        image: String,
        #[source]
        source: RuntimeError,
    },

    #[error(transparent)]
    Unreachable(RuntimeError),

    #[error("no credentials to pull {image} with")]
    NoCredentials { image: String },

    #[error("unable to pull {image}: all {attempts} credential attempts failed")]
    Exhausted { image: String, attempts: usize },

    #[error("pull progress task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    AlreadyPresent,
    Pulled {
        /// Name of the credential that worked.
        credential: String,
        attempts: usize,
        bytes: u64,
    },
}

impl PullOutcome {
    pub fn pulled(&self) -> bool {
        matches!(self, PullOutcome::Pulled { .. })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressDetail {
    #[serde(rename = "current", alias = "Current", default)]
    pub current: Option<i64>,
    #[serde(rename = "total", alias = "Total", default)]
    pub total: Option<i64>,
}

/// One status object from the runtime's pull stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullMessage {
    #[serde(rename = "status", alias = "Status", default)]
    pub status: Option<String>,
    #[serde(rename = "id", alias = "Id", default)]
    pub id: Option<String>,
    #[serde(rename = "progressDetail", alias = "ProgressDetail", default)]
    pub progress_detail: Option<ProgressDetail>,
    #[serde(rename = "error", alias = "Error", default)]
    pub error: Option<String>,
}

impl PullMessage {
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }

    /// `(layer, cumulative bytes)` for a `Downloading` message.
    pub fn download(&self) -> Option<(&str, u64)> {
        if self.status.as_deref() != Some("Downloading") {
            return None;
        }
        let layer = self.id.as_deref().filter(|id| !id.is_empty())?;
        let current = self.progress_detail.as_ref()?.current?;
        Some((layer, current.max(0) as u64))
    }
}

/// Incremental decoder for concatenated JSON objects split across arbitrary
/// chunk boundaries.
#[derive(Debug, Default)]
pub struct PullDecoder {
    pending: Vec<u8>,
}

impl PullDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every message it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<PullMessage>, serde_json::Error> {
        self.pending.extend_from_slice(chunk);

        let mut messages = Vec::new();
        let mut stream =
            serde_json::Deserializer::from_slice(&self.pending).into_iter::<PullMessage>();
        loop {
            match stream.next() {
                Some(Ok(message)) => messages.push(message),
                // Incomplete object; wait for more bytes.
                Some(Err(err)) if err.is_eof() => break,
                Some(Err(err)) => return Err(err),
                None => break,
            }
        }
        let consumed = stream.byte_offset();
        self.pending.drain(..consumed);

        Ok(messages)
    }

    /// The stream ended; anything but whitespace left over is malformed.
    pub fn finish(self) -> Result<(), serde_json::Error> {
        if self.pending.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        serde_json::from_slice::<PullMessage>(&self.pending).map(|_| ())
    }
}

/// Pulls images through a [`ContainerRuntime`].
pub struct Puller {
    runtime: Arc<dyn ContainerRuntime>,
    report_interval: Duration,
    progress: Option<ProgressBar>,
}

impl Puller {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            report_interval: progress::PULL_REPORT_INTERVAL,
            progress: None,
        }
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Show the running byte count on `bar` while pulling.
    pub fn set_progress_bar(&mut self, bar: ProgressBar) {
        self.progress = Some(bar);
    }

    /// Pull `image` unless the runtime already has it.
    pub async fn ensure_image(
        &self,
        image: &str,
        credentials: &CredentialSet,
    ) -> Result<PullOutcome, PullError> {
        match self.runtime.inspect_image(image).await {
            Ok(Some(_)) => {
                tracing::info!(image, "Image already present, skipping pull");
                return Ok(PullOutcome::AlreadyPresent);
            }
            Ok(None) => {}
            Err(source) if source.is_connectivity() => return Err(PullError::Unreachable(source)),
            Err(source) => {
                return Err(PullError::Inspect {
                    image: image.to_string(),
                    source,
                });
            }
        }

        self.pull(image, credentials).await
    }

    /// Try every credential in order, stopping at the first success.
    pub async fn pull(
        &self,
        image: &str,
        credentials: &CredentialSet,
    ) -> Result<PullOutcome, PullError> {
        if credentials.is_empty() {
            return Err(PullError::NoCredentials {
                image: image.to_string(),
            });
        }

        let mut attempts = 0;
        for credential in credentials.iter() {
            attempts += 1;
            let name = credential.name();
            tracing::info!(image, credential = %name, "Pulling image");

            // Each attempt reports its own download total.
            let (deltas, aggregator) =
                progress::spawn_aggregator(self.report_interval, self.progress.clone());
            let result = self.attempt(image, credential, &deltas).await;
            drop(deltas);
            let bytes = aggregator.await?;

            match result {
                Ok(()) => {
                    tracing::info!(image, credential = %name, attempts, "Image pulled");
                    return Ok(PullOutcome::Pulled {
                        credential: name,
                        attempts,
                        bytes,
                    });
                }
                Err(AttemptError::Runtime(err)) if err.is_connectivity() => {
                    return Err(PullError::Unreachable(err));
                }
                Err(err) => {
                    tracing::warn!(image, credential = %name, error = %err, "Pull attempt failed")
                }
            }
        }

        Err(PullError::Exhausted {
            image: image.to_string(),
            attempts,
        })
    }

    async fn attempt(
        &self,
        image: &str,
        credential: &Credential,
        deltas: &DeltaSender,
    ) -> Result<(), AttemptError> {
        let mut stream = self.runtime.pull_image(image, &credential.auth()).await?;
        let mut decoder = PullDecoder::new();
        let mut layers = LayerProgress::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(AttemptError::Stream)?;
            let messages = decoder.push(&chunk).map_err(AttemptError::Decode)?;
            for message in messages {
                if let Some(error) = message.error() {
                    return Err(AttemptError::Rejected(error.to_string()));
                }
                if let Some((layer, current)) = message.download() {
                    let delta = layers.observe(layer, current);
                    if delta > 0 {
                        // The aggregator outlives the attempt; a send can only
                        // fail if it panicked, and progress is not worth failing for.
                        let _ = deltas.send(delta);
                    }
                } else if let Some(status) = &message.status {
                    tracing::trace!(image, layer = message.id.as_deref().unwrap_or(""), status, "Pull status");
                }
            }
        }

        decoder.finish().map_err(AttemptError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ByteStream, ContainerConfig, ContainerInfo, ImageMetadata, RegistryAuth};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn decode_all(input: &str) -> Result<Vec<PullMessage>, serde_json::Error> {
        let mut decoder = PullDecoder::new();
        let messages = decoder.push(input.as_bytes())?;
        decoder.finish()?;
        Ok(messages)
    }

    #[test]
    fn test_decoder_plain_status() {
        let messages = decode_all(r#"{"Status": "fine"}"#).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status.as_deref(), Some("fine"));
        assert!(messages[0].error().is_none());
    }

    #[test]
    fn test_decoder_reports_error_field() {
        let messages =
            decode_all(r#"{"Status": "fine"}{"Error": "Oops"}{"Status": "fine"}"#).unwrap();
        assert_eq!(messages[1].error(), Some("Oops"));
    }

    #[test]
    fn test_decoder_rejects_garbage() {
        let mut decoder = PullDecoder::new();
        let err = decoder.push(b"{}{}what").unwrap_err();
        assert!(err.is_syntax());
    }

    #[test]
    fn test_decoder_handles_split_objects() {
        let mut decoder = PullDecoder::new();
        let first = decoder
            .push(br#"{"status":"Downloading","id":"abc","progressDetail":{"cur"#)
            .unwrap();
        assert!(first.is_empty());

        let second = decoder.push(b"rent\":100,\"total\":400}}\r\n{\"status\":\"Pull complete\"}\n").unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].download(), Some(("abc", 100)));
        decoder.finish().unwrap();
    }

    #[test]
    fn test_decoder_truncated_stream_is_an_error() {
        let mut decoder = PullDecoder::new();
        decoder.push(br#"{"status":"Down"#).unwrap();
        assert!(decoder.finish().is_err());
    }

    #[test]
    fn test_download_ignores_other_statuses() {
        let messages = decode_all(
            r#"{"status":"Extracting","id":"abc","progressDetail":{"current":5}}{"status":"Downloading","progressDetail":{"current":5}}"#,
        )
        .unwrap();
        assert!(messages.iter().all(|m| m.download().is_none()));
    }

    enum Script {
        Messages(&'static str),
        Fail(RuntimeError),
    }

    struct ScriptedRuntime {
        present: bool,
        scripts: Mutex<VecDeque<Script>>,
        auths: Mutex<Vec<RegistryAuth>>,
    }

    impl ScriptedRuntime {
        fn new(present: bool, scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                present,
                scripts: Mutex::new(scripts.into()),
                auths: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> usize {
            self.auths.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        async fn inspect_image(&self, _: &str) -> Result<Option<ImageMetadata>, RuntimeError> {
            Ok(self.present.then(ImageMetadata::default))
        }

        async fn pull_image(&self, _: &str, auth: &RegistryAuth) -> Result<ByteStream, RuntimeError> {
            self.auths.lock().unwrap().push(auth.clone());
            match self.scripts.lock().unwrap().pop_front() {
                Some(Script::Messages(body)) => {
                    // Split into small chunks so objects straddle boundaries.
                    let chunks: Vec<io::Result<Bytes>> = body
                        .as_bytes()
                        .chunks(7)
                        .map(|c| Ok(Bytes::copy_from_slice(c)))
                        .collect();
                    Ok(stream::iter(chunks).boxed())
                }
                Some(Script::Fail(err)) => Err(err),
                None => panic!("unexpected pull attempt"),
            }
        }

        async fn create_container(&self, _: &str, _: &ContainerConfig) -> Result<String, RuntimeError> {
            unimplemented!()
        }

        async fn inspect_container(&self, _: &str) -> Result<ContainerInfo, RuntimeError> {
            unimplemented!()
        }

        async fn copy_from_container(&self, _: &str, _: &str) -> Result<ByteStream, RuntimeError> {
            unimplemented!()
        }

        async fn remove_container(&self, _: &str) -> Result<(), RuntimeError> {
            unimplemented!()
        }
    }

    fn credentials(n: usize) -> CredentialSet {
        let mut entries: Vec<Credential> = (0..n - 1)
            .map(|i| Credential::Explicit {
                username: format!("user{i}"),
                password: "pw".into(),
            })
            .collect();
        entries.push(Credential::Anonymous);
        CredentialSet::from_entries(entries)
    }

    const DENIED: &str = r#"{"status":"Pulling from library/app"}{"errorDetail":{"message":"denied"},"error":"denied"}"#;
    const PARTIAL_THEN_DENIED: &str = concat!(
        r#"{"status":"Downloading","id":"l0","progressDetail":{"current":300,"total":900}}"#,
        "\n",
        r#"{"errorDetail":{"message":"connection reset"},"error":"connection reset"}"#,
    );
    const GARBLED: &str = r#"{"status":"Pulling"}not json"#;
    const SUCCESS: &str = concat!(
        r#"{"status":"Downloading","id":"l1","progressDetail":{"current":100,"total":400}}"#,
        "\n",
        r#"{"status":"Downloading","id":"l1","progressDetail":{"current":250,"total":400}}"#,
        "\n",
        r#"{"status":"Downloading","id":"l1","progressDetail":{"current":400,"total":400}}"#,
        "\n",
        r#"{"status":"Download complete","id":"l1","progressDetail":{}}"#,
        "\n",
    );

    #[tokio::test]
    async fn test_skips_pull_when_present() {
        let runtime = ScriptedRuntime::new(true, vec![]);
        let puller = Puller::new(runtime.clone());

        let outcome = puller.ensure_image("busybox", &credentials(2)).await.unwrap();

        assert_eq!(outcome, PullOutcome::AlreadyPresent);
        assert_eq!(runtime.attempts(), 0);
    }

    #[tokio::test]
    async fn test_stops_at_first_successful_credential() {
        let runtime = ScriptedRuntime::new(
            false,
            vec![Script::Messages(DENIED), Script::Messages(GARBLED), Script::Messages(SUCCESS)],
        );
        let puller = Puller::new(runtime.clone());

        let outcome = puller.ensure_image("app", &credentials(4)).await.unwrap();

        assert_eq!(
            outcome,
            PullOutcome::Pulled {
                credential: "user2".into(),
                attempts: 3,
                bytes: 400,
            }
        );
        assert_eq!(runtime.attempts(), 3);
        assert_eq!(runtime.auths.lock().unwrap()[0], RegistryAuth::basic("user0", "pw"));
    }

    #[tokio::test]
    async fn test_bytes_from_failed_attempts_are_not_counted() {
        let runtime = ScriptedRuntime::new(
            false,
            vec![Script::Messages(PARTIAL_THEN_DENIED), Script::Messages(SUCCESS)],
        );
        let puller = Puller::new(runtime.clone());

        let outcome = puller.ensure_image("app", &credentials(2)).await.unwrap();

        assert_eq!(
            outcome,
            PullOutcome::Pulled {
                credential: "anonymous".into(),
                attempts: 2,
                bytes: 400,
            }
        );
    }

    #[tokio::test]
    async fn test_all_credentials_failing_is_one_error() {
        let runtime = ScriptedRuntime::new(
            false,
            vec![
                Script::Messages(DENIED),
                Script::Fail(RuntimeError::Api {
                    status: 404,
                    message: "manifest unknown".into(),
                }),
                Script::Messages(DENIED),
            ],
        );
        let puller = Puller::new(runtime.clone());

        let err = puller.ensure_image("app", &credentials(3)).await.unwrap_err();

        assert!(matches!(err, PullError::Exhausted { attempts: 3, .. }), "got {err}");
        assert_eq!(runtime.attempts(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_runtime_stops_immediately() {
        let runtime = ScriptedRuntime::new(
            false,
            vec![Script::Fail(RuntimeError::Connect {
                endpoint: "unix:///nope".into(),
                source: io::Error::new(io::ErrorKind::NotFound, "no socket"),
            })],
        );
        let puller = Puller::new(runtime.clone());

        let err = puller.ensure_image("app", &credentials(3)).await.unwrap_err();

        assert!(matches!(err, PullError::Unreachable(_)));
        assert_eq!(runtime.attempts(), 1);
    }

    #[tokio::test]
    async fn test_empty_credential_set() {
        let runtime = ScriptedRuntime::new(false, vec![]);
        let puller = Puller::new(runtime);

        let err = puller
            .pull("app", &CredentialSet::from_entries(Vec::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, PullError::NoCredentials { .. }));
    }
}

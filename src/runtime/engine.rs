use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use futures::{StreamExt, TryStreamExt};
use hyper::client::conn;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Deserialize;
use tokio::net::UnixStream;

use super::{
    ByteStream, ContainerConfig, ContainerInfo, ContainerRuntime, ImageMetadata, RegistryAuth,
    RuntimeError,
};

/// Where the Docker daemon listens unless told otherwise.
pub const DEFAULT_ENDPOINT: &str = "unix:///var/run/docker.sock";

const REGISTRY_AUTH_HEADER: &str = "X-Registry-Auth";

// --- Docker Engine API JSON bodies ---

#[derive(Deserialize)]
struct CreateResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Talks to a Docker-compatible daemon (docker, podman's docker socket) over
/// its unix socket. Every request opens its own HTTP/1.1 connection so a
/// long-running stream never holds up another call.
#[derive(Debug, Clone)]
pub struct EngineClient {
    endpoint: String,
    socket: PathBuf,
}

impl EngineClient {
    /// Accepts `unix:///path/to/socket` or a bare absolute socket path.
    pub fn new(endpoint: &str) -> Result<Self, RuntimeError> {
        let socket = parse_endpoint(endpoint)?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            socket,
        })
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        headers: &[(&str, String)],
        body: Body,
    ) -> Result<Response<Body>, RuntimeError> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|source| RuntimeError::Connect {
                endpoint: self.endpoint.clone(),
                source,
            })?;

        let (mut sender, connection) = conn::handshake(stream).await.map_err(transport)?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(error = %err, "Runtime connection closed with error");
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, "docker");
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        let request = builder
            .body(body)
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;

        tracing::trace!(uri, "Runtime request");
        let response = sender.send_request(request).await.map_err(transport)?;
        check_status(response).await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, uri: &str) -> Result<T, RuntimeError> {
        let response = self.send(Method::GET, uri, &[], Body::empty()).await?;
        read_json(response).await
    }
}

#[async_trait]
impl ContainerRuntime for EngineClient {
    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageMetadata>, RuntimeError> {
        let reference = check_reference(reference)?;
        match self.get_json(&format!("/images/{reference}/json")).await {
            Ok(meta) => Ok(Some(meta)),
            Err(RuntimeError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn pull_image(
        &self,
        reference: &str,
        auth: &RegistryAuth,
    ) -> Result<ByteStream, RuntimeError> {
        let reference = check_reference(reference)?;
        let (name, tag) = split_tag(reference);
        let uri = match tag {
            Some(tag) => format!("/images/create?fromImage={name}&tag={tag}"),
            None => format!("/images/create?fromImage={name}"),
        };

        let mut headers = Vec::new();
        if !auth.is_anonymous() {
            headers.push((REGISTRY_AUTH_HEADER, encode_auth(auth)?));
        }

        let response = self.send(Method::POST, &uri, &headers, Body::empty()).await?;
        Ok(body_stream(response))
    }

    async fn create_container(
        &self,
        name: &str,
        config: &ContainerConfig,
    ) -> Result<String, RuntimeError> {
        let name = check_reference(name)?;
        let payload = serde_json::to_vec(config)?;
        let response = self
            .send(
                Method::POST,
                &format!("/containers/create?name={name}"),
                &[(CONTENT_TYPE.as_str(), "application/json".to_string())],
                Body::from(payload),
            )
            .await?;
        let created: CreateResponse = read_json(response).await?;
        Ok(created.id)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let id = check_reference(id)?;
        self.get_json(&format!("/containers/{id}/json")).await
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<ByteStream, RuntimeError> {
        let id = check_reference(id)?;
        let path = check_reference(path)?;
        let response = self
            .send(
                Method::GET,
                &format!("/containers/{id}/archive?path={path}"),
                &[],
                Body::empty(),
            )
            .await?;
        Ok(body_stream(response))
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let id = check_reference(id)?;
        self.send(
            Method::DELETE,
            &format!("/containers/{id}?v=true&force=true"),
            &[],
            Body::empty(),
        )
        .await?;
        Ok(())
    }
}

fn transport(err: hyper::Error) -> RuntimeError {
    RuntimeError::Transport(err.to_string())
}

async fn check_status(response: Response<Body>) -> Result<Response<Body>, RuntimeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(transport)?;
    Err(RuntimeError::Api {
        status: status.as_u16(),
        message: error_message(status, &body),
    })
}

/// Prefer the daemon's `{"message": ...}` body, fall back to raw text.
fn error_message(status: StatusCode, body: &[u8]) -> String {
    if let Ok(err) = serde_json::from_slice::<ErrorBody>(body) {
        return err.message;
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    if text.is_empty() {
        status.canonical_reason().unwrap_or("unknown error").to_string()
    } else {
        text
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    response: Response<Body>,
) -> Result<T, RuntimeError> {
    let body = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(transport)?;
    Ok(serde_json::from_slice(&body)?)
}

fn body_stream(response: Response<Body>) -> ByteStream {
    response.into_body().map_err(io::Error::other).boxed()
}

fn encode_auth(auth: &RegistryAuth) -> Result<String, RuntimeError> {
    Ok(URL_SAFE.encode(serde_json::to_vec(auth)?))
}

fn parse_endpoint(endpoint: &str) -> Result<PathBuf, RuntimeError> {
    let path = endpoint.strip_prefix("unix://").unwrap_or(endpoint);
    if path.is_empty() || !path.starts_with('/') {
        return Err(RuntimeError::UnsupportedEndpoint(endpoint.to_string()));
    }
    Ok(PathBuf::from(path))
}

/// Only characters that can appear in an image reference, container id, or
/// container name are accepted, so values can go into a URI verbatim.
fn check_reference(value: &str) -> Result<&str, RuntimeError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@'));
    if valid {
        Ok(value)
    } else {
        Err(RuntimeError::InvalidReference(value.to_string()))
    }
}

/// Split `name:tag`, handling registry port syntax (`registry:5000/foo`).
/// Digest references are left whole.
fn split_tag(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, Some(tag)),
        // The daemon pulls every tag when none is given.
        _ => (image, Some("latest")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint(DEFAULT_ENDPOINT).unwrap(),
            PathBuf::from("/var/run/docker.sock")
        );
        assert_eq!(
            parse_endpoint("/run/podman/podman.sock").unwrap(),
            PathBuf::from("/run/podman/podman.sock")
        );
        assert!(matches!(
            parse_endpoint("tcp://127.0.0.1:2375"),
            Err(RuntimeError::UnsupportedEndpoint(_))
        ));
        assert!(parse_endpoint("unix://").is_err());
    }

    #[test]
    fn test_split_tag() {
        assert_eq!(split_tag("busybox:1.36"), ("busybox", Some("1.36")));
        assert_eq!(split_tag("busybox"), ("busybox", Some("latest")));
        assert_eq!(
            split_tag("registry:5000/team/app"),
            ("registry:5000/team/app", Some("latest"))
        );
        assert_eq!(
            split_tag("registry:5000/team/app:v2"),
            ("registry:5000/team/app", Some("v2"))
        );
        assert_eq!(
            split_tag("busybox@sha256:0123abcd"),
            ("busybox@sha256:0123abcd", None)
        );
    }

    #[test]
    fn test_check_reference_rejects_query_characters() {
        assert!(check_reference("quay.io/org/app:v1").is_ok());
        assert!(check_reference("busybox@sha256:abc").is_ok());
        assert!(check_reference("").is_err());
        assert!(check_reference("busybox&fromSrc=x").is_err());
        assert!(check_reference("busy box").is_err());
        assert!(check_reference("a?b").is_err());
    }

    #[test]
    fn test_encode_auth_is_url_safe_json() {
        let auth = RegistryAuth::basic("erez", "p>?w").with_server_address("quay.io");
        let encoded = encode_auth(&auth).unwrap();
        assert!(!encoded.contains('+') && !encoded.contains('/'));

        let decoded = URL_SAFE.decode(encoded).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(json["username"], "erez");
        assert_eq!(json["password"], "p>?w");
        assert_eq!(json["serveraddress"], "quay.io");
    }

    #[test]
    fn test_error_message_prefers_daemon_message() {
        let msg = error_message(StatusCode::NOT_FOUND, br#"{"message":"No such image: nope"}"#);
        assert_eq!(msg, "No such image: nope");

        let msg = error_message(StatusCode::INTERNAL_SERVER_ERROR, b"  boom \n");
        assert_eq!(msg, "boom");

        let msg = error_message(StatusCode::UNAUTHORIZED, b"");
        assert_eq!(msg, "Unauthorized");
    }
}

use std::path::{Path, PathBuf};

use crate::inspector::credentials::{CredentialError, CredentialSet};
use crate::inspector::destination::DEFAULT_TEMP_ROOT;
use crate::runtime::engine::DEFAULT_ENDPOINT;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("a container runtime endpoint must be specified")]
    MissingEndpoint,

    #[error("an image to inspect must be specified")]
    MissingImage,

    #[error("specify either docker config files or a username/password pair, not both")]
    ConflictingAuth,

    #[error("a password file must be specified together with a username")]
    MissingPassword,

    #[error("{0} does not exist")]
    NotFound(PathBuf),
}

/// Everything one inspection needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectOptions {
    /// Runtime endpoint, e.g. `unix:///var/run/docker.sock`.
    pub docker_host: String,
    pub image: String,
    /// Extract here; a temporary directory under `temp_root` is made when unset.
    pub destination: Option<PathBuf>,
    pub docker_configs: Vec<PathBuf>,
    pub username: Option<String>,
    pub password_file: Option<PathBuf>,
    pub temp_root: PathBuf,
}

impl Default for InspectOptions {
    fn default() -> Self {
        Self {
            docker_host: DEFAULT_ENDPOINT.to_string(),
            image: String::new(),
            destination: None,
            docker_configs: Vec::new(),
            username: None,
            password_file: None,
            temp_root: PathBuf::from(DEFAULT_TEMP_ROOT),
        }
    }
}

impl InspectOptions {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.docker_host.is_empty() {
            return Err(OptionsError::MissingEndpoint);
        }
        if self.image.is_empty() {
            return Err(OptionsError::MissingImage);
        }
        let has_username = self.username.as_deref().is_some_and(|u| !u.is_empty());
        if has_username && !self.docker_configs.is_empty() {
            return Err(OptionsError::ConflictingAuth);
        }
        if has_username && self.password_file.is_none() {
            return Err(OptionsError::MissingPassword);
        }
        for path in self
            .docker_configs
            .iter()
            .chain(self.password_file.as_ref())
        {
            if !path.exists() {
                return Err(OptionsError::NotFound(path.clone()));
            }
        }
        Ok(())
    }

    /// Credentials to try, in order.
    pub fn credentials(&self) -> Result<CredentialSet, CredentialError> {
        CredentialSet::resolve(
            &self.docker_configs,
            self.username.as_deref(),
            self.password_file.as_deref(),
        )
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }
}

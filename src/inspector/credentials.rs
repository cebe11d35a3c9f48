//! Registry credentials tried, in order, when pulling an image.
//!
//! Credentials come from docker config files (`config.json` with an `auths`
//! map, or the legacy `.dockercfg` layout) or from an explicit username plus
//! password file. An anonymous entry is appended unless an explicit username
//! replaces everything.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use serde::Deserialize;

use crate::runtime::RegistryAuth;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("a username requires a password file")]
    MissingPasswordFile,

    #[error("unable to read password file {path}: {source}")]
    PasswordFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to open docker config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to parse docker config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("no auths were found in docker config file {path}")]
    ConfigEmpty { path: PathBuf },
}

/// One way of authenticating a pull attempt.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Anonymous,
    /// An entry of a docker config file.
    ConfigFile {
        source: PathBuf,
        registry: String,
        username: String,
        password: String,
    },
    /// Username given on the command line, password read from a file.
    Explicit { username: String, password: String },
}

impl Credential {
    /// Label safe to log; never includes the password.
    pub fn name(&self) -> String {
        match self {
            Credential::Anonymous => "anonymous".to_string(),
            Credential::ConfigFile {
                source, registry, ..
            } => format!("{}/{}", source.display(), registry),
            Credential::Explicit { username, .. } => username.clone(),
        }
    }

    pub fn auth(&self) -> RegistryAuth {
        match self {
            Credential::Anonymous => RegistryAuth::anonymous(),
            Credential::ConfigFile {
                registry,
                username,
                password,
                ..
            } => RegistryAuth::basic(username, password).with_server_address(registry),
            Credential::Explicit { username, password } => RegistryAuth::basic(username, password),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.name()).finish()
    }
}

/// Ordered credentials for one inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSet {
    entries: Vec<Credential>,
}

impl Default for CredentialSet {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl CredentialSet {
    /// Just the anonymous entry.
    pub fn anonymous() -> Self {
        Self {
            entries: vec![Credential::Anonymous],
        }
    }

    pub fn from_entries(entries: Vec<Credential>) -> Self {
        Self { entries }
    }

    /// Build the set for one inspection.
    ///
    /// An explicit `username` wins over everything else and needs a readable
    /// `password_file`. Otherwise every usable docker config entry is taken,
    /// in file order, followed by the anonymous entry. Docker config files
    /// that cannot be used are logged and skipped.
    pub fn resolve(
        docker_configs: &[PathBuf],
        username: Option<&str>,
        password_file: Option<&Path>,
    ) -> Result<Self, CredentialError> {
        if let Some(username) = username.filter(|u| !u.is_empty()) {
            let path = password_file.ok_or(CredentialError::MissingPasswordFile)?;
            let password =
                fs::read_to_string(path).map_err(|source| CredentialError::PasswordFile {
                    path: path.to_path_buf(),
                    source,
                })?;
            return Ok(Self {
                entries: vec![Credential::Explicit {
                    username: username.to_string(),
                    password: password.trim_end_matches(['\r', '\n']).to_string(),
                }],
            });
        }

        let mut entries = Vec::new();
        for path in docker_configs {
            match load_docker_config(path) {
                Ok(found) => entries.extend(found),
                Err(err) => {
                    tracing::warn!(config = %path.display(), error = %err, "Unable to read docker configuration")
                }
            }
        }
        entries.push(Credential::Anonymous);

        Ok(Self { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Deserialize)]
struct AuthEntry {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    /// base64 of `user:password`
    #[serde(default)]
    auth: Option<String>,
}

/// Read every usable registry entry of one docker config file.
pub fn load_docker_config(path: &Path) -> Result<Vec<Credential>, CredentialError> {
    let data = fs::read(path).map_err(|source| CredentialError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    let value: serde_json::Value =
        serde_json::from_slice(&data).map_err(|source| CredentialError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;

    // config.json nests registries under "auths"; .dockercfg is the map itself.
    let registries = match value.get("auths").and_then(|a| a.as_object()) {
        Some(auths) => auths,
        None => value
            .as_object()
            .ok_or_else(|| CredentialError::ConfigEmpty {
                path: path.to_path_buf(),
            })?,
    };

    let mut credentials = Vec::new();
    for (registry, raw) in registries {
        let Ok(entry) = serde_json::from_value::<AuthEntry>(raw.clone()) else {
            continue;
        };
        match entry_credentials(&entry) {
            Some((username, password)) => credentials.push(Credential::ConfigFile {
                source: path.to_path_buf(),
                registry: registry.clone(),
                username,
                password,
            }),
            None => {
                tracing::debug!(config = %path.display(), registry, "Docker config entry has no usable credentials")
            }
        }
    }

    if credentials.is_empty() {
        return Err(CredentialError::ConfigEmpty {
            path: path.to_path_buf(),
        });
    }
    Ok(credentials)
}

fn entry_credentials(entry: &AuthEntry) -> Option<(String, String)> {
    if let Some(username) = entry.username.as_ref().filter(|u| !u.is_empty()) {
        return Some((username.clone(), entry.password.clone().unwrap_or_default()));
    }

    let encoded = entry.auth.as_deref().filter(|a| !a.is_empty())?;
    let decoded = STANDARD
        .decode(encoded)
        .or_else(|_| STANDARD_NO_PAD.decode(encoded))
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn basic(user: &str, pass: &str) -> String {
        STANDARD.encode(format!("{user}:{pass}"))
    }

    #[test]
    fn test_no_sources_gives_anonymous_only() {
        let set = CredentialSet::resolve(&[], None, None).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next(), Some(&Credential::Anonymous));
    }

    #[test]
    fn test_two_config_files_plus_anonymous() {
        let dir = TempDir::new().unwrap();
        let modern = write(
            &dir,
            "config.json",
            &format!(r#"{{"auths": {{"quay.io": {{"auth": "{}"}}}}, "credsStore": "desktop"}}"#, basic("erez", "s3cret")),
        );
        let legacy = write(
            &dir,
            ".dockercfg",
            &format!(r#"{{"registry.example.com": {{"auth": "{}", "email": "a@b.c"}}}}"#, basic("bob", "pw:with:colons")),
        );

        let set = CredentialSet::resolve(&[modern.clone(), legacy.clone()], None, None).unwrap();
        let entries: Vec<_> = set.iter().cloned().collect();

        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0],
            Credential::ConfigFile {
                source: modern.clone(),
                registry: "quay.io".into(),
                username: "erez".into(),
                password: "s3cret".into(),
            }
        );
        assert_eq!(entries[0].name(), format!("{}/quay.io", modern.display()));
        match &entries[1] {
            Credential::ConfigFile { username, password, .. } => {
                assert_eq!(username, "bob");
                assert_eq!(password, "pw:with:colons");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(entries[2], Credential::Anonymous);
    }

    #[test]
    fn test_unusable_config_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let good = write(
            &dir,
            "good.json",
            &format!(r#"{{"auths": {{"quay.io": {{"auth": "{}"}}}}}}"#, basic("u", "p")),
        );
        let not_json = write(&dir, "password", "hunter2\n");
        let no_auths = write(&dir, "empty.json", r#"{"auths": {"quay.io": {}}}"#);
        let missing = dir.path().join("nosuchfile");

        let set = CredentialSet::resolve(&[good, not_json, no_auths, missing], None, None).unwrap();

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_explicit_username_replaces_everything() {
        let dir = TempDir::new().unwrap();
        let config = write(
            &dir,
            "config.json",
            &format!(r#"{{"auths": {{"quay.io": {{"auth": "{}"}}}}}}"#, basic("u", "p")),
        );
        let password = write(&dir, "password", "hunter2\n");

        let set = CredentialSet::resolve(&[config], Some("erez"), Some(&password)).unwrap();
        let entries: Vec<_> = set.iter().cloned().collect();

        assert_eq!(
            entries,
            vec![Credential::Explicit {
                username: "erez".into(),
                password: "hunter2".into()
            }]
        );
        assert_eq!(entries[0].auth(), RegistryAuth::basic("erez", "hunter2"));
    }

    #[test]
    fn test_explicit_username_needs_readable_password_file() {
        let dir = TempDir::new().unwrap();
        let err = CredentialSet::resolve(&[], Some("erez"), Some(&dir.path().join("nosuchfile")))
            .unwrap_err();
        assert!(matches!(err, CredentialError::PasswordFile { .. }));

        let err = CredentialSet::resolve(&[], Some("erez"), None).unwrap_err();
        assert!(matches!(err, CredentialError::MissingPasswordFile));
    }

    #[test]
    fn test_username_password_fields_are_used() {
        let dir = TempDir::new().unwrap();
        let config = write(
            &dir,
            "config.json",
            r#"{"auths": {"ghcr.io": {"username": "octo", "password": "token"}}}"#,
        );

        let creds = load_docker_config(&config).unwrap();

        assert_eq!(creds.len(), 1);
        let auth = creds[0].auth();
        assert_eq!(auth.username.as_deref(), Some("octo"));
        assert_eq!(auth.password.as_deref(), Some("token"));
        assert_eq!(auth.server_address.as_deref(), Some("ghcr.io"));
    }

    #[test]
    fn test_debug_output_hides_password() {
        let cred = Credential::Explicit {
            username: "erez".into(),
            password: "hunter2".into(),
        };
        let printed = format!("{cred:?}");
        assert!(printed.contains("erez"));
        assert!(!printed.contains("hunter2"));
    }
}

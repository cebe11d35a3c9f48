use std::fmt;

use serde::Serialize;

use crate::inspector::credentials::CredentialError;
use crate::inspector::destination::DestinationError;
use crate::inspector::provision::ProvisionError;
use crate::inspector::pull::PullError;
use crate::runtime::ImageMetadata;

/// Stage of an inspection that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pull,
    Destination,
    Extract,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Pull => "pull",
            Phase::Destination => "directory setup",
            Phase::Extract => "extraction",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("pull failed: {0}")]
    Credentials(#[from] CredentialError),

    #[error("pull failed: {0}")]
    Pull(#[from] PullError),

    #[error("directory setup failed: {0}")]
    Destination(#[from] DestinationError),

    #[error("extraction failed: {0}")]
    Extract(#[from] ProvisionError),
}

impl InspectError {
    pub fn phase(&self) -> Phase {
        match self {
            InspectError::Credentials(_) | InspectError::Pull(_) => Phase::Pull,
            InspectError::Destination(_) => Phase::Destination,
            InspectError::Extract(_) => Phase::Extract,
        }
    }

    /// Image metadata obtained before an extraction failure, if any.
    pub fn metadata(&self) -> Option<&ImageMetadata> {
        match self {
            InspectError::Extract(err) => err.metadata(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_display_names_the_phase() {
        let err = InspectError::from(PullError::Exhausted {
            image: "app".into(),
            attempts: 2,
        });
        assert_eq!(err.phase(), Phase::Pull);
        assert!(err.to_string().starts_with("pull failed: "));

        let err = InspectError::from(DestinationError::NotADirectory {
            path: PathBuf::from("/etc/passwd"),
        });
        assert_eq!(err.phase(), Phase::Destination);
        assert!(err.to_string().starts_with("directory setup failed: "));

        let err = InspectError::from(ProvisionError::ImageMissing {
            image: "app".into(),
        });
        assert_eq!(err.phase(), Phase::Extract);
        assert!(err.to_string().starts_with("extraction failed: "));
        assert!(err.metadata().is_none());
    }
}

//! Pull a container image and extract its complete filesystem into a local
//! directory, without ever running anything the image ships.

pub mod config;
pub mod error;
pub mod inspector;
pub mod progress;
pub mod runtime;

pub use config::{InspectOptions, OptionsError};
pub use error::{InspectError, Phase};
pub use inspector::{ImageInspector, Inspection};

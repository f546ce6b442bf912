pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{
    EngineError, EngineResult, ErrorCategory, ItemError, ManifestError, ValidationError,
};

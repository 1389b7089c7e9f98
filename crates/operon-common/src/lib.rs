//! Common building blocks for operon: errors, backoff, metrics and telemetry

#![deny(missing_docs)]

pub mod backoff;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default metric namespace for operon instruments
pub const DEFAULT_METRIC_NAMESPACE: &str = "operon";

/// Prefix used to build the default finalizer name of a controller
pub const FINALIZER_PREFIX: &str = "operon.dev";

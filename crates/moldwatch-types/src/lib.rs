//! Platform-agnostic types for moldwatch machine telemetry.
//!
//! This crate provides the shared vocabulary used by the telemetry core
//! (moldwatch-core) and the service (moldwatch-service).
//!
//! # Features
//!
//! - Canonical per-device samples and their source classes
//! - Operational state classification of raw status codes
//! - Connection state of the shared telemetry channel
//! - Absolute and relative (`-1h`) time windows
//!
//! # Example
//!
//! ```
//! use moldwatch_types::{CanonicalSample, MachineState, SourceType};
//! use time::OffsetDateTime;
//!
//! let sample = CanonicalSample::builder("press-07", OffsetDateTime::now_utc(), SourceType::Realtime)
//!     .temperature("zone1", 215.0)
//!     .status(2)
//!     .build();
//!
//! assert_eq!(sample.machine_state(), Some(MachineState::Production));
//! ```

pub mod error;
pub mod range;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use range::{RelativeRange, TimeRange};
pub use types::{
    CanonicalSample, CanonicalSampleBuilder, ConnectionState, ConnectionStatus, DeviceId,
    MachineState, SourceType,
};

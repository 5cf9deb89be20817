//! Real-time telemetry aggregation for injection-molding machines.
//!
//! This crate keeps a client-side, consistent view of many machines' time
//! series by merging two sources: a shared live channel that pushes realtime,
//! SPC, status and alert frames, and a request/response history endpoint used
//! for backfill.
//!
//! # Features
//!
//! - **Single shared channel**: one connection, ref-counted device subscriptions
//! - **Auto-reconnection**: configurable backoff, re-subscribes held devices
//! - **Normalization**: untrusted frames validated into [`CanonicalSample`]s
//! - **Merged series**: live samples supersede historical ones at the same instant
//! - **Coalesced history queries**: one request per (device, range), with retry
//! - **Bounded memory**: per-device retention by count and age
//!
//! # Cargo features
//!
//! | Feature | Adds |
//! |---------|------|
//! | `websocket` | [`WebSocketTransport`](channel::WebSocketTransport) over `tokio-tungstenite` |
//! | `http` | [`HttpHistoryEndpoint`](query::HttpHistoryEndpoint) over `reqwest` |
//!
//! # Quick Start
//!
//! ```
//! use moldwatch_core::{
//!     HubConfig, MockHistoryEndpoint, MockTransport, SubscribeOptions, TelemetryHub,
//! };
//! use moldwatch_types::DeviceId;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = MockTransport::new();
//!     let hub = TelemetryHub::new(transport.clone(), MockHistoryEndpoint::new(), HubConfig::default())?;
//!     hub.connect().await?;
//!
//!     let mut press = hub.subscribe(&DeviceId::from("press-07"), SubscribeOptions::default())?;
//!     transport.push(r#"{"kind":"realtime","deviceId":"press-07","timestamp":1700000000000,"data":{"oilTemp":42.5,"status":3}}"#);
//!
//!     let event = press.changed().await?;
//!     println!("{event:?}");
//!
//!     hub.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod consumer;
pub mod error;
pub mod events;
pub mod messages;
pub mod mock;
pub mod normalize;
pub mod pipeline;
pub mod query;
pub mod reconnect;
pub mod registry;
pub mod retry;
pub mod series;
pub mod status;

// Core exports
pub use consumer::{DeviceSubscription, HubConfig, SubscribeOptions, TelemetryHub};
pub use error::{ConnectionFailureReason, Error, NormalizationError, Result};

pub use channel::{ChannelManager, ChannelOptions, HandlerId, MessageHandler, Transport, TransportLink};
pub use events::{EventDispatcher, EventReceiver, EventSender, TelemetryEvent};
pub use messages::{
    AlertLevel, AlertNotice, ControlAction, ControlMessage, FrameKind, HistoryRequest,
    HistoryResponse, RawFrame, StatusUpdate,
};
pub use mock::{MockHistoryEndpoint, MockTransport};
pub use normalize::{Normalized, Normalizer, RowBatch};
pub use pipeline::{IngestOutcome, Pipeline, PipelineStats, RowsOutcome};
pub use query::{ConsumerId, FetchSummary, HistoryEndpoint, QueryFacade, QueryOptions};
pub use reconnect::ReconnectOptions;
pub use registry::{SubscriptionRecord, SubscriptionRegistry};
pub use retry::{RetryConfig, endpoint_status_error, is_retryable, with_retry};
pub use series::{BatchOutcome, DeviceSeries, InsertOutcome, RetentionPolicy, SeriesStore};
pub use status::{DeviceStatus, StatusChange, StatusTracker};

#[cfg(feature = "websocket")]
pub use channel::WebSocketTransport;
#[cfg(feature = "http")]
pub use query::HttpHistoryEndpoint;

// Re-export from moldwatch-types
pub use moldwatch_types::{
    CanonicalSample, ConnectionState, ConnectionStatus, DeviceId, MachineState, RelativeRange,
    SourceType, TimeRange,
};

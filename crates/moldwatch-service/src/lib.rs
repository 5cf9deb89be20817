//! REST and WebSocket service for live moldwatch machine telemetry.
//!
//! This crate provides a service that:
//! - Connects to the plant's telemetry channel and history endpoint
//! - Subscribes to the configured machines at startup
//! - Exposes the merged per-device series over a REST API
//! - Pushes sample, status, alert and connection events over WebSocket
//!
//! # REST API Endpoints
//!
//! - `GET /api/health` - Service health check
//! - `GET /api/status` - Channel status, subscriptions and ingestion counters
//! - `GET /api/devices` - Watched devices and devices with data
//! - `GET /api/devices/{id}/samples?range=-1h` - Merged series of a device
//! - `GET /api/devices/{id}/latest` - Newest sample of a device
//! - `POST /api/devices/{id}/refresh` - Re-fetch history for a device
//! - `WS /api/ws` - Real-time event stream
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/moldwatch/service.toml`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [channel]
//! url = "wss://telemetry.plant.example/ws"
//! token = "..."
//!
//! [query]
//! base_url = "https://telemetry.plant.example/api"
//!
//! [store]
//! max_samples = 10000
//! max_age_hours = 24
//!
//! [[devices]]
//! id = "press-07"
//! alias = "Line 3 press"
//! historical_range = "-1h"
//! ```

pub mod api;
pub mod config;
pub mod state;
pub mod ws;

pub use config::{
    ChannelConfig, Config, ConfigError, DeviceConfig, QueryConfig, ServerConfig, StoreConfig,
    ValidationError,
};
pub use state::AppState;

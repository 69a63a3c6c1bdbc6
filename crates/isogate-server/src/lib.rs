//! isogate-server: ISO-8583 gateway runtime.
//!
//! Accepts terminal connections, applies the per-side wire profiles from
//! `isogate-core`, routes each request by NII to a dialed destination or a
//! permanent link, and reports status to an optional monitor endpoint.

pub mod config;
pub mod events;
pub mod gateway;
pub mod handler;
pub mod logging;
pub mod monitor;
pub mod permanent;
pub mod policy;
pub mod stats;
pub mod tls;

pub use config::{GatewayConfig, Overrides};
pub use events::GatewayEvent;
pub use gateway::{crypto_backend, Gateway};

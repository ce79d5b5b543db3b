//! wienfeed - Vienna public-transport disruption feed aggregator
//!
//! A scheduled batch pipeline that collects disruption, construction and
//! notice messages from three upstream sources (municipal realtime,
//! national-railway RSS, regional-authority REST) and emits one
//! consolidated RSS 2.0 feed plus per-source JSON caches.
//!
//! # Architecture
//!
//! - [`config`] - environment-derived settings and the path allowlist
//! - [`fetch`] - hardened HTTP client (SSRF guards, redaction, retries)
//! - [`providers`] - the three upstream adapters and the regional filter
//! - [`stations`] - read-only station catalogue
//! - [`storage`] - cache, first-seen state and daily-counter stores
//! - [`feed`] - aggregation pipeline and RSS emitter
//! - [`text`] - text normalisation shared by adapters and emitter
//!
//! Two execution modes exist: a per-provider cache refresh (network, no
//! feed) and a feed build (no network, caches only). Coordination between
//! them is entirely through the filesystem.

pub mod commands;
pub mod config;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod models;
pub mod providers;
pub mod stations;
pub mod storage;
pub mod text;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::feed::BuildOutcome;
    pub use crate::models::Event;
    pub use crate::providers::ProviderKind;
}

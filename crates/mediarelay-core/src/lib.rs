//! # MediaRelay Core
//!
//! Shared vocabulary for the relay pipeline: value types that flow between
//! the grouping, queue and proxy crates, the collaborator traits they call
//! out to, configuration and the error taxonomy.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::RelayConfig;
pub use error::{BundleRejected, RelayError, Result};
pub use traits::{BundleSink, Clock, Downloader, Forwarder, SnapshotStorage, SystemClock};
pub use types::{Artifact, Bundle, InboundItem, ItemRef, MediaKind, ProxyKind};

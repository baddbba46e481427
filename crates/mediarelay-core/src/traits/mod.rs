//! Collaborator traits: the seams between this core and the outside world.

pub mod clock;
pub mod downloader;
pub mod forwarder;
pub mod sink;
pub mod storage;

pub use clock::{Clock, SystemClock};
pub use downloader::Downloader;
pub use forwarder::Forwarder;
pub use sink::BundleSink;
pub use storage::SnapshotStorage;

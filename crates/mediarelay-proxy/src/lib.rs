//! # MediaRelay Proxy
//!
//! Egress endpoint pool: selects the active proxy, rotates on schedule or
//! on demand, and only commits to a candidate after a reachability probe.
//! Candidates are never removed, only parked in a failed-set that resets
//! after a full cycle finds nothing reachable.

pub mod endpoint;
pub mod list;
pub mod pool;
pub mod probe;
pub mod transport;

pub use endpoint::{EgressConfig, ProxyEndpoint};
pub use pool::{ProxyPool, ProxyStats};
pub use probe::{Prober, TransportProbe, TunnelProbe};
pub use transport::{HttpTransportFactory, TransportFactory};

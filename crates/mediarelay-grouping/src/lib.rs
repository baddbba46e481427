//! # MediaRelay Grouping
//!
//! Turns a stream of inbound items into deliverable bundles.
//!
//! Items sharing a group key are collected until the group goes quiet for
//! the settle window, or until the max-wait ceiling from the first arrival.
//! The settled group is downloaded item by item under one deadline and
//! handed to the next stage as a single [`Bundle`](mediarelay_core::Bundle).
//! Ungrouped items skip collection and go straight to download.
//!
//! ```text
//! on_item ──▶ GroupState (Collecting) ──timer──▶ Downloading ──▶ Completed ──▶ BundleSink
//!                                                     └── deadline ──▶ Abandoned
//! ```

pub mod aggregator;
pub mod state;

pub use aggregator::GroupAggregator;
pub use state::{GroupState, GroupStatus};

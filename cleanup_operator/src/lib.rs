//! Garbage collection of unused ConfigMaps and Secrets.
//!
//! Each cycle marks the ConfigMaps and Secrets reachable from the workloads of
//! a namespace, then deletes the ones nothing references once they are older
//! than the configured threshold.

pub mod classifier;
pub mod collector;
pub mod config;
pub mod crd;
pub mod exclusion;
pub mod executor;
pub mod namespace;
pub mod pattern;
pub mod scheduler;
pub mod store;

//! Test harness for the GCS action transport.
//!
//! Runs whole groups in one process over the `mem` hub: a [`Cluster`] joins
//! connections to one channel and exposes the hub's partition and link
//! controls, and [`LossyDriver`] injects seeded fragment loss.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod lossy;

pub use cluster::{Cluster, Node, WAIT, next_action, recv_data, wait_for, wait_non_primary, wait_primary};
pub use lossy::LossyDriver;

//! GCS core: action transport and total-order monitor.
//!
//! The action transport turns a pluggable group-communication backend into an
//! ordered stream of arbitrary-size actions, each stamped with a cluster-wide
//! global sequence number and a connection-private local one. The TO monitor
//! lets application threads enter a critical section in exactly that global
//! order.
//!
//! # Architecture
//!
//! Protocol logic ([`defrag`], [`sequencer`], [`group`]) is a pure state
//! machine: it consumes backend events and returns declarative
//! [`group::GroupAction`]s. The blocking runtime in [`conn`] owns one delivery
//! thread per connection that feeds the state machine and executes its
//! actions, so reassembly and sequencing are serialized by construction.
//!
//! # Components
//!
//! - [`action`]: Delivered action union
//! - [`backend`]: Driver contract, registry and in-process drivers
//! - [`config`]: Connection configuration
//! - [`conn`]: Connection lifecycle and blocking send/recv/repl
//! - [`defrag`]: Per-sender reassembly of fragments
//! - [`error`]: Error codes and descriptions
//! - [`group`]: Membership, state exchange and delivery state machine
//! - [`mod@log`]: Injectable logging sink
//! - [`sequencer`]: Global and local sequence numbers
//! - [`to`]: Total-order monitor

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod action;
pub mod backend;
pub mod config;
pub mod conn;
pub mod defrag;
pub mod error;
pub mod group;
pub mod log;
pub mod sequencer;
pub mod to;

pub use action::{Action, Replicated};
pub use backend::{Backend, BackendError, BackendEvent, BackendLocator, BackendRegistry, Driver, Membership};
pub use config::ConnConfig;
pub use conn::{Connection, ConnectionState};
pub use error::{GcsError, Result, strerror};
pub use gcs_proto::{ActionType, ConfRecord, MemberId, SEQNO_ILL, Seqno};
pub use log::{LogConfig, LogSink, Logger, Severity};
pub use to::{ToError, ToMonitor};

//! Backend driver contract.
//!
//! A backend is the group transport: it moves bounded messages between the
//! members of a channel, detects membership and establishes the delivery
//! order. Every member of a component must observe messages and membership
//! views in one and the same order; the action transport builds global
//! sequencing on top of that order.
//!
//! Drivers are selected by the TYPE part of a `"TYPE://ADDRESS"` locator
//! through a [`BackendRegistry`]. Two in-process drivers are always available:
//!
//! - `dummy`: single-member loopback, the address is ignored
//! - `mem`: multi-member hub keyed by the address, with fault controls

pub mod dummy;
pub mod mem;

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, LazyLock, PoisonError, RwLock},
};

use bytes::Bytes;
use gcs_proto::MemberId;
use thiserror::Error;

pub use dummy::DummyDriver;
pub use mem::{MemDriver, MemHub};

/// Errors reported by drivers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Link to the group is down; the message was not accepted
    #[error("link down")]
    LinkDown,

    /// Backend has been closed
    #[error("backend closed")]
    Closed,

    /// No driver registered under this type
    #[error("unknown backend type '{0}'")]
    UnknownDriver(String),

    /// Locator is not of the form TYPE://ADDRESS
    #[error("malformed backend locator '{0}'")]
    BadLocator(String),

    /// Channel could not be joined
    #[error("could not join channel '{channel}': {reason}")]
    Join {
        /// Channel name
        channel: String,
        /// Driver-specific reason
        reason: String,
    },
}

/// A membership view as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    /// Backend view identifier, strictly increasing per channel
    pub view_id: u64,
    /// Whether this component may establish total order
    pub primary: bool,
    /// Members of this node's component, in backend order
    pub members: Vec<MemberId>,
    /// Index of this node in `members`
    pub my_idx: usize,
}

/// Something the backend delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// A message from the member at index `sender` of the current view
    Message {
        /// Sender index in the most recent membership view
        sender: usize,
        /// Raw message bytes
        payload: Bytes,
    },

    /// A new membership view
    Membership(Membership),

    /// The backend is closed; no further events follow
    Closed,
}

/// An open link to one channel.
pub trait Backend: Send + Sync {
    /// Hand one message to the group. Returns once the backend accepted it.
    fn send(&self, msg: Bytes) -> Result<(), BackendError>;

    /// Block until the next event.
    ///
    /// Returns [`BackendEvent::Closed`] once after [`Backend::close`] and an
    /// error on any further call.
    fn recv(&self) -> Result<BackendEvent, BackendError>;

    /// Leave the channel. Wakes a blocked [`Backend::recv`].
    fn close(&self);
}

/// Factory for backends of one type.
pub trait Driver: Send + Sync {
    /// Join `channel` at `address`, creating the channel if absent.
    fn open(&self, address: &str, channel: &str) -> Result<Box<dyn Backend>, BackendError>;
}

/// Parsed `"TYPE://ADDRESS"` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendLocator {
    /// Driver type
    pub kind: String,
    /// Driver-specific address, possibly empty
    pub address: String,
}

impl FromStr for BackendLocator {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("://") {
            Some((kind, address)) if !kind.is_empty() => {
                Ok(Self { kind: kind.to_ascii_lowercase(), address: address.to_owned() })
            },
            _ => Err(BackendError::BadLocator(s.to_owned())),
        }
    }
}

impl fmt::Display for BackendLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.address)
    }
}

/// Drivers by type name.
pub struct BackendRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn Driver>>>,
}

static GLOBAL: LazyLock<BackendRegistry> = LazyLock::new(BackendRegistry::with_defaults);

impl BackendRegistry {
    /// Registry without any driver.
    pub fn new() -> Self {
        Self { drivers: RwLock::new(HashMap::new()) }
    }

    /// Registry with the built-in `dummy` and `mem` drivers.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register("dummy", Arc::new(DummyDriver));
        registry.register("mem", Arc::new(MemDriver::new()));
        registry
    }

    /// Process-wide registry used by [`crate::Connection::create`].
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Register (or replace) the driver for `kind`.
    pub fn register(&self, kind: &str, driver: Arc<dyn Driver>) {
        self.drivers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.to_ascii_lowercase(), driver);
    }

    /// Driver for `kind`.
    pub fn get(&self, kind: &str) -> Result<Arc<dyn Driver>, BackendError> {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| BackendError::UnknownDriver(kind.to_owned()))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let drivers = self.drivers.read().unwrap_or_else(PoisonError::into_inner);
        let mut kinds: Vec<_> = drivers.keys().collect();
        kinds.sort();
        f.debug_struct("BackendRegistry").field("drivers", &kinds).finish()
    }
}

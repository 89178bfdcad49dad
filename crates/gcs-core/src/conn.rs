//! Connection runtime.
//!
//! A [`Connection`] owns one backend link and one delivery thread. The
//! delivery thread is the only reader of the backend: it feeds every event to
//! the [`GroupState`] machine and executes the resulting actions, so
//! reassembly and sequencing never race. Application threads call
//! [`Connection::send`], [`Connection::repl`] and [`Connection::recv`]
//! concurrently.
//!
//! # Lifecycle
//!
//! ```text
//! ┌─────────┐  open   ┌──────┐  close   ┌────────┐
//! │ Created │────────>│ Open │─────────>│ Closed │
//! └─────────┘         └──────┘          └────────┘
//!                         ↑     open        │
//!                         └─────────────────┘
//! ```
//!
//! Closing wakes every blocked `recv` and `repl` with
//! [`GcsError::ConnectionClosed`].

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use gcs_proto::{ActionType, FragmentHeader, Fragmenter, Seqno, ServiceMessage};
use tracing::{debug, info, warn};

use crate::{
    action::{Action, Replicated},
    backend::{Backend, BackendError, BackendEvent, BackendLocator, BackendRegistry, Driver},
    config::ConnConfig,
    error::{GcsError, Result},
    group::{GroupAction, GroupState},
    log::Logger,
    sequencer::Sequencer,
};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, never opened
    Created,
    /// Joined to a channel, delivery thread running
    Open,
    /// Left the channel
    Closed,
}

enum Link {
    Created,
    Open {
        backend: Arc<dyn Backend>,
        delivery: JoinHandle<Sequencer>,
        actions: Receiver<Action>,
    },
    Closed,
}

/// Callers blocked in `repl`, by action id.
#[derive(Default)]
struct Waiters {
    closed: bool,
    pending: HashMap<u64, Sender<Result<Replicated>>>,
}

/// State shared between application threads and the delivery thread.
struct Shared {
    pkt_size: AtomicUsize,
    next_act_id: AtomicU64,
    /// Held for a whole action: peers reassemble one action per sender.
    transmit: Mutex<()>,
    waiters: Mutex<Waiters>,
}

impl Shared {
    fn next_act_id(&self) -> u64 {
        self.next_act_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fragment `payload` at the current packet size and hand every fragment
    /// to the backend, without interleaving with other actions of this
    /// connection.
    fn transmit(&self, backend: &dyn Backend, act_type: ActionType, act_id: u64, payload: Bytes) -> Result<()> {
        let pkt_size = self.pkt_size.load(Ordering::Acquire);
        let frags = Fragmenter::new(act_type, act_id, payload, pkt_size)?;
        let _turn = self.transmit.lock().unwrap_or_else(PoisonError::into_inner);
        for frag in frags {
            backend.send(frag)?;
        }
        Ok(())
    }

    fn waiters(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, act_id: u64) -> Result<Receiver<Result<Replicated>>> {
        let mut waiters = self.waiters();
        if waiters.closed {
            return Err(GcsError::ConnectionClosed);
        }
        let (tx, rx) = bounded(1);
        waiters.pending.insert(act_id, tx);
        Ok(rx)
    }

    fn take(&self, act_id: u64) -> Option<Sender<Result<Replicated>>> {
        self.waiters().pending.remove(&act_id)
    }

    fn fail_all(&self) {
        let mut waiters = self.waiters();
        waiters.closed = true;
        for (_, waiter) in waiters.pending.drain() {
            let _ = waiter.send(Err(GcsError::ConnectionClosed));
        }
    }
}

/// A handle to one group channel.
pub struct Connection {
    driver: Arc<dyn Driver>,
    locator: BackendLocator,
    logger: Option<Logger>,
    shared: Arc<Shared>,
    link: Mutex<Link>,
    /// Counters of the last session, picked up by the next `open`.
    sequencer: Mutex<Sequencer>,
}

impl Connection {
    /// Create a connection for `locator` (`"TYPE://ADDRESS"`) using the
    /// process-wide driver registry and default configuration. No I/O.
    pub fn create(locator: &str) -> Result<Self> {
        Self::create_with(locator, ConnConfig::default(), BackendRegistry::global())
    }

    /// Create a connection with an explicit configuration and registry.
    pub fn create_with(locator: &str, config: ConnConfig, registry: &BackendRegistry) -> Result<Self> {
        let locator: BackendLocator =
            locator.parse().map_err(|e: BackendError| GcsError::InvalidArgument(e.to_string()))?;
        let driver = registry.get(&locator.kind).map_err(|e| GcsError::InvalidArgument(e.to_string()))?;
        validate_pkt_size(config.pkt_size)?;

        Ok(Self {
            driver,
            locator,
            logger: config.logger,
            shared: Arc::new(Shared {
                pkt_size: AtomicUsize::new(config.pkt_size),
                next_act_id: AtomicU64::new(1),
                transmit: Mutex::new(()),
                waiters: Mutex::new(Waiters::default()),
            }),
            link: Mutex::new(Link::Created),
            sequencer: Mutex::new(Sequencer::new()),
        })
    }

    /// Join `channel` and start delivering actions.
    pub fn open(&self, channel: &str) -> Result<()> {
        self.scoped(|| {
            let mut link = self.link();
            if matches!(*link, Link::Open { .. }) {
                return Err(GcsError::Busy);
            }

            let backend: Arc<dyn Backend> =
                Arc::from(self.driver.open(&self.locator.address, channel).map_err(|e| match e {
                    BackendError::Join { .. } => GcsError::Channel(e.to_string()),
                    other => GcsError::CouldNotConnect(other.to_string()),
                })?);

            {
                let mut waiters = self.shared.waiters();
                waiters.closed = false;
            }

            let (tx, actions) = unbounded();
            let delivery = {
                let reader = Arc::clone(&backend);
                let shared = Arc::clone(&self.shared);
                let logger = self.logger.clone();
                let group = GroupState::with_sequencer(self.sequencer().clone());
                thread::Builder::new()
                    .name(format!("gcs-deliver-{channel}"))
                    .spawn(move || {
                        let _log = logger.as_ref().map(|l| tracing::dispatcher::set_default(l.dispatch()));
                        deliver(group, reader.as_ref(), &shared, &tx)
                    })
                    .map_err(|e| {
                        backend.close();
                        GcsError::Internal(format!("could not start delivery thread: {e}"))
                    })?
            };

            info!(locator = %self.locator, channel, "connection opened");
            *link = Link::Open { backend, delivery, actions };
            Ok(())
        })
    }

    /// Leave the channel.
    ///
    /// Blocked `recv` and `repl` calls return [`GcsError::ConnectionClosed`].
    /// Fails with [`GcsError::NotConnected`] if the connection is not open.
    pub fn close(&self) -> Result<()> {
        self.scoped(|| {
            let (backend, delivery) = {
                let mut link = self.link();
                match std::mem::replace(&mut *link, Link::Closed) {
                    Link::Open { backend, delivery, .. } => (backend, delivery),
                    other => {
                        *link = other;
                        return Err(GcsError::NotConnected);
                    },
                }
            };

            backend.close();
            let seq = delivery
                .join()
                .map_err(|_| GcsError::Internal("delivery thread panicked".into()))?;
            *self.sequencer() = seq;
            info!(locator = %self.locator, "connection closed");
            Ok(())
        })
    }

    /// Release the handle. An open connection is handed back with
    /// [`GcsError::Busy`]; close it first.
    pub fn destroy(self) -> std::result::Result<(), (Self, GcsError)> {
        if self.state() == ConnectionState::Open {
            return Err((self, GcsError::Busy));
        }
        Ok(())
    }

    /// Send an action to the group without waiting for it to be ordered.
    ///
    /// Only [`ActionType::Data`] and [`ActionType::Snapshot`] may be sent.
    /// Returns the number of payload bytes accepted. On failure the payload
    /// is dropped.
    pub fn send(&self, act_type: ActionType, payload: impl Into<Bytes>) -> Result<usize> {
        if !act_type.is_sendable() {
            return Err(GcsError::InvalidArgument(format!("{act_type:?} actions cannot be sent")));
        }
        let payload = payload.into();
        let size = payload.len();

        self.scoped(|| {
            let backend = self.backend()?;
            let act_id = self.shared.next_act_id();
            self.shared.transmit(backend.as_ref(), act_type, act_id, payload)?;
            debug!(act_id, size, ?act_type, "action sent");
            Ok(size)
        })
    }

    /// Block until the next action is delivered.
    pub fn recv(&self) -> Result<Action> {
        self.receiver()?.recv().map_err(|_| GcsError::ConnectionClosed)
    }

    /// Like [`Self::recv`], but give up after `timeout` and return `None`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Action>> {
        match self.receiver()?.recv_timeout(timeout) {
            Ok(action) => Ok(Some(action)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(GcsError::ConnectionClosed),
        }
    }

    /// Send a data action and block until it comes back through the ordered
    /// stream.
    ///
    /// The action is not delivered to [`Self::recv`]. Fails with
    /// [`GcsError::NonPrimary`] when the group could not order it.
    pub fn repl(&self, act_type: ActionType, payload: impl Into<Bytes>) -> Result<Replicated> {
        if act_type != ActionType::Data {
            return Err(GcsError::InvalidArgument(format!("{act_type:?} actions cannot be replicated")));
        }
        let payload = payload.into();

        self.scoped(|| {
            let backend = self.backend()?;
            let act_id = self.shared.next_act_id();
            let done = self.shared.register(act_id)?;

            if let Err(e) = self.shared.transmit(backend.as_ref(), act_type, act_id, payload) {
                self.shared.take(act_id);
                return Err(e);
            }

            let replicated = done.recv().map_err(|_| GcsError::ConnectionClosed)??;
            debug!(act_id, global = replicated.global, "action replicated");
            Ok(replicated)
        })
    }

    /// Tell the group that every action up to `seqno` has been applied
    /// locally. Drives the commit cut; does not wait.
    pub fn set_last_applied(&self, seqno: Seqno) -> Result<()> {
        self.scoped(|| {
            let backend = self.backend()?;
            let payload = Bytes::from(ServiceMessage::LastApplied { seqno }.encode()?);
            let act_id = self.shared.next_act_id();
            self.shared.transmit(backend.as_ref(), ActionType::Service, act_id, payload)
        })
    }

    /// Change the maximum backend message size for subsequent sends.
    pub fn set_pkt_size(&self, pkt_size: usize) -> Result<usize> {
        validate_pkt_size(pkt_size)?;
        self.shared.pkt_size.store(pkt_size, Ordering::Release);
        Ok(pkt_size)
    }

    /// Current maximum backend message size.
    pub fn pkt_size(&self) -> usize {
        self.shared.pkt_size.load(Ordering::Acquire)
    }

    /// Lifecycle state.
    pub fn state(&self) -> ConnectionState {
        match *self.link() {
            Link::Created => ConnectionState::Created,
            Link::Open { .. } => ConnectionState::Open,
            Link::Closed => ConnectionState::Closed,
        }
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sequencer(&self) -> MutexGuard<'_, Sequencer> {
        self.sequencer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backend(&self) -> Result<Arc<dyn Backend>> {
        match &*self.link() {
            Link::Open { backend, .. } => Ok(Arc::clone(backend)),
            _ => Err(GcsError::NotConnected),
        }
    }

    fn receiver(&self) -> Result<Receiver<Action>> {
        match &*self.link() {
            Link::Open { actions, .. } => Ok(actions.clone()),
            Link::Created => Err(GcsError::NotConnected),
            Link::Closed => Err(GcsError::ConnectionClosed),
        }
    }

    fn scoped<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.logger {
            Some(logger) => logger.in_scope(f),
            None => f(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("locator", &self.locator)
            .field("state", &self.state())
            .field("pkt_size", &self.pkt_size())
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state() == ConnectionState::Open {
            let _ = self.close();
        }
    }
}

fn validate_pkt_size(pkt_size: usize) -> Result<()> {
    if pkt_size <= FragmentHeader::SIZE {
        return Err(GcsError::InvalidArgument(format!(
            "packet size {pkt_size} must exceed the {}-byte fragment header",
            FragmentHeader::SIZE
        )));
    }
    Ok(())
}

/// Delivery loop: runs until the backend reports it is closed, then hands
/// back the counters for the next session.
fn deliver(mut group: GroupState, backend: &dyn Backend, shared: &Shared, tx: &Sender<Action>) -> Sequencer {

    loop {
        let actions = match backend.recv() {
            Ok(BackendEvent::Message { sender, payload }) => group.handle_message(sender, payload),
            Ok(BackendEvent::Membership(view)) => group.handle_membership(view),
            Ok(BackendEvent::Closed) => break,
            Err(e) => {
                warn!(error = %e, "backend failed, stopping delivery");
                break;
            },
        };

        for action in actions {
            execute(action, backend, shared, tx);
        }
    }

    shared.fail_all();
    debug!("delivery thread stopped");
    group.into_sequencer()
}

fn execute(action: GroupAction, backend: &dyn Backend, shared: &Shared, tx: &Sender<Action>) {
    match action {
        GroupAction::Deliver(action) => {
            let _ = tx.send(action);
        },
        GroupAction::DeliverOwn { act_id, action } => match shared.take(act_id) {
            Some(waiter) => {
                let _ = waiter.send(Ok(Replicated::from_action(&action)));
            },
            None => {
                let _ = tx.send(action);
            },
        },
        GroupAction::DiscardOwn { act_id, error } => match shared.take(act_id) {
            Some(waiter) => {
                let _ = waiter.send(Err(error));
            },
            None => debug!(act_id, error = %error, "own action discarded"),
        },
        GroupAction::Broadcast(msg) => {
            let sent = msg.encode().map_err(GcsError::from).and_then(|payload| {
                shared.transmit(backend, ActionType::Service, shared.next_act_id(), Bytes::from(payload))
            });
            if let Err(e) = sent {
                warn!(error = %e, "service message not sent");
            }
        },
    }
}

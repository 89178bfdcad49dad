//! In-process group hub.
//!
//! Every backend opened against the same hub and channel joins one group.
//! The hub delivers under a single lock, so all members of a component see
//! messages and views in the same order. Tests drive faults through the hub
//! handle: [`MemHub::isolate`] splits a member into its own non-primary
//! component, [`MemHub::heal`] merges it back and [`MemHub::set_link`] makes
//! its sends fail.
//!
//! A component is primary when it holds a strict majority of the channel's
//! members; an isolated member of a one-member channel stays primary.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use gcs_proto::MemberId;
use tracing::debug;

use super::{Backend, BackendError, BackendEvent, Driver, Membership};

/// Driver for `mem://HUB` locators. Hubs are created on first use.
#[derive(Debug, Default)]
pub struct MemDriver {
    hubs: Mutex<HashMap<String, Arc<MemHub>>>,
}

impl MemDriver {
    /// Driver without hubs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub named `name`, created if absent.
    pub fn hub(&self, name: &str) -> Arc<MemHub> {
        let mut hubs = self.hubs.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(hubs.entry(name.to_owned()).or_insert_with(|| Arc::new(MemHub::new())))
    }
}

impl Driver for MemDriver {
    fn open(&self, address: &str, channel: &str) -> Result<Box<dyn Backend>, BackendError> {
        self.hub(address).join(channel)
    }
}

#[derive(Debug)]
struct Port {
    id: MemberId,
    tx: Sender<BackendEvent>,
    isolated: bool,
    link_up: bool,
}

#[derive(Debug, Default)]
struct Channel {
    view_id: u64,
    next_member: u64,
    ports: Vec<Port>,
}

impl Channel {
    fn port_mut(&mut self, member: &str) -> Option<&mut Port> {
        self.ports.iter_mut().find(|p| p.id == member)
    }

    fn main_component(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter().filter(|p| !p.isolated)
    }

    /// Push a fresh view to every member.
    fn announce(&mut self) {
        self.view_id += 1;

        let total = self.ports.len();
        let main: Vec<MemberId> = self.main_component().map(|p| p.id.clone()).collect();
        let primary = 2 * main.len() > total;

        let mut my_idx = 0;
        for port in &self.ports {
            let view = if port.isolated {
                Membership {
                    view_id: self.view_id,
                    primary: total == 1,
                    members: vec![port.id.clone()],
                    my_idx: 0,
                }
            } else {
                let view = Membership {
                    view_id: self.view_id,
                    primary,
                    members: main.clone(),
                    my_idx,
                };
                my_idx += 1;
                view
            };
            let _ = port.tx.send(BackendEvent::Membership(view));
        }

        debug!(view_id = self.view_id, members = total, primary, "hub view change");
    }

    fn broadcast(&self, from: &str, msg: &Bytes) -> Result<(), BackendError> {
        let port = self.ports.iter().find(|p| p.id == from).ok_or(BackendError::Closed)?;
        if !port.link_up {
            return Err(BackendError::LinkDown);
        }

        if port.isolated {
            let _ = port.tx.send(BackendEvent::Message { sender: 0, payload: msg.clone() });
            return Ok(());
        }

        let sender = self.main_component().position(|p| p.id == from).unwrap_or_default();
        for port in self.main_component() {
            let _ = port.tx.send(BackendEvent::Message { sender, payload: msg.clone() });
        }
        Ok(())
    }
}

/// A set of named channels shared by in-process members.
#[derive(Debug, Default)]
pub struct MemHub {
    channels: Mutex<HashMap<String, Channel>>,
}

impl MemHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `channel`, creating it if absent.
    pub fn join(self: &Arc<Self>, channel: &str) -> Result<Box<dyn Backend>, BackendError> {
        if channel.is_empty() {
            return Err(BackendError::Join {
                channel: channel.to_owned(),
                reason: "empty channel name".into(),
            });
        }

        let (tx, rx) = unbounded();
        let id = {
            let mut channels = self.lock();
            let chan = channels.entry(channel.to_owned()).or_default();
            chan.next_member += 1;
            let id = format!("m{}", chan.next_member);
            chan.ports.push(Port { id: id.clone(), tx, isolated: false, link_up: true });
            chan.announce();
            id
        };

        Ok(Box::new(MemBackend {
            hub: Arc::clone(self),
            channel: channel.to_owned(),
            id,
            rx,
            closed: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        }))
    }

    /// Member ids of `channel` in join order.
    pub fn members(&self, channel: &str) -> Vec<MemberId> {
        self.lock()
            .get(channel)
            .map(|c| c.ports.iter().map(|p| p.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Split `member` into its own component. Returns false if unknown or
    /// already isolated.
    pub fn isolate(&self, channel: &str, member: &str) -> bool {
        self.update(channel, member, |port| !std::mem::replace(&mut port.isolated, true))
    }

    /// Merge `member` back into the main component. Returns false if unknown
    /// or not isolated.
    pub fn heal(&self, channel: &str, member: &str) -> bool {
        self.update(channel, member, |port| std::mem::replace(&mut port.isolated, false))
    }

    /// Take `member`'s link up or down; sends over a down link fail. Does not
    /// change membership.
    pub fn set_link(&self, channel: &str, member: &str, up: bool) -> bool {
        let mut channels = self.lock();
        let Some(port) = channels.get_mut(channel).and_then(|c| c.port_mut(member)) else {
            return false;
        };
        port.link_up = up;
        true
    }

    fn update(&self, channel: &str, member: &str, change: impl FnOnce(&mut Port) -> bool) -> bool {
        let mut channels = self.lock();
        let Some(chan) = channels.get_mut(channel) else {
            return false;
        };
        let changed = chan.port_mut(member).is_some_and(change);
        if changed {
            chan.announce();
        }
        changed
    }

    fn broadcast(&self, channel: &str, from: &str, msg: &Bytes) -> Result<(), BackendError> {
        self.lock().get(channel).ok_or(BackendError::Closed)?.broadcast(from, msg)
    }

    fn leave(&self, channel: &str, member: &str) {
        let mut channels = self.lock();
        let Some(chan) = channels.get_mut(channel) else {
            return;
        };
        let Some(pos) = chan.ports.iter().position(|p| p.id == member) else {
            return;
        };

        let port = chan.ports.remove(pos);
        let _ = port.tx.send(BackendEvent::Closed);

        if chan.ports.is_empty() {
            channels.remove(channel);
        } else {
            chan.announce();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct MemBackend {
    hub: Arc<MemHub>,
    channel: String,
    id: MemberId,
    rx: Receiver<BackendEvent>,
    closed: AtomicBool,
    drained: AtomicBool,
}

impl Backend for MemBackend {
    fn send(&self, msg: Bytes) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        self.hub.broadcast(&self.channel, &self.id, &msg)
    }

    fn recv(&self) -> Result<BackendEvent, BackendError> {
        if self.drained.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        match self.rx.recv() {
            Ok(BackendEvent::Closed) => {
                self.drained.store(true, Ordering::Release);
                Ok(BackendEvent::Closed)
            },
            Ok(event) => Ok(event),
            Err(_) => Err(BackendError::Closed),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.hub.leave(&self.channel, &self.id);
        }
    }
}

impl Drop for MemBackend {
    fn drop(&mut self) {
        self.close();
    }
}

//! Loopback driver.
//!
//! A one-member group: every sent message comes straight back to the sender.
//! Useful for single-node deployments and for exercising the action transport
//! without a network. The address part of the locator is ignored.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};

use super::{Backend, BackendError, BackendEvent, Driver, Membership};

/// Member id the loopback backend reports for its only member.
pub const DUMMY_MEMBER: &str = "dummy";

/// Driver for `dummy://` locators.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyDriver;

impl Driver for DummyDriver {
    fn open(&self, _address: &str, channel: &str) -> Result<Box<dyn Backend>, BackendError> {
        if channel.is_empty() {
            return Err(BackendError::Join {
                channel: channel.to_owned(),
                reason: "empty channel name".into(),
            });
        }

        let (tx, rx) = unbounded();
        let view = Membership {
            view_id: 1,
            primary: true,
            members: vec![DUMMY_MEMBER.to_owned()],
            my_idx: 0,
        };
        tx.send(BackendEvent::Membership(view)).map_err(|_| BackendError::Closed)?;

        Ok(Box::new(DummyBackend {
            tx,
            rx,
            closed: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        }))
    }
}

struct DummyBackend {
    tx: Sender<BackendEvent>,
    rx: Receiver<BackendEvent>,
    closed: AtomicBool,
    drained: AtomicBool,
}

impl Backend for DummyBackend {
    fn send(&self, msg: Bytes) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        self.tx
            .send(BackendEvent::Message { sender: 0, payload: msg })
            .map_err(|_| BackendError::Closed)
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
            let _ = self.tx.send(BackendEvent::Closed);
        }
    }
}

//! Total-order monitor.
//!
//! Serializes entry into an application critical section by sequence number:
//! for any N, `grab(N)` returns only after `release(N - 1)`. Waiters live in a
//! fixed ring of `capacity` slots indexed by `seqno % capacity`, which bounds
//! how far ahead of the cursor a ticket may be and makes admission control
//! structural.
//!
//! # Slot states
//!
//! ```text
//!            grab            cursor reaches          release
//!  ┌───────┐ ──────> ┌────────┐ ──────────> ┌─────────┐ ──────> Empty (seqno + L)
//!  │ Empty │         │ Queued │             │ Holding │
//!  └───────┘         └────────┘             └─────────┘
//!     │  │  cancel /     │ │ withdraw
//!     │  │ self_cancel   │ └────────> Withdrawn ──renew──> Empty
//!     │  └───────────────┴──────────> Canceled ──cursor skips──> Empty
//!     └ withdraw ──────────────────> Withdrawn
//! ```
//!
//! Every seqno is consumed exactly once (released, cancelled or
//! self-cancelled) and the cursor never passes a slot that is not consumed.
//!
//! # Locking
//!
//! One mutex per monitor guards the ring; each slot has its own condition
//! variable so a release wakes exactly the next waiter. [`ToMonitor::seqno`]
//! reads an atomic mirror of the cursor and takes no lock.

use std::sync::{
    Condvar, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use gcs_proto::Seqno;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::errno;

/// Monitor errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ToError {
    /// Ticket too far ahead of the cursor or queue full; retry later
    #[error("too many waiters, try again")]
    Again,

    /// Operation out of order for this seqno
    #[error("seqno {seqno} out of range (cursor at {cursor})")]
    Range {
        /// Seqno passed by the caller
        seqno: Seqno,
        /// Monitor cursor at the time of the call
        cursor: Seqno,
    },

    /// Monitor is held or waited on
    #[error("monitor busy")]
    Busy,

    /// Slot was cancelled; the caller must not enter the critical section
    #[error("seqno {0} canceled")]
    Canceled(Seqno),

    /// Slot was withdrawn; renew before grabbing again
    #[error("seqno {0} withdrawn")]
    Withdrawn(Seqno),

    /// Monitor has been destroyed
    #[error("monitor destroyed")]
    Destroyed,

    /// Capacity must be at least one
    #[error("monitor capacity must be positive")]
    InvalidCapacity,
}

impl ToError {
    /// Negative POSIX-style code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Again => -errno::EAGAIN,
            Self::Range { .. } => -errno::ERANGE,
            Self::Busy => -errno::EBUSY,
            Self::Canceled(_) => -errno::ECANCELED,
            Self::Withdrawn(_) => -errno::EINTR,
            Self::Destroyed => -errno::EBADF,
            Self::InvalidCapacity => -errno::EINVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    Queued,
    Holding,
    Canceled,
    SelfCanceled,
    Withdrawn,
}

impl Slot {
    fn is_canceled(self) -> bool {
        matches!(self, Self::Canceled | Self::SelfCanceled)
    }
}

#[derive(Debug)]
struct Ring {
    cursor: Seqno,
    slots: Box<[Slot]>,
    waiters: usize,
    destroyed: bool,
}

/// Ticket-based critical section ordered by sequence number.
#[derive(Debug)]
pub struct ToMonitor {
    ring: Mutex<Ring>,
    conds: Box<[Condvar]>,
    last: AtomicU64,
    capacity: usize,
}

impl ToMonitor {
    /// Create a monitor whose first ticket is `seqno` (normally 1).
    ///
    /// `capacity` bounds both the number of concurrent waiters and how far
    /// ahead of the cursor a ticket may be. It should be no less than the
    /// number of threads competing for the resource.
    pub fn new(capacity: usize, seqno: Seqno) -> Result<Self, ToError> {
        if capacity == 0 {
            return Err(ToError::InvalidCapacity);
        }

        Ok(Self {
            ring: Mutex::new(Ring {
                cursor: seqno,
                slots: vec![Slot::Empty; capacity].into_boxed_slice(),
                waiters: 0,
                destroyed: false,
            }),
            conds: (0..capacity).map(|_| Condvar::new()).collect(),
            last: AtomicU64::new(seqno.saturating_sub(1)),
            capacity,
        })
    }

    /// Block until `seqno` is next, then hold the monitor.
    ///
    /// Fails immediately with [`ToError::Again`] when the ticket is beyond
    /// the ring or the queue is full, [`ToError::Canceled`] when the slot was
    /// cancelled (or already passed), [`ToError::Withdrawn`] when it was
    /// withdrawn. A waiter that is cancelled or withdrawn while blocked wakes
    /// with the same error.
    pub fn grab(&self, seqno: Seqno) -> Result<(), ToError> {
        let mut ring = self.lock()?;

        if seqno < ring.cursor {
            return Err(ToError::Canceled(seqno));
        }
        if self.beyond_window(&ring, seqno) || ring.waiters >= self.capacity {
            return Err(ToError::Again);
        }

        let idx = self.index(seqno);
        match ring.slots[idx] {
            Slot::Empty => {},
            Slot::Canceled | Slot::SelfCanceled => return Err(ToError::Canceled(seqno)),
            Slot::Withdrawn => return Err(ToError::Withdrawn(seqno)),
            Slot::Queued | Slot::Holding => {
                warn!(seqno, "seqno grabbed twice");
                return Err(ToError::Range { seqno, cursor: ring.cursor });
            },
        }

        if seqno == ring.cursor {
            ring.slots[idx] = Slot::Holding;
            return Ok(());
        }

        ring.slots[idx] = Slot::Queued;
        ring.waiters += 1;

        let outcome = loop {
            ring = self.conds[idx].wait(ring).unwrap_or_else(PoisonError::into_inner);

            if seqno < ring.cursor {
                break Err(ToError::Canceled(seqno));
            }
            match ring.slots[idx] {
                Slot::Queued | Slot::Empty if seqno == ring.cursor => {
                    ring.slots[idx] = Slot::Holding;
                    break Ok(());
                },
                // Renewed before this waiter observed the withdrawal.
                Slot::Empty => ring.slots[idx] = Slot::Queued,
                Slot::Queued | Slot::Holding => {},
                Slot::Canceled | Slot::SelfCanceled => break Err(ToError::Canceled(seqno)),
                Slot::Withdrawn => break Err(ToError::Withdrawn(seqno)),
            }
        };

        ring.waiters -= 1;
        outcome
    }

    /// Leave the critical section held at `seqno` and admit the next ticket.
    ///
    /// Releasing anything but the currently held seqno is an application
    /// error reported as [`ToError::Range`]; the monitor is left untouched.
    pub fn release(&self, seqno: Seqno) -> Result<(), ToError> {
        let mut ring = self.lock()?;
        let idx = self.index(seqno);

        if seqno != ring.cursor || ring.slots[idx] != Slot::Holding {
            warn!(seqno, cursor = ring.cursor, "release of a seqno that is not held");
            return Err(ToError::Range { seqno, cursor: ring.cursor });
        }

        ring.slots[idx] = Slot::Empty;
        ring.cursor += 1;
        self.skip_consumed(&mut ring);
        Ok(())
    }

    /// Last consumed seqno.
    ///
    /// Lock-free and therefore conservative: the value is no longer in use
    /// but may already be stale.
    pub fn seqno(&self) -> Seqno {
        self.last.load(Ordering::Acquire)
    }

    /// Cancel the waiter at `seqno`, normally called by the current holder.
    ///
    /// The waiter's pending or future [`Self::grab`] returns
    /// [`ToError::Canceled`]. A ticket at the cursor that nobody holds is
    /// consumed at once, which also covers cancelling an earlier queued
    /// transaction that has just been admitted.
    pub fn cancel(&self, seqno: Seqno) -> Result<(), ToError> {
        self.cancel_as(seqno, Slot::Canceled)
    }

    /// Give up one's own ticket without ever entering the critical section.
    pub fn self_cancel(&self, seqno: Seqno) -> Result<(), ToError> {
        self.cancel_as(seqno, Slot::SelfCanceled)
    }

    /// Step out of the wait queue while keeping the ticket reserved.
    ///
    /// A blocked waiter at `seqno` wakes with [`ToError::Withdrawn`]. The
    /// cursor still stops at a withdrawn ticket until it is cancelled or
    /// renewed, grabbed and released. Call [`Self::renew_wait`] before
    /// grabbing again.
    pub fn withdraw(&self, seqno: Seqno) -> Result<(), ToError> {
        let mut ring = self.lock()?;
        let idx = self.checked_index(&ring, seqno)?;

        match ring.slots[idx] {
            Slot::Withdrawn => Ok(()),
            Slot::Empty => {
                ring.slots[idx] = Slot::Withdrawn;
                Ok(())
            },
            Slot::Queued => {
                ring.slots[idx] = Slot::Withdrawn;
                self.conds[idx].notify_all();
                Ok(())
            },
            Slot::Holding | Slot::Canceled | Slot::SelfCanceled => {
                Err(ToError::Range { seqno, cursor: ring.cursor })
            },
        }
    }

    /// Re-arm a withdrawn ticket so that the next [`Self::grab`] waits again.
    pub fn renew_wait(&self, seqno: Seqno) -> Result<(), ToError> {
        let mut ring = self.lock()?;
        let idx = self.checked_index(&ring, seqno)?;

        match ring.slots[idx] {
            Slot::Withdrawn => {
                ring.slots[idx] = Slot::Empty;
                Ok(())
            },
            Slot::Empty => Ok(()),
            Slot::Queued | Slot::Holding | Slot::Canceled | Slot::SelfCanceled => {
                Err(ToError::Range { seqno, cursor: ring.cursor })
            },
        }
    }

    /// Restart the sequence at `seqno`, e.g. on a new primary configuration.
    ///
    /// Fails with [`ToError::Busy`] while any ticket is held or queued.
    /// Withdrawn and cancelled tickets are forgotten.
    pub fn reset(&self, seqno: Seqno) -> Result<(), ToError> {
        let mut ring = self.lock()?;
        if ring.waiters > 0 || ring.slots.contains(&Slot::Holding) {
            return Err(ToError::Busy);
        }

        ring.slots.fill(Slot::Empty);
        ring.cursor = seqno;
        self.last.store(seqno.saturating_sub(1), Ordering::Release);
        debug!(seqno, "monitor reset");
        Ok(())
    }

    /// Retire the monitor. Every later call fails with
    /// [`ToError::Destroyed`].
    ///
    /// Fails with [`ToError::Busy`] while a ticket is held or waited on.
    pub fn destroy(&self) -> Result<(), ToError> {
        let mut ring = self.lock()?;
        if ring.waiters > 0 || ring.slots.contains(&Slot::Holding) {
            return Err(ToError::Busy);
        }
        ring.destroyed = true;
        Ok(())
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of threads currently blocked in [`Self::grab`].
    pub fn waiters(&self) -> usize {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner).waiters
    }

    fn lock(&self) -> Result<MutexGuard<'_, Ring>, ToError> {
        let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        if ring.destroyed {
            return Err(ToError::Destroyed);
        }
        Ok(ring)
    }

    fn index(&self, seqno: Seqno) -> usize {
        (seqno % self.capacity as u64) as usize
    }

    fn beyond_window(&self, ring: &Ring, seqno: Seqno) -> bool {
        seqno - ring.cursor >= self.capacity as u64
    }

    /// Slot index for an operation on a ticket that must not be consumed yet.
    fn checked_index(&self, ring: &Ring, seqno: Seqno) -> Result<usize, ToError> {
        if seqno < ring.cursor {
            return Err(ToError::Range { seqno, cursor: ring.cursor });
        }
        if self.beyond_window(ring, seqno) {
            return Err(ToError::Again);
        }
        Ok(self.index(seqno))
    }

    fn cancel_as(&self, seqno: Seqno, mark: Slot) -> Result<(), ToError> {
        let mut ring = self.lock()?;
        let idx = self.checked_index(&ring, seqno)?;

        match ring.slots[idx] {
            Slot::Holding => {
                warn!(seqno, "cannot cancel the holder; release instead");
                return Err(ToError::Range { seqno, cursor: ring.cursor });
            },
            slot if slot.is_canceled() => return Ok(()),
            Slot::Queued => self.conds[idx].notify_all(),
            _ => {},
        }

        ring.slots[idx] = mark;
        if seqno == ring.cursor {
            self.skip_consumed(&mut ring);
        }
        Ok(())
    }

    /// Move the cursor over cancelled tickets, publish it and wake the waiter
    /// at the new cursor.
    fn skip_consumed(&self, ring: &mut Ring) {
        loop {
            let idx = self.index(ring.cursor);
            if !ring.slots[idx].is_canceled() {
                break;
            }
            ring.slots[idx] = Slot::Empty;
            ring.cursor += 1;
        }

        self.last.store(ring.cursor - 1, Ordering::Release);

        let idx = self.index(ring.cursor);
        if ring.slots[idx] == Slot::Queued {
            self.conds[idx].notify_all();
        }
    }
}

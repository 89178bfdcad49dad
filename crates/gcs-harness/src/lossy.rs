//! Loss injection.
//!
//! [`LossyDriver`] wraps another driver and drops incoming data fragments
//! with a fixed probability. Service traffic (state exchange, last-applied
//! reports) and membership events always pass, so configurations still form
//! and only application actions are affected. Each opened backend draws from
//! its own seeded RNG, making runs reproducible.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use gcs_core::{Backend, BackendError, BackendEvent, Driver};
use gcs_proto::{ActionType, FragmentHeader};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::trace;

/// Driver that loses a share of the data fragments its backends receive.
pub struct LossyDriver {
    inner: Arc<dyn Driver>,
    rate: f64,
    seed: u64,
    opened: AtomicU64,
}

impl LossyDriver {
    /// Drop each data fragment with probability `rate` (clamped to 0..=1).
    pub fn new(inner: Arc<dyn Driver>, rate: f64, seed: u64) -> Self {
        Self { inner, rate: rate.clamp(0.0, 1.0), seed, opened: AtomicU64::new(0) }
    }
}

impl Driver for LossyDriver {
    fn open(&self, address: &str, channel: &str) -> Result<Box<dyn Backend>, BackendError> {
        let inner = self.inner.open(address, channel)?;
        let n = self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(LossyBackend {
            inner,
            rate: self.rate,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(n))),
            dropped: AtomicU64::new(0),
        }))
    }
}

struct LossyBackend {
    inner: Box<dyn Backend>,
    rate: f64,
    rng: Mutex<ChaCha8Rng>,
    dropped: AtomicU64,
}

impl LossyBackend {
    fn should_drop(&self, payload: &Bytes) -> bool {
        let is_data = FragmentHeader::parse(payload).is_ok_and(|(h, _)| h.act_type() == ActionType::Data);
        is_data && self.rng.lock().unwrap_or_else(PoisonError::into_inner).gen_bool(self.rate)
    }
}

impl Backend for LossyBackend {
    fn send(&self, msg: Bytes) -> Result<(), BackendError> {
        self.inner.send(msg)
    }

    fn recv(&self) -> Result<BackendEvent, BackendError> {
        loop {
            let event = self.inner.recv()?;
            if let BackendEvent::Message { sender, payload } = &event {
                if self.should_drop(payload) {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!(sender, dropped, "fragment lost");
                    continue;
                }
            }
            return Ok(event);
        }
    }

    fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use gcs_core::backend::DummyDriver;
    use gcs_proto::Fragmenter;

    use super::*;

    fn data_fragment() -> Bytes {
        Fragmenter::new(ActionType::Data, 1, Bytes::from_static(b"x"), 1500).unwrap().next().unwrap()
    }

    #[test]
    fn total_loss_drops_every_data_fragment() {
        let driver = LossyDriver::new(Arc::new(DummyDriver), 1.0, 7);
        let backend = driver.open("", "c").unwrap();
        assert!(matches!(backend.recv().unwrap(), BackendEvent::Membership(_)));

        backend.send(data_fragment()).unwrap();
        backend.send(Bytes::from_static(b"not a fragment")).unwrap();

        // Only the non-data message makes it through.
        assert_eq!(
            backend.recv().unwrap(),
            BackendEvent::Message { sender: 0, payload: Bytes::from_static(b"not a fragment") }
        );
    }

    #[test]
    fn zero_loss_is_transparent() {
        let driver = LossyDriver::new(Arc::new(DummyDriver), 0.0, 7);
        let backend = driver.open("", "c").unwrap();
        backend.recv().unwrap();

        let frag = data_fragment();
        backend.send(frag.clone()).unwrap();
        assert_eq!(backend.recv().unwrap(), BackendEvent::Message { sender: 0, payload: frag });
    }
}

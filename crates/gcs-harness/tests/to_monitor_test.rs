//! Total-order monitor under real threads.
//!
//! Model-based: for any arrival order of threads and any set of cancelled
//! tickets, the critical section must be entered in ascending seqno order by
//! exactly the tickets that were not cancelled.

use std::{
    sync::{Arc, Mutex},
    thread,
};

use gcs_core::{Action, ActionType, ToError, ToMonitor};
use gcs_harness::{Cluster, wait_for};
use proptest::prelude::*;

/// Grab, record, release. Retries while the ticket is beyond the ring.
fn enter(to: &ToMonitor, seqno: u64, log: &Mutex<Vec<u64>>) -> Result<(), ToError> {
    loop {
        match to.grab(seqno) {
            Err(ToError::Again) => thread::yield_now(),
            Err(e) => return Err(e),
            Ok(()) => break,
        }
    }
    log.lock().unwrap().push(seqno);
    to.release(seqno)
}

fn arrivals() -> impl Strategy<Value = (Vec<u64>, Vec<bool>)> {
    (1usize..12).prop_flat_map(|n| {
        (
            Just((1..=n as u64).collect::<Vec<_>>()).prop_shuffle(),
            proptest::collection::vec(any::<bool>(), n),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn entry_order_is_seqno_order((order, cancelled) in arrivals()) {
        let n = order.len() as u64;
        let to = ToMonitor::new(16, 1).unwrap();
        let log = Mutex::new(Vec::new());

        let skipped: Vec<u64> = (1..=n).filter(|s| cancelled[(*s - 1) as usize]).collect();
        for seqno in &skipped {
            to.cancel(*seqno).unwrap();
        }

        let outcomes: Vec<(u64, Result<(), ToError>)> = thread::scope(|s| {
            let handles: Vec<_> = order
                .iter()
                .map(|&seqno| {
                    let (to, log) = (&to, &log);
                    (seqno, s.spawn(move || enter(to, seqno, log)))
                })
                .collect();
            handles.into_iter().map(|(seqno, h)| (seqno, h.join().unwrap())).collect()
        });

        let expected: Vec<u64> = (1..=n).filter(|s| !skipped.contains(s)).collect();
        prop_assert_eq!(log.lock().unwrap().clone(), expected);

        for (seqno, outcome) in outcomes {
            if skipped.contains(&seqno) {
                prop_assert_eq!(outcome, Err(ToError::Canceled(seqno)));
            } else {
                prop_assert_eq!(outcome, Ok(()));
            }
        }
        prop_assert_eq!(to.seqno(), n);
    }
}

#[test]
fn more_threads_than_slots_retry_and_stay_ordered() {
    let to = ToMonitor::new(4, 1).unwrap();
    let log = Mutex::new(Vec::new());

    thread::scope(|s| {
        for seqno in (1..=32).rev() {
            let (to, log) = (&to, &log);
            s.spawn(move || enter(to, seqno, log).unwrap());
        }
    });

    assert_eq!(*log.lock().unwrap(), (1..=32).collect::<Vec<_>>());
}

#[test]
fn holder_cancels_a_conflicting_waiter() {
    let to = ToMonitor::new(8, 1).unwrap();
    let log = Mutex::new(Vec::new());

    to.grab(1).unwrap();
    thread::scope(|s| {
        let second = s.spawn(|| enter(&to, 2, &log));
        let third = s.spawn(|| enter(&to, 3, &log));
        while to.waiters() < 2 {
            thread::yield_now();
        }

        // Ticket 2 conflicts with the holder's work.
        to.cancel(2).unwrap();
        assert_eq!(second.join().unwrap(), Err(ToError::Canceled(2)));

        to.release(1).unwrap();
        third.join().unwrap().unwrap();
    });

    assert_eq!(*log.lock().unwrap(), vec![3]);
    assert_eq!(to.seqno(), 3);
}

/// Appliers on a receiving node enter the monitor in the group's global
/// order; commit-cut seqnos are consumed with `self_cancel`.
#[test]
fn appliers_follow_the_replicated_order() {
    const WRITES: usize = 20;
    let cluster = Cluster::start("appliers", 2).unwrap();

    let first = next_global_seqno(&cluster);
    let to = Arc::new(ToMonitor::new(64, first).unwrap());
    let applied = Arc::new(Mutex::new(Vec::new()));

    for k in 0..WRITES {
        cluster.conn(0).send(ActionType::Data, format!("w{k}")).unwrap();
    }

    thread::scope(|s| {
        let mut seen = 0;
        while seen < WRITES {
            let action = wait_for(cluster.conn(1), |a| a.act_type().is_ordered()).unwrap();
            let global = action.global();
            match action {
                Action::Data { payload, .. } => {
                    seen += 1;
                    let (to, applied) = (Arc::clone(&to), Arc::clone(&applied));
                    s.spawn(move || {
                        to.grab(global).unwrap();
                        applied.lock().unwrap().push(payload);
                        to.release(global).unwrap();
                    });
                },
                _ => to.self_cancel(global).unwrap(),
            }
        }
    });

    let applied = applied.lock().unwrap();
    let expected: Vec<_> = (0..WRITES).map(|k| bytes::Bytes::from(format!("w{k}"))).collect();
    assert_eq!(*applied, expected);
    assert_eq!(to.seqno(), first + WRITES as u64 - 1);
}

/// Global seqno the next ordered action will receive.
fn next_global_seqno(cluster: &Cluster) -> u64 {
    cluster.conn(0).send(ActionType::Data, "marker").unwrap();
    let marker = wait_for(cluster.conn(1), |a| matches!(a, Action::Data { .. })).unwrap();
    wait_for(cluster.conn(0), |a| matches!(a, Action::Data { .. })).unwrap();
    marker.global() + 1
}

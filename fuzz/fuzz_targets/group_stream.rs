//! Drive the group state machine with arbitrary backend messages after a
//! primary configuration formed. Global seqnos must stay gapless.

#![no_main]

use bytes::Bytes;
use gcs_core::{
    Action,
    backend::Membership,
    group::{GroupAction, GroupState},
};
use gcs_proto::{ActionType, Fragmenter, ServiceMessage};
use libfuzzer_sys::fuzz_target;

fn loopback(state: &mut GroupState, actions: Vec<GroupAction>) {
    for action in actions {
        if let GroupAction::Broadcast(msg) = action {
            let Ok(payload) = msg.encode() else { return };
            let Ok(frags) = Fragmenter::new(ActionType::Service, 0, Bytes::from(payload), 1500) else {
                return;
            };
            for frag in frags {
                let more = state.handle_message(0, frag);
                loopback(state, more);
            }
        }
    }
}

fuzz_target!(|data: &[u8]| {
    let mut state = GroupState::new();
    let view = Membership { view_id: 1, primary: true, members: vec!["a".into(), "b".into()], my_idx: 0 };
    let actions = state.handle_membership(view);
    loopback(&mut state, actions);

    // Let "b" report too so that the configuration is primary.
    let report = ServiceMessage::StateReport(gcs_proto::StateReport { view_id: 1, last_global: 0, conf_id: -1 });
    if let Ok(payload) = report.encode() {
        if let Ok(frags) = Fragmenter::new(ActionType::Service, 0, Bytes::from(payload), 1500) {
            for frag in frags {
                state.handle_message(1, frag);
            }
        }
    }

    let mut last_global = state.last_global();
    for chunk in data.chunks(64) {
        let sender = usize::from(chunk[0] % 2);
        for action in state.handle_message(sender, Bytes::copy_from_slice(&chunk[1..])) {
            let delivered = match action {
                GroupAction::Deliver(a) | GroupAction::DeliverOwn { action: a, .. } => a,
                _ => continue,
            };
            if matches!(delivered, Action::Data { .. } | Action::CommitCut { .. }) {
                assert_eq!(delivered.global(), last_global + 1);
                last_global = delivered.global();
            }
        }
    }
});

//! Group state machine.
//!
//! Turns the backend's event stream into delivered actions: reassembles
//! fragments, runs the state exchange that establishes a primary
//! configuration, stamps ordered actions with global sequence numbers and
//! computes commit cuts.
//!
//! # Architecture: Action-Based State Machine
//!
//! [`GroupState`] performs no I/O. Each input returns the [`GroupAction`]s the
//! connection runtime must execute, in order. Every member of a component
//! feeds its state machine the same stream, so every member derives the same
//! sequence numbers and configurations.
//!
//! # Configuration lifecycle
//!
//! ```text
//! ┌─────────┐ primary view ┌────────────┐ all reports ┌─────────┐
//! │ Joining │─────────────>│ Exchanging │────────────>│ Primary │
//! └─────────┘              └────────────┘             └─────────┘
//!      │                      ↑      │                     │
//!      │ non-primary view     │      │ non-primary view    │
//!      ↓                      │      ↓                     │
//! ┌────────────┐  primary view│                            │
//! │ NonPrimary │──────────────┘<───────────────────────────┘
//! └────────────┘                   any new view
//! ```
//!
//! Ordered actions received outside `Primary` are discarded; the sender's own
//! discarded actions surface as [`GroupAction::DiscardOwn`].

use std::collections::HashMap;

use bytes::Bytes;
use gcs_proto::{ActionType, ConfRecord, Fragment, MemberId, Seqno, ServiceMessage, StateReport};
use tracing::{debug, info, warn};

use crate::{
    action::Action,
    backend::Membership,
    defrag::{Defragmenter, Reassembled},
    error::GcsError,
    sequencer::Sequencer,
};

/// Work for the connection runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupAction {
    /// Hand an action to the application
    Deliver(Action),

    /// This member's own action came back through the ordered stream
    DeliverOwn {
        /// Sender-local id the action was sent with
        act_id: u64,
        /// Delivered action
        action: Action,
    },

    /// This member's own action will never be delivered
    DiscardOwn {
        /// Sender-local id the action was sent with
        act_id: u64,
        /// Why it was discarded
        error: GcsError,
    },

    /// Send a service message to the group
    Broadcast(ServiceMessage),
}

#[derive(Debug)]
enum Status {
    Joining,
    Exchanging { view_id: u64, reports: HashMap<MemberId, StateReport> },
    Primary,
    NonPrimary,
}

/// Per-connection protocol state.
#[derive(Debug)]
pub struct GroupState {
    view: Option<Membership>,
    status: Status,
    conf_id: i64,
    seq: Sequencer,
    defrag: Defragmenter,
    applied: HashMap<MemberId, Seqno>,
    commit_cut: Seqno,
}

impl GroupState {
    /// State of a member that has not seen any view yet.
    pub fn new() -> Self {
        Self::with_sequencer(Sequencer::new())
    }

    /// State of a member rejoining with the counters of its previous
    /// session. Local seqnos continue where they stopped, and the state
    /// exchange sees the history this member already delivered.
    pub fn with_sequencer(seq: Sequencer) -> Self {
        Self {
            view: None,
            status: Status::Joining,
            conf_id: ConfRecord::NON_PRIMARY_ID,
            seq,
            defrag: Defragmenter::new(),
            applied: HashMap::new(),
            commit_cut: 0,
        }
    }

    /// Apply a new membership view.
    ///
    /// Partial actions of departed members are discarded. A primary view
    /// starts the state exchange; a non-primary view is delivered at once.
    pub fn handle_membership(&mut self, view: Membership) -> Vec<GroupAction> {
        let dropped = self.defrag.retain_senders(&view.members);
        if dropped > 0 {
            debug!(dropped, "discarded partial actions of departed members");
        }

        let actions = if view.primary {
            debug!(view_id = view.view_id, members = view.members.len(), "starting state exchange");
            self.status = Status::Exchanging { view_id: view.view_id, reports: HashMap::new() };
            vec![GroupAction::Broadcast(ServiceMessage::StateReport(StateReport {
                view_id: view.view_id,
                last_global: self.seq.last_global(),
                conf_id: self.conf_id,
            }))]
        } else {
            self.status = Status::NonPrimary;
            let conf = ConfRecord {
                seqno: self.seq.next_global(),
                conf_id: ConfRecord::NON_PRIMARY_ID,
                my_idx: view.my_idx,
                members: view.members.clone(),
                st_required: false,
            };
            info!(view_id = view.view_id, members = conf.memb_num(), "non-primary configuration");
            let local = self.seq.assign_unordered();
            vec![GroupAction::Deliver(Action::NonPrimary { conf, local })]
        };

        self.view = Some(view);
        actions
    }

    /// Feed one backend message from the member at index `sender` of the
    /// current view.
    pub fn handle_message(&mut self, sender: usize, msg: Bytes) -> Vec<GroupAction> {
        let Some(member) = self.view.as_ref().and_then(|v| v.members.get(sender)).cloned() else {
            warn!(sender, "message from a sender outside the current view");
            return Vec::new();
        };

        let frag = match Fragment::decode(msg) {
            Ok(frag) => frag,
            Err(e) => {
                warn!(sender = %member, error = %e, "malformed fragment");
                return vec![self.error(format!("malformed fragment from {member}: {e}"))];
            },
        };

        let own = self.is_own(&member);
        let pushed = self.defrag.push(&member, frag);

        let mut actions = Vec::new();
        if let Some(act_id) = self.defrag.superseded().filter(|_| own) {
            actions.push(GroupAction::DiscardOwn { act_id, error: GcsError::Aborted });
        }

        let done = match pushed {
            Ok(Some(done)) => done,
            Ok(None) => return actions,
            Err(e) => {
                debug!(error = %e, "partial action dropped");
                if own {
                    actions.push(GroupAction::DiscardOwn { act_id: e.act_id(), error: GcsError::Aborted });
                }
                return actions;
            },
        };

        actions.extend(match done.act_type {
            ActionType::Data => self.data(own, done),
            ActionType::Snapshot => {
                let local = self.seq.assign_unordered();
                vec![GroupAction::Deliver(Action::Snapshot { payload: done.payload, local })]
            },
            ActionType::Service => self.service(member, &done.payload),
            other => {
                warn!(act_type = ?other, sender = %member, "action type is not sent over the wire");
                Vec::new()
            },
        });
        actions
    }

    /// Whether ordered actions are currently delivered.
    pub fn is_primary(&self) -> bool {
        matches!(self.status, Status::Primary)
    }

    /// Id of the last primary configuration, -1 if none.
    pub fn conf_id(&self) -> i64 {
        self.conf_id
    }

    /// Last global seqno delivered or agreed.
    pub fn last_global(&self) -> Seqno {
        self.seq.last_global()
    }

    /// Last commit cut delivered in this configuration.
    pub fn commit_cut(&self) -> Seqno {
        self.commit_cut
    }

    /// Give up the counters, for a later [`Self::with_sequencer`].
    pub fn into_sequencer(self) -> Sequencer {
        self.seq
    }

    /// This member's id in the current view.
    pub fn my_id(&self) -> Option<&MemberId> {
        self.view.as_ref().and_then(|v| v.members.get(v.my_idx))
    }

    fn is_own(&self, member: &str) -> bool {
        self.my_id().is_some_and(|me| me == member)
    }

    fn error(&mut self, reason: String) -> GroupAction {
        let local = self.seq.assign_unordered();
        GroupAction::Deliver(Action::Error { reason, local })
    }

    fn data(&mut self, own: bool, done: Reassembled) -> Vec<GroupAction> {
        if !self.is_primary() {
            if own {
                return vec![GroupAction::DiscardOwn { act_id: done.act_id, error: GcsError::NonPrimary }];
            }
            debug!(act_id = done.act_id, "ordered action outside primary configuration dropped");
            return Vec::new();
        }

        let (global, local) = self.seq.assign_ordered();
        let action = Action::Data { payload: done.payload, global, local };
        if own {
            vec![GroupAction::DeliverOwn { act_id: done.act_id, action }]
        } else {
            vec![GroupAction::Deliver(action)]
        }
    }

    fn service(&mut self, member: MemberId, payload: &[u8]) -> Vec<GroupAction> {
        match ServiceMessage::decode(payload) {
            Ok(ServiceMessage::StateReport(report)) => self.state_report(member, report),
            Ok(ServiceMessage::LastApplied { seqno }) => self.last_applied(member, seqno),
            Err(e) => {
                warn!(sender = %member, error = %e, "malformed service message");
                vec![self.error(format!("malformed service message from {member}: {e}"))]
            },
        }
    }

    fn state_report(&mut self, member: MemberId, report: StateReport) -> Vec<GroupAction> {
        let Some(view) = &self.view else {
            return Vec::new();
        };
        let Status::Exchanging { view_id, reports } = &mut self.status else {
            debug!(sender = %member, "state report outside exchange ignored");
            return Vec::new();
        };
        if report.view_id != *view_id {
            debug!(sender = %member, stale = report.view_id, current = *view_id, "stale state report");
            return Vec::new();
        }

        reports.insert(member, report);
        if !view.members.iter().all(|m| reports.contains_key(m)) {
            return Vec::new();
        }

        let group_seqno = reports.values().map(|r| r.last_global).max().unwrap_or_default();
        let conf_id = reports.values().map(|r| r.conf_id).max().unwrap_or(ConfRecord::NON_PRIMARY_ID) + 1;
        let conf = ConfRecord {
            seqno: group_seqno + 1,
            conf_id,
            my_idx: view.my_idx,
            members: view.members.clone(),
            st_required: self.seq.last_global() < group_seqno,
        };

        self.status = Status::Primary;
        self.conf_id = conf_id;
        self.seq.reset_global(group_seqno + 1);
        self.applied.clear();
        self.commit_cut = 0;

        info!(
            conf_id,
            seqno = conf.seqno,
            members = conf.memb_num(),
            st_required = conf.st_required,
            "primary configuration"
        );
        let local = self.seq.assign_unordered();
        vec![GroupAction::Deliver(Action::Primary { conf, local })]
    }

    /// Commit cuts are tracked per configuration: only reports received in
    /// the primary state count, so every member computes the same cut.
    fn last_applied(&mut self, member: MemberId, seqno: Seqno) -> Vec<GroupAction> {
        if !self.is_primary() {
            return Vec::new();
        }
        let Some(view) = &self.view else {
            return Vec::new();
        };

        let entry = self.applied.entry(member).or_default();
        *entry = (*entry).max(seqno);

        let cut = view
            .members
            .iter()
            .map(|m| self.applied.get(m).copied().unwrap_or_default())
            .min()
            .unwrap_or_default();
        if cut <= self.commit_cut {
            return Vec::new();
        }

        self.commit_cut = cut;
        let (global, local) = self.seq.assign_ordered();
        debug!(cut, global, "commit cut advanced");
        vec![GroupAction::Deliver(Action::CommitCut { cut, global, local })]
    }
}

impl Default for GroupState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use gcs_proto::Fragmenter;

    use super::*;

    fn view(view_id: u64, primary: bool, members: &[&str], my_idx: usize) -> Membership {
        Membership {
            view_id,
            primary,
            members: members.iter().map(|m| (*m).to_owned()).collect(),
            my_idx,
        }
    }

    fn wire(act_type: ActionType, act_id: u64, payload: &[u8]) -> Vec<Bytes> {
        Fragmenter::new(act_type, act_id, Bytes::copy_from_slice(payload), 64).unwrap().collect()
    }

    fn service_wire(msg: &ServiceMessage) -> Bytes {
        let payload = Bytes::from(msg.encode().unwrap());
        let mut frags = Fragmenter::new(ActionType::Service, 0, payload, 1500).unwrap();
        frags.next().unwrap()
    }

    fn feed(state: &mut GroupState, sender: usize, frags: Vec<Bytes>) -> Vec<GroupAction> {
        frags.into_iter().flat_map(|f| state.handle_message(sender, f)).collect()
    }

    fn broadcast_of(actions: &[GroupAction]) -> Bytes {
        match actions {
            [GroupAction::Broadcast(msg)] => service_wire(msg),
            other => panic!("expected a single broadcast, got {other:?}"),
        }
    }

    /// Single member reaching primary through its own looped-back report.
    fn primary_alone() -> GroupState {
        let mut state = GroupState::new();
        let report = broadcast_of(&state.handle_membership(view(1, true, &["a"], 0)));
        state.handle_message(0, report);
        assert!(state.is_primary());
        state
    }

    #[test]
    fn lone_member_becomes_primary_after_own_report() {
        let mut state = GroupState::new();
        let actions = state.handle_membership(view(1, true, &["a"], 0));
        assert_eq!(
            actions,
            vec![GroupAction::Broadcast(ServiceMessage::StateReport(StateReport {
                view_id: 1,
                last_global: 0,
                conf_id: -1,
            }))]
        );
        assert!(!state.is_primary());

        let actions = state.handle_message(0, broadcast_of(&actions));
        let [GroupAction::Deliver(Action::Primary { conf, local: 1 })] = actions.as_slice() else {
            panic!("expected primary, got {actions:?}");
        };
        assert_eq!(conf.seqno, 1);
        assert_eq!(conf.conf_id, 0);
        assert_eq!(conf.members, vec!["a".to_owned()]);
        assert!(!conf.st_required);
    }

    #[test]
    fn own_data_is_sequenced_and_tagged() {
        let mut state = primary_alone();
        let payload = vec![7u8; 200];

        let actions = feed(&mut state, 0, wire(ActionType::Data, 9, &payload));
        assert_eq!(
            actions,
            vec![GroupAction::DeliverOwn {
                act_id: 9,
                action: Action::Data { payload: Bytes::from(payload), global: 1, local: 2 },
            }]
        );
        assert_eq!(state.last_global(), 1);
    }

    #[test]
    fn data_during_exchange_is_discarded() {
        let mut state = GroupState::new();
        state.handle_membership(view(1, true, &["a", "b"], 0));

        let own = feed(&mut state, 0, wire(ActionType::Data, 3, b"x"));
        assert_eq!(own, vec![GroupAction::DiscardOwn { act_id: 3, error: GcsError::NonPrimary }]);

        let other = feed(&mut state, 1, wire(ActionType::Data, 3, b"x"));
        assert!(other.is_empty());
    }

    #[test]
    fn non_primary_view_is_delivered_immediately() {
        let mut state = primary_alone();
        let actions = state.handle_membership(view(2, false, &["a"], 0));

        let [GroupAction::Deliver(Action::NonPrimary { conf, .. })] = actions.as_slice() else {
            panic!("expected non-primary, got {actions:?}");
        };
        assert_eq!(conf.conf_id, ConfRecord::NON_PRIMARY_ID);
        assert!(!conf.is_primary());
        assert!(!state.is_primary());
        assert_eq!(state.conf_id(), 0);
    }

    #[test]
    fn snapshot_is_unordered() {
        let mut state = primary_alone();
        let actions = feed(&mut state, 0, wire(ActionType::Snapshot, 1, b"state please"));
        let [GroupAction::Deliver(action)] = actions.as_slice() else {
            panic!("expected delivery, got {actions:?}");
        };
        assert_eq!(action.act_type(), ActionType::Snapshot);
        assert_eq!(action.global(), gcs_proto::SEQNO_ILL);
        assert_eq!(state.last_global(), 0);
    }

    #[test]
    fn joiner_behind_the_group_requires_state_transfer() {
        let mut a = primary_alone();
        for id in 0..3 {
            feed(&mut a, 0, wire(ActionType::Data, id, b"history"));
        }
        assert_eq!(a.last_global(), 3);

        let mut b = GroupState::new();
        let report_a = broadcast_of(&a.handle_membership(view(2, true, &["a", "b"], 0)));
        let report_b = broadcast_of(&b.handle_membership(view(2, true, &["a", "b"], 1)));

        let mut confs = Vec::new();
        for state in [&mut a, &mut b] {
            let mut actions = state.handle_message(0, report_a.clone());
            actions.extend(state.handle_message(1, report_b.clone()));
            let [GroupAction::Deliver(Action::Primary { conf, .. })] = actions.as_slice() else {
                panic!("expected primary, got {actions:?}");
            };
            confs.push(conf.clone());
        }

        assert_eq!((confs[0].seqno, confs[1].seqno), (4, 4));
        assert_eq!((confs[0].conf_id, confs[1].conf_id), (1, 1));
        assert!(!confs[0].st_required);
        assert!(confs[1].st_required);
        assert_eq!(b.last_global(), 3);
    }

    #[test]
    fn stale_reports_are_ignored() {
        let mut state = GroupState::new();
        state.handle_membership(view(5, true, &["a"], 0));

        let stale = ServiceMessage::StateReport(StateReport { view_id: 4, last_global: 0, conf_id: -1 });
        assert!(state.handle_message(0, service_wire(&stale)).is_empty());
        assert!(!state.is_primary());
    }

    #[test]
    fn commit_cut_follows_slowest_member() {
        let members = ["a", "b"];
        let mut a = GroupState::new();
        let mut b = GroupState::new();
        let ra = broadcast_of(&a.handle_membership(view(1, true, &members, 0)));
        let rb = broadcast_of(&b.handle_membership(view(1, true, &members, 1)));
        for state in [&mut a, &mut b] {
            state.handle_message(0, ra.clone());
            state.handle_message(1, rb.clone());
            assert!(state.is_primary());
        }

        let applied_a = service_wire(&ServiceMessage::LastApplied { seqno: 5 });
        let applied_b = service_wire(&ServiceMessage::LastApplied { seqno: 3 });

        for state in [&mut a, &mut b] {
            assert!(state.handle_message(0, applied_a.clone()).is_empty());
            let actions = state.handle_message(1, applied_b.clone());
            assert_eq!(
                actions,
                vec![GroupAction::Deliver(Action::CommitCut { cut: 3, global: 1, local: 2 })]
            );
            assert_eq!(state.commit_cut(), 3);

            // No progress, no action.
            assert!(state.handle_message(1, applied_b.clone()).is_empty());
        }
    }

    #[test]
    fn garbage_becomes_an_error_action() {
        let mut state = primary_alone();
        let actions = state.handle_message(0, Bytes::from_static(b"definitely not a fragment"));
        let [GroupAction::Deliver(Action::Error { .. })] = actions.as_slice() else {
            panic!("expected error action, got {actions:?}");
        };
    }

    #[test]
    fn unknown_sender_index_is_dropped() {
        let mut state = primary_alone();
        assert!(feed(&mut state, 4, wire(ActionType::Data, 1, b"x")).is_empty());
    }

    #[test]
    fn own_action_missing_its_tail_is_aborted_by_the_next() {
        let mut state = primary_alone();
        let mut first = wire(ActionType::Data, 4, &[1u8; 300]);
        first.pop();

        assert!(feed(&mut state, 0, first).is_empty());
        let actions = feed(&mut state, 0, wire(ActionType::Data, 5, b"next"));
        assert_eq!(
            actions,
            vec![
                GroupAction::DiscardOwn { act_id: 4, error: GcsError::Aborted },
                GroupAction::DeliverOwn {
                    act_id: 5,
                    action: Action::Data { payload: Bytes::from_static(b"next"), global: 1, local: 2 },
                },
            ]
        );
    }

    #[test]
    fn rejoin_keeps_local_seqnos_and_history() {
        let mut state = primary_alone();
        feed(&mut state, 0, wire(ActionType::Data, 1, b"before"));
        let seq = state.into_sequencer();
        assert_eq!((seq.last_global(), seq.last_local()), (1, 2));

        let mut state = GroupState::with_sequencer(seq);
        let report = broadcast_of(&state.handle_membership(view(1, true, &["a"], 0)));
        let actions = state.handle_message(0, report);
        let [GroupAction::Deliver(Action::Primary { conf, local })] = actions.as_slice() else {
            panic!("expected primary, got {actions:?}");
        };
        assert_eq!(*local, 3);
        assert_eq!(conf.seqno, 2);
        assert!(!conf.st_required);
    }
}

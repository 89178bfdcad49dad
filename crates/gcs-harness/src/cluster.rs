//! In-process cluster.
//!
//! A [`Cluster`] is a set of [`Connection`]s joined to one channel of a
//! private `mem` hub. Nodes are addressed by their join index; the hub's
//! fault controls are exposed per node.

use std::{sync::Arc, time::Duration};

use gcs_core::{
    Action, BackendRegistry, ConfRecord, ConnConfig, Connection, Driver, MemberId,
    backend::{MemDriver, MemHub},
};
use tracing::debug;

use crate::lossy::LossyDriver;

/// How long helpers wait for an expected action before giving up.
pub const WAIT: Duration = Duration::from_secs(10);

const HUB: &str = "cluster";

/// A joined node.
#[derive(Debug)]
pub struct Node {
    /// The node's connection
    pub conn: Connection,
    /// The node's member id on the hub
    pub member: MemberId,
}

/// In-process group of connections.
pub struct Cluster {
    mem: Arc<MemDriver>,
    channel: String,
    pkt_size: usize,
    nodes: Vec<Node>,
}

impl Cluster {
    /// Empty cluster on `channel`.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            mem: Arc::new(MemDriver::new()),
            channel: channel.into(),
            pkt_size: ConnConfig::default().pkt_size,
            nodes: Vec::new(),
        }
    }

    /// Packet size for nodes joined from now on.
    pub fn with_pkt_size(mut self, pkt_size: usize) -> Self {
        self.pkt_size = pkt_size;
        self
    }

    /// Cluster of `n` nodes that all reached the same primary configuration.
    pub fn start(channel: impl Into<String>, n: usize) -> Result<Self, String> {
        let mut cluster = Self::new(channel);
        for _ in 0..n {
            cluster.join()?;
        }
        cluster.settle()?;
        Ok(cluster)
    }

    /// Join a new node. Returns its index.
    pub fn join(&mut self) -> Result<usize, String> {
        self.join_via(Arc::clone(&self.mem) as Arc<dyn Driver>)
    }

    /// Join a node that loses `rate` of incoming data fragments.
    pub fn join_lossy(&mut self, rate: f64, seed: u64) -> Result<usize, String> {
        let inner = Arc::clone(&self.mem) as Arc<dyn Driver>;
        self.join_via(Arc::new(LossyDriver::new(inner, rate, seed)))
    }

    fn join_via(&mut self, driver: Arc<dyn Driver>) -> Result<usize, String> {
        let registry = BackendRegistry::new();
        registry.register("node", driver);

        let config = ConnConfig { pkt_size: self.pkt_size, ..ConnConfig::default() };
        let conn = Connection::create_with(&format!("node://{HUB}"), config, &registry)
            .map_err(|e| format!("create: {e}"))?;
        conn.open(&self.channel).map_err(|e| format!("open: {e}"))?;

        let member = self
            .hub()
            .members(&self.channel)
            .pop()
            .ok_or_else(|| "joined member missing from hub".to_owned())?;
        debug!(%member, index = self.nodes.len(), "node joined");

        self.nodes.push(Node { conn, member });
        Ok(self.nodes.len() - 1)
    }

    /// Wait until every node delivered a primary configuration with all
    /// current members. Returns the configurations in node order.
    pub fn settle(&self) -> Result<Vec<ConfRecord>, String> {
        self.nodes.iter().map(|node| wait_primary(&node.conn, self.nodes.len())).collect()
    }

    /// Connection of node `i`.
    pub fn conn(&self, i: usize) -> &Connection {
        &self.nodes[i].conn
    }

    /// Member id of node `i`.
    pub fn member(&self, i: usize) -> &str {
        &self.nodes[i].member
    }

    /// All nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The underlying hub.
    pub fn hub(&self) -> Arc<MemHub> {
        self.mem.hub(HUB)
    }

    /// Split node `i` into its own component.
    pub fn isolate(&self, i: usize) -> bool {
        self.hub().isolate(&self.channel, self.member(i))
    }

    /// Merge node `i` back.
    pub fn heal(&self, i: usize) -> bool {
        self.hub().heal(&self.channel, self.member(i))
    }

    /// Take node `i`'s link up or down.
    pub fn set_link(&self, i: usize, up: bool) -> bool {
        self.hub().set_link(&self.channel, self.member(i), up)
    }
}

/// Next action on `conn`, or an error after [`WAIT`].
pub fn next_action(conn: &Connection) -> Result<Action, String> {
    conn.recv_timeout(WAIT)
        .map_err(|e| format!("recv: {e}"))?
        .ok_or_else(|| format!("no action within {WAIT:?}"))
}

/// Skip actions until one matches `want`.
pub fn wait_for(conn: &Connection, want: impl Fn(&Action) -> bool) -> Result<Action, String> {
    loop {
        let action = next_action(conn)?;
        if want(&action) {
            return Ok(action);
        }
    }
}

/// Wait for a primary configuration of `members` members.
pub fn wait_primary(conn: &Connection, members: usize) -> Result<ConfRecord, String> {
    let action = wait_for(conn, |a| matches!(a, Action::Primary { conf, .. } if conf.memb_num() == members))?;
    action.conf().cloned().ok_or_else(|| "primary without configuration".to_owned())
}

/// Wait for a non-primary configuration.
pub fn wait_non_primary(conn: &Connection) -> Result<ConfRecord, String> {
    let action = wait_for(conn, |a| matches!(a, Action::NonPrimary { .. }))?;
    action.conf().cloned().ok_or_else(|| "non-primary without configuration".to_owned())
}

/// Collect the next `n` data actions, skipping everything else.
pub fn recv_data(conn: &Connection, n: usize) -> Result<Vec<Action>, String> {
    (0..n).map(|_| wait_for(conn, |a| matches!(a, Action::Data { .. }))).collect()
}

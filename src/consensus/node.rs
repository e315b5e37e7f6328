//! The consensus actor and the handle the rest of the node talks to.
//!
//! One task owns the raft group, the durable stores and the state
//! machine write path. Everything reaches it through channels: raft
//! messages from peers, proposals from the public surface, and a watch
//! channel carries role/leader/configuration back out. Apply is strictly
//! sequential in log order; a fatal error stops the actor rather than
//! letting the replica diverge.

use std::collections::VecDeque;

use log::{error, info, warn};
use protobuf::Message as PbMessage;
use raft::{prelude::*, StateRole, Storage};
use serde_derive::{Deserialize, Serialize};
use slog::{o, Drain};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::config::{raft_ord, RuntimeConfig};
use crate::consensus::observer::{self, ObserverChannels, Observers};
use crate::consensus::proposal::{ApplyResult, Proposal};
use crate::consensus::storage::{LogStore, SnapshotStore};
use crate::consensus::StateMachine;
use crate::error::NodeError;
use crate::metrics;

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const LOGGER_CHANNEL_SIZE: usize = 4096;
const MESSAGE_CHANNEL_SIZE: usize = 1000;
const PROPOSAL_CHANNEL_SIZE: usize = 256;
const OBSERVER_CHANNEL_SIZE: usize = 64;

/// Identity a joining voter ships inside its conf-change entry, so every
/// replica learns the name behind the numeric raft id.
#[derive(Debug, Serialize, Deserialize)]
struct PeerContext {
    id: String,
}

/// Engine state as observed from outside the actor.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterStatus {
    pub role: StateRole,
    /// Leader's node name, `None` while the cluster has no leader.
    pub leader: Option<String>,
    pub term: u64,
    /// Current voters as `(raft id, node name)`.
    pub servers: Vec<(u64, String)>,
}

impl Default for ClusterStatus {
    fn default() -> Self {
        ClusterStatus {
            role: StateRole::Follower,
            leader: None,
            term: 0,
            servers: Vec::new(),
        }
    }
}

/// Cheap handle onto the consensus actor.
#[derive(Clone)]
pub struct ConsensusHandle {
    proposals: mpsc::Sender<Proposal>,
    status: watch::Receiver<ClusterStatus>,
    timeout: Duration,
}

impl ConsensusHandle {
    /// Replicates a command and resolves with the state machine's apply
    /// result. Fails with `NotLeader` on a non-leader.
    pub async fn apply(&self, payload: Vec<u8>) -> Result<(), NodeError> {
        let (proposal, rx) = Proposal::command(payload);
        self.submit(proposal, rx).await
    }

    /// Leader-only membership change: adds `name` as a voter.
    pub async fn add_voter(&self, ord: u64, name: &str) -> Result<(), NodeError> {
        let mut cc = ConfChange::default();
        cc.node_id = ord;
        cc.set_change_type(ConfChangeType::AddNode);
        let context = serde_json::to_vec(&PeerContext {
            id: name.to_string(),
        })
        .map_err(|e| NodeError::fatal("couldn't encode conf change context", e))?;
        cc.set_context(context.into());
        let (proposal, rx) = Proposal::conf_change(cc);
        self.submit(proposal, rx).await
    }

    async fn submit(
        &self,
        proposal: Proposal,
        rx: oneshot::Receiver<ApplyResult>,
    ) -> Result<(), NodeError> {
        self.proposals
            .send(proposal)
            .await
            .map_err(|_| NodeError::Fatal("consensus engine is gone".to_string()))?;
        match tokio::time::timeout(self.timeout, rx).await {
            // A timed-out apply is not a rollback; the entry may still
            // commit behind the caller's back.
            Err(_) => Err(NodeError::Transient(
                "apply timed out; the entry may still commit".to_string(),
            )),
            Ok(Err(_)) => Err(NodeError::Fatal("consensus engine is gone".to_string())),
            Ok(Ok(result)) => result,
        }
    }

    pub fn status(&self) -> ClusterStatus {
        self.status.borrow().clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<ClusterStatus> {
        self.status.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().role == StateRole::Leader
    }

    pub fn leader_name(&self) -> Option<String> {
        self.status.borrow().leader.clone()
    }
}

/// Everything `start` hands back to the supervisor.
pub struct ConsensusParts {
    pub handle: ConsensusHandle,
    pub observers: ObserverChannels,
    /// Raft messages the actor wants delivered to peers.
    pub outbound: mpsc::Receiver<Message>,
    /// Feed for raft messages arriving from peers.
    pub inbound: mpsc::Sender<Message>,
    pub actor: JoinHandle<()>,
}

struct Pending {
    index: u64,
    term: u64,
    proposal: Proposal,
}

struct Node<S: StateMachine> {
    raft_group: RawNode<LogStore>,
    state_machine: S,
    snapshots: SnapshotStore,
    my_mailbox: mpsc::Receiver<Message>,
    out_mailbox: mpsc::Sender<Message>,
    proposals: mpsc::Receiver<Proposal>,
    pending: VecDeque<Pending>,
    status_tx: watch::Sender<ClusterStatus>,
    observers: Observers,
    last_role: StateRole,
    last_leader: Option<String>,
    snapshot_interval: Duration,
    snapshot_threshold: u64,
    last_snapshot_at: Instant,
    last_snapshot_index: u64,
}

/// Builds the raft group over the given stores and spawns the actor.
pub fn start<S: StateMachine>(
    cfg: &RuntimeConfig,
    store: LogStore,
    snapshots: SnapshotStore,
    state_machine: S,
    applied: u64,
) -> Result<ConsensusParts, NodeError> {
    let id = raft_ord(&cfg.id)?;

    // The raft crate wants an slog logger; application logging stays on
    // the log facade.
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    let logger = slog::Logger::root(drain, o!("node" => cfg.id.clone()));

    let raft_state = store
        .initial_state()
        .map_err(|e| NodeError::fatal("couldn't read initial state", e))?;
    let first = store
        .first_index()
        .map_err(|e| NodeError::fatal("couldn't read log store", e))?;
    let snapshot_base = first.saturating_sub(1);
    let applied = applied
        .min(raft_state.hard_state.commit)
        .max(snapshot_base);

    let raft_cfg = Config {
        id,
        election_tick: cfg.consensus.election_tick,
        heartbeat_tick: cfg.consensus.heartbeat_tick,
        applied,
        ..Default::default()
    };
    let raft_group = RawNode::new(&raft_cfg, store, &logger)
        .map_err(|e| NodeError::fatal("couldn't create consensus group", e))?;

    let (proposal_tx, proposal_rx) = mpsc::channel(PROPOSAL_CHANNEL_SIZE);
    let (out_tx, out_rx) = mpsc::channel(MESSAGE_CHANNEL_SIZE);
    let (in_tx, in_rx) = mpsc::channel(MESSAGE_CHANNEL_SIZE);
    let (observers, channels) = observer::channel(OBSERVER_CHANNEL_SIZE);
    let (status_tx, status_rx) = watch::channel(ClusterStatus::default());

    let node = Node {
        raft_group,
        state_machine,
        snapshots,
        my_mailbox: in_rx,
        out_mailbox: out_tx,
        proposals: proposal_rx,
        pending: VecDeque::new(),
        status_tx,
        observers,
        last_role: StateRole::Follower,
        last_leader: None,
        snapshot_interval: cfg.snapshot_interval(),
        snapshot_threshold: cfg.consensus.snapshot_threshold,
        last_snapshot_at: Instant::now(),
        last_snapshot_index: snapshot_base,
    };
    let actor = tokio::spawn(node.run());

    Ok(ConsensusParts {
        handle: ConsensusHandle {
            proposals: proposal_tx,
            status: status_rx,
            timeout: cfg.rpc_timeout(),
        },
        observers: channels,
        outbound: out_rx,
        inbound: in_tx,
        actor,
    })
}

impl<S: StateMachine> Node<S> {
    async fn run(mut self) {
        if let Err(e) = self.drive().await {
            error!("consensus actor aborting: {e}");
        }
        Self::fail_pending(&mut self.pending);
    }

    async fn drive(&mut self) -> Result<(), NodeError> {
        let mut last_tick = Instant::now();
        loop {
            tokio::select! {
                maybe_msg = self.my_mailbox.recv() => match maybe_msg {
                    Some(msg) => {
                        let _ = self.raft_group.step(msg);
                        while let Ok(msg) = self.my_mailbox.try_recv() {
                            let _ = self.raft_group.step(msg);
                        }
                    }
                    None => break,
                },
                maybe_proposal = self.proposals.recv() => match maybe_proposal {
                    Some(proposal) => {
                        self.propose(proposal);
                        while let Ok(proposal) = self.proposals.try_recv() {
                            self.propose(proposal);
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep(Duration::from_millis(1)) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.raft_group.tick();
                last_tick = Instant::now();
            }

            if let Err(e) = self.maybe_snapshot() {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("skipping snapshot: {e}");
            }

            self.on_ready()?;
            self.publish_status();
        }
        Ok(())
    }

    fn propose(&mut self, mut proposal: Proposal) {
        if self.raft_group.raft.state != StateRole::Leader {
            proposal.finish(Err(NodeError::NotLeader));
            metrics::PROPOSAL_COUNTER_VEC
                .with_label_values(&["rejected"])
                .inc();
            return;
        }

        let index = self.raft_group.raft.raft_log.last_index() + 1;
        let term = self.raft_group.raft.term;
        let accepted = if let Some(data) = proposal.command.take() {
            self.raft_group.propose(vec![], data).is_ok()
        } else if let Some(cc) = proposal.conf_change.take() {
            self.raft_group.propose_conf_change(vec![], cc).is_ok()
        } else {
            false
        };

        if !accepted || self.raft_group.raft.raft_log.last_index() + 1 == index {
            proposal.finish(Err(NodeError::Transient(
                "proposal was not accepted into the log".to_string(),
            )));
            metrics::PROPOSAL_COUNTER_VEC
                .with_label_values(&["dropped"])
                .inc();
            return;
        }

        proposal.proposed = index;
        metrics::PROPOSAL_COUNTER_VEC
            .with_label_values(&["accepted"])
            .inc();
        self.pending.push_back(Pending {
            index,
            term,
            proposal,
        });
    }

    fn on_ready(&mut self) -> Result<(), NodeError> {
        if !self.raft_group.has_ready() {
            return Ok(());
        }
        let mut ready = self.raft_group.ready();

        if !ready.messages().is_empty() {
            Self::send_messages(&self.out_mailbox, &ready.take_messages());
        }

        if *ready.snapshot() != Snapshot::default() {
            let snapshot = ready.snapshot().clone();
            let meta = snapshot.get_metadata().clone();
            {
                let store = &mut self.raft_group.raft.raft_log.store;
                store.install_snapshot(&snapshot)?;
            }
            self.snapshots.save(&snapshot)?;
            self.state_machine
                .restore(meta.index, meta.term, snapshot.get_data())?;
            self.last_snapshot_index = meta.index;
            info!("installed snapshot at index {} term {}", meta.index, meta.term);
        }

        // Entries and term/vote hit disk before anything is acknowledged
        // or applied.
        {
            let store = &mut self.raft_group.raft.raft_log.store;
            store.append(ready.entries())?;
            if let Some(hs) = ready.hs() {
                store.set_hard_state(hs)?;
            }
        }

        if !ready.persisted_messages().is_empty() {
            Self::send_messages(&self.out_mailbox, &ready.take_persisted_messages());
        }

        let committed = ready.take_committed_entries();
        Self::handle_committed(
            &mut self.raft_group,
            committed,
            &mut self.state_machine,
            &mut self.pending,
        )?;

        let mut light_rd = self.raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.raft_group.raft.raft_log.store.set_commit(commit);
        }
        Self::send_messages(&self.out_mailbox, light_rd.messages());
        let committed = light_rd.take_committed_entries();
        Self::handle_committed(
            &mut self.raft_group,
            committed,
            &mut self.state_machine,
            &mut self.pending,
        )?;
        self.raft_group.advance_apply();
        Ok(())
    }

    /// Applies committed entries in log order and routes each result to
    /// its local waiter, if any.
    fn handle_committed(
        raft_group: &mut RawNode<LogStore>,
        entries: Vec<Entry>,
        state_machine: &mut S,
        pending: &mut VecDeque<Pending>,
    ) -> Result<(), NodeError> {
        for entry in entries {
            if entry.data.is_empty() {
                // Term-start no-op from a fresh leader.
                continue;
            }

            let result = match entry.get_entry_type() {
                EntryType::EntryConfChange => {
                    let mut cc = ConfChange::default();
                    cc.merge_from_bytes(&entry.data)
                        .map_err(|e| NodeError::fatal("couldn't decode conf change", e))?;
                    let name = if cc.context.is_empty() {
                        None
                    } else {
                        let ctx: PeerContext = serde_json::from_slice(&cc.context).map_err(
                            |e| NodeError::fatal("couldn't decode conf change context", e),
                        )?;
                        Some(ctx.id)
                    };
                    match raft_group.apply_conf_change(&cc) {
                        Ok(cs) => {
                            let store = &mut raft_group.raft.raft_log.store;
                            if let Some(name) = &name {
                                store.register_peer(cc.node_id, name)?;
                                info!("voter {name} joined the configuration");
                            }
                            store.set_conf_state(cs)?;
                            metrics::APPLIED_COUNTER_VEC
                                .with_label_values(&["conf_change"])
                                .inc();
                            Ok(())
                        }
                        Err(e) => Err(NodeError::transient("conf change rejected", e)),
                    }
                }
                EntryType::EntryConfChangeV2 => {
                    return Err(NodeError::Fatal(
                        "unexpected v2 conf change in the log".to_string(),
                    ));
                }
                EntryType::EntryNormal => {
                    let started = std::time::Instant::now();
                    match state_machine.apply(entry.index, &entry.data) {
                        Ok(()) => {
                            metrics::APPLIED_COUNTER_VEC
                                .with_label_values(&["command"])
                                .inc();
                            metrics::APPLY_HISTOGRAM_VEC
                                .with_label_values(&["command"])
                                .observe(started.elapsed().as_secs_f64());
                            Ok(())
                        }
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => Err(e),
                    }
                }
            };

            Self::resolve_pending(pending, entry.index, entry.term, result);
        }
        Ok(())
    }

    /// Matches an applied entry against the oldest in-flight proposals.
    /// A slot taken by another leader's entry means ours was dropped.
    fn resolve_pending(
        pending: &mut VecDeque<Pending>,
        index: u64,
        term: u64,
        result: ApplyResult,
    ) {
        let mut result = Some(result);
        while let Some(front) = pending.front() {
            if front.index > index {
                return;
            }
            let mut p = pending.pop_front().expect("front exists");
            if p.index == index && p.term == term {
                p.proposal.finish(result.take().unwrap_or(Ok(())));
                return;
            }
            let matched = p.index == index;
            p.proposal.finish(Err(NodeError::NotLeader));
            if matched {
                return;
            }
        }
    }

    /// Demotion or shutdown orphans the in-flight proposals. The entries
    /// may still commit; callers see the rejection and retry against the
    /// current leader.
    fn fail_pending(pending: &mut VecDeque<Pending>) {
        for mut p in pending.drain(..) {
            p.proposal.finish(Err(NodeError::NotLeader));
        }
    }

    fn send_messages(sender: &mpsc::Sender<Message>, messages: &[Message]) {
        for msg in messages {
            if let Err(e) = sender.try_send(msg.clone()) {
                warn!("couldn't queue raft message, raft will retry: {e}");
            }
        }
    }

    /// Takes a snapshot once the interval elapsed and enough entries were
    /// applied since the previous one.
    fn maybe_snapshot(&mut self) -> Result<(), NodeError> {
        if self.last_snapshot_at.elapsed() < self.snapshot_interval {
            return Ok(());
        }
        let applied = self.raft_group.raft.raft_log.applied();
        if applied < self.last_snapshot_index + self.snapshot_threshold {
            return Ok(());
        }

        let data = self.state_machine.snapshot()?;
        let snapshot = {
            let store = &mut self.raft_group.raft.raft_log.store;
            store.build_snapshot(applied, data)?
        };
        self.snapshots.save(&snapshot)?;
        self.raft_group.raft.raft_log.store.compact(applied)?;
        self.last_snapshot_at = Instant::now();
        self.last_snapshot_index = applied;
        info!("saved snapshot at index {applied}");
        Ok(())
    }

    fn publish_status(&mut self) {
        let (role, leader_ord, term) = {
            let raft = &self.raft_group.raft;
            (raft.state, raft.leader_id, raft.term)
        };
        let (leader, servers) = {
            let store = &self.raft_group.raft.raft_log.store;
            let leader = if leader_ord == 0 {
                None
            } else {
                Some(
                    store
                        .peer_name(leader_ord)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("node{leader_ord}")),
                )
            };
            (leader, store.servers())
        };

        if role != self.last_role {
            self.observers.role_changed(role);
            if self.last_role == StateRole::Leader {
                Self::fail_pending(&mut self.pending);
            }
            self.last_role = role;
        }
        if leader != self.last_leader {
            self.observers.leader_changed(leader.clone());
            self.last_leader = leader.clone();
        }

        let status = ClusterStatus {
            role,
            leader,
            term,
            servers,
        };
        if status != *self.status_tx.borrow() {
            let _ = self.status_tx.send_replace(status);
        }
    }
}

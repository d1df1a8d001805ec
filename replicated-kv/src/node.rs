//! Consensus engine.
//!
//! [`RaftNode`] owns one node's role, term, vote and log, and reacts to
//! inbound messages and timeouts. It never touches the network: every
//! reaction is queued as an [`Outbound`] that the runtime drains with
//! [`RaftNode::take_outbound`] and hands to a transport. That keeps the
//! engine single-threaded and lets tests drive a whole cluster by hand.
//!
//! # Timing
//!
//! A single configured timeout drives everything. A leader sends
//! AppendEntries every `timeout / 2`; a follower or candidate that hears
//! nothing for `timeout` (plus optional jitter) starts an election.
//!
//! # Indexes
//!
//! Log positions are 0-based. The commit point is kept as a length: the
//! number of entries committed, so an empty committed prefix is `0`.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::mem;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::command::{Command, LogEntry, Operation};
use crate::config::{ClusterConfig, NodeConfig};
use crate::error::{Error, Result};
use crate::log::{KEY_MISSING, PendingRequest, ReplicatedLog};
use crate::message::{
    Address, AppendEntriesRequest, AppendEntriesResult, ClientRequest, ClientResponse, Envelope,
    Message, NodeId, Outbound, VoteRequest, VoteResponse,
};
use crate::state::{HardState, StateFile};
use crate::store::KvStore;

pub const NO_LEADER: &str = "no known leader";
pub const MALFORMED_REQUEST: &str = "malformed request";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Leader's view of one peer. Both fields are lengths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Progress {
    next: usize,
    matched: usize,
}

pub struct RaftNode {
    id: NodeId,
    cluster: ClusterConfig,
    role: Role,
    hard: HardState,
    state_file: StateFile,
    leader: Option<NodeId>,
    votes: BTreeSet<NodeId>,
    progress: Vec<Progress>,
    log: ReplicatedLog,
    last_activity: Instant,
    election_jitter: Duration,
    jitter: Duration,
    outbox: Vec<Outbound>,
}

impl RaftNode {
    /// Restores a node from its data directory.
    ///
    /// The durable log is replayed and the saved term/vote reloaded. A
    /// node that has never written a state file is fresh; if it is node 0
    /// and `bootstrap_leader` is set it starts as leader of term 0 without
    /// an election. Every other node, and every restart, begins as a
    /// follower.
    pub fn open(config: &NodeConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let state_file = StateFile::new(config.state_path());
        let restored = state_file.load()?;
        let log = ReplicatedLog::open(config.log_path())?;

        let mut node = Self {
            id: config.index,
            cluster: config.cluster.clone(),
            role: Role::Follower,
            hard: restored.unwrap_or_default(),
            state_file,
            leader: None,
            votes: BTreeSet::new(),
            progress: vec![Progress::default(); config.cluster.len()],
            log,
            last_activity: Instant::now(),
            election_jitter: config.election_jitter,
            jitter: Duration::ZERO,
            outbox: Vec::new(),
        };

        match restored {
            Some(state) => info!(
                node = node.number(),
                term = state.term,
                voted_for = ?state.voted_for,
                committed = node.log.committed(),
                "restored durable state"
            ),
            None if !node.log.is_empty() => {
                // lost its state file but not its log: the old term is
                // unknown, so it must not claim term 0 again
                warn!(
                    node = node.number(),
                    committed = node.log.committed(),
                    "durable log without state file, starting as follower"
                );
                node.persist()?;
            }
            None if config.bootstrap_leader && node.id == 0 => {
                info!(node = node.number(), "fresh cluster, bootstrapping as leader of term 0");
                node.hard.voted_for = Some(node.id);
                node.persist()?;
                node.become_leader(false)?;
            }
            None => node.persist()?,
        }
        node.reset_timer();
        Ok(node)
    }

    /// 0-based index into the cluster's node list.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// 1-based number used in file names and logs.
    pub fn number(&self) -> usize {
        self.id + 1
    }

    /// Current role. Changes only inside `step`, `on_timeout` and `open`.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Latest term this node has seen. Persisted before it changes
    /// anything observable.
    pub fn term(&self) -> u64 {
        self.hard.term
    }

    /// Candidate this node voted for in the current term, if any.
    pub fn voted_for(&self) -> Option<NodeId> {
        self.hard.voted_for
    }

    /// Leader this node currently believes in, possibly itself.
    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    /// Number of committed entries. Never decreases, including across
    /// restarts.
    pub fn commit_index(&self) -> usize {
        self.log.committed()
    }

    /// Number of entries in the log, committed or not.
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Entry at 0-based `index`, or `None` past the end of the log.
    pub fn entry_at(&self, index: usize) -> Option<&LogEntry> {
        self.log.entry_at(index)
    }

    /// State machine built from the committed prefix only.
    pub fn store(&self) -> &KvStore {
        self.log.store()
    }

    /// Committed value of `key`, as a local read would see it.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.log.get(key)
    }

    /// When the next timeout fires unless something resets the timer.
    pub fn deadline(&self) -> Instant {
        self.last_activity + self.current_timeout()
    }

    /// Drains the messages produced since the last call.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        mem::take(&mut self.outbox)
    }

    /// Flushes the durable log. Called once on shutdown.
    pub fn close(&mut self) -> Result<()> {
        self.log.sync()
    }

    /// Fires the role's timeout action: a replication round for a leader,
    /// a new election for anybody else.
    pub fn on_timeout(&mut self) -> Result<()> {
        match self.role {
            Role::Leader => {
                self.replicate_all();
                self.last_activity = Instant::now();
                Ok(())
            }
            Role::Follower | Role::Candidate => self.start_election(),
        }
    }

    /// Handles one inbound message.
    ///
    /// Errors mean the durable state could not be written or a peer
    /// contradicted the committed log. See [`Error::is_fatal`].
    pub fn step(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope { from, message } = envelope;

        if let Some(peer) = message.sender() {
            if peer >= self.cluster.len() || peer == self.id {
                warn!(
                    node = self.number(),
                    peer,
                    kind = message.kind(),
                    "dropping peer message with bad sender index"
                );
                return Ok(());
            }
        }
        if let Some(term) = message.term() {
            if term > self.hard.term {
                self.step_down(term)?;
            }
        }

        match message {
            Message::ClientRequest(request) => self.handle_client_request(from, request),
            Message::ClientResponse(response) => {
                self.relay_response(response);
                Ok(())
            }
            Message::VoteRequest(request) => self.handle_vote_request(request),
            Message::VoteResponse(response) => self.handle_vote_response(response),
            Message::AppendEntries(request) => self.handle_append_entries(request),
            Message::AppendEntriesResult(result) => self.handle_append_result(result),
        }
    }

    fn handle_client_request(&mut self, from: Address, request: ClientRequest) -> Result<()> {
        if !is_well_formed(&request) {
            self.reply(
                from,
                ClientResponse::failed(request.op, MALFORMED_REQUEST, request.redirections),
            );
            return Ok(());
        }

        match request.op {
            Operation::Ping => {
                self.reply(from, ClientResponse::ok(request.op, None, request.redirections));
                Ok(())
            }
            Operation::Get => {
                let value = request
                    .key
                    .as_deref()
                    .and_then(|key| self.log.get(key))
                    .map(str::to_string);
                let response = match value {
                    Some(value) => ClientResponse::ok(request.op, Some(value), request.redirections),
                    None => ClientResponse::failed(request.op, KEY_MISSING, request.redirections),
                };
                self.reply(from, response);
                Ok(())
            }
            Operation::Set | Operation::Delete => self.handle_write(from, request),
        }
    }

    /// Leaders append the write; everybody else forwards it to the leader
    /// they know of, pushing the hop it came from onto the chain.
    fn handle_write(&mut self, from: Address, mut request: ClientRequest) -> Result<()> {
        if self.role == Role::Leader {
            let ClientRequest {
                op,
                key,
                value,
                redirections,
            } = request;
            let key = key.unwrap_or_default();
            let command = match op {
                Operation::Set => Command::Set {
                    key,
                    value: value.unwrap_or_default(),
                },
                _ => Command::Delete { key },
            };
            let index = self.log.append(
                LogEntry::new(self.hard.term, command),
                Some(PendingRequest {
                    origin: from,
                    op,
                    redirections,
                }),
            );
            debug!(node = self.number(), index, %op, "accepted client write");
            self.replicate_all();
            return self.advance_commit();
        }

        match self.leader.filter(|&leader| leader != self.id) {
            Some(leader) => {
                debug!(node = self.number(), leader = leader + 1, op = %request.op, "forwarding client write");
                request.redirections.push(from);
                self.send_to_peer(leader, Message::ClientRequest(request));
            }
            None => self.reply(
                from,
                ClientResponse::failed(request.op, NO_LEADER, request.redirections),
            ),
        }
        Ok(())
    }

    /// Passes a response one hop back towards the client that asked.
    fn relay_response(&mut self, mut response: ClientResponse) {
        match response.redirections.pop() {
            Some(next_hop) => self.reply(next_hop, response),
            None => warn!(
                node = self.number(),
                op = %response.op,
                "client response with empty redirection chain, dropping"
            ),
        }
    }

    fn handle_vote_request(&mut self, request: VoteRequest) -> Result<()> {
        let candidate_log = (request.last_log_term, request.last_log_index);
        let own_log = (self.log.last_term(), self.log.last_index());
        let free = match self.hard.voted_for {
            None => true,
            Some(voted) => voted == request.candidate,
        };
        let granted = request.term == self.hard.term && free && candidate_log >= own_log;

        if granted {
            if self.hard.voted_for.is_none() {
                self.hard.voted_for = Some(request.candidate);
                self.persist()?;
            }
            self.reset_timer();
        }
        debug!(
            node = self.number(),
            term = self.hard.term,
            candidate = request.candidate + 1,
            granted,
            "answered vote request"
        );

        self.send_to_peer(
            request.candidate,
            Message::VoteResponse(VoteResponse {
                term: self.hard.term,
                granted,
                voter: self.id,
            }),
        );
        Ok(())
    }

    fn handle_vote_response(&mut self, response: VoteResponse) -> Result<()> {
        if self.role != Role::Candidate || response.term != self.hard.term || !response.granted {
            return Ok(());
        }
        self.votes.insert(response.voter);
        if self.votes.len() >= self.cluster.majority() {
            info!(
                node = self.number(),
                term = self.hard.term,
                votes = self.votes.len(),
                "won election"
            );
            self.become_leader(true)?;
        }
        Ok(())
    }

    fn handle_append_entries(&mut self, request: AppendEntriesRequest) -> Result<()> {
        if request.term < self.hard.term {
            self.send_append_result(request.leader, false, self.log.len());
            return Ok(());
        }
        if self.role == Role::Leader {
            return Err(Error::ProtocolViolation(format!(
                "node {} claims leadership of term {} already held by node {}",
                request.leader + 1,
                request.term,
                self.number()
            )));
        }

        self.role = Role::Follower;
        self.votes.clear();
        self.leader = Some(request.leader);
        self.reset_timer();

        let prev_matches = match request.prev_log_index {
            None => true,
            Some(index) => {
                request.prev_log_term.is_some() && self.log.term_at(index) == request.prev_log_term
            }
        };
        if !prev_matches {
            self.send_append_result(request.leader, false, self.log.len());
            return Ok(());
        }

        let start = request.prev_log_index.map_or(0, |index| index + 1);
        let matched = start + request.entries.len();
        for (index, entry) in (start..).zip(request.entries) {
            match self.log.term_at(index) {
                Some(term) if term == entry.term => {}
                Some(term) if index < self.log.committed() => {
                    return Err(Error::ProtocolViolation(format!(
                        "entry {index} of term {} conflicts with committed entry of term {term}",
                        entry.term
                    )));
                }
                Some(_) => {
                    self.log.truncate_after(index.checked_sub(1))?;
                    self.log.append(entry, None);
                }
                None => {
                    self.log.append(entry, None);
                }
            }
        }

        self.commit_to(request.leader_commit.min(matched))?;
        self.send_append_result(request.leader, true, matched);
        Ok(())
    }

    fn handle_append_result(&mut self, result: AppendEntriesResult) -> Result<()> {
        if self.role != Role::Leader || result.term != self.hard.term {
            return Ok(());
        }

        let log_len = self.log.len();
        let progress = &mut self.progress[result.responder];
        if result.success {
            progress.matched = progress.matched.max(result.log_length.min(log_len));
            progress.next = progress.matched;
            self.advance_commit()
        } else {
            // step back one entry; the next round retries from there
            progress.next = progress.next.saturating_sub(1).min(result.log_length);
            Ok(())
        }
    }

    fn start_election(&mut self) -> Result<()> {
        self.hard = HardState {
            term: self.hard.term + 1,
            voted_for: Some(self.id),
        };
        self.persist()?;
        self.role = Role::Candidate;
        self.leader = None;
        self.votes = BTreeSet::from([self.id]);
        self.reset_timer();
        info!(node = self.number(), term = self.hard.term, "timed out, starting election");

        if self.votes.len() >= self.cluster.majority() {
            return self.become_leader(true);
        }

        let request = VoteRequest {
            term: self.hard.term,
            candidate: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in 0..self.cluster.len() {
            if peer != self.id {
                self.send_to_peer(peer, Message::VoteRequest(request.clone()));
            }
        }
        Ok(())
    }

    /// `with_noop` appends an entry of the new term so entries inherited
    /// from earlier terms can commit without waiting for a client write.
    fn become_leader(&mut self, with_noop: bool) -> Result<()> {
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.votes.clear();

        let len = self.log.len();
        for progress in &mut self.progress {
            *progress = Progress {
                next: len,
                matched: 0,
            };
        }
        if with_noop {
            self.log.append(LogEntry::noop(self.hard.term), None);
        }

        self.replicate_all();
        self.advance_commit()
    }

    fn step_down(&mut self, term: u64) -> Result<()> {
        debug!(node = self.number(), from = self.hard.term, to = term, "saw higher term");
        self.hard = HardState {
            term,
            voted_for: None,
        };
        self.persist()?;
        self.role = Role::Follower;
        self.leader = None;
        self.votes.clear();
        Ok(())
    }

    fn replicate_all(&mut self) {
        for peer in 0..self.cluster.len() {
            if peer != self.id {
                self.send_append(peer);
            }
        }
    }

    fn send_append(&mut self, peer: NodeId) {
        let next = self.progress[peer].next.min(self.log.len());
        let prev_log_index = next.checked_sub(1);
        let request = AppendEntriesRequest {
            term: self.hard.term,
            leader: self.id,
            prev_log_index,
            prev_log_term: prev_log_index.and_then(|index| self.log.term_at(index)),
            entries: self.log.entries_from(next),
            leader_commit: self.log.committed(),
        };
        self.send_to_peer(peer, Message::AppendEntries(request));
    }

    fn send_append_result(&mut self, leader: NodeId, success: bool, log_length: usize) {
        self.send_to_peer(
            leader,
            Message::AppendEntriesResult(AppendEntriesResult {
                term: self.hard.term,
                success,
                log_length,
                responder: self.id,
            }),
        );
    }

    /// Commits the longest prefix that ends in a current-term entry held by
    /// a strict majority. Older entries only commit underneath such an entry.
    fn advance_commit(&mut self) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }

        let committed = self.log.committed();
        let majority = self.cluster.majority();
        let mut target = committed;
        for len in (committed + 1..=self.log.len()).rev() {
            if self.log.term_at(len - 1) != Some(self.hard.term) {
                break;
            }
            let replicas = 1 + self
                .progress
                .iter()
                .enumerate()
                .filter(|(peer, progress)| *peer != self.id && progress.matched >= len)
                .count();
            if replicas >= majority {
                target = len;
                break;
            }
        }
        self.commit_to(target)
    }

    fn commit_to(&mut self, target: usize) -> Result<()> {
        let committed = self.log.committed();
        if target <= committed {
            return Ok(());
        }
        let responses = self.log.commit(committed, target)?;
        debug!(
            node = self.number(),
            from = committed,
            to = target,
            responses = responses.len(),
            "advanced commit point"
        );
        self.outbox.extend(responses);
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        self.state_file.save(self.hard)
    }

    fn reset_timer(&mut self) {
        self.last_activity = Instant::now();
        self.jitter = if self.election_jitter.is_zero() {
            Duration::ZERO
        } else {
            let max = self.election_jitter.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=max))
        };
    }

    fn current_timeout(&self) -> Duration {
        match self.role {
            Role::Leader => self.cluster.timeout / 2,
            Role::Follower | Role::Candidate => self.cluster.timeout + self.jitter,
        }
    }

    fn send_to_peer(&mut self, peer: NodeId, message: Message) {
        if let Some(addr) = self.cluster.address(peer) {
            self.outbox.push(Outbound {
                to: addr.to_string(),
                message,
            });
        }
    }

    fn reply(&mut self, to: Address, response: ClientResponse) {
        self.outbox.push(Outbound {
            to,
            message: Message::ClientResponse(response),
        });
    }
}

fn is_well_formed(request: &ClientRequest) -> bool {
    match request.op {
        Operation::Ping => true,
        Operation::Get | Operation::Delete => request.key.is_some(),
        Operation::Set => request.key.is_some() && request.value.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use tempfile::TempDir;

    const CLIENT: &str = "127.0.0.1:9000";

    fn addr(index: NodeId) -> Address {
        format!("127.0.0.1:{}", 7101 + index)
    }

    /// Simulated cluster without networking.
    ///
    /// Messages move only when a test calls `deliver`, and timeouts only
    /// fire when a test calls `fire`, so every interleaving is scripted.
    struct TestCluster {
        _dir: TempDir,
        configs: Vec<NodeConfig>,
        nodes: Vec<RaftNode>,
        blocked: HashSet<(NodeId, NodeId)>,
        client_inbox: Vec<ClientResponse>,
        /// (from, to) of every client response that moved.
        response_hops: Vec<(Address, Address)>,
    }

    impl TestCluster {
        fn new(n: usize) -> Result<Self> {
            Self::with_bootstrap(n, true)
        }

        fn with_bootstrap(n: usize, bootstrap: bool) -> Result<Self> {
            let dir = tempfile::tempdir()?;
            let cluster = ClusterConfig::new((0..n).map(addr).collect(), Duration::from_millis(100))?;
            let mut configs = Vec::new();
            let mut nodes = Vec::new();
            for index in 0..n {
                let mut config = NodeConfig::new(cluster.clone(), index, dir.path())?;
                config.bootstrap_leader = bootstrap;
                nodes.push(RaftNode::open(&config)?);
                configs.push(config);
            }
            Ok(Self {
                _dir: dir,
                configs,
                nodes,
                blocked: HashSet::new(),
                client_inbox: Vec::new(),
                response_hops: Vec::new(),
            })
        }

        fn node(&self, index: NodeId) -> &RaftNode {
            &self.nodes[index]
        }

        fn node_mut(&mut self, index: NodeId) -> &mut RaftNode {
            &mut self.nodes[index]
        }

        fn index_of(&self, address: &str) -> Option<NodeId> {
            self.configs.iter().position(|c| c.listen_addr() == address)
        }

        /// Moves every queued message one hop. Returns how many moved.
        fn deliver_round(&mut self) -> Result<usize> {
            let mut batch = Vec::new();
            for (from, node) in self.nodes.iter_mut().enumerate() {
                batch.extend(node.take_outbound().into_iter().map(|out| (from, out)));
            }

            let count = batch.len();
            for (from, out) in batch {
                if matches!(out.message, Message::ClientResponse(_)) {
                    self.response_hops.push((addr(from), out.to.clone()));
                }
                match self.index_of(&out.to) {
                    Some(to) if self.blocked.contains(&(from, to)) => {}
                    Some(to) => self.nodes[to].step(Envelope::new(addr(from), out.message))?,
                    None => match out.message {
                        Message::ClientResponse(response) => self.client_inbox.push(response),
                        other => panic!("unexpected message for {}: {other:?}", out.to),
                    },
                }
            }
            Ok(count)
        }

        fn deliver(&mut self) -> Result<()> {
            for _ in 0..100 {
                if self.deliver_round()? == 0 {
                    return Ok(());
                }
            }
            panic!("cluster did not quiesce");
        }

        /// Fires one node's timeout and lets the cluster settle.
        fn fire(&mut self, index: NodeId) -> Result<()> {
            self.nodes[index].on_timeout()?;
            self.deliver()
        }

        fn request(&mut self, index: NodeId, request: ClientRequest) -> Result<()> {
            self.nodes[index].step(Envelope::new(CLIENT, Message::ClientRequest(request)))?;
            self.deliver()
        }

        fn responses(&mut self) -> Vec<ClientResponse> {
            mem::take(&mut self.client_inbox)
        }

        fn isolate(&mut self, index: NodeId) {
            for other in 0..self.nodes.len() {
                if other != index {
                    self.blocked.insert((index, other));
                    self.blocked.insert((other, index));
                }
            }
        }

        fn heal(&mut self) {
            self.blocked.clear();
        }

        fn discard(&mut self, index: NodeId) {
            self.nodes[index].take_outbound();
        }

        fn restart(&mut self, index: NodeId) -> Result<()> {
            self.nodes[index].close()?;
            self.nodes[index] = RaftNode::open(&self.configs[index])?;
            Ok(())
        }

        /// Panics if two nodes lead the same term.
        fn assert_one_leader_per_term(&self) {
            let mut by_term: HashMap<u64, NodeId> = HashMap::new();
            for (index, node) in self.nodes.iter().enumerate() {
                if node.role() == Role::Leader {
                    if let Some(other) = by_term.insert(node.term(), index) {
                        panic!("nodes {other} and {index} both lead term {}", node.term());
                    }
                }
            }
        }

        fn assert_single_leader(&self) -> NodeId {
            self.assert_one_leader_per_term();
            let leaders: Vec<NodeId> = (0..self.nodes.len())
                .filter(|&i| self.nodes[i].role() == Role::Leader)
                .collect();
            assert_eq!(leaders.len(), 1, "expected exactly one leader, found {leaders:?}");
            leaders[0]
        }
    }

    #[test]
    fn bootstrap_leader_replicates_a_write() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.deliver()?;
        assert_eq!(cluster.assert_single_leader(), 0);
        for i in 0..3 {
            assert_eq!(cluster.node(i).term(), 0);
            assert_eq!(cluster.node(i).leader(), Some(0));
        }

        cluster.request(0, ClientRequest::set("x", "1"))?;
        assert_eq!(
            cluster.responses(),
            vec![ClientResponse::ok(Operation::Set, None, vec![])]
        );

        // the next heartbeat carries the new commit point
        cluster.fire(0)?;
        for i in 0..3 {
            assert_eq!(cluster.node(i).get("x"), Some("1"));
            assert_eq!(cluster.node(i).commit_index(), 1);
        }
        Ok(())
    }

    #[test]
    fn partitioned_leader_steps_down_after_rejoining() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.deliver()?;

        cluster.isolate(0);
        cluster.fire(1)?;
        assert_eq!(cluster.node(1).role(), Role::Leader);
        assert_eq!(cluster.node(1).term(), 1);
        assert_eq!(cluster.node(2).leader(), Some(1));
        // the old leader has not heard anything yet
        assert_eq!(cluster.node(0).role(), Role::Leader);
        assert_eq!(cluster.node(0).term(), 0);
        cluster.assert_one_leader_per_term();

        cluster.heal();
        cluster.fire(1)?;
        assert_eq!(cluster.node(0).role(), Role::Follower);
        assert_eq!(cluster.node(0).term(), 1);
        assert_eq!(cluster.node(0).leader(), Some(1));
        assert_eq!(cluster.assert_single_leader(), 1);
        Ok(())
    }

    #[test]
    fn conflicting_uncommitted_suffix_is_replaced() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.deliver()?;

        cluster.isolate(0);
        cluster.request(0, ClientRequest::set("lost", "1"))?;
        assert_eq!(cluster.node(0).log_len(), 1);
        assert_eq!(cluster.node(0).commit_index(), 0);

        cluster.fire(1)?;
        cluster.heal();
        cluster.fire(1)?;

        let node = cluster.node(0);
        assert_eq!(node.log_len(), 1);
        assert_eq!(node.entry_at(0), Some(&LogEntry::noop(1)));
        assert_eq!(node.commit_index(), 1);
        assert_eq!(node.get("lost"), None);
        // the client bound to the dropped entry gets nothing and must retry
        assert!(cluster.responses().is_empty());
        Ok(())
    }

    #[test]
    fn delete_reports_whether_key_existed() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.deliver()?;

        cluster.request(0, ClientRequest::delete("ghost"))?;
        assert_eq!(
            cluster.responses(),
            vec![ClientResponse::failed(Operation::Delete, KEY_MISSING, vec![])]
        );

        cluster.request(0, ClientRequest::set("k", "v"))?;
        cluster.request(0, ClientRequest::delete("k"))?;
        let outcomes: Vec<_> = cluster
            .responses()
            .into_iter()
            .map(|r| (r.op, r.success))
            .collect();
        assert_eq!(
            outcomes,
            vec![(Operation::Set, true), (Operation::Delete, true)]
        );

        cluster.fire(0)?;
        for i in 0..3 {
            assert_eq!(cluster.node(i).get("k"), None);
        }
        cluster.request(1, ClientRequest::get("k"))?;
        assert_eq!(
            cluster.responses(),
            vec![ClientResponse::failed(Operation::Get, KEY_MISSING, vec![])]
        );
        Ok(())
    }

    #[test]
    fn forwarded_request_retraces_both_hops() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.deliver()?;

        // node 1 takes over term 1 while node 0 is cut off
        cluster.isolate(0);
        cluster.fire(1)?;
        // node 0 wins term 2 while node 2 is cut off, so node 2 still
        // believes node 1 leads
        cluster.heal();
        cluster.isolate(2);
        cluster.fire(1)?;
        cluster.fire(0)?;
        assert_eq!(cluster.node(0).role(), Role::Leader);
        assert_eq!(cluster.node(0).term(), 2);
        assert_eq!(cluster.node(1).leader(), Some(0));
        assert_eq!(cluster.node(2).leader(), Some(1));

        cluster.heal();
        cluster.response_hops.clear();
        cluster.request(2, ClientRequest::set("x", "1"))?;

        assert_eq!(
            cluster.responses(),
            vec![ClientResponse::ok(Operation::Set, None, vec![])]
        );
        assert_eq!(
            cluster.response_hops,
            vec![
                (addr(0), addr(1)),
                (addr(1), addr(2)),
                (addr(2), CLIENT.to_string()),
            ]
        );
        assert_eq!(cluster.node(0).get("x"), Some("1"));
        Ok(())
    }

    #[test]
    fn vote_refused_to_candidate_with_stale_log() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.deliver()?;
        cluster.request(0, ClientRequest::set("a", "1"))?;

        cluster.isolate(2);
        cluster.request(0, ClientRequest::set("b", "2"))?;
        assert_eq!(cluster.node(1).log_len(), 2);
        assert_eq!(cluster.node(2).log_len(), 1);

        cluster.heal();
        cluster.isolate(0);
        cluster.fire(2)?;
        assert_eq!(cluster.node(2).role(), Role::Candidate);
        assert_eq!(cluster.node(1).term(), 1);
        assert_eq!(cluster.node(1).voted_for(), None);

        cluster.fire(1)?;
        assert_eq!(cluster.node(1).role(), Role::Leader);
        assert_eq!(cluster.node(1).term(), 2);
        assert_eq!(cluster.node(2).role(), Role::Follower);

        // one round to find the match point, one to carry the commit point
        cluster.fire(1)?;
        cluster.fire(1)?;
        assert_eq!(cluster.node(2).get("b"), Some("2"));
        cluster.assert_one_leader_per_term();
        Ok(())
    }

    #[test]
    fn one_vote_per_term() -> Result<()> {
        let mut cluster = TestCluster::with_bootstrap(3, false)?;
        assert!(cluster.nodes.iter().all(|n| n.role() == Role::Follower));

        cluster.node_mut(1).on_timeout()?;
        cluster.node_mut(2).on_timeout()?;
        cluster.deliver()?;

        assert_eq!(cluster.node(0).voted_for(), Some(1));
        assert_eq!(cluster.assert_single_leader(), 1);
        assert_eq!(cluster.node(2).role(), Role::Follower);
        assert_eq!(cluster.node(2).leader(), Some(1));
        Ok(())
    }

    #[test]
    fn prior_term_entries_wait_for_a_current_term_entry() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.deliver()?;

        // replicate a term-0 entry everywhere but lose the acknowledgements
        cluster
            .node_mut(0)
            .step(Envelope::new(CLIENT, Message::ClientRequest(ClientRequest::set("x", "1"))))?;
        cluster.deliver_round()?;
        cluster.discard(1);
        cluster.discard(2);
        assert_eq!(cluster.node(0).commit_index(), 0);

        cluster.isolate(0);
        cluster.node_mut(1).on_timeout()?;
        cluster.deliver_round()?;
        cluster.deliver_round()?;
        assert_eq!(cluster.node(1).role(), Role::Leader);
        assert_eq!(cluster.node(1).log_len(), 2);

        // a majority holds entry 0, but its term is older than the leader's
        let leader = cluster.node_mut(1);
        leader.progress[2].matched = 1;
        leader.advance_commit()?;
        assert_eq!(leader.commit_index(), 0);

        cluster.deliver()?;
        assert_eq!(cluster.node(1).commit_index(), 2);
        assert_eq!(cluster.node(1).get("x"), Some("1"));
        Ok(())
    }

    #[test]
    fn restart_restores_term_vote_and_store() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.deliver()?;
        cluster.isolate(0);
        cluster.fire(1)?;
        cluster.heal();
        cluster.request(1, ClientRequest::set("k", "v"))?;
        cluster.fire(1)?;

        cluster.restart(0)?;
        cluster.restart(2)?;

        let node = cluster.node(0);
        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.leader(), None);
        assert_eq!(node.term(), 1);
        assert_eq!(node.voted_for(), None);
        assert_eq!(node.get("k"), Some("v"));
        assert_eq!(node.commit_index(), node.log_len());

        let node = cluster.node(2);
        assert_eq!(node.term(), 1);
        assert_eq!(node.voted_for(), Some(1));
        assert_eq!(node.commit_index(), 2);
        assert_eq!(node.get("k"), Some("v"));

        // the restarted nodes rejoin under the same leader
        cluster.fire(1)?;
        assert_eq!(cluster.node(0).leader(), Some(1));
        assert_eq!(cluster.assert_single_leader(), 1);
        Ok(())
    }

    #[test]
    fn log_without_state_file_does_not_bootstrap() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.deliver()?;
        cluster.request(0, ClientRequest::set("x", "1"))?;
        cluster.fire(0)?;

        fs::remove_file(cluster.configs[0].state_path())?;
        cluster.restart(0)?;
        let node = cluster.node(0);
        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.leader(), None);
        assert_eq!(node.get("x"), Some("1"));
        assert!(cluster.configs[0].state_path().exists());

        // leadership comes back through a normal election
        cluster.fire(0)?;
        assert_eq!(cluster.assert_single_leader(), 0);
        assert_eq!(cluster.node(0).term(), 1);
        Ok(())
    }

    fn wait_of(node: &RaftNode) -> Duration {
        node.deadline().duration_since(node.last_activity)
    }

    #[test]
    fn leader_waits_half_the_timeout() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.deliver()?;
        assert_eq!(wait_of(cluster.node(0)), Duration::from_millis(50));
        assert_eq!(wait_of(cluster.node(1)), Duration::from_millis(100));

        cluster.isolate(0);
        cluster.fire(1)?;
        assert_eq!(cluster.node(1).role(), Role::Leader);
        assert_eq!(wait_of(cluster.node(1)), Duration::from_millis(50));
        assert_eq!(wait_of(cluster.node(2)), Duration::from_millis(100));

        // a candidate waits like a follower
        cluster.isolate(2);
        cluster.fire(2)?;
        assert_eq!(cluster.node(2).role(), Role::Candidate);
        assert_eq!(wait_of(cluster.node(2)), Duration::from_millis(100));
        Ok(())
    }

    #[test]
    fn jitter_only_stretches_non_leader_waits() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cluster = ClusterConfig::new((0..3).map(addr).collect(), Duration::from_millis(100))?;
        let open = |index| -> Result<RaftNode> {
            let mut config = NodeConfig::new(cluster.clone(), index, dir.path())?;
            config.election_jitter = Duration::from_millis(40);
            RaftNode::open(&config)
        };
        let mut leader = open(0)?;
        let mut follower = open(1)?;
        assert_eq!(leader.role(), Role::Leader);
        assert_eq!(follower.role(), Role::Follower);

        for _ in 0..50 {
            leader.reset_timer();
            follower.reset_timer();
            assert_eq!(wait_of(&leader), Duration::from_millis(50));
            let wait = wait_of(&follower);
            assert!(
                (Duration::from_millis(100)..=Duration::from_millis(140)).contains(&wait),
                "follower wait {wait:?} outside timeout plus jitter"
            );
        }
        Ok(())
    }

    #[test]
    fn commit_index_never_moves_backwards() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        let mut seen = vec![0; 3];
        let check = |cluster: &TestCluster, seen: &mut Vec<usize>| {
            for (i, last) in seen.iter_mut().enumerate() {
                let now = cluster.node(i).commit_index();
                assert!(now >= *last, "node {i} commit went from {last} to {now}");
                *last = now;
            }
        };

        cluster.deliver()?;
        check(&cluster, &mut seen);
        cluster.request(0, ClientRequest::set("x", "1"))?;
        check(&cluster, &mut seen);
        cluster.fire(0)?;
        check(&cluster, &mut seen);
        assert_eq!(seen, vec![1, 1, 1]);

        // the cut-off leader takes a write it can never commit
        cluster.isolate(0);
        cluster.request(0, ClientRequest::set("lost", "1"))?;
        check(&cluster, &mut seen);
        cluster.fire(0)?;
        check(&cluster, &mut seen);
        cluster.fire(1)?;
        check(&cluster, &mut seen);
        cluster.request(1, ClientRequest::set("y", "2"))?;
        check(&cluster, &mut seen);
        cluster.fire(1)?;
        check(&cluster, &mut seen);

        cluster.heal();
        cluster.fire(0)?;
        check(&cluster, &mut seen);
        cluster.fire(1)?;
        check(&cluster, &mut seen);
        cluster.restart(2)?;
        check(&cluster, &mut seen);
        cluster.fire(1)?;
        check(&cluster, &mut seen);

        assert_eq!(seen, vec![3, 3, 3]);
        assert_eq!(cluster.node(0).get("lost"), None);
        assert_eq!(cluster.node(0).get("y"), Some("2"));
        Ok(())
    }

    #[test]
    fn single_node_cluster_elects_itself() -> Result<()> {
        let mut cluster = TestCluster::with_bootstrap(1, false)?;
        assert_eq!(cluster.node(0).role(), Role::Follower);

        cluster.fire(0)?;
        assert_eq!(cluster.node(0).role(), Role::Leader);
        assert_eq!(cluster.node(0).term(), 1);
        assert_eq!(cluster.node(0).commit_index(), 1);

        cluster.request(0, ClientRequest::set("solo", "yes"))?;
        assert_eq!(
            cluster.responses(),
            vec![ClientResponse::ok(Operation::Set, None, vec![])]
        );
        assert_eq!(cluster.node(0).get("solo"), Some("yes"));
        Ok(())
    }

    #[test]
    fn requests_fail_fast_without_leader_or_fields() -> Result<()> {
        let mut cluster = TestCluster::with_bootstrap(3, false)?;

        cluster.request(1, ClientRequest::set("k", "v"))?;
        cluster.request(
            1,
            ClientRequest {
                op: Operation::Set,
                key: Some("k".into()),
                value: None,
                redirections: vec![],
            },
        )?;
        cluster.request(
            1,
            ClientRequest {
                op: Operation::Get,
                key: None,
                value: None,
                redirections: vec![],
            },
        )?;
        cluster.request(1, ClientRequest::ping())?;

        assert_eq!(
            cluster.responses(),
            vec![
                ClientResponse::failed(Operation::Set, NO_LEADER, vec![]),
                ClientResponse::failed(Operation::Set, MALFORMED_REQUEST, vec![]),
                ClientResponse::failed(Operation::Get, MALFORMED_REQUEST, vec![]),
                ClientResponse::ok(Operation::Ping, None, vec![]),
            ]
        );
        assert_eq!(cluster.node(1).log_len(), 0);
        Ok(())
    }

    #[test]
    fn duplicate_votes_count_once() -> Result<()> {
        let mut cluster = TestCluster::with_bootstrap(5, false)?;
        let node = cluster.node_mut(0);
        node.on_timeout()?;
        node.take_outbound();

        let vote = |voter| {
            Envelope::new(
                addr(voter),
                Message::VoteResponse(VoteResponse {
                    term: 1,
                    granted: true,
                    voter,
                }),
            )
        };
        node.step(vote(1))?;
        node.step(vote(1))?;
        assert_eq!(node.role(), Role::Candidate);

        node.step(vote(2))?;
        assert_eq!(node.role(), Role::Leader);
        Ok(())
    }

    #[test]
    fn higher_term_result_demotes_leader() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.deliver()?;

        let leader = cluster.node_mut(0);
        leader.step(Envelope::new(
            addr(1),
            Message::AppendEntriesResult(AppendEntriesResult {
                term: 5,
                success: false,
                log_length: 0,
                responder: 1,
            }),
        ))?;
        assert_eq!(leader.role(), Role::Follower);
        assert_eq!(leader.term(), 5);
        assert_eq!(leader.voted_for(), None);
        assert_eq!(leader.leader(), None);
        Ok(())
    }

    #[test]
    fn response_with_empty_chain_is_dropped() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.deliver()?;

        let node = cluster.node_mut(1);
        node.step(Envelope::new(
            addr(0),
            Message::ClientResponse(ClientResponse::ok(Operation::Set, None, vec![])),
        ))?;
        assert!(node.take_outbound().is_empty());
        Ok(())
    }

    #[test]
    fn conflict_inside_committed_prefix_is_a_violation() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.deliver()?;
        cluster.request(0, ClientRequest::set("a", "1"))?;
        cluster.fire(0)?;
        assert_eq!(cluster.node(1).commit_index(), 1);

        let result = cluster.node_mut(1).step(Envelope::new(
            addr(2),
            Message::AppendEntries(AppendEntriesRequest {
                term: 3,
                leader: 2,
                prev_log_index: None,
                prev_log_term: None,
                entries: vec![LogEntry::noop(3)],
                leader_commit: 0,
            }),
        ));
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
        Ok(())
    }

    #[test]
    fn messages_with_bad_sender_index_are_ignored() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        cluster.deliver()?;

        let node = cluster.node_mut(1);
        node.step(Envelope::new(
            "127.0.0.1:1",
            Message::VoteRequest(VoteRequest {
                term: 9,
                candidate: 7,
                last_log_index: None,
                last_log_term: None,
            }),
        ))?;
        assert_eq!(node.term(), 0);
        assert!(node.take_outbound().is_empty());
        Ok(())
    }
}

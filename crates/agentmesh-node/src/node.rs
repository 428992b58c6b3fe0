use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use libp2p::swarm::SwarmEvent;
use libp2p::{gossipsub, identify, kad, Multiaddr, PeerId, Swarm};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use agentmesh_protocol::{
    dht_key, ecies, now_ms, Address, AgentKeys, Announcement, Frame, SignedMessage,
    StatusMetrics, StatusReport, ProtocolError, STATUS_INTERVAL_SECS, STATUS_TTL_SECS,
    TOPIC_ANNOUNCEMENTS, TOPIC_MESSAGES, TOPIC_STATUS,
};
use agentmesh_registry::{Registry, RegistryError};

use crate::api::P2PEvent;
use crate::config::Config;
use crate::directory::{AgentSummary, Directory};
use crate::network::{peer_id_from_multiaddr, MeshBehaviour, MeshBehaviourEvent};
use crate::role::{NodeRole, RolePolicy};

/// Hard per-attempt timeout for bootstrap dials.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Backoff between bootstrap dial attempts.
const DIAL_BACKOFF: Duration = Duration::from_secs(5);
/// Dial attempts between bootstrap peers.
const BOOTSTRAP_DIAL_ATTEMPTS: u32 = 3;
/// Dial attempts from an edge node towards a bootstrap peer.
const EDGE_DIAL_ATTEMPTS: u32 = 5;
/// Cap on a directory lookup through the DHT.
const DHT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace for the first listener to come up.
const LISTEN_TIMEOUT: Duration = Duration::from_secs(10);
/// Cadence of the status-table purge sweep.
const PURGE_INTERVAL: Duration = Duration::from_secs(30);
/// Floor between reactive re-announcements (first sight of a new agent),
/// independent of the role's periodic cadence.
const REANNOUNCE_FLOOR: Duration = Duration::from_secs(5);

// ============================================================================
// Errors surfaced to message senders
// ============================================================================

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no route to {0}")]
    NoRoute(Address),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),
}

impl SendError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoRoute(_) => "NO_ROUTE",
            Self::Encryption(_) => "ENCRYPTION_FAILED",
            Self::PublishFailed(_) => "PUBLISH_FAILED",
        }
    }
}

// ============================================================================
// Commands from the local API into the node loop
// ============================================================================

pub enum NodeCommand {
    Send {
        to: Address,
        content: Vec<u8>,
        conversation_id: Option<String>,
        reply_to: Option<String>,
        reply: oneshot::Sender<Result<String, SendError>>,
    },
    ListAgents {
        reply: oneshot::Sender<Vec<AgentSummary>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    /// Internal: a directory lookup hit its deadline.
    LookupDeadline(kad::QueryId),
}

/// An outbound message parked until its recipient binding resolves.
struct PendingSend {
    to: Address,
    content: Vec<u8>,
    conversation_id: Option<String>,
    reply_to: Option<String>,
    reply: oneshot::Sender<Result<String, SendError>>,
}

struct PendingLookup {
    address: Address,
    sends: Vec<PendingSend>,
}

// ============================================================================
// Node handle
// ============================================================================

/// Cheaply cloneable handle into a running node. The local API server and
/// the signal hook both drive the node exclusively through this.
#[derive(Clone)]
pub struct NodeHandle {
    address: Address,
    peer_id: PeerId,
    cmd_tx: mpsc::Sender<NodeCommand>,
    events: broadcast::Sender<P2PEvent>,
    ready: watch::Receiver<bool>,
}

impl NodeHandle {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Subscribe to the lossy event fan-out. A receiver that lags simply
    /// misses events; it never blocks the node.
    pub fn subscribe(&self) -> broadcast::Receiver<P2PEvent> {
        self.events.subscribe()
    }

    pub async fn send_message(
        &self,
        to: Address,
        content: Vec<u8>,
        conversation_id: Option<String>,
        reply_to: Option<String>,
    ) -> Result<String, SendError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(NodeCommand::Send { to, content, conversation_id, reply_to, reply: tx })
            .await
            .map_err(|_| SendError::PublishFailed("node loop unavailable".into()))?;
        rx.await
            .map_err(|_| SendError::PublishFailed("node loop dropped reply".into()))?
    }

    pub async fn list_agents(&self) -> Vec<AgentSummary> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(NodeCommand::ListAgents { reply: tx }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Cooperative shutdown; resolves once the node loop has exited.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(NodeCommand::Stop { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Wait until startup has finished. Returns false if the node died
    /// before becoming ready.
    pub async fn wait_ready(&self) -> bool {
        let mut ready = self.ready.clone();
        loop {
            if *ready.borrow() {
                return true;
            }
            if ready.changed().await.is_err() {
                return false;
            }
        }
    }
}

// ============================================================================
// MeshNode
// ============================================================================

pub struct MeshNode {
    config: Config,
    role: NodeRole,
    policy: RolePolicy,
    keys: Arc<AgentKeys>,
    registry: Arc<dyn Registry>,
    /// Present only when an on-chain registry is configured; in dev mode the
    /// registry gate is advisory.
    strict_registry: bool,

    address: Address,
    peer_id: PeerId,
    bootstrap_peers: Vec<Multiaddr>,

    directory: Directory,
    /// Cached eligibility per sender; absent = unchecked, retried lazily so
    /// an RPC outage never permanently blocks a legitimate agent.
    registry_gate: HashMap<Address, bool>,
    pending_lookups: HashMap<kad::QueryId, PendingLookup>,

    events: broadcast::Sender<P2PEvent>,
    cmd_tx: mpsc::Sender<NodeCommand>,
    cmd_rx: mpsc::Receiver<NodeCommand>,
    ready_tx: watch::Sender<bool>,
    stop_ack: Option<oneshot::Sender<()>>,

    started_at: Instant,
    messages_sent: u64,
    messages_received: u64,
    last_message_ms: u64,
    /// Whether our binding announcement has actually reached a mesh peer.
    announced: bool,
    last_announce: Option<Instant>,
}

impl MeshNode {
    /// Assemble the node and its networking stack. Nothing dials yet; the
    /// startup sequence runs at the front of [`MeshNode::run`].
    pub fn new(
        config: Config,
        keys: Arc<AgentKeys>,
        registry: Arc<dyn Registry>,
    ) -> anyhow::Result<(Self, NodeHandle, Swarm<MeshBehaviour>)> {
        let role = config.resolve_role();
        let policy = RolePolicy::for_role(role);
        let strict_registry = config.registry_address.is_some();

        let overlay_keypair = match (role, config.bootstrap_private_key.as_deref()) {
            (NodeRole::Bootstrap, Some(pinned)) => pinned_keypair(pinned)?,
            (NodeRole::Bootstrap, None) => {
                tracing::warn!(
                    "bootstrap node without BOOTSTRAP_PRIVATE_KEY; \
                     the overlay peer id will not survive restarts"
                );
                libp2p::identity::Keypair::generate_ed25519()
            }
            _ => libp2p::identity::Keypair::generate_ed25519(),
        };

        let bootstrap_peers = config.bootstrap_peers();
        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.port).parse()?;
        let swarm =
            crate::network::build_swarm(overlay_keypair, &policy, &bootstrap_peers, listen_addr)?;
        let peer_id = *swarm.local_peer_id();
        let address = keys.address();

        let (events, _) = broadcast::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = watch::channel(false);

        tracing::info!(
            role = %role,
            agent_id = %address,
            peer_id = %peer_id,
            "node assembled",
        );

        let handle = NodeHandle {
            address,
            peer_id,
            cmd_tx: cmd_tx.clone(),
            events: events.clone(),
            ready: ready_rx,
        };
        let node = Self {
            config,
            role,
            policy,
            keys,
            registry,
            strict_registry,
            address,
            peer_id,
            bootstrap_peers,
            directory: Directory::new(address),
            registry_gate: HashMap::new(),
            pending_lookups: HashMap::new(),
            events,
            cmd_tx,
            cmd_rx,
            ready_tx,
            stop_ack: None,
            started_at: Instant::now(),
            messages_sent: 0,
            messages_received: 0,
            last_message_ms: 0,
            announced: false,
            last_announce: None,
        };
        Ok((node, handle, swarm))
    }

    // ========================================================================
    // Main event loop
    // ========================================================================

    pub async fn run(mut self, mut swarm: Swarm<MeshBehaviour>) -> anyhow::Result<()> {
        self.startup(&mut swarm).await?;
        let _ = self.ready_tx.send(true);

        let mut announce_timer = tokio::time::interval(self.policy.announce_interval());
        let mut status_timer =
            tokio::time::interval(Duration::from_secs(STATUS_INTERVAL_SECS));
        let mut redial_timer = tokio::time::interval(self.policy.auto_dial_interval);
        let mut purge_timer = tokio::time::interval(PURGE_INTERVAL);

        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    self.handle_swarm_event(&mut swarm, event).await;
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    if self.handle_command(&mut swarm, cmd).await {
                        break;
                    }
                }
                _ = announce_timer.tick() => {
                    self.publish_binding(&mut swarm);
                }
                _ = status_timer.tick() => {
                    self.publish_status(&mut swarm);
                }
                _ = redial_timer.tick() => {
                    self.maintain_connections(&mut swarm);
                }
                _ = purge_timer.tick() => {
                    self.directory.purge_expired(Duration::from_secs(STATUS_TTL_SECS));
                }
            }
        }

        if let Some(ack) = self.stop_ack.take() {
            let _ = ack.send(());
        }
        tracing::info!("node stopped");
        Ok(())
    }

    // ========================================================================
    // Startup: listen, rendezvous, register, announce
    // ========================================================================

    async fn startup(&mut self, swarm: &mut Swarm<MeshBehaviour>) -> anyhow::Result<()> {
        // Listener failure is fatal.
        let listen_deadline = tokio::time::sleep(LISTEN_TIMEOUT);
        tokio::pin!(listen_deadline);
        loop {
            tokio::select! {
                _ = &mut listen_deadline => {
                    anyhow::bail!("listener did not come up within {LISTEN_TIMEOUT:?}");
                }
                event = swarm.select_next_some() => {
                    if let SwarmEvent::NewListenAddr { address, .. } = &event {
                        tracing::info!("listening on {address}");
                        self.handle_swarm_event(swarm, event).await;
                        break;
                    }
                    self.handle_swarm_event(swarm, event).await;
                }
            }
        }

        // Bootstrap peers advertise a deterministic public address on top of
        // their local listeners.
        if self.role == NodeRole::Bootstrap {
            if let Some(entry) = self.config.bootstrap_entry() {
                let external: Multiaddr =
                    format!("/dns4/{}/tcp/{}", entry.host, entry.port).parse()?;
                swarm.add_external_address(external.clone());
                tracing::info!("advertising public address {external}");
            }
        }

        // Rendezvous. Transport errors on individual dials are non-fatal;
        // ending up with zero bootstrap connections is, for roles that
        // require it.
        let attempts = if self.role == NodeRole::Bootstrap {
            BOOTSTRAP_DIAL_ATTEMPTS
        } else {
            EDGE_DIAL_ATTEMPTS
        };
        let peers = self.bootstrap_peers.clone();
        let mut reached = 0usize;
        for addr in &peers {
            for attempt in 1..=attempts {
                if self.dial_and_wait(swarm, addr, DIAL_TIMEOUT).await {
                    reached += 1;
                    break;
                }
                tracing::debug!("bootstrap dial {addr} attempt {attempt}/{attempts} failed");
                if attempt < attempts {
                    tokio::time::sleep(DIAL_BACKOFF).await;
                }
            }
        }
        tracing::info!("connected to {reached}/{} bootstrap peers", peers.len());
        if reached == 0 && self.policy.bootstrap_required {
            anyhow::bail!("no reachable bootstrap peers; cannot join the overlay");
        }

        // Register once at startup; "already registered" is success inside
        // the registry client.
        let metadata =
            serde_json::json!({ "publicKey": self.keys.public_key_hex() }).to_string();
        self.registry
            .register_self(&self.config.agent_name, &metadata)
            .await
            .map_err(|e| anyhow::anyhow!("registration failed: {e}"))?;

        self.publish_binding(swarm);
        Ok(())
    }

    /// Dial `addr` and drive the swarm until the connection lands or the
    /// timeout expires. Unrelated events are dispatched normally.
    async fn dial_and_wait(
        &mut self,
        swarm: &mut Swarm<MeshBehaviour>,
        addr: &Multiaddr,
        timeout: Duration,
    ) -> bool {
        let target = peer_id_from_multiaddr(addr);
        if let Some(peer) = target {
            if swarm.is_connected(&peer) {
                return true;
            }
        }
        if let Err(e) = swarm.dial(addr.clone()) {
            tracing::debug!("dial {addr}: {e}");
            return false;
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return false,
                event = swarm.select_next_some() => {
                    let outcome = match &event {
                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                            let hit = target.map_or_else(
                                || endpoint.get_remote_address() == addr,
                                |t| t == *peer_id,
                            );
                            hit.then_some(true)
                        }
                        SwarmEvent::OutgoingConnectionError { peer_id, .. }
                            if target.is_some() && *peer_id == target =>
                        {
                            Some(false)
                        }
                        _ => None,
                    };
                    self.handle_swarm_event(swarm, event).await;
                    if let Some(connected) = outcome {
                        return connected;
                    }
                }
            }
        }
    }

    // ========================================================================
    // Swarm event dispatch
    // ========================================================================

    async fn handle_swarm_event(
        &mut self,
        swarm: &mut Swarm<MeshBehaviour>,
        event: SwarmEvent<MeshBehaviourEvent>,
    ) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::debug!("new listen addr {address}");
            }
            SwarmEvent::ConnectionEstablished { peer_id, connection_id, .. } => {
                // Connection budget hook: anything beyond the role's ceiling
                // is closed on arrival.
                let established =
                    swarm.network_info().connection_counters().num_established() as usize;
                if established > self.policy.max_connections {
                    tracing::warn!(
                        "connection budget exceeded ({established}/{}); closing {peer_id}",
                        self.policy.max_connections,
                    );
                    swarm.close_connection(connection_id);
                    return;
                }
                tracing::debug!("connected to {peer_id}");
                self.directory.note_connected(peer_id, now_ms());
                self.emit(P2PEvent::PeerConnected { peer_id: peer_id.to_string() });
            }
            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                if num_established == 0 {
                    self.directory.note_disconnected(&peer_id);
                }
                tracing::debug!("disconnected from {peer_id}");
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                tracing::debug!("outgoing connection error to {peer_id:?}: {error}");
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(swarm, event).await,
            _ => {}
        }
    }

    async fn handle_behaviour_event(
        &mut self,
        swarm: &mut Swarm<MeshBehaviour>,
        event: MeshBehaviourEvent,
    ) {
        match event {
            MeshBehaviourEvent::Gossipsub(gossipsub::Event::Message { message, .. }) => {
                match message.topic.as_str() {
                    TOPIC_MESSAGES => self.handle_agent_message(&message.data).await,
                    TOPIC_ANNOUNCEMENTS => self.handle_announcement(swarm, &message.data).await,
                    TOPIC_STATUS => self.handle_status(&message.data),
                    other => tracing::trace!("message on unknown topic {other}"),
                }
            }
            MeshBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed { peer_id, topic }) => {
                tracing::debug!("{peer_id} subscribed to {topic}");
                // First contact with the announcement mesh: get our binding
                // out immediately instead of waiting a full cadence.
                if topic.as_str() == TOPIC_ANNOUNCEMENTS && !self.announced {
                    self.publish_binding(swarm);
                }
            }
            MeshBehaviourEvent::Gossipsub(_) => {}

            MeshBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result,
                ..
            }) => {
                self.handle_query_result(swarm, id, result).await;
            }
            MeshBehaviourEvent::Kademlia(kad::Event::RoutingUpdated { peer, .. }) => {
                tracing::trace!("routing table updated: {peer}");
            }
            MeshBehaviourEvent::Kademlia(_) => {}

            MeshBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                tracing::trace!("identified {peer_id} ({})", info.protocol_version);
                if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
                    for addr in &info.listen_addrs {
                        kademlia.add_address(&peer_id, addr.clone());
                    }
                }
            }
            MeshBehaviourEvent::Identify(_) => {}
        }
    }

    async fn handle_query_result(
        &mut self,
        swarm: &mut Swarm<MeshBehaviour>,
        id: kad::QueryId,
        result: kad::QueryResult,
    ) {
        match result {
            kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                providers,
                ..
            })) => {
                let Some(pending) = self.pending_lookups.remove(&id) else { return };
                // First provider wins; stop the query early.
                if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
                    if let Some(mut query) = kademlia.query_mut(&id) {
                        query.finish();
                    }
                }
                match providers.into_iter().next() {
                    Some(peer) => {
                        self.directory.upsert_binding(pending.address, peer, now_ms());
                        tracing::debug!(
                            "resolved {} -> {peer} via DHT providers",
                            pending.address,
                        );
                        for send in pending.sends {
                            self.complete_send(swarm, Some(peer), send).await;
                        }
                    }
                    None => self.fail_sends(pending.sends),
                }
            }
            kad::QueryResult::GetProviders(Ok(
                kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
            )) => {
                if let Some(pending) = self.pending_lookups.remove(&id) {
                    self.fail_sends(pending.sends);
                }
            }
            kad::QueryResult::GetProviders(Err(e)) => {
                tracing::debug!("provider query failed: {e}");
                if let Some(pending) = self.pending_lookups.remove(&id) {
                    self.fail_sends(pending.sends);
                }
            }
            kad::QueryResult::StartProviding(Ok(_)) => {
                tracing::debug!("binding published to DHT");
            }
            kad::QueryResult::StartProviding(Err(e)) => {
                tracing::warn!("DHT provide failed: {e}");
            }
            _ => {}
        }
    }

    // ========================================================================
    // Inbound: agent messages
    // ========================================================================

    async fn handle_agent_message(&mut self, data: &[u8]) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("undecodable frame on {TOPIC_MESSAGES}: {e}");
                return;
            }
        };
        let message = frame.message;

        // Our own publishes come back through the mesh.
        if message.from_agent_id == self.address {
            return;
        }

        // Authenticity first; everything else is advisory.
        if let Err(e) = message.verify() {
            tracing::debug!("dropping message {}: {e}", message.message_id);
            self.emit(P2PEvent::Error {
                code: "SIGNATURE_INVALID".into(),
                message: format!("dropped message from {}: {e}", message.from_agent_id),
            });
            return;
        }

        if !self.registry_allows(message.from_agent_id).await {
            tracing::warn!(
                "dropping message from ineligible agent {}",
                message.from_agent_id,
            );
            return;
        }

        // Recipient filter: addressed traffic for someone else is dropped
        // silently; absent recipient means broadcast intent.
        if let Some(to) = message.to_agent_id {
            if to != self.address {
                return;
            }
        }

        let content = if message.encrypted {
            match self.keys.decrypt(&message.content) {
                Ok(plaintext) => plaintext,
                Err(ProtocolError::NotForMe) => {
                    // Mixed-encryption deployments: the sender may not have
                    // encrypted at all.
                    tracing::debug!(
                        "decryption fallback for message {}",
                        message.message_id,
                    );
                    message.content.clone()
                }
                Err(e) => {
                    tracing::debug!("decrypt failed for {}: {e}", message.message_id);
                    message.content.clone()
                }
            }
        } else {
            message.content.clone()
        };

        self.messages_received += 1;
        self.last_message_ms = now_ms();

        self.emit(P2PEvent::Message {
            message_id: message.message_id,
            from: message.from_agent_id.to_string(),
            to: message.to_agent_id.map(|a| a.to_string()).unwrap_or_default(),
            content: String::from_utf8_lossy(&content).into_owned(),
            timestamp_ms: message.timestamp,
        });
    }

    // ========================================================================
    // Inbound: announcements and status
    // ========================================================================

    async fn handle_announcement(&mut self, swarm: &mut Swarm<MeshBehaviour>, data: &[u8]) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("undecodable frame on {TOPIC_ANNOUNCEMENTS}: {e}");
                return;
            }
        };
        let message = frame.message;
        if message.from_agent_id == self.address {
            return;
        }
        if let Err(e) = message.verify() {
            tracing::debug!("unverifiable announcement: {e}");
            return;
        }
        let announcement = match Announcement::decode(&message.content) {
            Ok(a) => a,
            Err(e) => {
                tracing::debug!("malformed announcement payload: {e}");
                return;
            }
        };
        // The binding is only authoritative when the signer asserts its own
        // address.
        if announcement.address != message.from_agent_id {
            tracing::debug!(
                "announcement address {} does not match signer {}",
                announcement.address,
                message.from_agent_id,
            );
            return;
        }
        if !self.registry_allows(announcement.address).await {
            return;
        }
        let peer_id: PeerId = match announcement.peer_id.parse() {
            Ok(peer_id) => peer_id,
            Err(_) => {
                tracing::debug!("announcement carries unparsable peer id");
                return;
            }
        };

        let first_sight = self.directory.lookup(announcement.address).is_none();
        if self.directory.upsert_binding(announcement.address, peer_id, now_ms()) {
            self.directory.set_name(announcement.address, announcement.name);
            let multiaddrs: Vec<Multiaddr> = announcement
                .multiaddrs
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect();
            if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
                for addr in &multiaddrs {
                    kademlia.add_address(&peer_id, addr.clone());
                }
            }
            self.directory.set_multiaddrs(announcement.address, multiaddrs);
            tracing::debug!("directory: {} -> {peer_id}", announcement.address);

            // A newcomer has likely never seen our binding; answer with our
            // own announcement so the directories converge without waiting a
            // full cadence. The floor keeps floods of forged newcomers from
            // turning this into an amplifier.
            if first_sight
                && self
                    .last_announce
                    .map_or(true, |at| at.elapsed() >= REANNOUNCE_FLOOR)
            {
                self.publish_binding(swarm);
            }
        }
    }

    fn handle_status(&mut self, data: &[u8]) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("undecodable frame on {TOPIC_STATUS}: {e}");
                return;
            }
        };
        let message = frame.message;
        if message.from_agent_id == self.address {
            return;
        }
        if message.verify().is_err() {
            tracing::debug!("unverifiable status report from {}", message.from_agent_id);
            return;
        }
        match StatusReport::decode(&message.content) {
            Ok(report) => self.directory.record_status(message.from_agent_id, report),
            Err(e) => tracing::debug!("malformed status payload: {e}"),
        }
    }

    // ========================================================================
    // Registry gate
    // ========================================================================

    /// Lazily consult the registry for `sender` and cache the verdict.
    ///
    /// Acceptance is decided by signature verification; this gate only
    /// rejects a sender *confirmed* ineligible, and only when an on-chain
    /// registry is actually configured. An unreachable registry leaves the
    /// sender unchecked so the next message retries.
    async fn registry_allows(&mut self, sender: Address) -> bool {
        if let Some(eligible) = self.registry_gate.get(&sender) {
            return *eligible || !self.strict_registry;
        }
        match self.registry.agent_info(sender).await {
            Ok(record) => {
                let eligible = record.eligible();
                self.registry_gate.insert(sender, eligible);
                self.directory.set_registry_status(sender, eligible);
                if !eligible {
                    tracing::warn!("registry marks {sender} as ineligible");
                }
                eligible || !self.strict_registry
            }
            Err(RegistryError::NotFound(_)) => {
                // Normal condition for unregistered peers.
                self.registry_gate.insert(sender, false);
                self.directory.set_registry_status(sender, false);
                !self.strict_registry
            }
            Err(e) => {
                tracing::warn!("registry check for {sender} failed: {e} (will retry)");
                true
            }
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Returns true when the node should stop.
    async fn handle_command(
        &mut self,
        swarm: &mut Swarm<MeshBehaviour>,
        cmd: NodeCommand,
    ) -> bool {
        match cmd {
            NodeCommand::Send { to, content, conversation_id, reply_to, reply } => {
                let send = PendingSend { to, content, conversation_id, reply_to, reply };
                match self.directory.lookup(to) {
                    Some(peer) => self.complete_send(swarm, Some(peer), send).await,
                    None => self.start_lookup(swarm, send),
                }
                false
            }
            NodeCommand::ListAgents { reply } => {
                let _ = reply.send(self.directory.snapshot());
                false
            }
            NodeCommand::Stop { reply } => {
                tracing::info!("stop requested");
                self.stop_ack = Some(reply);
                true
            }
            NodeCommand::LookupDeadline(id) => {
                if let Some(pending) = self.pending_lookups.remove(&id) {
                    tracing::debug!("lookup for {} timed out", pending.address);
                    if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
                        if let Some(mut query) = kademlia.query_mut(&id) {
                            query.finish();
                        }
                    }
                    self.fail_sends(pending.sends);
                }
                false
            }
        }
    }

    // ========================================================================
    // Outbound: resolve, encrypt, sign, publish
    // ========================================================================

    fn start_lookup(&mut self, swarm: &mut Swarm<MeshBehaviour>, send: PendingSend) {
        // Piggy-back on a lookup already in flight for the same address.
        if let Some(pending) =
            self.pending_lookups.values_mut().find(|p| p.address == send.to)
        {
            pending.sends.push(send);
            return;
        }
        let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() else {
            self.fail_sends(vec![send]);
            return;
        };
        let address = send.to;
        let query_id = kademlia.get_providers(kad::RecordKey::new(&dht_key(address)));
        self.pending_lookups.insert(query_id, PendingLookup { address, sends: vec![send] });

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DHT_LOOKUP_TIMEOUT).await;
            let _ = cmd_tx.send(NodeCommand::LookupDeadline(query_id)).await;
        });
    }

    async fn complete_send(
        &mut self,
        swarm: &mut Swarm<MeshBehaviour>,
        peer: Option<PeerId>,
        send: PendingSend,
    ) {
        // Best-effort direct connection; the mesh routes either way.
        if let Some(peer) = peer {
            if !swarm.is_connected(&peer) {
                if let Err(e) = swarm.dial(peer) {
                    tracing::debug!("direct dial of {peer} failed: {e}");
                }
            }
        }
        let PendingSend { to, content, conversation_id, reply_to, reply } = send;
        let result = self.send_now(swarm, to, content, conversation_id, reply_to).await;
        if let Err(e) = &result {
            self.emit(P2PEvent::Error { code: e.code().into(), message: e.to_string() });
        }
        let _ = reply.send(result);
    }

    async fn send_now(
        &mut self,
        swarm: &mut Swarm<MeshBehaviour>,
        to: Address,
        content: Vec<u8>,
        conversation_id: Option<String>,
        reply_to: Option<String>,
    ) -> Result<String, SendError> {
        let (content, encrypted) = if self.config.use_encryption {
            let key = self
                .registry
                .encryption_key(to)
                .await
                .map_err(|e| SendError::Encryption(e.to_string()))?;
            let ciphertext = ecies::encrypt(&key, &content)
                .map_err(|e| SendError::Encryption(e.to_string()))?;
            (ciphertext, true)
        } else {
            (content, false)
        };

        let message = SignedMessage::build(
            &self.keys,
            Some(to),
            content,
            encrypted,
            conversation_id,
            reply_to,
        )
        .map_err(|e| SendError::PublishFailed(e.to_string()))?;
        let message_id = message.message_id.clone();
        let bytes = Frame::new(message)
            .encode()
            .map_err(|e| SendError::PublishFailed(e.to_string()))?;

        self.publish(swarm, TOPIC_MESSAGES, bytes)?;
        self.messages_sent += 1;
        tracing::debug!("sent {message_id} to {to}");
        Ok(message_id)
    }

    fn fail_sends(&mut self, sends: Vec<PendingSend>) {
        for send in sends {
            let err = SendError::NoRoute(send.to);
            self.emit(P2PEvent::Error { code: err.code().into(), message: err.to_string() });
            let _ = send.reply.send(Err(err));
        }
    }

    /// Publish raw bytes on a topic. `Ok(true)` means at least one mesh peer
    /// received it; `Ok(false)` means the role policy tolerated an empty
    /// mesh.
    fn publish(
        &mut self,
        swarm: &mut Swarm<MeshBehaviour>,
        topic: &str,
        bytes: Vec<u8>,
    ) -> Result<bool, SendError> {
        let Some(gossipsub) = swarm.behaviour_mut().gossipsub.as_mut() else {
            return Err(SendError::PublishFailed("gossip disabled for this role".into()));
        };
        match gossipsub.publish(gossipsub::IdentTopic::new(topic), bytes) {
            Ok(_) => Ok(true),
            Err(gossipsub::PublishError::InsufficientPeers)
                if self.policy.allow_publish_to_zero_peers =>
            {
                tracing::debug!("published to empty mesh on {topic}");
                Ok(false)
            }
            Err(e) => Err(SendError::PublishFailed(format!("{e:?}"))),
        }
    }

    // ========================================================================
    // Periodic tasks
    // ========================================================================

    /// Publish our own `address → peer id` binding: a DHT provider record
    /// plus a signed announcement.
    fn publish_binding(&mut self, swarm: &mut Swarm<MeshBehaviour>) {
        self.last_announce = Some(Instant::now());
        let key = dht_key(self.address);
        if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
            if let Err(e) = kademlia.start_providing(kad::RecordKey::new(&key)) {
                tracing::warn!("DHT provide of {key} failed: {e}");
            }
        }
        if !self.policy.enable_gossip {
            return;
        }

        let multiaddrs: Vec<String> = swarm
            .listeners()
            .chain(swarm.external_addresses())
            .map(|a| a.to_string())
            .collect();
        let announcement = Announcement {
            peer_id: self.peer_id.to_string(),
            address: self.address,
            name: self.config.agent_name.clone(),
            multiaddrs,
            timestamp: now_ms(),
        };

        let frame = announcement
            .encode()
            .and_then(|content| {
                SignedMessage::build(&self.keys, None, content, false, None, None)
            })
            .and_then(|message| Frame::new(message).encode());
        match frame {
            Ok(bytes) => match self.publish(swarm, TOPIC_ANNOUNCEMENTS, bytes) {
                Ok(delivered) => self.announced = self.announced || delivered,
                Err(e) => tracing::warn!("announcement publish failed: {e}"),
            },
            Err(e) => tracing::warn!("announcement build failed: {e}"),
        }
    }

    /// Broadcast a signed status report with current node telemetry.
    fn publish_status(&mut self, swarm: &mut Swarm<MeshBehaviour>) {
        if !self.policy.enable_gossip {
            return;
        }
        let connected_peers = swarm.network_info().num_peers();
        let multiaddrs: Vec<String> = swarm.listeners().map(|a| a.to_string()).collect();
        let routing_table_size = swarm
            .behaviour_mut()
            .kademlia
            .as_mut()
            .map(|k| k.kbuckets().map(|bucket| bucket.num_entries()).sum())
            .unwrap_or(0);

        let report = StatusReport {
            peer_id: self.peer_id.to_string(),
            metrics: StatusMetrics {
                connected_peers,
                messages_sent: self.messages_sent,
                messages_received: self.messages_received,
                uptime_sec: self.started_at.elapsed().as_secs(),
                routing_table_size,
                multiaddrs,
                is_bootstrap: self.role == NodeRole::Bootstrap,
                last_message_ms: self.last_message_ms,
            },
        };

        let frame = report
            .encode()
            .and_then(|content| {
                SignedMessage::build(&self.keys, None, content, false, None, None)
            })
            .and_then(|message| Frame::new(message).encode());
        match frame {
            Ok(bytes) => {
                if let Err(e) = self.publish(swarm, TOPIC_STATUS, bytes) {
                    tracing::debug!("status publish failed: {e}");
                }
            }
            Err(e) => tracing::warn!("status build failed: {e}"),
        }
    }

    /// Keep at least `minConnections` alive by re-dialing bootstrap peers.
    fn maintain_connections(&mut self, swarm: &mut Swarm<MeshBehaviour>) {
        let connected = swarm.network_info().num_peers();
        if connected >= self.policy.min_connections {
            return;
        }
        tracing::debug!(
            "below minimum connectivity ({connected}/{}); re-dialing bootstrap peers",
            self.policy.min_connections,
        );
        let dials = self.policy.max_parallel_dials;
        for addr in self.bootstrap_peers.iter().take(dials) {
            if let Some(peer) = peer_id_from_multiaddr(addr) {
                if swarm.is_connected(&peer) {
                    continue;
                }
            }
            let _ = swarm.dial(addr.clone());
        }
    }

    fn emit(&self, event: P2PEvent) {
        // Lossy fan-out: no subscribers, or a full buffer on a slow one, is
        // not an error here.
        let _ = self.events.send(event);
    }
}

fn pinned_keypair(secret_hex: &str) -> anyhow::Result<libp2p::identity::Keypair> {
    let stripped = secret_hex.strip_prefix("0x").unwrap_or(secret_hex);
    let mut bytes: [u8; 32] = hex::decode(stripped)?
        .try_into()
        .map_err(|_| anyhow::anyhow!("bootstrap key must be 32 bytes"))?;
    let secret = libp2p::identity::ed25519::SecretKey::try_from_bytes(&mut bytes)?;
    Ok(libp2p::identity::Keypair::from(libp2p::identity::ed25519::Keypair::from(secret)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_keypair_is_deterministic() {
        let secret = "11".repeat(32);
        let a = pinned_keypair(&secret).unwrap().public().to_peer_id();
        let b = pinned_keypair(&secret).unwrap().public().to_peer_id();
        assert_eq!(a, b);
    }

    #[test]
    fn pinned_keypair_rejects_short_secret() {
        assert!(pinned_keypair("abcd").is_err());
    }

    #[test]
    fn send_error_codes() {
        let addr = Address::from_bytes([0u8; 20]);
        assert_eq!(SendError::NoRoute(addr).code(), "NO_ROUTE");
        assert_eq!(SendError::Encryption(String::new()).code(), "ENCRYPTION_FAILED");
        assert_eq!(SendError::PublishFailed(String::new()).code(), "PUBLISH_FAILED");
    }
}

use std::num::{NonZeroU8, NonZeroUsize};
use std::time::Duration;

use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{gossipsub, identify, kad, noise, tcp, yamux, Multiaddr, PeerId, Swarm};

use agentmesh_protocol::{MAX_MESSAGE_SIZE, TOPIC_ANNOUNCEMENTS, TOPIC_MESSAGES, TOPIC_STATUS};

use crate::role::RolePolicy;

/// Identify protocol string for the overlay.
pub const IDENTIFY_PROTOCOL: &str = "/agentmesh/id/1.0.0";

/// Ceiling for DHT queries that are not individually capped by callers.
const DHT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Kademlia's fixed bucket width; the policy's kBucketSize is mapped onto
/// the replication factor and capped here.
const KAD_K: usize = 20;

// ============================================================================
// Combined behaviour
// ============================================================================

#[derive(NetworkBehaviour)]
pub struct MeshBehaviour {
    /// Gossip mesh for the three overlay topics. Disabled for LIGHT roles.
    pub gossipsub: Toggle<gossipsub::Behaviour>,
    /// Peer and binding discovery. Disabled for LIGHT roles.
    pub kademlia: Toggle<kad::Behaviour<kad::store::MemoryStore>>,
    pub identify: identify::Behaviour,
}

// ============================================================================
// Swarm builder
// ============================================================================

/// Build the libp2p swarm for the given role policy and start listening.
///
/// Bootstrap multiaddrs that carry a `/p2p/` component are pre-seeded into
/// the Kademlia routing table so the first queries have somewhere to go.
pub fn build_swarm(
    keypair: libp2p::identity::Keypair,
    policy: &RolePolicy,
    bootstrap_peers: &[Multiaddr],
    listen_addr: Multiaddr,
) -> anyhow::Result<Swarm<MeshBehaviour>> {
    let policy = policy.clone();
    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
        .with_dns()?
        .with_behaviour(|key| {
            let peer_id = key.public().to_peer_id();

            let gossipsub = if policy.enable_gossip {
                let gossip_cfg = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(policy.gossip_heartbeat)
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .max_transmit_size(MAX_MESSAGE_SIZE)
                    .build()
                    .expect("static gossipsub config is valid");
                let mut gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossip_cfg,
                )
                .expect("gossipsub init");
                // Pre-seed the bootstrap fleet as direct peers: always
                // forwarded to, never pruned from the mesh.
                for addr in bootstrap_peers {
                    if let Some(peer) = peer_id_from_multiaddr(addr) {
                        gossipsub.add_explicit_peer(&peer);
                    }
                }
                Some(gossipsub)
            } else {
                None
            };

            let kademlia = if policy.enable_dht {
                let mut kad_cfg = kad::Config::new(kad::PROTOCOL_NAME);
                kad_cfg.set_query_timeout(DHT_QUERY_TIMEOUT);
                if let Some(replication) = NonZeroUsize::new(policy.k_bucket_size.min(KAD_K)) {
                    kad_cfg.set_replication_factor(replication);
                }
                let store = kad::store::MemoryStore::new(peer_id);
                let mut kademlia = kad::Behaviour::with_config(peer_id, store, kad_cfg);
                kademlia.set_mode(Some(if policy.dht_server_mode {
                    kad::Mode::Server
                } else {
                    kad::Mode::Client
                }));
                for addr in bootstrap_peers {
                    if let Some(peer) = peer_id_from_multiaddr(addr) {
                        kademlia.add_address(&peer, addr.clone());
                    }
                }
                Some(kademlia)
            } else {
                None
            };

            let identify = identify::Behaviour::new(identify::Config::new(
                IDENTIFY_PROTOCOL.to_string(),
                key.public(),
            ));

            MeshBehaviour {
                gossipsub: Toggle::from(gossipsub),
                kademlia: Toggle::from(kademlia),
                identify,
            }
        })?
        .with_swarm_config(|cfg| {
            let dials = NonZeroU8::new(policy.max_parallel_dials.min(u8::MAX as usize) as u8)
                .unwrap_or(NonZeroU8::MIN);
            cfg.with_idle_connection_timeout(Duration::from_secs(60))
                .with_dial_concurrency_factor(dials)
        })
        .build();

    if let Some(gossipsub) = swarm.behaviour_mut().gossipsub.as_mut() {
        for topic in [TOPIC_MESSAGES, TOPIC_ANNOUNCEMENTS, TOPIC_STATUS] {
            gossipsub.subscribe(&gossipsub::IdentTopic::new(topic))?;
        }
    }

    swarm.listen_on(listen_addr)?;
    Ok(swarm)
}

/// Extract the `/p2p/<peer-id>` component of a multiaddr, if present.
pub fn peer_id_from_multiaddr(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|proto| {
        if let libp2p::multiaddr::Protocol::P2p(peer_id) = proto {
            Some(peer_id)
        } else {
            None
        }
    })
}

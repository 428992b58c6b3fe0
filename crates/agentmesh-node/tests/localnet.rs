//! End-to-end scenarios on localhost: a local bootstrap peer, a shared
//! in-memory registry, and full nodes exchanging signed (and optionally
//! encrypted) messages over the gossip mesh.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use libp2p::{gossipsub, Multiaddr};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use agentmesh_node::network::build_swarm;
use agentmesh_node::{Config, MeshNode, NodeHandle, NodeRole, P2PEvent, RolePolicy, SendError};
use agentmesh_protocol::{Address, AgentKeys, Frame, SignedMessage, TOPIC_MESSAGES};
use agentmesh_registry::MemoryRegistry;

/// Unique port per test node so parallel tests never collide.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(41200);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(30);
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(15);
const SILENCE_WINDOW: Duration = Duration::from_secs(3);

struct TestNode {
    address: Address,
    port: u16,
    handle: NodeHandle,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestNode {
    fn multiaddr(&self) -> Multiaddr {
        format!("/ip4/127.0.0.1/tcp/{}/p2p/{}", self.port, self.handle.peer_id())
            .parse()
            .expect("valid test multiaddr")
    }
}

fn test_config(role: NodeRole, port: u16, bootstrap: Vec<Multiaddr>, secret: &[u8; 32]) -> Config {
    Config {
        private_key: hex::encode(secret),
        registry_address: None,
        rpc_url: "http://127.0.0.1:8545".into(),
        network: "sepolia".into(),
        node_type: role,
        port,
        agent_name: format!("test-agent-{port}"),
        bootstrap_name: None,
        use_encryption: false,
        bootstrap_private_key: None,
        api_addr: None,
        bootstrap,
        no_default_bootstrap: true,
    }
}

fn spawn_node(
    role: NodeRole,
    bootstrap: Vec<Multiaddr>,
    registry: &MemoryRegistry,
    use_encryption: bool,
) -> TestNode {
    let secret: [u8; 32] = rand::random();
    let keys = Arc::new(AgentKeys::from_secret(secret).expect("random secret is valid"));
    let address = keys.address();
    let port = next_port();

    let mut config = test_config(role, port, bootstrap, &secret);
    config.use_encryption = use_encryption;

    let registry = Arc::new(registry.for_agent(address));
    let (node, handle, swarm) = MeshNode::new(config, keys, registry).expect("node assembles");
    let task = tokio::spawn(node.run(swarm));
    TestNode { address, port, handle, task }
}

async fn spawn_ready(
    role: NodeRole,
    bootstrap: Vec<Multiaddr>,
    registry: &MemoryRegistry,
    use_encryption: bool,
) -> TestNode {
    let node = spawn_node(role, bootstrap, registry, use_encryption);
    assert!(node.handle.wait_ready().await, "node failed to start");
    node
}

fn shared_registry() -> MemoryRegistry {
    MemoryRegistry::new(Address::from_bytes([0u8; 20]))
}

/// Poll ListAgents until `address` appears.
async fn wait_for_agent(handle: &NodeHandle, address: Address) -> bool {
    let wanted = address.to_string();
    let deadline = Instant::now() + CONVERGE_TIMEOUT;
    while Instant::now() < deadline {
        if handle.list_agents().await.iter().any(|a| a.agent_id == wanted) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    false
}

/// The next Message event on a stream, skipping everything else.
async fn next_message(
    rx: &mut broadcast::Receiver<P2PEvent>,
    wait: Duration,
) -> Option<(String, String, String, String)> {
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return None,
            event = rx.recv() => match event {
                Ok(P2PEvent::Message { message_id, from, to, content, .. }) => {
                    return Some((message_id, from, to, content));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            },
        }
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn plaintext_delivery_between_full_nodes() {
    let registry = shared_registry();
    let b0 = spawn_ready(NodeRole::Bootstrap, vec![], &registry, false).await;
    let boot = vec![b0.multiaddr()];

    let a = spawn_ready(NodeRole::Full, boot.clone(), &registry, false).await;
    let b = spawn_ready(NodeRole::Full, boot.clone(), &registry, false).await;
    let mut b_events = b.handle.subscribe();

    assert!(wait_for_agent(&a.handle, b.address).await, "A never discovered B");

    let message_id = a
        .handle
        .send_message(b.address, b"hello".to_vec(), None, None)
        .await
        .expect("send succeeds");
    assert!(!message_id.is_empty());

    let (received_id, from, to, content) = next_message(&mut b_events, DELIVERY_TIMEOUT)
        .await
        .expect("B receives the message");
    assert_eq!(received_id, message_id);
    assert_eq!(from, a.address.to_string());
    assert_eq!(to, b.address.to_string());
    assert_eq!(content, "hello");

    a.handle.stop().await;
    b.handle.stop().await;
    b0.handle.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn encrypted_delivery_round_trips() {
    let registry = shared_registry();
    let b0 = spawn_ready(NodeRole::Bootstrap, vec![], &registry, false).await;
    let boot = vec![b0.multiaddr()];

    // Both ends opt into encryption; each registered its publicKey at
    // startup, so A can fetch B's key from the shared registry.
    let a = spawn_ready(NodeRole::Full, boot.clone(), &registry, true).await;
    let b = spawn_ready(NodeRole::Full, boot.clone(), &registry, true).await;
    let mut b_events = b.handle.subscribe();

    assert!(wait_for_agent(&a.handle, b.address).await, "A never discovered B");

    let message_id = a
        .handle
        .send_message(b.address, b"attack at dawn".to_vec(), None, None)
        .await
        .expect("encrypted send succeeds");

    let (received_id, from, _, content) = next_message(&mut b_events, DELIVERY_TIMEOUT)
        .await
        .expect("B decrypts and receives");
    assert_eq!(received_id, message_id);
    assert_eq!(from, a.address.to_string());
    assert_eq!(content, "attack at dawn");

    a.handle.stop().await;
    b.handle.stop().await;
    b0.handle.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_recipient_stays_silent() {
    let registry = shared_registry();
    let b0 = spawn_ready(NodeRole::Bootstrap, vec![], &registry, false).await;
    let boot = vec![b0.multiaddr()];

    let a = spawn_ready(NodeRole::Full, boot.clone(), &registry, false).await;
    let b = spawn_ready(NodeRole::Full, boot.clone(), &registry, false).await;
    let c = spawn_ready(NodeRole::Full, boot.clone(), &registry, false).await;
    let mut b_events = b.handle.subscribe();
    let mut c_events = c.handle.subscribe();

    assert!(wait_for_agent(&a.handle, c.address).await, "A never discovered C");

    a.handle
        .send_message(c.address, b"hi".to_vec(), None, None)
        .await
        .expect("send succeeds");

    // C, the addressee, gets it; B sees the frame on the mesh but must not
    // surface it.
    let (_, _, to, content) = next_message(&mut c_events, DELIVERY_TIMEOUT)
        .await
        .expect("C receives the message");
    assert_eq!(to, c.address.to_string());
    assert_eq!(content, "hi");
    assert!(
        next_message(&mut b_events, SILENCE_WINDOW).await.is_none(),
        "B must not deliver a message addressed to C",
    );

    a.handle.stop().await;
    b.handle.stop().await;
    c.handle.stop().await;
    b0.handle.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tampered_signature_is_dropped() {
    let registry = shared_registry();
    let b0 = spawn_ready(NodeRole::Bootstrap, vec![], &registry, false).await;
    let boot = vec![b0.multiaddr()];

    let b = spawn_ready(NodeRole::Full, boot.clone(), &registry, false).await;
    let mut b_events = b.handle.subscribe();

    // A rogue publisher built from the same networking stack, injecting a
    // frame whose signature has one flipped byte.
    let rogue_keys = AgentKeys::generate();
    let mut message = SignedMessage::build(
        &rogue_keys,
        Some(b.address),
        b"forged".to_vec(),
        false,
        None,
        None,
    )
    .unwrap();
    let mut sig = hex::decode(message.signature.strip_prefix("0x").unwrap()).unwrap();
    sig[0] ^= 0xFF;
    message.signature = format!("0x{}", hex::encode(sig));
    let tampered = Frame::new(message).encode().unwrap();

    let policy = RolePolicy::for_role(NodeRole::Full);
    let mut rogue = build_swarm(
        libp2p::identity::Keypair::generate_ed25519(),
        &policy,
        &[],
        format!("/ip4/127.0.0.1/tcp/{}", next_port()).parse().unwrap(),
    )
    .unwrap();
    rogue.dial(b0.multiaddr()).unwrap();

    // Drive the rogue swarm until the injection goes out on the mesh.
    let mut publish_timer = tokio::time::interval(Duration::from_millis(500));
    let give_up = tokio::time::sleep(Duration::from_secs(20));
    tokio::pin!(give_up);
    let mut published = false;
    while !published {
        tokio::select! {
            _ = &mut give_up => panic!("rogue publisher never reached the mesh"),
            _ = rogue.select_next_some() => {}
            _ = publish_timer.tick() => {
                if let Some(gs) = rogue.behaviour_mut().gossipsub.as_mut() {
                    published = gs
                        .publish(gossipsub::IdentTopic::new(TOPIC_MESSAGES), tampered.clone())
                        .is_ok();
                }
            }
        }
    }

    // Keep the rogue alive long enough for the frame to propagate.
    let flush = tokio::time::sleep(SILENCE_WINDOW);
    tokio::pin!(flush);
    loop {
        tokio::select! {
            _ = &mut flush => break,
            _ = rogue.select_next_some() => {}
        }
    }

    assert!(
        next_message(&mut b_events, SILENCE_WINDOW).await.is_none(),
        "a tampered message must never reach the stream",
    );

    b.handle.stop().await;
    b0.handle.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn directory_converges_across_three_nodes() {
    let registry = shared_registry();
    let b0 = spawn_ready(NodeRole::Bootstrap, vec![], &registry, false).await;
    let boot = vec![b0.multiaddr()];

    let a = spawn_ready(NodeRole::Full, boot.clone(), &registry, false).await;
    let b = spawn_ready(NodeRole::Full, boot.clone(), &registry, false).await;
    let d = spawn_ready(NodeRole::Full, boot.clone(), &registry, false).await;

    assert!(wait_for_agent(&a.handle, b.address).await, "A never discovered B");
    assert!(wait_for_agent(&a.handle, d.address).await, "A never discovered D");

    let agents = a.handle.list_agents().await;
    for wanted in [b.address, d.address] {
        let row = agents
            .iter()
            .find(|row| row.agent_id == wanted.to_string())
            .expect("agent row present");
        assert!(!row.peer_id.is_empty());
        assert!(!row.agent_name.is_empty());
    }
    // A's own address never shows up in its directory.
    assert!(agents.iter().all(|row| row.agent_id != a.address.to_string()));

    a.handle.stop().await;
    b.handle.stop().await;
    d.handle.stop().await;
    b0.handle.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn full_node_without_bootstrap_fails_startup() {
    let registry = shared_registry();
    let node = spawn_node(NodeRole::Full, vec![], &registry, false);

    let result = timeout(Duration::from_secs(30), node.task)
        .await
        .expect("startup failure must land within the retry budget")
        .expect("node task not cancelled");
    assert!(result.is_err(), "a FULL node with no bootstrap peers must not start");
}

#[tokio::test(flavor = "multi_thread")]
async fn light_node_neither_announces_nor_publishes() {
    let registry = shared_registry();
    let b0 = spawn_ready(NodeRole::Bootstrap, vec![], &registry, false).await;
    let boot = vec![b0.multiaddr()];

    let light = spawn_ready(NodeRole::Light, boot.clone(), &registry, false).await;

    // The light node dialed the bootstrap, but with gossip and DHT off its
    // binding never reaches anyone's directory.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let seen = b0.handle.list_agents().await;
    assert!(seen.iter().all(|row| row.agent_id != light.address.to_string()));

    // And an outbound send cannot resolve a route.
    let err = light
        .handle
        .send_message(b0.address, b"ping".to_vec(), None, None)
        .await
        .expect_err("light node send must fail");
    assert!(matches!(err, SendError::NoRoute(_)));

    light.handle.stop().await;
    b0.handle.stop().await;
}

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde_json::json;
use time::OffsetDateTime;
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tonic::{async_trait, Status};

use super::{periodic, shutdown_signal, MembershipDriver};
use crate::{
    cluster::EndNodeClusterManager,
    codec::MessageCodec,
    config::StaticNode,
    engine::{MemoryEngine, ProxyEngine, User},
    error::ResponseCode,
    fanout::{Operation, OperationResponse},
    grpc::{client::MembershipClient, protos, NodeTransport, RpcMethod, StatusResponse},
    node::{Node, NodeIdentity},
    CenterNode, EndNode, EndNodeBuilder,
};

const TOKEN: &str = "cluster-secret";

/// Polls `$check` until it holds, failing the test after ten seconds.
macro_rules! eventually {
    ($what:expr, $check:expr) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if $check {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting until {}",
                $what
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }};
}

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn identity(name: &str, port: u16) -> NodeIdentity {
    NodeIdentity::new(name, "127.0.0.1", port, "prod")
}

fn static_node(name: &str, port: u16) -> StaticNode {
    StaticNode {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port,
    }
}

fn fast(builder: EndNodeBuilder) -> EndNodeBuilder {
    builder
        .with_heartbeat_interval(Duration::from_millis(300))
        .with_rpc_timeout(Duration::from_millis(250))
        .with_eviction_interval(Duration::from_secs(1))
}

async fn start(
    name: &str,
    token: &str,
    (listener, port): (TcpListener, u16),
    configure: impl FnOnce(EndNodeBuilder) -> EndNodeBuilder,
) -> (EndNode, JoinHandle<Result<(), tonic::transport::Error>>) {
    let builder = fast(EndNode::builder(identity(name, port), token));
    let node = configure(builder).build().await.unwrap();
    let server = tokio::spawn(node.serve(listener));
    (node, server)
}

async fn registered_with(node: &EndNode, peer: &str) -> bool {
    node.cluster_manager()
        .cluster()
        .nodes()
        .get(peer)
        .await
        .map_or(false, |n| n.registered_remote())
}

async fn stop(node: EndNode, server: JoinHandle<Result<(), tonic::transport::Error>>) {
    node.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn static_peers_register_with_each_other() {
    let (la, lb) = (listener().await, listener().await);
    let b_port = lb.1;
    let (a, a_server) = start("a", TOKEN, la, |b| b.with_static_nodes(&[static_node("b", b_port)])).await;
    let (b, b_server) = start("b", TOKEN, lb, |b| b).await;

    eventually!("a is registered with b", registered_with(&a, "b").await);
    // b learned about a from its registration and registers back
    eventually!("b is registered with a", registered_with(&b, "a").await);

    let a_on_b = b.cluster_manager().cluster().nodes().get("a").await.unwrap();
    assert!(a_on_b.registered_local());
    assert!(!a_on_b.is_local());
    assert!(a.all_nodes().await[0].is_local());

    stop(a, a_server).await;
    stop(b, b_server).await;
}

#[tokio::test]
async fn peers_are_discovered_through_a_common_peer() {
    let (la, lb, lc) = (listener().await, listener().await, listener().await);
    let b_port = lb.1;
    let (a, a_server) = start("a", TOKEN, la, |b| b.with_static_nodes(&[static_node("b", b_port)])).await;
    let (b, b_server) = start("b", TOKEN, lb, |b| b).await;
    let (c, c_server) = start("c", TOKEN, lc, |b| b.with_static_nodes(&[static_node("b", b_port)])).await;

    eventually!("a is registered with c", registered_with(&a, "c").await);
    eventually!("c is registered with a", registered_with(&c, "a").await);
    assert_eq!(a.node_names().await, vec!["b".to_string(), "c".to_string()]);
    assert!(!a.cluster_manager().cluster().nodes().get("c").await.unwrap().is_local());

    stop(a, a_server).await;
    stop(b, b_server).await;
    stop(c, c_server).await;
}

#[tokio::test]
async fn peers_are_discovered_through_the_center() {
    let (center_listener, center_port) = listener().await;
    let center = CenterNode::builder("center")
        .with_cluster("prod", TOKEN)
        .with_cluster("staging", "other-secret")
        .build()
        .await
        .unwrap();
    let center_server = tokio::spawn(center.serve(center_listener));

    let (la, lb) = (listener().await, listener().await);
    let (a, a_server) = start("a", TOKEN, la, |b| b.with_center(identity("center", center_port))).await;
    let (b, b_server) = start("b", TOKEN, lb, |b| b.with_center(identity("center", center_port))).await;

    eventually!("a is registered with b", registered_with(&a, "b").await);
    eventually!("b is registered with a", registered_with(&b, "a").await);
    assert!(a.center_node().await.unwrap().registered_remote());
    // the center is contacted like a peer but never becomes one
    assert_eq!(a.node_names().await, vec!["b".to_string()]);

    let manager = center.cluster_manager();
    let prod = manager.cluster("prod").await.unwrap();
    assert_eq!(prod.nodes().len().await, 2);
    assert!(manager.cluster("staging").await.unwrap().nodes().is_empty().await);

    stop(a, a_server).await;
    stop(b, b_server).await;
    center.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), center_server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn wrong_cluster_token_is_quarantined() {
    let (la, lb) = (listener().await, listener().await);
    let b_port = lb.1;
    let (intruder, intruder_server) = start("a", "guessed-secret", la, |b| {
        b.with_static_nodes(&[static_node("b", b_port)])
    })
    .await;
    let (b, b_server) = start("b", TOKEN, lb, |b| b).await;

    let cluster = Arc::clone(b.cluster_manager().cluster());
    eventually!(
        "the intruder is quarantined",
        cluster.get_node_from_wrong_node_list("a").await.is_some()
    );
    assert!(!cluster.nodes().contains("a").await);
    assert!(!registered_with(&intruder, "b").await);

    stop(intruder, intruder_server).await;
    stop(b, b_server).await;
}

#[tokio::test]
async fn operations_reach_registered_peers() {
    let (la, lb) = (listener().await, listener().await);
    let b_port = lb.1;
    let b_engine = Arc::new(MemoryEngine::new());
    let (a, a_server) = start("a", TOKEN, la, |b| b.with_static_nodes(&[static_node("b", b_port)])).await;
    let (b, b_server) = start("b", TOKEN, lb, |builder| {
        builder.with_proxy_engine(Arc::clone(&b_engine) as Arc<dyn ProxyEngine>)
    })
    .await;
    eventually!("a is registered with b", registered_with(&a, "b").await);

    let targets = ["b".to_string(), "ghost".to_string()];
    let inbound = json!({"inbound": {"tag": "vmess-in", "protocol": "vmess", "port": 10086}});
    let result = a.fan_out(Operation::AddInbound, &inbound, &targets).await.unwrap();
    assert_eq!(result.succeeded["b"], OperationResponse::Done);
    assert_eq!(result.failed["ghost"], "node ghost not exist");

    let users = json!({"users": [{"email": "x@example.com", "protocol": "vmess", "inbound_tag": "vmess-in"}]});
    let result = a.fan_out(Operation::AddUsers, &users, &targets[..1]).await.unwrap();
    assert!(result.all_succeeded());
    assert_eq!(b_engine.user_count().await, 1);

    let result = a
        .fan_out(Operation::GetUsers, &json!({"inbound_tag": "vmess-in"}), &targets[..1])
        .await
        .unwrap();
    assert_eq!(
        result.succeeded["b"],
        OperationResponse::Users(vec![User {
            email: "x@example.com".to_string(),
            protocol: "vmess".to_string(),
            inbound_tag: "vmess-in".to_string(),
            account: serde_json::Value::Null,
        }])
    );

    // a runs no engine of its own, so b's calls to a fail on a's side
    eventually!("b is registered with a", registered_with(&b, "a").await);
    let result = b
        .fan_out_all(Operation::GetStats, &json!({}))
        .await
        .unwrap();
    assert!(result.failed["a"].contains("OperationFailed(500)"));

    stop(a, a_server).await;
    stop(b, b_server).await;
}

#[tokio::test]
async fn periodic_runs_until_shutdown() {
    let (shutdown, receiver) = watch::channel(false);
    let ticks = Arc::new(AtomicUsize::new(0));
    let task = {
        let ticks = Arc::clone(&ticks);
        tokio::spawn(periodic(Duration::from_millis(10), receiver, move || {
            let ticks = Arc::clone(&ticks);
            async move {
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        }))
    };

    eventually!("a few ticks ran", ticks.load(Ordering::SeqCst) >= 3);
    shutdown.send_replace(true);
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    let after = ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), after);
}

#[tokio::test]
async fn dropping_the_sender_also_stops() {
    let (shutdown, receiver) = watch::channel(false);
    let signal = tokio::spawn(shutdown_signal(receiver.clone()));
    let task = tokio::spawn(periodic(Duration::from_secs(3600), receiver, || async {}));
    drop(shutdown);
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(1), signal).await.unwrap().unwrap();
}

/// How a scripted peer answers membership calls.
#[derive(Clone, Copy)]
enum Peer {
    Unreachable,
    // drops heartbeats with 104, accepts registrations
    Forgetful,
}

/// Answers membership calls per target and records which method each target saw.
struct ScriptedTransport {
    peers: HashMap<String, Peer>,
    calls: Mutex<Vec<(String, RpcMethod)>>,
}

impl ScriptedTransport {
    fn new(peers: &[(&str, Peer)]) -> Self {
        Self {
            peers: peers.iter().map(|(name, peer)| (name.to_string(), *peer)).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn take_calls(&self) -> HashMap<String, RpcMethod> {
        self.calls.lock().unwrap().drain(..).collect()
    }
}

#[async_trait]
impl NodeTransport for ScriptedTransport {
    async fn unary(
        &self,
        target: &NodeIdentity,
        method: RpcMethod,
        request: protos::SealedMessage,
    ) -> Result<protos::SealedMessage, Status> {
        self.calls.lock().unwrap().push((target.name.clone(), method));
        let codec = MessageCodec::cluster(TOKEN);
        match (self.peers[&target.name], method) {
            (Peer::Unreachable, _) => Err(Status::unavailable("connection refused")),
            (Peer::Forgetful, RpcMethod::Heartbeat) => {
                let _: protos::HeartbeatRequest = codec.open(&request).unwrap();
                let reply = protos::HeartbeatResponse::failure(
                    ResponseCode::NodeDropped,
                    "node a not exist".to_string(),
                );
                Ok(codec.seal(&target.cluster_name, &target.name, &reply).unwrap())
            }
            (Peer::Forgetful, _) => {
                let _: protos::RegisterRequest = codec.open(&request).unwrap();
                let reply = protos::RegisterResponse {
                    code: ResponseCode::Ok.into(),
                    msg: String::new(),
                    token: format!("fresh-{}", target.name),
                };
                Ok(codec.seal(&target.cluster_name, &target.name, &reply).unwrap())
            }
        }
    }
}

fn registered_peer(name: &str, is_local: bool, reported_at: OffsetDateTime) -> Node {
    let identity = NodeIdentity::new(name, "10.0.0.2", 5000, "prod");
    let mut node = if is_local {
        Node::local(identity, reported_at)
    } else {
        Node::new(identity, reported_at)
    };
    node.set_out_token(format!("old-{}", name));
    node.touch_report_heartbeat(reported_at);
    node
}

#[tokio::test]
async fn failed_contacts_fall_back_to_registration() {
    let reported_at = OffsetDateTime::now_utc() - time::Duration::seconds(30);
    let manager = Arc::new(EndNodeClusterManager::new(
        NodeIdentity::new("a", "10.0.0.1", 5000, "prod"),
        TOKEN,
    ));
    let nodes = manager.cluster().nodes();
    nodes.add("static", registered_peer("static", true, reported_at)).await;
    nodes.add("learned", registered_peer("learned", false, reported_at)).await;

    let transport = Arc::new(ScriptedTransport::new(&[
        ("static", Peer::Unreachable),
        ("learned", Peer::Forgetful),
    ]));
    let client = MembershipClient::new(
        Arc::clone(&transport) as Arc<dyn NodeTransport>,
        manager.this_node().clone(),
        TOKEN.to_string(),
        Duration::from_secs(1),
    );
    let driver = Arc::new(MembershipDriver::new(Arc::clone(&manager), client));

    driver.heartbeat_cycle().await;
    let calls = transport.take_calls();
    assert_eq!(calls["static"], RpcMethod::Heartbeat);
    assert_eq!(calls["learned"], RpcMethod::Heartbeat);

    let static_peer = nodes.get("static").await.unwrap();
    assert_eq!(static_peer.out_token(), "");
    assert!(static_peer.report_heartbeat_time().unwrap() > reported_at);
    assert!(!static_peer.registered_remote());

    let learned = nodes.get("learned").await.unwrap();
    assert_eq!(learned.out_token(), "");
    assert_eq!(learned.report_heartbeat_time(), Some(reported_at));

    driver.heartbeat_cycle().await;
    let calls = transport.take_calls();
    assert_eq!(calls["static"], RpcMethod::RegisterNode);
    assert_eq!(calls["learned"], RpcMethod::RegisterNode);
    let learned = nodes.get("learned").await.unwrap();
    assert_eq!(learned.out_token(), "fresh-learned");
    assert!(learned.registered_remote());
}

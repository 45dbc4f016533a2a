use std::{sync::Arc, time::Duration};

use log::LevelFilter;
use proxyfleet::{
    engine::{MemoryEngine, ProxyEngine},
    fanout::Operation,
    node::NodeIdentity,
    CenterNode, EndNode,
};
use serde_json::json;
use simplelog::{ConfigBuilder, SimpleLogger};
use tokio::net::TcpListener;

const CLUSTER: &str = "demo";
const TOKEN: &str = "demo-cluster-secret";

#[tokio::main]
pub async fn main() {
    let _ = SimpleLogger::init(
        LevelFilter::Debug,
        ConfigBuilder::new()
            .add_filter_ignore_str("h2::codec")
            .add_filter_ignore_str("tower::buffer")
            .add_filter_ignore_str("hyper")
            .build(),
    );

    let number_of_nodes_to_start: usize = std::env::args()
        .find_map(|arg| arg.parse::<usize>().ok().filter(|n| *n > 1 && *n <= 50))
        .unwrap_or(3);

    let center_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let center_port = center_listener.local_addr().unwrap().port();
    let center = CenterNode::builder("center")
        .with_cluster(CLUSTER, TOKEN)
        .build()
        .await
        .unwrap();
    tokio::spawn(center.serve(center_listener));
    log::info!("Center listening on 127.0.0.1:{}", center_port);

    log::info!("Starting {} end nodes", number_of_nodes_to_start);
    let mut nodes = Vec::with_capacity(number_of_nodes_to_start);
    for i in 0..number_of_nodes_to_start {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let node = EndNode::builder(
            NodeIdentity::new(format!("edge-{}", i), "127.0.0.1", port, CLUSTER),
            TOKEN,
        )
        .with_center(NodeIdentity::new("center", "127.0.0.1", center_port, CLUSTER))
        .with_heartbeat_interval(Duration::from_secs(2))
        .with_rpc_timeout(Duration::from_secs(1))
        .with_proxy_engine(Arc::new(MemoryEngine::new()) as Arc<dyn ProxyEngine>)
        .build()
        .await
        .unwrap();
        tokio::spawn(node.serve(listener));
        nodes.push(node);
    }

    // a few heartbeat rounds: center registration, peer discovery, peer registration
    tokio::time::sleep(Duration::from_secs(7)).await;
    let first = &nodes[0];
    log::info!("{} knows {:?}", first.this_node(), first.node_names().await);

    let result = first
        .fan_out_all(
            Operation::AddInbound,
            &json!({"inbound": {"tag": "vmess-in", "protocol": "vmess", "port": 10086}}),
        )
        .await
        .unwrap();
    log::info!(
        "add_inbound succeeded on {:?}, skipped {:?}",
        result.succeeded.keys().collect::<Vec<_>>(),
        result.skipped
    );
    if !result.failed.is_empty() {
        log::warn!("add_inbound failures: {}", result.failure_summary());
    }

    log::info!("Press ctrl-c to stop");
    tokio::signal::ctrl_c().await.unwrap();
    for node in &nodes {
        node.shutdown().await;
    }
    center.shutdown().await;
}

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tonic::{async_trait, Status};

use super::{EndNodeClient, FanOutResult, Operation, OperationResponse};
use crate::{
    codec::MessageCodec,
    engine::Stat,
    error::{FanOutError, ResponseCode},
    grpc::{protos, NodeTransport, RpcMethod, StatusResponse},
    node::{Node, NodeIdentity},
};

/// Answers every call itself, keyed by the same `token-<name>` tokens the targets hold.
#[derive(Default)]
struct MockTransport {
    unreachable: HashSet<String>,
    rejecting: HashSet<String>,
    // when set, calls wait for a permit before answering
    gate: Option<Arc<Semaphore>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl NodeTransport for MockTransport {
    async fn unary(
        &self,
        target: &NodeIdentity,
        method: RpcMethod,
        request: protos::SealedMessage,
    ) -> Result<protos::SealedMessage, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.contains(&target.name) {
            return Err(Status::unavailable("connection refused"));
        }
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _open = gate.acquire().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let codec = MessageCodec::node(&token_for(&target.name));
        let (code, msg) = if self.rejecting.contains(&target.name) {
            (ResponseCode::OperationFailed, "engine down".to_string())
        } else {
            (ResponseCode::Ok, String::new())
        };
        let sealed = match method {
            RpcMethod::GetStats => {
                let _: protos::GetStatsRequest = codec
                    .open(&request)
                    .map_err(|e| Status::unauthenticated(e.to_string()))?;
                let mut reply = protos::GetStatsResponse::failure(code, msg);
                if code == ResponseCode::Ok {
                    reply.stats = vec![Stat {
                        name: format!("{}>>>traffic", target.name),
                        value: 1,
                    }
                    .into()];
                }
                codec.seal(&target.cluster_name, &target.name, &reply)
            }
            _ => codec.seal(
                &target.cluster_name,
                &target.name,
                &protos::CommonResponse::failure(code, msg),
            ),
        };
        sealed.map_err(|e| Status::internal(e.to_string()))
    }
}

fn token_for(name: &str) -> String {
    format!("token-{}", name)
}

fn registered(name: &str) -> Node {
    let now = OffsetDateTime::now_utc();
    let mut node = Node::new(NodeIdentity::new(name, "10.0.0.2", 5000, "prod"), now);
    node.set_out_token(token_for(name));
    node.touch_report_heartbeat(now);
    node
}

fn client(transport: Arc<MockTransport>, max_in_flight: usize, rpc_timeout: Duration) -> EndNodeClient {
    EndNodeClient::new(
        NodeIdentity::new("a", "10.0.0.1", 5000, "prod"),
        transport,
        max_in_flight,
        rpc_timeout,
    )
}

fn names(result: &FanOutResult) -> (Vec<&str>, Vec<&str>) {
    (
        result.succeeded.keys().map(String::as_str).collect(),
        result.failed.keys().map(String::as_str).collect(),
    )
}

#[tokio::test]
async fn one_unreachable_node_does_not_fail_the_others() {
    let transport = Arc::new(MockTransport {
        unreachable: HashSet::from(["b".to_string()]),
        ..Default::default()
    });
    let client = client(transport, 64, Duration::from_secs(1));
    let targets = [registered("a2"), registered("b"), registered("c")];

    let result = client
        .fan_out(Operation::GetStats, &json!({"pattern": "traffic"}), &targets)
        .await
        .unwrap();
    assert_eq!(names(&result), (vec!["a2", "c"], vec!["b"]));
    assert_eq!(
        result.succeeded["c"],
        OperationResponse::Stats(vec![Stat {
            name: "c>>>traffic".to_string(),
            value: 1
        }])
    );
    assert!(result.failed["b"].contains("connection refused"));
    assert!(!result.all_succeeded());
}

#[tokio::test]
async fn non_zero_code_is_a_per_node_failure() {
    let transport = Arc::new(MockTransport {
        rejecting: HashSet::from(["b".to_string()]),
        ..Default::default()
    });
    let client = client(transport, 64, Duration::from_secs(1));
    let targets = [registered("b"), registered("c")];

    let result = client
        .fan_out_by_name("delete_inbound", &json!({"tag": "vmess-in"}), &targets)
        .await
        .unwrap();
    assert_eq!(names(&result), (vec!["c"], vec!["b"]));
    assert_eq!(result.succeeded["c"], OperationResponse::Done);
    assert_eq!(result.failed["b"], "OperationFailed(500): engine down");
    assert_eq!(
        result.failure_summary(),
        "node: b > err: OperationFailed(500): engine down"
    );
}

#[tokio::test]
async fn unregistered_targets_are_skipped_without_a_call() {
    let transport = Arc::new(MockTransport::default());
    let client = client(Arc::clone(&transport), 64, Duration::from_secs(1));
    let stranger = Node::new(
        NodeIdentity::new("d", "10.0.0.4", 5000, "prod"),
        OffsetDateTime::now_utc(),
    );

    let result = client
        .fan_out(Operation::GetCerts, &json!({}), &[stranger, registered("c")])
        .await
        .unwrap();
    assert_eq!(result.skipped, vec!["d".to_string()]);
    assert_eq!(names(&result), (vec!["c"], vec![]));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn request_level_problems_are_the_only_overall_errors() {
    let transport = Arc::new(MockTransport::default());
    let client = client(Arc::clone(&transport), 64, Duration::from_secs(1));
    let targets = [registered("b")];

    let err = client
        .fan_out(Operation::AddUsers, &json!({"users": "everyone"}), &targets)
        .await
        .unwrap_err();
    assert!(matches!(err, FanOutError::Payload { operation: "add_users", .. }));

    let err = client
        .fan_out_by_name("reboot", &json!({}), &targets)
        .await
        .unwrap_err();
    assert!(matches!(err, FanOutError::UnknownOperation(_)));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn slow_nodes_time_out_individually() {
    let transport = Arc::new(MockTransport {
        gate: Some(Arc::new(Semaphore::new(0))),
        ..Default::default()
    });
    let client = client(transport, 64, Duration::from_millis(50));

    let result = client
        .fan_out(Operation::ObtainCert, &json!({"domain": "a.example.com"}), &[registered("b")])
        .await
        .unwrap();
    assert!(result.failed["b"].starts_with("no reply within"));
}

#[tokio::test]
async fn more_fan_outs_than_permits_all_complete() {
    let gate = Arc::new(Semaphore::new(0));
    let transport = Arc::new(MockTransport {
        gate: Some(Arc::clone(&gate)),
        ..Default::default()
    });
    let client = client(Arc::clone(&transport), 4, Duration::from_secs(10));
    let targets: Vec<Node> = ["b", "c", "d"].iter().map(|n| registered(n)).collect();

    let fan_outs: Vec<_> = (0..10)
        .map(|_| {
            let client = client.clone();
            let targets = targets.clone();
            tokio::spawn(async move {
                client
                    .fan_out(Operation::GetStats, &json!({}), &targets)
                    .await
            })
        })
        .collect();

    tokio::time::timeout(Duration::from_secs(5), async {
        while transport.in_flight.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(client.available_permits(), 0);
    assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 4);

    gate.add_permits(1000);
    for fan_out in fan_outs {
        let result = tokio::time::timeout(Duration::from_secs(5), fan_out)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result.succeeded.len(), 3);
    }
    assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 4);
    assert_eq!(client.available_permits(), 4);
}

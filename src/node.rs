use std::fmt;

#[cfg(test)]
use quickcheck::Arbitrary;
use time::{Duration, OffsetDateTime};
use url::Url;

/// A node is considered alive as long as one of its liveness signals is younger than this.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::seconds(60);

/// The four fields that together identify a node on the wire.
///
/// `name` is the key within a cluster; the other three fields are compared to
/// tell a legitimate re-registration apart from two nodes fighting over a name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    pub host: String,
    pub port: u16,
    pub cluster_name: String,
    pub name: String,
}

impl NodeIdentity {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        cluster_name: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            cluster_name: cluster_name.into(),
            name: name.into(),
        }
    }

    /// `host:port`, as used in logs and error messages
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The URL gRPC channels to this node are opened against.
    pub fn endpoint_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("http://{}:{}", self.host, self.port))
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.port)
    }
}

#[cfg(test)]
impl Arbitrary for NodeIdentity {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let hosts = ["10.0.0.1", "10.0.0.2", "node.example.com", "127.0.0.1"];
        let names = ["a", "b", "c", "edge-1", "edge-2"];
        Self {
            host: g.choose(&hosts).unwrap().to_string(),
            port: u16::arbitrary(g).max(1001),
            cluster_name: g.choose(&["prod", "staging"]).unwrap().to_string(),
            name: g.choose(&names).unwrap().to_string(),
        }
    }
}

/// The state this process keeps about one peer.
///
/// Tokens are directional: `in_token` is what the peer must present to us, and
/// `out_token` is what we present to the peer. Either may be empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    identity: NodeIdentity,
    in_token: String,
    out_token: String,
    // last time the peer proved its liveness to us
    get_heartbeat_time: Option<OffsetDateTime>,
    // last time we successfully pushed a heartbeat or registration to the peer
    report_heartbeat_time: Option<OffsetDateTime>,
    create_time: Option<OffsetDateTime>,
    is_local: bool,
}

impl Node {
    /// A peer learned at runtime, holding no tokens yet.
    pub fn new(identity: NodeIdentity, now: OffsetDateTime) -> Self {
        Self {
            identity,
            in_token: String::new(),
            out_token: String::new(),
            get_heartbeat_time: None,
            report_heartbeat_time: None,
            create_time: Some(now),
            is_local: false,
        }
    }

    /// A peer loaded from static local configuration. Never evicted.
    pub fn local(identity: NodeIdentity, now: OffsetDateTime) -> Self {
        Self {
            is_local: true,
            ..Self::new(identity, now)
        }
    }

    /// A peer that just registered with us and received `in_token`.
    pub(crate) fn registered(identity: NodeIdentity, in_token: String, now: OffsetDateTime) -> Self {
        Self {
            in_token,
            get_heartbeat_time: Some(now),
            ..Self::new(identity, now)
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn host(&self) -> &str {
        &self.identity.host
    }

    pub fn port(&self) -> u16 {
        self.identity.port
    }

    pub fn cluster_name(&self) -> &str {
        &self.identity.cluster_name
    }

    pub fn in_token(&self) -> &str {
        &self.in_token
    }

    pub fn out_token(&self) -> &str {
        &self.out_token
    }

    pub fn get_heartbeat_time(&self) -> Option<OffsetDateTime> {
        self.get_heartbeat_time
    }

    pub fn report_heartbeat_time(&self) -> Option<OffsetDateTime> {
        self.report_heartbeat_time
    }

    pub fn create_time(&self) -> Option<OffsetDateTime> {
        self.create_time
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub(crate) fn set_in_token(&mut self, token: String) {
        self.in_token = token;
    }

    pub(crate) fn mark_local(&mut self) {
        self.is_local = true;
    }

    pub(crate) fn set_out_token(&mut self, token: String) {
        self.out_token = token;
    }

    pub(crate) fn clear_out_token(&mut self) {
        self.out_token.clear();
    }

    pub(crate) fn touch_get_heartbeat(&mut self, now: OffsetDateTime) {
        self.get_heartbeat_time = Some(now);
    }

    pub(crate) fn touch_report_heartbeat(&mut self, now: OffsetDateTime) {
        self.report_heartbeat_time = Some(now);
    }

    /// True when all four identity fields match.
    pub fn compare(&self, other: &NodeIdentity) -> bool {
        self.identity == *other
    }

    /// A node is alive if any of its three timestamps is recent.
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        within_timeout(self.create_time, now)
            || within_timeout(self.get_heartbeat_time, now)
            || within_timeout(self.report_heartbeat_time, now)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(OffsetDateTime::now_utc())
    }

    /// The peer has recently proven itself to us with the token we issued.
    pub fn registered_local_at(&self, now: OffsetDateTime) -> bool {
        !self.in_token.is_empty() && within_timeout(self.get_heartbeat_time, now)
    }

    pub fn registered_local(&self) -> bool {
        self.registered_local_at(OffsetDateTime::now_utc())
    }

    /// We hold a token for the peer and recently proved ourselves with it.
    pub fn registered_remote_at(&self, now: OffsetDateTime) -> bool {
        !self.out_token.is_empty() && within_timeout(self.report_heartbeat_time, now)
    }

    pub fn registered_remote(&self) -> bool {
        self.registered_remote_at(OffsetDateTime::now_utc())
    }
}

fn within_timeout(at: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
    at.map_or(false, |at| now - at < HEARTBEAT_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use time::{Duration, OffsetDateTime};

    use super::{Node, NodeIdentity, HEARTBEAT_TIMEOUT};

    fn stale_node(base: OffsetDateTime) -> Node {
        Node::new(
            NodeIdentity::new("b", "10.0.0.2", 5000, "prod"),
            base - Duration::seconds(1000),
        )
    }

    #[quickcheck]
    fn any_fresh_signal_keeps_node_alive_for_exactly_the_timeout(signal: u8, elapsed: u16) -> bool {
        let base = OffsetDateTime::now_utc();
        let mut node = stale_node(base);
        match signal % 3 {
            0 => node.create_time = Some(base),
            1 => node.touch_get_heartbeat(base),
            _ => node.touch_report_heartbeat(base),
        }
        let elapsed = Duration::seconds(elapsed as i64);
        node.is_valid_at(base + elapsed) == (elapsed < HEARTBEAT_TIMEOUT)
    }

    #[test]
    fn validity_boundary() {
        let base = OffsetDateTime::now_utc();
        let mut node = stale_node(base);
        assert!(!node.is_valid_at(base));

        node.touch_report_heartbeat(base);
        assert!(node.is_valid_at(base));
        assert!(node.is_valid_at(base + Duration::seconds(59)));
        assert!(!node.is_valid_at(base + Duration::seconds(60)));
    }

    #[test]
    fn latest_signal_wins() {
        let base = OffsetDateTime::now_utc();
        let mut node = stale_node(base);
        node.touch_get_heartbeat(base);
        node.touch_report_heartbeat(base + Duration::seconds(30));
        assert!(node.is_valid_at(base + Duration::seconds(89)));
        assert!(!node.is_valid_at(base + Duration::seconds(90)));
    }

    #[test]
    fn registered_local_requires_token_and_recent_inbound_signal() {
        let now = OffsetDateTime::now_utc();
        let mut node = Node::new(NodeIdentity::new("b", "10.0.0.2", 5000, "prod"), now);
        node.touch_get_heartbeat(now);
        assert!(!node.registered_local_at(now));

        node.set_in_token("secret".to_string());
        assert!(node.registered_local_at(now));
        assert!(!node.registered_local_at(now + HEARTBEAT_TIMEOUT));
        assert!(!node.registered_remote_at(now));
    }

    #[test]
    fn registered_remote_requires_token_and_recent_outbound_signal() {
        let now = OffsetDateTime::now_utc();
        let mut node = Node::new(NodeIdentity::new("b", "10.0.0.2", 5000, "prod"), now);
        node.set_out_token("issued-by-b".to_string());
        assert!(!node.registered_remote_at(now));

        node.touch_report_heartbeat(now);
        assert!(node.registered_remote_at(now));

        node.clear_out_token();
        assert!(!node.registered_remote_at(now));
    }

    #[quickcheck]
    fn compare_matches_on_all_identity_fields(a: NodeIdentity, b: NodeIdentity) -> bool {
        let node = Node::new(a.clone(), OffsetDateTime::now_utc());
        node.compare(&b) == (a == b) && node.compare(&a)
    }

    #[test]
    fn endpoint_url() {
        let id = NodeIdentity::new("b", "10.0.0.2", 5000, "prod");
        assert_eq!(id.endpoint_url().unwrap().as_str(), "http://10.0.0.2:5000/");
        assert_eq!(id.to_string(), "b@10.0.0.2:5000");
    }
}

use std::time::Duration;

use typed_builder::TypedBuilder;

/// Default UDP port a QUIC node listens on.
pub const NODE_PORT: u16 = 4711;

/// Default per-round broadcast deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Session-wide settings shared by the client, its proxy and every node.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ClusterConfig {
    /// Deadline applied to every slot of a broadcast round.
    #[builder(default = DEFAULT_TIMEOUT)]
    pub timeout: Duration,
    /// Registry name prefix; worker `k` registers as `{node_prefix}{k}`.
    #[builder(default = String::from("cluster-node-"), setter(into))]
    pub node_prefix: String,
    #[builder(default = NODE_PORT)]
    pub port: u16,
    /// Pause between a failed transform and its single out-of-memory retry.
    #[builder(default = Duration::from_millis(50))]
    pub retry_pause: Duration,
    /// Wire payloads larger than this are zstd-compressed.
    #[builder(default = 16 * 1024)]
    pub compress_threshold: usize,
    #[builder(default = 256 * 1024 * 1024)]
    pub max_frame_len: usize,
    /// Upper bound on the bytes one scene fragment may allocate on a node.
    #[builder(default = 512 * 1024 * 1024)]
    pub fragment_budget: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClusterConfig {
    /// Registry location of worker `k`.
    pub fn location(&self, k: usize) -> String {
        format!("{}{}", self.node_prefix, k)
    }
}

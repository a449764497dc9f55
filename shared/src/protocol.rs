use std::time::Duration;

/// An origin is alive while its last heartbeat is younger than this.
pub const SERVER_ALIVE_DURATION: Duration = Duration::from_secs(300);

/// An HLS session is alive while it was touched within this window.
pub const HLS_ALIVE_DURATION: Duration = Duration::from_secs(120);

/// A WebRTC session is alive while it was touched within this window.
pub const RTC_ALIVE_DURATION: Duration = Duration::from_secs(120);

/// Key namespaces in the shared store. Every proxy instance sharing one
/// store must agree on these.
pub const KEY_SERVER: &str = "srs-proxy-server";
pub const KEY_ALL_SERVERS: &str = "srs-proxy-all-servers";
pub const KEY_STREAM: &str = "srs-proxy-stream";
pub const KEY_HLS: &str = "srs-proxy-hls";
pub const KEY_SPBHID: &str = "srs-proxy-spbhid";
pub const KEY_RTC: &str = "srs-proxy-rtc";

/// System API paths
pub const API_REGISTER: &str = "/api/v1/srs/register";
pub const API_VERSIONS: &str = "/api/v1/versions";

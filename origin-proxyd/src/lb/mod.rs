//! Origin registry and load balancing.
//!
//! Protocol front-ends route client sessions through a [`LoadBalancer`]:
//! origins announce themselves with `update`, new streams are assigned with
//! `pick`, and HLS/WebRTC handshakes resolve their sticky origin through the
//! session operations.
//!
//! Two backends implement the contract:
//!
//! - [`MemoryLoadBalancer`] keeps everything in process, for single-instance
//!   deployments.
//! - [`RedisLoadBalancer`] shares origins and sessions between proxy
//!   instances through Redis, relying on native key expiry and `SET NX`.
//!
//! Both apply the TTLs from `shared::protocol`.

pub mod clock;
pub mod default_backend;
pub mod error;
pub mod memory;
pub mod redis;

use std::sync::Arc;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use shared::types::{HlsSession, OriginServer, RtcSession};
use crate::config::{BalancerKind, Config};

pub use clock::{Clock, SystemClock};
pub use error::LbError;
pub use memory::MemoryLoadBalancer;
pub use self::redis::RedisLoadBalancer;

pub type Result<T> = std::result::Result<T, LbError>;

/// Selection store shared by every protocol front-end.
///
/// All operations take the caller's cancellation token and return
/// [`LbError::Cancelled`] once it fires.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Open connections and register the configured default origin.
    async fn initialize(&self, ctx: &CancellationToken) -> Result<()>;

    /// Upsert an origin under its composite key and refresh its heartbeat.
    async fn update(&self, ctx: &CancellationToken, server: OriginServer) -> Result<()>;

    /// Pick a live origin for a stream, preferring the previous assignment.
    async fn pick(&self, ctx: &CancellationToken, stream_url: &str) -> Result<OriginServer>;

    /// Return the live HLS session of a stream, or store `value` as the new
    /// one. The flag is true when an existing session was returned.
    async fn load_or_store_hls(
        &self,
        ctx: &CancellationToken,
        stream_url: &str,
        value: HlsSession,
    ) -> Result<(HlsSession, bool)>;

    /// Resolve an HLS session by SPBHID.
    async fn load_hls_by_spbhid(&self, ctx: &CancellationToken, spbhid: &str) -> Result<HlsSession>;

    /// Store a WebRTC session under its ufrag.
    async fn store_webrtc(
        &self,
        ctx: &CancellationToken,
        stream_url: &str,
        value: RtcSession,
    ) -> Result<()>;

    /// Resolve a WebRTC session by ICE ufrag.
    async fn load_webrtc_by_ufrag(&self, ctx: &CancellationToken, ufrag: &str) -> Result<RtcSession>;

    /// Drop stale entries. Returns how many were removed.
    async fn prune(&self, ctx: &CancellationToken) -> Result<usize>;
}

/// Build the backend selected by configuration. Call `initialize` before use.
pub fn build(config: &Config) -> Arc<dyn LoadBalancer> {
    match config.balancer.kind {
        BalancerKind::Memory => Arc::new(MemoryLoadBalancer::new(config.default_backend.clone())),
        BalancerKind::Redis => Arc::new(RedisLoadBalancer::new(
            config.redis.clone(),
            config.default_backend.clone(),
        )),
    }
}

fn ensure_active(ctx: &CancellationToken) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(LbError::Cancelled);
    }
    Ok(())
}

//! Redis-backed load balancer shared by several proxy instances.
//!
//! # Key layout
//!
//! | Key | Value | Expiry |
//! |---|---|---|
//! | `srs-proxy-server:<id>` | origin JSON | server TTL |
//! | `srs-proxy-all-servers` | sorted set of origin ids, scored by heartbeat | pruned by score |
//! | `srs-proxy-stream:<url>` | picked origin id | server TTL, renewed on sticky hits |
//! | `srs-proxy-hls:<url>` | HLS session JSON | HLS TTL |
//! | `srs-proxy-spbhid:<spbhid>` | stream URL | HLS TTL |
//! | `srs-proxy-rtc:<ufrag>` | WebRTC session JSON | RTC TTL |
//!
//! Native key expiry is the source of truth for liveness. Session reads
//! renew the expiry server-side and never write back a value read earlier.
//! Every round trip is bounded by the configured timeout and aborts when the
//! caller's token is cancelled.

use std::future::Future;
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;
use rand::seq::SliceRandom;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Script};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use shared::protocol::{
    HLS_ALIVE_DURATION, KEY_ALL_SERVERS, KEY_HLS, KEY_RTC, KEY_SERVER, KEY_SPBHID, KEY_STREAM,
    RTC_ALIVE_DURATION, SERVER_ALIVE_DURATION,
};
use shared::types::{HlsSession, OriginServer, RtcSession};
use crate::config::{DefaultBackendConfig, RedisConfig};
use super::{default_backend, ensure_active, LbError, LoadBalancer, Result};

/// Return the live HLS session for a stream, or store the candidate.
///
/// KEYS: session key, SPBHID index prefix.
/// ARGV: candidate JSON, candidate SPBHID, stream URL, TTL seconds.
/// Returns the existing JSON, or nil when the candidate was stored.
const HLS_LOAD_OR_STORE: &str = r#"
local existing = redis.call('GET', KEYS[1])
if existing then
    redis.call('EXPIRE', KEYS[1], ARGV[4])
    local ok, session = pcall(cjson.decode, existing)
    if ok and type(session) == 'table' and type(session.spbhid) == 'string' then
        redis.call('EXPIRE', KEYS[2] .. session.spbhid, ARGV[4])
    end
    return existing
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[4])
redis.call('SET', KEYS[2] .. ARGV[2], ARGV[3], 'EX', ARGV[4])
return false
"#;

/// Resolve an SPBHID to its session and renew both keys.
///
/// KEYS: SPBHID index key, session key prefix.
/// ARGV: SPBHID, TTL seconds.
/// Returns nil when the index or session is gone or the session belongs to
/// another SPBHID. Undecodable sessions are returned as-is.
const HLS_LOAD_BY_SPBHID: &str = r#"
local url = redis.call('GET', KEYS[1])
if not url then
    return false
end
local raw = redis.call('GET', KEYS[2] .. url)
if not raw then
    return false
end
local ok, session = pcall(cjson.decode, raw)
if not ok or type(session) ~= 'table' then
    return raw
end
if session.spbhid ~= ARGV[1] then
    return false
end
redis.call('EXPIRE', KEYS[1], ARGV[2])
redis.call('EXPIRE', KEYS[2] .. url, ARGV[2])
return raw
"#;

/// KEYS: record key. ARGV: TTL seconds.
const GET_AND_RENEW: &str = r#"
local raw = redis.call('GET', KEYS[1])
if raw then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return raw
"#;

fn server_key(id: &str) -> String {
    format!("{}:{}", KEY_SERVER, id)
}

fn stream_key(stream_url: &str) -> String {
    format!("{}:{}", KEY_STREAM, stream_url)
}

fn hls_key(stream_url: &str) -> String {
    format!("{}:{}", KEY_HLS, stream_url)
}

fn spbhid_key(spbhid: &str) -> String {
    format!("{}:{}", KEY_SPBHID, spbhid)
}

fn rtc_key(ufrag: &str) -> String {
    format!("{}:{}", KEY_RTC, ufrag)
}

fn encode<T: Serialize>(op: &'static str, key: &str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|source| LbError::Codec {
        op,
        key: key.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(op: &'static str, key: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|source| LbError::Codec {
        op,
        key: key.to_string(),
        source,
    })
}

/// Origins whose heartbeat score is at or below this are stale.
fn server_cutoff() -> i64 {
    Utc::now().timestamp() - SERVER_ALIVE_DURATION.as_secs() as i64
}

pub struct RedisLoadBalancer {
    config: RedisConfig,
    default_backend: DefaultBackendConfig,
    conn: OnceCell<ConnectionManager>,
}

impl RedisLoadBalancer {
    pub fn new(config: RedisConfig, default_backend: DefaultBackendConfig) -> Self {
        Self {
            config,
            default_backend,
            conn: OnceCell::new(),
        }
    }

    fn address(&self) -> String {
        if self.config.host.contains(':') {
            format!("[{}]:{}/{}", self.config.host, self.config.port, self.config.db)
        } else {
            format!("{}:{}/{}", self.config.host, self.config.port, self.config.db)
        }
    }

    fn connection_info(&self) -> ConnectionInfo {
        let password = if self.config.password.is_empty() {
            None
        } else {
            Some(self.config.password.clone())
        };

        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.config.host.clone(), self.config.port),
            redis: RedisConnectionInfo {
                db: self.config.db,
                password,
                ..Default::default()
            },
        }
    }

    fn conn(&self, op: &'static str, key: &str) -> Result<ConnectionManager> {
        self.conn
            .get()
            .cloned()
            .ok_or_else(|| LbError::unavailable(op, key, "not initialized"))
    }

    /// Run one round trip, bounded by the caller's token and the timeout.
    async fn call<T, F>(&self, ctx: &CancellationToken, op: &'static str, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let limit = Duration::from_millis(self.config.timeout_ms);
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(LbError::Cancelled),
            result = tokio::time::timeout(limit, fut) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(LbError::unavailable(op, key, e)),
                Err(_) => Err(LbError::unavailable(op, key, format!("timed out after {:?}", limit))),
            },
        }
    }

    async fn connect(&self, ctx: &CancellationToken) -> Result<ConnectionManager> {
        if self.config.host.is_empty() {
            return Err(LbError::Config("empty redis host".to_string()));
        }
        if self.config.port == 0 {
            return Err(LbError::Config("invalid redis port 0".to_string()));
        }

        let address = self.address();
        let client = redis::Client::open(self.connection_info())
            .map_err(|e| LbError::Config(format!("redis client {}: {}", address, e)))?;

        let mut conn = match self
            .call(ctx, "initialize", &address, ConnectionManager::new(client))
            .await
        {
            Ok(conn) => conn,
            Err(LbError::Cancelled) => return Err(LbError::Cancelled),
            Err(e) => return Err(LbError::Config(format!("redis {} unreachable: {}", address, e))),
        };

        let pong: String = self
            .call(ctx, "initialize", &address, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|e| match e {
                LbError::Cancelled => LbError::Cancelled,
                e => LbError::Config(format!("redis {} rejected PING: {}", address, e)),
            })?;
        tracing::debug!("Redis {} answered {}", address, pong);

        Ok(conn)
    }

    async fn get(
        &self,
        ctx: &CancellationToken,
        conn: &mut ConnectionManager,
        op: &'static str,
        key: &str,
    ) -> Result<Option<String>> {
        self.call(ctx, op, key, conn.get(key)).await
    }

    /// Read a record and restart its expiry in one step.
    async fn get_and_renew(
        &self,
        ctx: &CancellationToken,
        conn: &mut ConnectionManager,
        op: &'static str,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<String>> {
        let script = Script::new(GET_AND_RENEW);
        self.call(ctx, op, key, script.key(key).arg(ttl.as_secs()).invoke_async(conn))
            .await
    }

    /// Load an origin by id. Missing or malformed records count as absent.
    async fn load_server(
        &self,
        ctx: &CancellationToken,
        conn: &mut ConnectionManager,
        id: &str,
    ) -> Result<Option<OriginServer>> {
        let key = server_key(id);
        let Some(raw) = self.get(ctx, conn, "pick", &key).await? else {
            return Ok(None);
        };
        match decode::<OriginServer>("pick", &key, &raw) {
            Ok(server) => Ok(Some(server)),
            Err(e) => {
                tracing::warn!("Ignoring origin record: {}", e);
                Ok(None)
            }
        }
    }

    async fn alive_servers(
        &self,
        ctx: &CancellationToken,
        conn: &mut ConnectionManager,
    ) -> Result<Vec<OriginServer>> {
        let _: usize = self
            .call(
                ctx,
                "pick",
                KEY_ALL_SERVERS,
                conn.zrembyscore(KEY_ALL_SERVERS, "-inf", server_cutoff()),
            )
            .await?;

        let ids: Vec<String> = self
            .call(ctx, "pick", KEY_ALL_SERVERS, conn.zrange(KEY_ALL_SERVERS, 0, -1))
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| server_key(id)).collect();
        let raws: Vec<Option<String>> = self
            .call(ctx, "pick", KEY_ALL_SERVERS, conn.mget(&keys))
            .await?;

        let now = Utc::now();
        let servers = keys
            .iter()
            .zip(raws)
            .filter_map(|(key, raw)| {
                let raw = raw?;
                match decode::<OriginServer>("pick", key, &raw) {
                    Ok(server) => Some(server),
                    Err(e) => {
                        tracing::warn!("Ignoring origin record: {}", e);
                        None
                    }
                }
            })
            .filter(|server| server.is_alive(now))
            .collect();
        Ok(servers)
    }
}

#[async_trait]
impl LoadBalancer for RedisLoadBalancer {
    async fn initialize(&self, ctx: &CancellationToken) -> Result<()> {
        ensure_active(ctx)?;

        self.conn.get_or_try_init(|| self.connect(ctx)).await?;
        tracing::info!("Redis load balancer connected to {}", self.address());

        if let Some(server) = default_backend::build(&self.default_backend)? {
            tracing::info!("Registering default backend {}", server.detailed());
            self.update(ctx, server).await?;
        }
        Ok(())
    }

    async fn update(&self, ctx: &CancellationToken, mut server: OriginServer) -> Result<()> {
        ensure_active(ctx)?;

        server.updated_at = Utc::now();
        let id = server.id();
        let key = server_key(&id);
        let json = encode("update", &key, &server)?;
        let mut conn = self.conn("update", &key)?;

        let _: () = self
            .call(
                ctx,
                "update",
                &key,
                redis::pipe()
                    .atomic()
                    .set_ex(&key, &json, SERVER_ALIVE_DURATION.as_secs())
                    .ignore()
                    .zadd(KEY_ALL_SERVERS, &id, server.updated_at.timestamp())
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;

        tracing::debug!("Origin heartbeat: {}", server.detailed());
        Ok(())
    }

    async fn pick(&self, ctx: &CancellationToken, stream_url: &str) -> Result<OriginServer> {
        ensure_active(ctx)?;

        let key = stream_key(stream_url);
        let ttl = SERVER_ALIVE_DURATION.as_secs();
        let mut conn = self.conn("pick", &key)?;

        if let Some(id) = self.get(ctx, &mut conn, "pick", &key).await? {
            if let Some(server) = self.load_server(ctx, &mut conn, &id).await? {
                // The pointer lives as long as its origin keeps heartbeating.
                let _: bool = self
                    .call(ctx, "pick", &key, conn.expire(&key, ttl as i64))
                    .await?;
                tracing::debug!("Picked {} for {} (sticky)", server, stream_url);
                return Ok(server);
            }
        }

        let servers = self.alive_servers(ctx, &mut conn).await?;
        let server = servers
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| LbError::NoAvailableBackend {
                stream_url: stream_url.to_string(),
            })?;

        let _: () = self
            .call(ctx, "pick", &key, conn.set_ex(&key, server.id(), ttl))
            .await?;

        tracing::debug!("Picked {} for {}", server, stream_url);
        Ok(server)
    }

    async fn load_or_store_hls(
        &self,
        ctx: &CancellationToken,
        stream_url: &str,
        mut value: HlsSession,
    ) -> Result<(HlsSession, bool)> {
        ensure_active(ctx)?;

        const OP: &str = "load_or_store_hls";
        let key = hls_key(stream_url);

        value.stream_url = stream_url.to_string();
        value.updated_at = Utc::now();
        let json = encode(OP, &key, &value)?;
        let mut conn = self.conn(OP, &key)?;

        let script = Script::new(HLS_LOAD_OR_STORE);
        let existing: Option<String> = self
            .call(
                ctx,
                OP,
                &key,
                script
                    .key(&key)
                    .key(format!("{}:", KEY_SPBHID))
                    .arg(&json)
                    .arg(&value.spbhid)
                    .arg(stream_url)
                    .arg(HLS_ALIVE_DURATION.as_secs())
                    .invoke_async(&mut conn),
            )
            .await?;

        match existing {
            Some(raw) => {
                let mut existing: HlsSession = decode(OP, &key, &raw)?;
                existing.updated_at = Utc::now();
                Ok((existing, true))
            }
            None => {
                tracing::debug!("HLS session {} created for {}", value.spbhid, stream_url);
                Ok((value, false))
            }
        }
    }

    async fn load_hls_by_spbhid(&self, ctx: &CancellationToken, spbhid: &str) -> Result<HlsSession> {
        ensure_active(ctx)?;

        const OP: &str = "load_hls_by_spbhid";
        let index = spbhid_key(spbhid);
        let mut conn = self.conn(OP, &index)?;

        let script = Script::new(HLS_LOAD_BY_SPBHID);
        let raw: Option<String> = self
            .call(
                ctx,
                OP,
                &index,
                script
                    .key(&index)
                    .key(format!("{}:", KEY_HLS))
                    .arg(spbhid)
                    .arg(HLS_ALIVE_DURATION.as_secs())
                    .invoke_async(&mut conn),
            )
            .await?;
        let raw = raw.ok_or_else(|| LbError::not_found(OP, spbhid))?;

        let mut session: HlsSession = decode(OP, &index, &raw)?;
        if session.spbhid != spbhid {
            return Err(LbError::not_found(OP, spbhid));
        }
        session.updated_at = Utc::now();
        Ok(session)
    }

    async fn store_webrtc(
        &self,
        ctx: &CancellationToken,
        stream_url: &str,
        mut value: RtcSession,
    ) -> Result<()> {
        ensure_active(ctx)?;

        const OP: &str = "store_webrtc";
        let key = rtc_key(&value.ufrag);
        value.stream_url = stream_url.to_string();
        value.updated_at = Utc::now();
        let json = encode(OP, &key, &value)?;
        let mut conn = self.conn(OP, &key)?;

        let _: () = self
            .call(ctx, OP, &key, conn.set_ex(&key, &json, RTC_ALIVE_DURATION.as_secs()))
            .await?;

        tracing::debug!("WebRTC session {} stored for {}", value.ufrag, stream_url);
        Ok(())
    }

    async fn load_webrtc_by_ufrag(&self, ctx: &CancellationToken, ufrag: &str) -> Result<RtcSession> {
        ensure_active(ctx)?;

        const OP: &str = "load_webrtc_by_ufrag";
        let key = rtc_key(ufrag);
        let mut conn = self.conn(OP, &key)?;

        let raw = self
            .get_and_renew(ctx, &mut conn, OP, &key, RTC_ALIVE_DURATION)
            .await?
            .ok_or_else(|| LbError::not_found(OP, ufrag))?;

        let mut session: RtcSession = decode(OP, &key, &raw)?;
        session.updated_at = Utc::now();
        Ok(session)
    }

    async fn prune(&self, ctx: &CancellationToken) -> Result<usize> {
        ensure_active(ctx)?;

        let mut conn = self.conn("prune", KEY_ALL_SERVERS)?;
        let removed: usize = self
            .call(
                ctx,
                "prune",
                KEY_ALL_SERVERS,
                conn.zrembyscore(KEY_ALL_SERVERS, "-inf", server_cutoff()),
            )
            .await?;

        if removed > 0 {
            tracing::debug!("Pruned {} expired origins from {}", removed, KEY_ALL_SERVERS);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    fn unreachable_config() -> RedisConfig {
        RedisConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            timeout_ms: 500,
            ..Default::default()
        }
    }

    /// `ORIGIN_PROXY_TEST_REDIS=host:port` enables the tests that need a
    /// live server.
    fn live_config() -> Option<RedisConfig> {
        let addr = std::env::var("ORIGIN_PROXY_TEST_REDIS").ok()?;
        let (host, port) = addr.rsplit_once(':')?;
        Some(RedisConfig {
            host: host.to_string(),
            port: port.parse().ok()?,
            ..Default::default()
        })
    }

    fn unique(prefix: &str) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        format!("{}-{}", prefix, suffix)
    }

    fn origin(server_id: &str) -> OriginServer {
        OriginServer {
            ip: "10.0.0.1".to_string(),
            server_id: server_id.to_string(),
            service_id: "svc".to_string(),
            pid: "100".to_string(),
            rtmp: vec!["1935".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(server_key("x1-y1-100"), "srs-proxy-server:x1-y1-100");
        assert_eq!(stream_key("rtmp://h/app/s"), "srs-proxy-stream:rtmp://h/app/s");
        assert_eq!(hls_key("live/s"), "srs-proxy-hls:live/s");
        assert_eq!(spbhid_key("abc"), "srs-proxy-spbhid:abc");
        assert_eq!(rtc_key("u1"), "srs-proxy-rtc:u1");
    }

    #[test]
    fn test_decode_reports_key() {
        let err = decode::<OriginServer>("pick", "srs-proxy-server:x", "{not json").unwrap_err();
        assert!(matches!(err, LbError::Codec { op: "pick", .. }));
        assert!(err.to_string().contains("srs-proxy-server:x"));
    }

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let lb = RedisLoadBalancer::new(RedisConfig::default(), DefaultBackendConfig::default());
        let ctx = CancellationToken::new();

        let err = lb.pick(&ctx, "live/s").await.unwrap_err();
        assert!(err.is_unavailable(), "unexpected error: {}", err);
        let err = lb.load_webrtc_by_ufrag(&ctx, "u1").await.unwrap_err();
        assert!(err.is_unavailable(), "unexpected error: {}", err);
    }

    #[test]
    fn test_connection_info_accepts_ipv6_host() {
        let config = RedisConfig {
            host: "::1".to_string(),
            port: 6380,
            db: 2,
            password: "secret".to_string(),
            ..Default::default()
        };
        let lb = RedisLoadBalancer::new(config, DefaultBackendConfig::default());

        let info = lb.connection_info();
        assert!(matches!(&info.addr, ConnectionAddr::Tcp(host, 6380) if host == "::1"));
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.password.as_deref(), Some("secret"));
        assert_eq!(lb.address(), "[::1]:6380/2");
    }

    #[test]
    fn test_connection_info_without_password() {
        let lb = RedisLoadBalancer::new(RedisConfig::default(), DefaultBackendConfig::default());
        let info = lb.connection_info();
        assert!(info.redis.password.is_none());
        assert_eq!(lb.address(), "127.0.0.1:6379/0");
    }

    #[tokio::test]
    async fn test_initialize_validates_settings() {
        let ctx = CancellationToken::new();

        let mut config = unreachable_config();
        config.host.clear();
        let lb = RedisLoadBalancer::new(config, DefaultBackendConfig::default());
        assert!(matches!(lb.initialize(&ctx).await, Err(LbError::Config(_))));

        let mut config = unreachable_config();
        config.port = 0;
        let lb = RedisLoadBalancer::new(config, DefaultBackendConfig::default());
        assert!(matches!(lb.initialize(&ctx).await, Err(LbError::Config(_))));
    }

    #[tokio::test]
    async fn test_initialize_unreachable_store() {
        let lb = RedisLoadBalancer::new(unreachable_config(), DefaultBackendConfig::default());
        let result = lb.initialize(&CancellationToken::new()).await;
        assert!(matches!(result, Err(LbError::Config(_))), "unexpected result: {:?}", result.err());
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let lb = RedisLoadBalancer::new(unreachable_config(), DefaultBackendConfig::default());
        let ctx = CancellationToken::new();
        ctx.cancel();

        assert!(matches!(lb.initialize(&ctx).await, Err(LbError::Cancelled)));
        assert!(matches!(lb.pick(&ctx, "live/s").await, Err(LbError::Cancelled)));
        assert!(matches!(lb.prune(&ctx).await, Err(LbError::Cancelled)));
    }

    #[tokio::test]
    async fn test_call_honors_cancellation() {
        let lb = RedisLoadBalancer::new(RedisConfig::default(), DefaultBackendConfig::default());
        let ctx = CancellationToken::new();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let pending = std::future::pending::<redis::RedisResult<()>>();
        let result = lb.call(&ctx, "pick", "live/s", pending).await;
        assert!(matches!(result, Err(LbError::Cancelled)));
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let lb = RedisLoadBalancer::new(unreachable_config(), DefaultBackendConfig::default());
        let pending = std::future::pending::<redis::RedisResult<()>>();

        let err = lb
            .call(&CancellationToken::new(), "pick", "live/s", pending)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_live_sticky_pick() {
        let Some(config) = live_config() else { return };
        let lb = RedisLoadBalancer::new(config, DefaultBackendConfig::default());
        let ctx = CancellationToken::new();
        lb.initialize(&ctx).await.unwrap();

        lb.update(&ctx, origin(&unique("a"))).await.unwrap();
        lb.update(&ctx, origin(&unique("b"))).await.unwrap();

        let stream = unique("rtmp://host/app/stream");
        let first = lb.pick(&ctx, &stream).await.unwrap();
        for _ in 0..5 {
            assert_eq!(lb.pick(&ctx, &stream).await.unwrap().id(), first.id());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_live_load_or_store_hls_is_atomic() {
        let Some(config) = live_config() else { return };
        let lb = Arc::new(RedisLoadBalancer::new(config, DefaultBackendConfig::default()));
        let ctx = CancellationToken::new();
        lb.initialize(&ctx).await.unwrap();

        let stream = unique("stream2");
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let lb = Arc::clone(&lb);
                let ctx = ctx.clone();
                let stream = stream.clone();
                tokio::spawn(async move {
                    let candidate = HlsSession::new(stream.clone(), "");
                    lb.load_or_store_hls(&ctx, &stream, candidate).await
                })
            })
            .collect();

        let results: Vec<(HlsSession, bool)> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(results.iter().filter(|(_, existing)| !existing).count(), 1);
        let spbhids: HashSet<_> = results.iter().map(|(s, _)| s.spbhid.clone()).collect();
        assert_eq!(spbhids.len(), 1);

        let winner = spbhids.into_iter().next().unwrap();
        let found = lb.load_hls_by_spbhid(&ctx, &winner).await.unwrap();
        assert_eq!(found.stream_url, stream);
    }

    #[tokio::test]
    async fn test_live_webrtc_roundtrip() {
        let Some(config) = live_config() else { return };
        let lb = RedisLoadBalancer::new(config, DefaultBackendConfig::default());
        let ctx = CancellationToken::new();
        lb.initialize(&ctx).await.unwrap();

        let ufrag = unique("ufrag");
        lb.store_webrtc(&ctx, "webrtc://host/live/s", RtcSession::new(ufrag.clone(), ""))
            .await
            .unwrap();
        let found = lb.load_webrtc_by_ufrag(&ctx, &ufrag).await.unwrap();
        assert_eq!(found.stream_url, "webrtc://host/live/s");

        let missing = lb.load_webrtc_by_ufrag(&ctx, &unique("ufrag")).await;
        assert!(matches!(missing, Err(LbError::NotFound { .. })));
    }

    async fn live_balancer(config: RedisConfig) -> (RedisLoadBalancer, ConnectionManager) {
        let lb = RedisLoadBalancer::new(config, DefaultBackendConfig::default());
        lb.initialize(&CancellationToken::new()).await.unwrap();
        let conn = lb.conn("test", "").unwrap();
        (lb, conn)
    }

    #[tokio::test]
    async fn test_live_initialize_twice() {
        let Some(config) = live_config() else { return };
        let (lb, _) = live_balancer(config).await;

        lb.initialize(&CancellationToken::new()).await.unwrap();
        lb.update(&CancellationToken::new(), origin(&unique("twice"))).await.unwrap();
    }

    #[tokio::test]
    async fn test_live_sticky_pick_renews_pointer() {
        let Some(config) = live_config() else { return };
        let (lb, mut conn) = live_balancer(config).await;
        let ctx = CancellationToken::new();

        lb.update(&ctx, origin(&unique("a"))).await.unwrap();
        let stream = unique("rtmp://host/app/renew");
        let first = lb.pick(&ctx, &stream).await.unwrap();

        let key = stream_key(&stream);
        let _: bool = conn.expire(&key, 5).await.unwrap();

        let again = lb.pick(&ctx, &stream).await.unwrap();
        assert_eq!(again.id(), first.id());

        let ttl: i64 = conn.ttl(&key).await.unwrap();
        assert!(ttl > 250, "stream pointer ttl {}", ttl);
    }

    #[tokio::test]
    async fn test_live_pick_reselects_after_origin_expires() {
        let Some(config) = live_config() else { return };
        let (lb, mut conn) = live_balancer(config).await;
        let ctx = CancellationToken::new();

        lb.update(&ctx, origin(&unique("a"))).await.unwrap();
        lb.update(&ctx, origin(&unique("b"))).await.unwrap();
        let stream = unique("rtmp://host/app/failover");
        let first = lb.pick(&ctx, &stream).await.unwrap();

        // The picked origin stops heartbeating and its record expires.
        let _: () = conn.del(server_key(&first.id())).await.unwrap();
        let _: () = conn.zrem(KEY_ALL_SERVERS, first.id()).await.unwrap();

        let second = lb.pick(&ctx, &stream).await.unwrap();
        assert_ne!(second.id(), first.id());

        let pointer: Option<String> = conn.get(stream_key(&stream)).await.unwrap();
        assert_eq!(pointer, Some(second.id()));
    }

    #[tokio::test]
    async fn test_live_prune_drops_stale_index_members() {
        let Some(config) = live_config() else { return };
        let (lb, mut conn) = live_balancer(config).await;

        let stale = unique("stale");
        let _: () = conn
            .zadd(KEY_ALL_SERVERS, &stale, server_cutoff() - 10)
            .await
            .unwrap();

        lb.prune(&CancellationToken::new()).await.unwrap();

        let score: Option<i64> = conn.zscore(KEY_ALL_SERVERS, &stale).await.unwrap();
        assert_eq!(score, None);
    }

    #[tokio::test]
    async fn test_live_pick_without_origins() {
        let Some(mut config) = live_config() else { return };
        // No other test registers origins in this database.
        config.db = 15;
        let (lb, mut conn) = live_balancer(config).await;

        let _: () = conn.del(KEY_ALL_SERVERS).await.unwrap();

        let err = lb
            .pick(&CancellationToken::new(), &unique("rtmp://host/app/none"))
            .await
            .unwrap_err();
        assert!(matches!(err, LbError::NoAvailableBackend { .. }), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_live_hls_lookup_rejects_replaced_and_expired() {
        let Some(config) = live_config() else { return };
        let (lb, mut conn) = live_balancer(config).await;
        let ctx = CancellationToken::new();

        let stream = unique("live/hls");
        let (first, existing) = lb
            .load_or_store_hls(&ctx, &stream, HlsSession::new(stream.clone(), ""))
            .await
            .unwrap();
        assert!(!existing);

        // A losing candidate leaves nothing resolvable behind.
        let loser = HlsSession::new(stream.clone(), "");
        let loser_id = loser.spbhid.clone();
        let (winner, existing) = lb.load_or_store_hls(&ctx, &stream, loser).await.unwrap();
        assert!(existing);
        assert_eq!(winner.spbhid, first.spbhid);
        let result = lb.load_hls_by_spbhid(&ctx, &loser_id).await;
        assert!(matches!(result, Err(LbError::NotFound { .. })));

        // The session expires.
        let _: () = conn.del(hls_key(&stream)).await.unwrap();
        let result = lb.load_hls_by_spbhid(&ctx, &first.spbhid).await;
        assert!(matches!(result, Err(LbError::NotFound { .. })));

        // A new session takes the stream over; the old index points at it.
        let (second, existing) = lb
            .load_or_store_hls(&ctx, &stream, HlsSession::new(stream.clone(), ""))
            .await
            .unwrap();
        assert!(!existing);
        assert_ne!(second.spbhid, first.spbhid);

        let result = lb.load_hls_by_spbhid(&ctx, &first.spbhid).await;
        assert!(matches!(result, Err(LbError::NotFound { .. })));
        let found = lb.load_hls_by_spbhid(&ctx, &second.spbhid).await.unwrap();
        assert_eq!(found.spbhid, second.spbhid);
    }

    #[tokio::test]
    async fn test_live_hls_reads_renew_without_rewriting() {
        let Some(config) = live_config() else { return };
        let (lb, mut conn) = live_balancer(config).await;
        let ctx = CancellationToken::new();

        let stream = unique("live/renew");
        let (session, _) = lb
            .load_or_store_hls(&ctx, &stream, HlsSession::new(stream.clone(), ""))
            .await
            .unwrap();
        let key = hls_key(&stream);
        let index = spbhid_key(&session.spbhid);
        let stored: String = conn.get(&key).await.unwrap();

        let _: bool = conn.expire(&key, 5).await.unwrap();
        let _: bool = conn.expire(&index, 5).await.unwrap();
        let (found, existing) = lb
            .load_or_store_hls(&ctx, &stream, HlsSession::new(stream.clone(), ""))
            .await
            .unwrap();
        assert!(existing);
        assert_eq!(found.spbhid, session.spbhid);
        assert!(conn.ttl::<_, i64>(&key).await.unwrap() > 100);
        assert!(conn.ttl::<_, i64>(&index).await.unwrap() > 100);

        let _: bool = conn.expire(&key, 5).await.unwrap();
        let _: bool = conn.expire(&index, 5).await.unwrap();
        lb.load_hls_by_spbhid(&ctx, &session.spbhid).await.unwrap();
        assert!(conn.ttl::<_, i64>(&key).await.unwrap() > 100);
        assert!(conn.ttl::<_, i64>(&index).await.unwrap() > 100);

        let unchanged: String = conn.get(&key).await.unwrap();
        assert_eq!(unchanged, stored);
    }

    #[tokio::test]
    async fn test_live_webrtc_read_renews_without_rewriting() {
        let Some(config) = live_config() else { return };
        let (lb, mut conn) = live_balancer(config).await;
        let ctx = CancellationToken::new();

        let ufrag = unique("ufrag");
        lb.store_webrtc(&ctx, "webrtc://host/live/s", RtcSession::new(ufrag.clone(), ""))
            .await
            .unwrap();
        let key = rtc_key(&ufrag);
        let stored: String = conn.get(&key).await.unwrap();

        let _: bool = conn.expire(&key, 5).await.unwrap();
        lb.load_webrtc_by_ufrag(&ctx, &ufrag).await.unwrap();

        assert!(conn.ttl::<_, i64>(&key).await.unwrap() > 100);
        let unchanged: String = conn.get(&key).await.unwrap();
        assert_eq!(unchanged, stored);
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use shared::types::{HlsSession, OriginServer, RtcSession, SessionRecord};
use crate::config::DefaultBackendConfig;
use super::{default_backend, ensure_active, Clock, LbError, LoadBalancer, Result, SystemClock};

#[derive(Default)]
struct State {
    /// Origins by composite key
    servers: HashMap<String, OriginServer>,
    /// Sticky assignment, stream URL to origin key
    picked: HashMap<String, String>,
    hls_by_stream: HashMap<String, HlsSession>,
    /// SPBHID to stream URL
    hls_by_spbhid: HashMap<String, String>,
    rtc_by_ufrag: HashMap<String, RtcSession>,
}

/// Process-local load balancer.
///
/// Every map sits behind one mutex. No operation awaits while holding it,
/// so critical sections are a few map accesses long.
pub struct MemoryLoadBalancer {
    default_backend: DefaultBackendConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl MemoryLoadBalancer {
    pub fn new(default_backend: DefaultBackendConfig) -> Self {
        Self::with_clock(default_backend, Arc::new(SystemClock))
    }

    pub fn with_clock(default_backend: DefaultBackendConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            default_backend,
            clock,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Map operations never leave State half-written, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pick_locked(&self, stream_url: &str) -> Result<OriginServer> {
        let now = self.clock.now();
        let mut state = self.state();

        if let Some(server) = state
            .picked
            .get(stream_url)
            .and_then(|id| state.servers.get(id))
            .filter(|server| server.is_alive(now))
        {
            return Ok(server.clone());
        }

        let alive: Vec<&OriginServer> = state
            .servers
            .values()
            .filter(|server| server.is_alive(now))
            .collect();
        let server = alive
            .choose(&mut rand::thread_rng())
            .map(|server| (*server).clone())
            .ok_or_else(|| LbError::NoAvailableBackend {
                stream_url: stream_url.to_string(),
            })?;

        state.picked.insert(stream_url.to_string(), server.id());
        Ok(server)
    }

    fn load_or_store_hls_locked(&self, stream_url: &str, mut value: HlsSession) -> (HlsSession, bool) {
        let now = self.clock.now();
        let mut state = self.state();

        if let Some(existing) = state.hls_by_stream.get_mut(stream_url) {
            if existing.is_alive(now) {
                existing.touch(now);
                return (existing.clone(), true);
            }
        }

        if let Some(stale) = state.hls_by_stream.remove(stream_url) {
            state.hls_by_spbhid.remove(&stale.spbhid);
        }

        value.stream_url = stream_url.to_string();
        value.touch(now);
        state
            .hls_by_spbhid
            .insert(value.spbhid.clone(), stream_url.to_string());
        state
            .hls_by_stream
            .insert(stream_url.to_string(), value.clone());
        (value, false)
    }

    fn load_hls_locked(&self, spbhid: &str) -> Option<HlsSession> {
        let now = self.clock.now();
        let mut state = self.state();

        let stream_url = state.hls_by_spbhid.get(spbhid)?.clone();
        let session = state.hls_by_stream.get_mut(&stream_url)?;
        if session.spbhid != spbhid || !session.is_alive(now) {
            return None;
        }
        session.touch(now);
        Some(session.clone())
    }

    fn load_rtc_locked(&self, ufrag: &str) -> Option<RtcSession> {
        let now = self.clock.now();
        let mut state = self.state();

        let session = state.rtc_by_ufrag.get_mut(ufrag)?;
        if !session.is_alive(now) {
            state.rtc_by_ufrag.remove(ufrag);
            return None;
        }
        session.touch(now);
        Some(session.clone())
    }

    fn prune_locked(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.state();
        let state = &mut *guard;

        let before = state.servers.len()
            + state.picked.len()
            + state.hls_by_stream.len()
            + state.rtc_by_ufrag.len();

        state.servers.retain(|_, server| server.is_alive(now));

        let servers = &state.servers;
        state.picked.retain(|_, id| servers.contains_key(id));

        let spbhid_index = &mut state.hls_by_spbhid;
        state.hls_by_stream.retain(|_, session| {
            let alive = session.is_alive(now);
            if !alive {
                spbhid_index.remove(&session.spbhid);
            }
            alive
        });

        state.rtc_by_ufrag.retain(|_, session| session.is_alive(now));

        let after = state.servers.len()
            + state.picked.len()
            + state.hls_by_stream.len()
            + state.rtc_by_ufrag.len();
        before - after
    }

    #[cfg(test)]
    pub(crate) fn origin_count(&self) -> usize {
        self.state().servers.len()
    }
}

#[async_trait]
impl LoadBalancer for MemoryLoadBalancer {
    async fn initialize(&self, ctx: &CancellationToken) -> Result<()> {
        ensure_active(ctx)?;

        if let Some(server) = default_backend::build(&self.default_backend)? {
            tracing::info!("Registering default backend {}", server.detailed());
            self.update(ctx, server).await?;
        }

        tracing::info!("Memory load balancer initialized");
        Ok(())
    }

    async fn update(&self, ctx: &CancellationToken, mut server: OriginServer) -> Result<()> {
        ensure_active(ctx)?;

        server.updated_at = self.clock.now();
        let id = server.id();
        let detail = server.detailed();

        let is_new = self.state().servers.insert(id, server).is_none();
        if is_new {
            tracing::info!("Origin registered: {}", detail);
        } else {
            tracing::debug!("Origin heartbeat: {}", detail);
        }
        Ok(())
    }

    async fn pick(&self, ctx: &CancellationToken, stream_url: &str) -> Result<OriginServer> {
        ensure_active(ctx)?;

        let server = self.pick_locked(stream_url)?;
        tracing::debug!("Picked {} for {}", server, stream_url);
        Ok(server)
    }

    async fn load_or_store_hls(
        &self,
        ctx: &CancellationToken,
        stream_url: &str,
        value: HlsSession,
    ) -> Result<(HlsSession, bool)> {
        ensure_active(ctx)?;

        let (session, existing) = self.load_or_store_hls_locked(stream_url, value);
        if !existing {
            tracing::debug!("HLS session {} created for {}", session.spbhid, stream_url);
        }
        Ok((session, existing))
    }

    async fn load_hls_by_spbhid(&self, ctx: &CancellationToken, spbhid: &str) -> Result<HlsSession> {
        ensure_active(ctx)?;

        self.load_hls_locked(spbhid)
            .ok_or_else(|| LbError::not_found("load_hls_by_spbhid", spbhid))
    }

    async fn store_webrtc(
        &self,
        ctx: &CancellationToken,
        stream_url: &str,
        mut value: RtcSession,
    ) -> Result<()> {
        ensure_active(ctx)?;

        value.stream_url = stream_url.to_string();
        value.touch(self.clock.now());
        tracing::debug!("WebRTC session {} stored for {}", value.ufrag, stream_url);

        self.state().rtc_by_ufrag.insert(value.ufrag.clone(), value);
        Ok(())
    }

    async fn load_webrtc_by_ufrag(&self, ctx: &CancellationToken, ufrag: &str) -> Result<RtcSession> {
        ensure_active(ctx)?;

        self.load_rtc_locked(ufrag)
            .ok_or_else(|| LbError::not_found("load_webrtc_by_ufrag", ufrag))
    }

    async fn prune(&self, ctx: &CancellationToken) -> Result<usize> {
        ensure_active(ctx)?;

        let removed = self.prune_locked();
        if removed > 0 {
            tracing::debug!("Pruned {} stale entries", removed);
        }
        Ok(removed)
    }
}

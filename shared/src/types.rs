use std::fmt;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::protocol::{HLS_ALIVE_DURATION, RTC_ALIVE_DURATION, SERVER_ALIVE_DURATION};

/// True while `now - updated_at` is strictly below `ttl`.
pub fn is_alive(updated_at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(updated_at) < chrono::Duration::milliseconds(ttl.as_millis() as i64)
}

/// A backend media origin announced through heartbeats.
///
/// This is the wire format exchanged between proxy instances sharing one
/// store, so field names must stay stable. Empty fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginServer {
    /// Origin IP, required for routing
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,

    /// Optional user-assigned label
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,

    /// Persisted by the origin, survives restarts
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_id: String,

    /// Regenerated on every origin restart
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_id: String,

    /// Origin process id, diagnostic only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pid: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtmp: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub srt: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtc: Vec<String>,

    /// Last heartbeat
    #[serde(rename = "update_at", default)]
    pub updated_at: DateTime<Utc>,
}

impl OriginServer {
    /// Composite key of one origin process instance.
    pub fn id(&self) -> String {
        format!("{}-{}-{}", self.server_id, self.service_id, self.pid)
    }

    pub fn is_alive(&self, now: DateTime<Utc>) -> bool {
        is_alive(self.updated_at, SERVER_ALIVE_DURATION, now)
    }

    /// One-line identity, used in most log lines.
    pub fn summary(&self) -> String {
        format!("SRS ip={}, id={}", self.ip, self.id())
    }

    /// Identity plus every non-empty endpoint list and the heartbeat time.
    pub fn detailed(&self) -> String {
        let mut out = format!(
            "{}, pid={}, server={}, service={}",
            self.summary(),
            self.pid,
            self.server_id,
            self.service_id
        );
        if !self.device_id.is_empty() {
            out.push_str(&format!(", device={}", self.device_id));
        }
        for (name, endpoints) in [
            ("rtmp", &self.rtmp),
            ("http", &self.http),
            ("api", &self.api),
            ("srt", &self.srt),
            ("rtc", &self.rtc),
        ] {
            if !endpoints.is_empty() {
                out.push_str(&format!(", {}=[{}]", name, endpoints.join(",")));
            }
        }
        out.push_str(&format!(
            ", update={}",
            self.updated_at.format("%Y-%m-%d %H:%M:%S%.3f")
        ));
        out
    }
}

impl fmt::Display for OriginServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Minimal capability shared by session affinity records.
pub trait SessionRecord {
    /// The key the session is looked up by.
    fn session_key(&self) -> &str;

    /// Refresh liveness.
    fn touch(&mut self, now: DateTime<Utc>);

    fn is_alive(&self, now: DateTime<Utc>) -> bool;
}

/// HLS playback session, keyed by SPBHID (SRS Proxy Backend HLS ID).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HlsSession {
    pub spbhid: String,
    pub stream_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub full_url: String,
    #[serde(rename = "update_at", default)]
    pub updated_at: DateTime<Utc>,
}

impl HlsSession {
    /// Creates a session with a freshly generated SPBHID.
    pub fn new(stream_url: impl Into<String>, full_url: impl Into<String>) -> Self {
        Self {
            spbhid: uuid::Uuid::new_v4().simple().to_string(),
            stream_url: stream_url.into(),
            full_url: full_url.into(),
            updated_at: Utc::now(),
        }
    }
}

impl SessionRecord for HlsSession {
    fn session_key(&self) -> &str {
        &self.spbhid
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn is_alive(&self, now: DateTime<Utc>) -> bool {
        is_alive(self.updated_at, HLS_ALIVE_DURATION, now)
    }
}

/// WebRTC session, keyed by the ICE username fragment negotiated in SDP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcSession {
    pub ufrag: String,
    pub stream_url: String,
    #[serde(rename = "update_at", default)]
    pub updated_at: DateTime<Utc>,
}

impl RtcSession {
    pub fn new(ufrag: impl Into<String>, stream_url: impl Into<String>) -> Self {
        Self {
            ufrag: ufrag.into(),
            stream_url: stream_url.into(),
            updated_at: Utc::now(),
        }
    }
}

impl SessionRecord for RtcSession {
    fn session_key(&self) -> &str {
        &self.ufrag
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn is_alive(&self, now: DateTime<Utc>) -> bool {
        is_alive(self.updated_at, RTC_ALIVE_DURATION, now)
    }
}

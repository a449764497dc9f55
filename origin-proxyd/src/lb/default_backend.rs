use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use shared::types::OriginServer;
use crate::config::DefaultBackendConfig;
use super::LbError;

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(char::from)
        .collect()
}

fn endpoints(value: &str) -> Vec<String> {
    if value.is_empty() {
        Vec::new()
    } else {
        vec![value.to_string()]
    }
}

/// Build the statically configured origin, if enabled.
///
/// Server and service ids are regenerated on every start, like a restarted
/// origin.
pub fn build(config: &DefaultBackendConfig) -> Result<Option<OriginServer>, LbError> {
    if !config.enabled {
        return Ok(None);
    }

    if config.ip.is_empty() {
        return Err(LbError::Config("empty default backend ip".to_string()));
    }
    if config.rtmp.is_empty() {
        return Err(LbError::Config("empty default backend rtmp".to_string()));
    }

    Ok(Some(OriginServer {
        ip: config.ip.clone(),
        device_id: String::new(),
        server_id: format!("default-{}", random_id()),
        service_id: random_id(),
        pid: std::process::id().to_string(),
        rtmp: endpoints(&config.rtmp),
        http: endpoints(&config.http),
        api: endpoints(&config.api),
        srt: endpoints(&config.srt),
        rtc: endpoints(&config.rtc),
        updated_at: Utc::now(),
    }))
}

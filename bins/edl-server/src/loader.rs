//! Configuration source: local files and HTTP endpoints.
//!
//! A location is either `file://<path>` or `http(s)://<url>`. HTTP bodies
//! may arrive wrapped as `{id, data: {…}}` and are unwrapped before
//! parsing. Loading is the only place in the layer that retries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use edl_core::config::LayerConfig;
use edl_core::registry::{self, Registry};

use crate::env;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_RETRIES: usize = 3;

/// Reads the raw configuration bytes from a location.
pub async fn load(location: &str) -> anyhow::Result<Vec<u8>> {
    if let Some(path) = location.strip_prefix("file://") {
        return tokio::fs::read(path)
            .await
            .with_context(|| format!("unable to open config file {path}"));
    }
    if location.starts_with("http") {
        let raw = load_url(location).await?;
        return Ok(unwrap_content(raw));
    }
    anyhow::bail!("config location not supported: {location}")
}

async fn load_url(endpoint: &str) -> anyhow::Result<Vec<u8>> {
    let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
    let mut last_err = None;
    for attempt in 1..=HTTP_RETRIES {
        match client.get(endpoint).send().await {
            Ok(resp) if resp.status().is_success() => {
                return Ok(resp.bytes().await?.to_vec());
            }
            Ok(resp) => {
                last_err = Some(anyhow::anyhow!("endpoint returned {}", resp.status()));
            }
            Err(e) => {
                last_err = Some(e.into());
            }
        }
        warn!(endpoint, attempt, "config fetch failed, retrying");
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("unable to open config url {endpoint}")))
}

/// Unwraps a `{id, data: {…}}` envelope; anything else passes through.
fn unwrap_content(raw: Vec<u8>) -> Vec<u8> {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&raw) else {
        return raw;
    };
    match value.get("data") {
        Some(data) if data.is_object() => serde_json::to_vec(data).unwrap_or(raw),
        _ => raw,
    }
}

/// Loads, parses, enriches and installs the configuration. Returns whether
/// the registry snapshot changed.
pub async fn reload(registry: &Registry, location: &str) -> anyhow::Result<bool> {
    let bytes = load(location).await?;
    let digest = registry::digest(&bytes);
    let mut config = LayerConfig::parse(&bytes).map_err(anyhow::Error::from)?;
    env::enrich(&mut config);
    Ok(registry.replace(config, digest))
}

/// Periodic refresh: reload on an interval, digest-gated, never fatal.
pub fn spawn_refresh(registry: Arc<Registry>, location: String, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the immediate first tick
        loop {
            ticker.tick().await;
            match reload(&registry, &location).await {
                Ok(true) => info!("configuration refreshed"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "configuration refresh failed"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwrap_content_handles_the_envelope() {
        let wrapped = br#"{"id": "cfg-1", "data": {"datasets": []}}"#.to_vec();
        let unwrapped = unwrap_content(wrapped);
        let value: serde_json::Value = serde_json::from_slice(&unwrapped).unwrap();
        assert!(value.get("datasets").is_some());
        assert!(value.get("data").is_none());
    }

    #[test]
    fn unwrap_content_passes_plain_documents() {
        let plain = br#"{"datasets": []}"#.to_vec();
        assert_eq!(unwrap_content(plain.clone()), plain);
        let broken = b"not json".to_vec();
        assert_eq!(unwrap_content(broken.clone()), broken);
    }

    #[tokio::test]
    async fn file_locations_load_and_install() {
        let path = std::env::temp_dir().join("edl-loader-test.json");
        tokio::fs::write(
            &path,
            br#"{"host": "localhost", "datasets": [{"name": "products", "sourceConfig": {"table_name": "product"}}]}"#,
        )
        .await
        .unwrap();

        let registry = Registry::new();
        let location = format!("file://{}", path.display());
        assert!(reload(&registry, &location).await.unwrap());
        assert_eq!(registry.list(), vec!["products"]);
        // unchanged bytes are a digest no-op
        assert!(!reload(&registry, &location).await.unwrap());

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn unsupported_locations_error() {
        assert!(load("ftp://example").await.is_err());
    }
}

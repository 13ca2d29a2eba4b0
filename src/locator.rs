//! Server discovery: probe candidate base URLs concurrently, rank by latency.
//!
//! Endpoints are transient; a discovery pass rebuilds the whole list and the
//! client keeps only the winner. Total failure is a valid result — the
//! client then marks itself unavailable and callers must re-check.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::domain::ServerEndpoint;
use crate::ollama::TextBackend;

/// Probe every candidate concurrently with a bounded per-probe timeout.
/// Returns one entry per candidate, reachable or not, in ranking order
/// (available first, fastest first).
pub async fn probe_all<B: TextBackend>(
  backend: &Arc<B>,
  candidates: &[String],
  probe_timeout: Duration,
) -> Vec<ServerEndpoint> {
  let mut set = JoinSet::new();
  for url in candidates {
    let url = url.clone();
    let backend = Arc::clone(backend);
    set.spawn(async move { probe_one(backend.as_ref(), url, probe_timeout).await });
  }

  let mut endpoints = Vec::with_capacity(candidates.len());
  while let Some(joined) = set.join_next().await {
    match joined {
      Ok(ep) => endpoints.push(ep),
      Err(e) => warn!(target: "triviagen", error = %e, "probe task panicked"),
    }
  }

  endpoints.sort_by_key(|ep| (!ep.available, ep.latency_ms.unwrap_or(u64::MAX)));
  let reachable = endpoints.iter().filter(|e| e.available).count();
  info!(target: "triviagen", probed = endpoints.len(), reachable, "discovery pass finished");
  endpoints
}

async fn probe_one<B: TextBackend>(
  backend: &B,
  url: String,
  probe_timeout: Duration,
) -> ServerEndpoint {
  let started = std::time::Instant::now();
  match tokio::time::timeout(probe_timeout, backend.version(&url, probe_timeout)).await {
    Ok(Ok(version)) => {
      let latency = started.elapsed().as_millis() as u64;
      debug!(target: "triviagen", %url, %version, latency_ms = latency, "probe ok");
      ServerEndpoint {
        url,
        available: true,
        version: Some(version),
        latency_ms: Some(latency),
      }
    }
    Ok(Err(e)) => {
      debug!(target: "triviagen", %url, error = %e, "probe failed");
      ServerEndpoint { url, available: false, version: None, latency_ms: None }
    }
    Err(_) => {
      debug!(target: "triviagen", %url, timeout_ms = probe_timeout.as_millis() as u64, "probe timed out");
      ServerEndpoint { url, available: false, version: None, latency_ms: None }
    }
  }
}

/// Fastest reachable endpoint, if any.
pub fn best(endpoints: &[ServerEndpoint]) -> Option<&ServerEndpoint> {
  endpoints
    .iter()
    .filter(|e| e.available)
    .min_by_key(|e| e.latency_ms.unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ep(url: &str, available: bool, latency_ms: Option<u64>) -> ServerEndpoint {
    ServerEndpoint { url: url.into(), available, version: None, latency_ms }
  }

  #[test]
  fn best_prefers_lowest_latency_among_reachable() {
    let eps = vec![
      ep("http://a", false, None),
      ep("http://b", true, Some(40)),
      ep("http://c", true, Some(12)),
    ];
    assert_eq!(best(&eps).map(|e| e.url.as_str()), Some("http://c"));
  }

  #[test]
  fn best_is_none_when_everything_is_down() {
    let eps = vec![ep("http://a", false, None), ep("http://b", false, None)];
    assert!(best(&eps).is_none());
  }
}

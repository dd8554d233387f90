//! HTTP probe endpoint on `may_minihttp`
//!
//! - readiness path: 200 with `{"status":"ready"}`, otherwise 503 with the reason
//! - liveness path: always 200 while the process runs
//! - `/metrics`: Prometheus text (feature `metrics`)

use crate::config::ProbeSettings;
use crate::migration::HistoryReader;
use crate::readiness::ReadinessGate;
use may::coroutine::JoinHandle;
use may_minihttp::{HttpServer, HttpService, Request, Response};
use std::io;
use std::sync::Arc;

const JSON_CONTENT_TYPE: &str = "Content-Type: application/json";
const TEXT_CONTENT_TYPE: &str = "Content-Type: text/plain; charset=utf-8";
#[cfg(feature = "metrics")]
const METRICS_CONTENT_TYPE: &str = "Content-Type: text/plain; version=0.0.4; charset=utf-8";

/// A rendered probe response, independent of the HTTP server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: usize,
    pub reason: &'static str,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl ProbeResponse {
    fn json(status: usize, reason: &'static str, body: &serde_json::Value) -> Self {
        Self {
            status,
            reason,
            content_type: JSON_CONTENT_TYPE,
            body: body.to_string().into_bytes(),
        }
    }

    fn text(status: usize, reason: &'static str, body: &str) -> Self {
        Self {
            status,
            reason,
            content_type: TEXT_CONTENT_TYPE,
            body: body.as_bytes().to_vec(),
        }
    }
}

/// Probe routes
pub struct ProbeService<R> {
    gate: Arc<ReadinessGate<R>>,
    readiness_path: String,
    liveness_path: String,
}

impl<R> Clone for ProbeService<R> {
    fn clone(&self) -> Self {
        Self {
            gate: Arc::clone(&self.gate),
            readiness_path: self.readiness_path.clone(),
            liveness_path: self.liveness_path.clone(),
        }
    }
}

impl<R: HistoryReader> ProbeService<R> {
    pub fn new(gate: Arc<ReadinessGate<R>>, settings: &ProbeSettings) -> Self {
        Self {
            gate,
            readiness_path: settings.readiness_path.clone(),
            liveness_path: settings.liveness_path.clone(),
        }
    }

    /// Route a request path (query string ignored)
    pub fn respond(&self, path: &str) -> ProbeResponse {
        let path = path.split('?').next().unwrap_or(path);

        if path == self.readiness_path {
            let readiness = self.gate.check_ready();
            return if readiness.is_ready() {
                ProbeResponse::json(200, "OK", &readiness.to_json())
            } else {
                ProbeResponse::json(503, "Service Unavailable", &readiness.to_json())
            };
        }

        if path == self.liveness_path {
            return ProbeResponse::json(200, "OK", &serde_json::json!({ "status": "alive" }));
        }

        #[cfg(feature = "metrics")]
        if path == "/metrics" {
            return match crate::metrics::encode() {
                Ok((_, body)) => ProbeResponse {
                    status: 200,
                    reason: "OK",
                    content_type: METRICS_CONTENT_TYPE,
                    body,
                },
                Err(e) => {
                    log::warn!("failed to encode metrics: {e}");
                    ProbeResponse::text(500, "Internal Server Error", "metrics unavailable")
                }
            };
        }

        ProbeResponse::text(404, "Not Found", "not found")
    }
}

impl<R> HttpService for ProbeService<R>
where
    R: HistoryReader + Send + Sync + 'static,
{
    fn call(&mut self, req: Request, res: &mut Response) -> io::Result<()> {
        let probe = self.respond(req.path());
        res.status_code(probe.status, probe.reason);
        res.header(probe.content_type);
        res.body_mut().extend_from_slice(&probe.body);
        Ok(())
    }
}

/// Start the probe server on `settings.bind_address()`
///
/// # Errors
///
/// Returns `io::Error` if the address cannot be bound.
pub fn serve<R>(gate: Arc<ReadinessGate<R>>, settings: &ProbeSettings) -> io::Result<JoinHandle<()>>
where
    R: HistoryReader + Send + Sync + 'static,
{
    let address = settings.bind_address();
    let service = ProbeService::new(gate, settings);
    let handle = HttpServer(service).start(&address)?;
    log::info!(
        "probe server listening on http://{address} (readiness: {}, liveness: {})",
        settings.readiness_path,
        settings.liveness_path
    );
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{MemoryHistoryStore, MigrationScript, ScriptRepository};
    use chrono::Utc;

    fn service(dir: &std::path::Path, store: MemoryHistoryStore) -> ProbeService<MemoryHistoryStore> {
        let gate = Arc::new(ReadinessGate::new(dir, store));
        ProbeService::new(gate, &ProbeSettings::default())
    }

    #[test]
    fn test_ready_when_no_scripts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let probe = service(dir.path(), MemoryHistoryStore::new());

        let response = probe.respond("/health/ready");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, br#"{"status":"ready"}"#.to_vec());
    }

    #[test]
    fn test_not_ready_with_pending_script() {
        let dir = tempfile::tempdir().expect("tempdir");
        ScriptRepository::new(dir.path())
            .write(&MigrationScript::new(
                20240101000000,
                "init",
                None,
                "SELECT 1;".to_string(),
                None,
                Utc::now(),
            ))
            .expect("write");
        let probe = service(dir.path(), MemoryHistoryStore::new());

        let response = probe.respond("/health/ready?verbose=1");
        assert_eq!(response.status, 503);
        let body: serde_json::Value = serde_json::from_slice(&response.body).expect("json");
        assert_eq!(body["reason"], "pending_migrations");
        assert_eq!(body["pending"], 1);
    }

    #[test]
    fn test_liveness_ignores_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MemoryHistoryStore::new();
        store.set_unreachable(true);
        let probe = service(dir.path(), store);

        assert_eq!(probe.respond("/health/live").status, 200);
        assert_eq!(probe.respond("/health/ready").status, 503);
        assert_eq!(probe.respond("/nope").status, 404);
    }
}

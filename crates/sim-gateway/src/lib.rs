#![deny(warnings)]

//! Network boundary to the authoritative server-side simulator.
//!
//! The session posts net percentage changes and gets back recalculated
//! forecasts that supersede local estimates. Every call carries a
//! [`RequestToken`] from a [`RequestSequencer`] so a response that lands after
//! a newer request was issued can be recognized as stale and dropped.

use budget_config::GatewayConfig;
use budget_core::{Budget, DateRange, ForecastId, Metric};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use thiserror::Error;
use tracing::{debug, warn};

/// Body of a simulation call: forecast id → percent change vs original.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub budget_changes: BTreeMap<ForecastId, f64>,
}

/// Server-side replacement for one forecast. Absent fields are left as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForecastUpdate {
    pub id: ForecastId,
    #[serde(default)]
    pub budget: Option<Budget>,
    #[serde(default)]
    pub metrics: Option<Vec<Metric>>,
}

/// Full or partial dataset returned by simulate/refresh.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationResponse {
    #[serde(default)]
    pub forecasts: Vec<ForecastUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

#[derive(Debug, Error, PartialEq)]
pub enum GatewayError {
    #[error("simulator unreachable: {0}")]
    Transport(String),
    #[error("simulator answered with status {0}")]
    Status(u16),
    #[error("malformed simulator response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            GatewayError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            GatewayError::Status(status.as_u16())
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

/// Monotonic id attached to each simulate/refresh call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestToken(u64);

impl RequestToken {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Issues tokens and tells whether a token is still the latest one.
#[derive(Debug, Default)]
pub struct RequestSequencer {
    issued: u64,
}

impl RequestSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self) -> RequestToken {
        self.issued += 1;
        RequestToken(self.issued)
    }

    /// Only the most recently issued token is current.
    pub fn is_current(&self, token: RequestToken) -> bool {
        self.issued != 0 && token.0 == self.issued
    }

    pub fn latest(&self) -> Option<RequestToken> {
        (self.issued != 0).then_some(RequestToken(self.issued))
    }
}

/// Operations offered by the simulator.
pub trait SimulationGateway {
    fn simulate(
        &self,
        request: &SimulationRequest,
    ) -> impl Future<Output = Result<SimulationResponse, GatewayError>> + Send;

    /// Current server-side dataset without budget changes.
    fn refresh(&self) -> impl Future<Output = Result<SimulationResponse, GatewayError>> + Send;

    /// Release server-side session resources (uploaded files).
    fn cleanup(&self) -> impl Future<Output = Result<(), GatewayError>> + Send;
}

/// [`SimulationGateway`] over HTTP/JSON.
#[derive(Clone, Debug)]
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    async fn post<T: DeserializeOwned>(
        &self,
        url: String,
        body: Option<&SimulationRequest>,
    ) -> Result<T, GatewayError> {
        let mut req = self.client.post(&url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            warn!(%url, status = status.as_u16(), "simulator rejected request");
            return Err(GatewayError::Status(status.as_u16()));
        }
        Ok(resp.json::<T>().await?)
    }
}

impl SimulationGateway for HttpGateway {
    fn simulate(
        &self,
        request: &SimulationRequest,
    ) -> impl Future<Output = Result<SimulationResponse, GatewayError>> + Send {
        async move {
            debug!(changes = request.budget_changes.len(), "posting simulation");
            self.post(self.config.simulate_url(), Some(request)).await
        }
    }

    fn refresh(&self) -> impl Future<Output = Result<SimulationResponse, GatewayError>> + Send {
        async move { self.post(self.config.refresh_url(), None).await }
    }

    fn cleanup(&self) -> impl Future<Output = Result<(), GatewayError>> + Send {
        async move {
            let url = self.config.cleanup_url();
            let resp = self.client.post(&url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(GatewayError::Status(status.as_u16()));
            }
            Ok(())
        }
    }
}

/// Fire the cleanup call on the runtime without waiting for it.
///
/// Failures are logged only; the handle is returned for callers that want to
/// give it a grace period before exiting.
pub fn spawn_cleanup<G>(gateway: G) -> tokio::task::JoinHandle<()>
where
    G: SimulationGateway + Send + Sync + 'static,
{
    tokio::spawn(async move {
        match gateway.cleanup().await {
            Ok(()) => debug!("cleanup acknowledged"),
            Err(e) => warn!(error = %e, "cleanup call failed"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one HTTP request, answer it, and hand back the raw request.
    async fn serve_once(status: u16, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(pos) = text.find("\r\n\r\n") {
                    let len = text[..pos]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if buf.len() >= pos + 4 + len {
                        break;
                    }
                }
            }
            let resp = format!(
                "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            let _ = sock.shutdown().await;
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    fn gateway(base_url: String) -> HttpGateway {
        HttpGateway::new(GatewayConfig {
            base_url,
            timeout_ms: 2_000,
            ..GatewayConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn request_wire_shape() {
        let mut req = SimulationRequest::default();
        req.budget_changes.insert("ForecastName 1".into(), -12.5);
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"budget_changes":{"ForecastName 1":-12.5}}"#);
    }

    #[test]
    fn partial_response_parses() {
        let raw = r#"{"forecasts":[
            {"id":"a","title":"ignored","budget":{"value":120.0,"currency":"£"}},
            {"id":"b","metrics":[{"name":"Clicks","current":10,"simulated":12,"impact":20.0}]}
        ]}"#;
        let resp: SimulationResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.forecasts.len(), 2);
        assert!(resp.forecasts[0].metrics.is_none());
        assert_eq!(resp.forecasts[1].budget, None);
        assert_eq!(resp.forecasts[1].metrics.as_ref().unwrap()[0].simulated, 12.0);
    }

    #[test]
    fn only_latest_token_is_current() {
        let mut seq = RequestSequencer::new();
        assert_eq!(seq.latest(), None);
        let first = seq.issue();
        assert!(seq.is_current(first));
        let second = seq.issue();
        assert!(!seq.is_current(first));
        assert!(seq.is_current(second));
        assert!(second > first);
        assert_eq!(second.get(), 2);
    }

    #[tokio::test]
    async fn simulate_posts_changes_and_decodes() {
        let (url, server) =
            serve_once(200, r#"{"forecasts":[{"id":"a","budget":{"value":90.0}}]}"#).await;
        let gw = gateway(url);
        let mut req = SimulationRequest::default();
        req.budget_changes.insert("a".into(), -10.0);
        let resp = gw.simulate(&req).await.unwrap();
        assert_eq!(resp.forecasts[0].budget.as_ref().unwrap().value, Some(90.0));
        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /impact/simulate"));
        assert!(raw.contains(r#""budget_changes":{"a":-10.0}"#));
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let (url, server) = serve_once(500, r#"{"error":"boom"}"#).await;
        let err = gateway(url).refresh().await.unwrap_err();
        assert_eq!(err, GatewayError::Status(500));
        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /impact/refresh"));
    }

    #[tokio::test]
    async fn garbage_body_is_decode_error() {
        let (url, _server) = serve_once(200, "not json").await;
        let err = gateway(url).refresh().await.unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));
    }

    #[tokio::test]
    async fn cleanup_posts_without_body() {
        let (url, server) = serve_once(200, r#"{"status":"success"}"#).await;
        gateway(url).cleanup().await.unwrap();
        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /impact/cleanup"));
    }

    #[derive(Clone, Default)]
    struct CountingGateway {
        cleanups: Arc<AtomicUsize>,
    }

    impl SimulationGateway for CountingGateway {
        fn simulate(
            &self,
            _request: &SimulationRequest,
        ) -> impl Future<Output = Result<SimulationResponse, GatewayError>> + Send {
            async { Ok(SimulationResponse::default()) }
        }

        fn refresh(&self) -> impl Future<Output = Result<SimulationResponse, GatewayError>> + Send {
            async { Ok(SimulationResponse::default()) }
        }

        fn cleanup(&self) -> impl Future<Output = Result<(), GatewayError>> + Send {
            let cleanups = self.cleanups.clone();
            async move {
                cleanups.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::Transport("offline".into()))
            }
        }
    }

    #[tokio::test]
    async fn spawned_cleanup_swallows_failure() {
        let gw = CountingGateway::default();
        let counter = gw.cleanups.clone();
        spawn_cleanup(gw).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

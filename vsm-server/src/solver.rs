//! Position solver and almanac source.
//!
//! `LoraCloudSolver` talks to a LoRa Cloud compatible service: one POST per
//! solve, one GET per almanac refresh, raw API key in `Authorization`.
//! Every failure is logged and reduced to `None`; nothing is retried.
//! Solved positions and the almanac TTL use the local clock, never the
//! network's.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use vsm_core::{Almanac, SolveKind, SolveRequest, SolveResponse};

use crate::cache::AlmanacCache;

/// Almanac endpoint below the solver base URL.
pub const ALMANAC_ENDPOINT: &str = "/api/v1/almanac/full";

/// Source of the current time.
pub type Clock = fn() -> DateTime<Utc>;

#[async_trait]
pub trait Solver: Send + Sync {
    /// Solve one scan. `None` means no usable answer.
    async fn solve(&self, request: &SolveRequest) -> Option<SolveResponse>;

    /// Current almanac, from cache when fresh.
    async fn load_almanac(&self) -> Option<Arc<Almanac>>;
}

#[derive(Deserialize)]
struct AlmanacEnvelope {
    result: Option<AlmanacPayload>,
}

#[derive(Deserialize)]
struct AlmanacPayload {
    almanac_image: Option<String>,
}

pub struct LoraCloudSolver {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    cache: AlmanacCache,
    clock: Clock,
}

impl LoraCloudSolver {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self::with_cache(base_url, api_key, AlmanacCache::default())
    }

    pub fn with_cache(base_url: &str, api_key: Option<String>, cache: AlmanacCache) -> Self {
        LoraCloudSolver {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
            cache,
            clock: Utc::now,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header(AUTHORIZATION, key),
            None => req,
        }
    }

    async fn fetch_almanac_image(&self) -> Option<Vec<u8>> {
        let url = format!("{}{ALMANAC_ENDPOINT}", self.base_url);
        debug!(%url, "GET almanac");

        let response = match self.authorized(self.client.get(&url)).send().await {
            Ok(r) => r,
            Err(e) => {
                error!(%url, error = %e, "almanac request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            error!(%url, status = %response.status(), "almanac request rejected");
            return None;
        }
        let envelope: AlmanacEnvelope = match response.json().await {
            Ok(e) => e,
            Err(e) => {
                error!(%url, error = %e, "almanac response is not JSON");
                return None;
            }
        };

        let encoded = envelope
            .result
            .and_then(|r| r.almanac_image)
            .filter(|s| !s.is_empty());
        let Some(encoded) = encoded else {
            error!("almanac response carries no image");
            return None;
        };
        match Almanac::decode_base64(&encoded) {
            Ok(image) if !image.is_empty() => Some(image),
            Ok(_) => {
                error!("almanac image is empty");
                None
            }
            Err(e) => {
                error!(error = %e, "bad almanac data");
                None
            }
        }
    }
}

#[async_trait]
impl Solver for LoraCloudSolver {
    async fn solve(&self, request: &SolveRequest) -> Option<SolveResponse> {
        if self.api_key.is_none() {
            warn!(kind = request.kind.name(), "no solver API key configured, skipping solve");
            return None;
        }
        let body = match request.prepare() {
            Ok(body) => body,
            Err(rejected) => {
                warn!(kind = request.kind.name(), errors = ?rejected.errors, "scan rejected locally");
                return Some(rejected);
            }
        };

        let url = format!("{}{}", self.base_url, request.kind.endpoint());
        info!(kind = request.kind.name(), "new positioning data");
        debug!(%url, "POST solve");

        let response = match self.authorized(self.client.post(&url)).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                error!(%url, error = %e, "solve request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            error!(%url, status = %response.status(), "solve request rejected");
            return None;
        }
        let parsed: SolveResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                error!(%url, error = %e, "solve response is not JSON");
                return None;
            }
        };
        debug!(response = ?parsed, "solver response");

        let checked = match request.kind {
            SolveKind::Wifi => parsed.require_wifi_algorithm(),
            SolveKind::Gnss => parsed,
        };
        Some(checked.stamp((self.clock)()))
    }

    async fn load_almanac(&self) -> Option<Arc<Almanac>> {
        if self.api_key.is_none() {
            warn!("no solver API key configured, almanac unavailable");
            return None;
        }
        self.cache
            .get_or_fetch((self.clock)(), || self.fetch_almanac_image())
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};
    use vsm_core::Update;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn wifi_request(aps: usize) -> SolveRequest {
        let aps: Vec<_> = (0..aps)
            .map(|i| json!({"macAddress": format!("aa:bb:cc:dd:ee:{i:02x}"), "signalStrength": -60}))
            .collect();
        let update = Update::from_value(&json!({
            "semtechEncoded": {"msgtype": "wifi"},
            "wifi": {"wifiAccessPoints": aps, "lorawan": [], "timestamp": 3}
        }))
        .unwrap();
        SolveRequest::from_update(&update).unwrap()
    }

    fn gnss_request() -> SolveRequest {
        let update = Update::from_value(&json!({
            "gnss": {"completeHex": "0011"},
            "semtechEncoded": {"msgtype": "gnss", "payload": "0011"}
        }))
        .unwrap();
        SolveRequest::from_update(&update).unwrap()
    }

    #[tokio::test]
    async fn test_wifi_solve() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/solve/loraWifi"))
            .and(header("authorization", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {"latitude": 46.98, "longitude": 6.91, "accuracy": 30.0, "algorithmType": "Wifi"},
                "warnings": ["few gateways"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let solver = LoraCloudSolver::new(&server.uri(), Some("secret".into())).with_clock(t0);
        let response = solver.solve(&wifi_request(3)).await.unwrap();
        let result = response.result.as_ref().unwrap();
        assert_eq!(result.latitude, Some(46.98));
        assert_eq!(result.position_timestamp, Some(t0()));
        assert_eq!(response.warnings, Some(vec!["few gateways".to_string()]));
    }

    #[tokio::test]
    async fn test_solve_stamped_with_local_time() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "latitude": 46.98,
                    "longitude": 6.91,
                    "algorithmType": "Wifi",
                    "positionTimestamp": "2001-01-01T00:00:00Z"
                }
            })))
            .mount(&server)
            .await;

        let before = Utc::now();
        let solver = LoraCloudSolver::new(&server.uri(), Some("k".into()));
        let response = solver.solve(&wifi_request(3)).await.unwrap();
        let stamped = response.result.unwrap().position_timestamp.unwrap();
        assert!(stamped >= before);
        assert!(stamped <= Utc::now());
    }

    #[tokio::test]
    async fn test_solve_requires_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let solver = LoraCloudSolver::new(&server.uri(), None);
        assert!(solver.solve(&wifi_request(3)).await.is_none());
        assert!(solver.solve(&gnss_request()).await.is_none());
    }

    #[tokio::test]
    async fn test_gnss_body_stripped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/solve/gnss_lora_edge_singleframe"))
            .and(body_json(json!({"payload": "0011"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {"latitude": 1.0, "longitude": 2.0, "algorithmType": "Gnss"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let solver = LoraCloudSolver::new(&server.uri(), Some("k".into()));
        let response = solver.solve(&gnss_request()).await.unwrap();
        assert!(response.result.is_some());
    }

    #[tokio::test]
    async fn test_too_few_access_points_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let solver = LoraCloudSolver::new(&server.uri(), Some("k".into()));
        let response = solver.solve(&wifi_request(1)).await.unwrap();
        assert!(response.result.is_none());
        assert_eq!(response.errors.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_http_error_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let solver = LoraCloudSolver::new(&server.uri(), Some("k".into()));
        assert!(solver.solve(&wifi_request(2)).await.is_none());
    }

    #[tokio::test]
    async fn test_bad_json_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let solver = LoraCloudSolver::new(&server.uri(), Some("k".into()));
        assert!(solver.solve(&gnss_request()).await.is_none());
    }

    #[tokio::test]
    async fn test_wifi_wrong_algorithm() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {"latitude": 1.0, "longitude": 2.0, "algorithmType": "Ip"}
            })))
            .mount(&server)
            .await;

        let solver = LoraCloudSolver::new(&server.uri(), Some("k".into()));
        let response = solver.solve(&wifi_request(2)).await.unwrap();
        assert!(response.result.is_none());
        assert_eq!(response.errors.unwrap()[0], "Got wrong type of response: Ip");
    }

    #[tokio::test]
    async fn test_load_almanac_cached() {
        let mut image = vec![0u8; 512];
        image[3] = 9;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(ALMANAC_ENDPOINT))
            .and(header("authorization", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {"almanac_image": STANDARD.encode(&image)}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let solver = LoraCloudSolver::new(&server.uri(), Some("k".into()));
        let first = solver.load_almanac().await.unwrap();
        let second = solver.load_almanac().await.unwrap();
        assert_eq!(first.image, image);
        assert!(first.is_compressed());
        assert!(Arc::ptr_eq(&first, &second));
    }

    static ELAPSED_H: AtomicI64 = AtomicI64::new(0);

    fn advancing_clock() -> DateTime<Utc> {
        t0() + Duration::hours(ELAPSED_H.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_almanac_expires_by_solver_clock() {
        let mut image = vec![0u8; 512];
        image[3] = 9;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {"almanac_image": STANDARD.encode(&image)}
            })))
            .expect(2)
            .mount(&server)
            .await;

        let solver = LoraCloudSolver::new(&server.uri(), Some("k".into())).with_clock(advancing_clock);
        solver.load_almanac().await.unwrap();
        ELAPSED_H.store(23, Ordering::SeqCst);
        solver.load_almanac().await.unwrap();
        ELAPSED_H.store(25, Ordering::SeqCst);
        solver.load_almanac().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_almanac_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let solver = LoraCloudSolver::new(&server.uri(), Some("k".into()));
        assert!(solver.load_almanac().await.is_none());
    }

    #[tokio::test]
    async fn test_load_almanac_without_image() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {}})))
            .mount(&server)
            .await;

        let solver = LoraCloudSolver::new(&server.uri(), Some("k".into()));
        assert!(solver.load_almanac().await.is_none());
    }

    #[tokio::test]
    async fn test_load_almanac_requires_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let solver = LoraCloudSolver::new(&server.uri(), None);
        assert!(solver.load_almanac().await.is_none());
    }
}

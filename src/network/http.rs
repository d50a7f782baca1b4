/// HTTP implementation of the collector, registry and liveness probe
///
/// Every operation walks the configured base URLs in order (gateway first,
/// then the direct database endpoint) and stops at the first definitive
/// answer.
use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;
use url::Url;

use crate::models::Reading;
use crate::network::collector::{
    classify_send_status, Acceptance, AssignmentBody, AssignmentReply, Collector, DeliveryError,
    Registration, Registry,
};
use crate::network::connectivity::Probe;

#[derive(Clone)]
pub struct HttpCollector {
    client: reqwest::Client,
    probe_client: reqwest::Client,
    candidates: Vec<Url>,
    label: String,
}

impl HttpCollector {
    pub fn new(
        candidates: Vec<Url>,
        request_timeout: Duration,
        probe_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        let probe_client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let label = candidates
            .iter()
            .map(Url::as_str)
            .collect::<Vec<_>>()
            .join(" | ");

        Ok(HttpCollector {
            client,
            probe_client,
            candidates,
            label,
        })
    }
}

/// Append path segments to a base URL, escaping each segment
pub fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, DeliveryError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| DeliveryError::InvalidEndpoint(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[async_trait]
impl Collector for HttpCollector {
    async fn send(&self, reading: &Reading) -> Result<Acceptance, DeliveryError> {
        let mut last_error = DeliveryError::Connection("no collector endpoints configured".into());

        for base in &self.candidates {
            let url = endpoint(base, &["sensor-data"])?;
            debug!("Sending reading {} to {}", reading.captured_at(), url);

            let status = match self.client.post(url.clone()).json(reading).send().await {
                Ok(response) => response.status().as_u16(),
                Err(e) => {
                    let e = DeliveryError::from(e);
                    warn!("Send to {} failed: {}", url, e);
                    last_error = e;
                    continue;
                }
            };

            match classify_send_status(status) {
                Ok(acceptance) => {
                    match acceptance {
                        Acceptance::Delivered => info!("Reading delivered via {}", base),
                        Acceptance::QueuedRemotely => {
                            info!("{} accepted reading but stored it offline", base)
                        }
                        Acceptance::StoredOffline => {
                            warn!("{} unavailable but accepted reading for offline storage", base)
                        }
                    }
                    return Ok(acceptance);
                }
                Err(DeliveryError::Rejected) => {
                    warn!("{} rejected reading - sensor not assigned", base);
                    return Err(DeliveryError::Rejected);
                }
                Err(e) => {
                    warn!("Send to {} failed: {}", url, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl Registry for HttpCollector {
    async fn register(&self, registration: &Registration) -> Result<(), DeliveryError> {
        let mut last_error = DeliveryError::Connection("no registry endpoints configured".into());

        for base in &self.candidates {
            let url = endpoint(base, &["sensors", "register"])?;
            match self.client.post(url.clone()).json(registration).send().await {
                Ok(response) if matches!(response.status().as_u16(), 200 | 201) => {
                    info!("Sensor registered via {}", base);
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    warn!("Registration via {} returned status {}", base, status);
                    last_error = DeliveryError::UnexpectedStatus(status);
                }
                Err(e) => {
                    let e = DeliveryError::from(e);
                    warn!("Registration via {} failed: {}", base, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn assignment(&self, device_id: &str) -> Result<AssignmentReply, DeliveryError> {
        let mut last_error = DeliveryError::Connection("no registry endpoints configured".into());
        let mut unknown = false;

        for base in &self.candidates {
            let url = endpoint(base, &["sensors", device_id, "assignment"])?;
            let response = match self.client.get(url).send().await {
                Ok(response) => response,
                Err(e) => {
                    let e = DeliveryError::from(e);
                    warn!("Assignment check via {} failed: {}", base, e);
                    last_error = e;
                    continue;
                }
            };

            match response.status().as_u16() {
                200 => match response.json::<AssignmentBody>().await {
                    Ok(body) => return Ok(AssignmentReply::Known(body.into())),
                    Err(e) => {
                        let e = DeliveryError::InvalidResponse(e.to_string());
                        warn!("Assignment check via {} returned bad body: {}", base, e);
                        last_error = e;
                    }
                },
                404 => {
                    debug!("{} does not know sensor {}", base, device_id);
                    unknown = true;
                }
                status => {
                    warn!("Assignment check via {} returned status {}", base, status);
                    last_error = DeliveryError::UnexpectedStatus(status);
                }
            }
        }

        if unknown {
            Ok(AssignmentReply::UnknownDevice)
        } else {
            Err(last_error)
        }
    }
}

#[async_trait]
impl Probe for HttpCollector {
    fn target(&self) -> &str {
        &self.label
    }

    /// Reachable if any candidate answers `GET {base}/test` with 200
    async fn probe(&self) -> bool {
        for base in &self.candidates {
            let url = match endpoint(base, &["test"]) {
                Ok(url) => url,
                Err(_) => continue,
            };
            match self.probe_client.get(url).send().await {
                Ok(response) if response.status().as_u16() == 200 => return true,
                Ok(response) => debug!("{} health check returned {}", base, response.status()),
                Err(e) => debug!("{} health check failed: {}", base, e),
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Assignment;
    use crate::testing::sample_reading;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn collector(servers: &[&MockServer]) -> HttpCollector {
        let candidates = servers
            .iter()
            .map(|server| Url::parse(&format!("{}/api", server.uri())).unwrap())
            .collect();
        HttpCollector::new(candidates, Duration::from_secs(2), Duration::from_secs(1)).unwrap()
    }

    async fn respond(server: &MockServer, verb: &str, route: &str, status: u16, hits: u64) {
        Mock::given(method(verb))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .expect(hits)
            .mount(server)
            .await;
    }

    fn registration() -> Registration {
        Registration {
            machine_id: "dev-1".into(),
            connection_timestamp: "2024-05-01 12:00:00".into(),
            sensor_type: "Soil_Monitor_V1".into(),
            firmware_version: "1.0".into(),
            response_length: 19,
        }
    }

    #[test]
    fn endpoint_appends_segments() {
        let base = Url::parse("http://192.168.1.80:5000/api").unwrap();
        assert_eq!(
            endpoint(&base, &["sensor-data"]).unwrap().as_str(),
            "http://192.168.1.80:5000/api/sensor-data"
        );

        let slashed = Url::parse("http://192.168.1.80:5000/api/").unwrap();
        assert_eq!(
            endpoint(&slashed, &["sensors", "abc 1", "assignment"])
                .unwrap()
                .as_str(),
            "http://192.168.1.80:5000/api/sensors/abc%201/assignment"
        );
    }

    #[tokio::test]
    async fn unreachable_candidates_are_transient() {
        // Port 9 on localhost: connection refused, no listener
        let base = Url::parse("http://127.0.0.1:9/api").unwrap();
        let collector =
            HttpCollector::new(vec![base], Duration::from_secs(2), Duration::from_secs(1)).unwrap();

        assert!(!collector.probe().await);
        let err = collector
            .assignment("dev-1")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn send_falls_through_to_database_on_gateway_failure() {
        let gateway = MockServer::start().await;
        let database = MockServer::start().await;
        respond(&gateway, "POST", "/api/sensor-data", 500, 1).await;
        Mock::given(method("POST"))
            .and(path("/api/sensor-data"))
            .and(body_partial_json(json!({
                "machine_id": "dev-1",
                "timestamp": "2024-05-01 12:30:00",
                "crc_valid": true,
                "response_bytes": 19
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&database)
            .await;

        let result = collector(&[&gateway, &database])
            .send(&sample_reading("dev-1"))
            .await;
        assert_eq!(result, Ok(Acceptance::Delivered));
    }

    #[tokio::test]
    async fn rejection_stops_at_first_candidate() {
        let gateway = MockServer::start().await;
        let database = MockServer::start().await;
        respond(&gateway, "POST", "/api/sensor-data", 403, 1).await;
        respond(&database, "POST", "/api/sensor-data", 200, 0).await;

        let result = collector(&[&gateway, &database])
            .send(&sample_reading("dev-1"))
            .await;
        assert_eq!(result, Err(DeliveryError::Rejected));
    }

    #[tokio::test]
    async fn deferred_statuses_count_as_accepted() {
        let queued = MockServer::start().await;
        let offline = MockServer::start().await;
        respond(&queued, "POST", "/api/sensor-data", 202, 1).await;
        respond(&offline, "POST", "/api/sensor-data", 503, 1).await;
        let reading = sample_reading("dev-1");

        assert_eq!(
            collector(&[&queued]).send(&reading).await,
            Ok(Acceptance::QueuedRemotely)
        );
        assert_eq!(
            collector(&[&offline]).send(&reading).await,
            Ok(Acceptance::StoredOffline)
        );
    }

    #[tokio::test]
    async fn send_reports_last_failure_when_all_candidates_fail() {
        let gateway = MockServer::start().await;
        let database = MockServer::start().await;
        respond(&gateway, "POST", "/api/sensor-data", 500, 1).await;
        respond(&database, "POST", "/api/sensor-data", 502, 1).await;

        let err = collector(&[&gateway, &database])
            .send(&sample_reading("dev-1"))
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::UnexpectedStatus(502));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn register_accepts_created() {
        let gateway = MockServer::start().await;
        let database = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sensors/register"))
            .and(body_partial_json(json!({
                "machine_id": "dev-1",
                "response_length": 19
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&gateway)
            .await;
        respond(&database, "POST", "/api/sensors/register", 200, 0).await;

        let result = collector(&[&gateway, &database])
            .register(&registration())
            .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn register_falls_through_to_database() {
        let gateway = MockServer::start().await;
        let database = MockServer::start().await;
        respond(&gateway, "POST", "/api/sensors/register", 500, 1).await;
        respond(&database, "POST", "/api/sensors/register", 200, 1).await;

        let result = collector(&[&gateway, &database])
            .register(&registration())
            .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn not_found_with_failures_elsewhere_is_unknown_device() {
        let gateway = MockServer::start().await;
        let database = MockServer::start().await;
        respond(&gateway, "GET", "/api/sensors/dev-1/assignment", 500, 1).await;
        respond(&database, "GET", "/api/sensors/dev-1/assignment", 404, 1).await;

        let reply = collector(&[&gateway, &database])
            .assignment("dev-1")
            .await;
        assert_eq!(reply, Ok(AssignmentReply::UnknownDevice));
    }

    #[tokio::test]
    async fn known_assignment_wins_over_not_found() {
        let gateway = MockServer::start().await;
        let database = MockServer::start().await;
        respond(&gateway, "GET", "/api/sensors/dev-1/assignment", 404, 1).await;
        Mock::given(method("GET"))
            .and(path("/api/sensors/dev-1/assignment"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "assigned": true,
                "farm_id": 7,
                "zone_code": "B2"
            })))
            .expect(1)
            .mount(&database)
            .await;

        let reply = collector(&[&gateway, &database])
            .assignment("dev-1")
            .await;
        assert_eq!(
            reply,
            Ok(AssignmentReply::Known(Assignment::Assigned {
                farm_id: Some("7".into()),
                zone_code: Some("B2".into()),
            }))
        );
    }

    #[tokio::test]
    async fn health_check_passes_if_any_candidate_answers() {
        let gateway = MockServer::start().await;
        let database = MockServer::start().await;
        respond(&gateway, "GET", "/api/test", 500, 1).await;
        respond(&database, "GET", "/api/test", 200, 1).await;

        assert!(collector(&[&gateway, &database]).probe().await);
    }
}

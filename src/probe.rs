//! Single-shot, bounded health probes against a service's health endpoint.
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tracing::debug;

use crate::error::LifecycleError;
use crate::registry::ServiceSpec;

/// Classified result of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthOutcome {
    Healthy,
    Unhealthy,
    Timeout,
    ConnectionError,
}

/// One recorded probe. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    pub outcome: HealthOutcome,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl HealthSample {
    /// Creates a sample stamped with the current time.
    pub fn new(outcome: HealthOutcome, latency_ms: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            outcome,
            latency_ms,
            status_code: None,
        }
    }

    /// Attaches the HTTP status code that produced the sample.
    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.outcome == HealthOutcome::Healthy
    }
}

/// What came back from the wire, independent of the HTTP client in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResponse<'a> {
    /// The endpoint answered with a status code and possibly a body.
    Status { code: u16, body: Option<&'a str> },
    /// Nothing arrived before the deadline.
    TimedOut,
    /// The connection was refused, reset, or otherwise failed.
    ConnectionFailed,
}

/// Maps a raw probe response to an outcome.
///
/// HTTP 200 is healthy unless the body is a JSON object whose `status` field is anything
/// other than `"healthy"` (case-insensitive). Bodies that are not JSON, or JSON without a
/// `status` field, count as healthy.
pub fn classify(response: ProbeResponse<'_>) -> HealthOutcome {
    match response {
        ProbeResponse::TimedOut => HealthOutcome::Timeout,
        ProbeResponse::ConnectionFailed => HealthOutcome::ConnectionError,
        ProbeResponse::Status { code: 200, body } => match body.map(body_status) {
            Some(Some(false)) => HealthOutcome::Unhealthy,
            _ => HealthOutcome::Healthy,
        },
        ProbeResponse::Status { .. } => HealthOutcome::Unhealthy,
    }
}

/// `Some(true)` when the body reports healthy, `Some(false)` when it reports anything else,
/// `None` when the body carries no structured status.
fn body_status(body: &str) -> Option<bool> {
    let value: serde_json::Value = serde_json::from_str(body.trim()).ok()?;
    let status = value.as_object()?.get("status")?;
    Some(
        status
            .as_str()
            .is_some_and(|status| status.eq_ignore_ascii_case("healthy")),
    )
}

/// Answers "is this service serving traffic right now" with a single bounded call.
///
/// Implementations never fail: every failure mode is an outcome.
pub trait HealthProber: Send + Sync {
    fn probe(&self, service: &ServiceSpec, timeout: Duration) -> HealthSample;
}

/// Probes `GET {protocol}://{host}:{port}{health_path}` with a blocking HTTP client.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: Client,
}

impl HttpProber {
    pub fn new() -> Result<Self, LifecycleError> {
        let client = Client::builder().build()?;
        Ok(Self { client })
    }
}

impl HealthProber for HttpProber {
    fn probe(&self, service: &ServiceSpec, timeout: Duration) -> HealthSample {
        let url = service.health_url();
        let started = Instant::now();

        let result = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .and_then(|response| {
                let code = response.status().as_u16();
                let body = response.text()?;
                Ok((code, body))
            });

        let (outcome, code) = match result {
            Ok((code, body)) => (
                classify(ProbeResponse::Status {
                    code,
                    body: Some(&body),
                }),
                Some(code),
            ),
            Err(err) if err.is_timeout() => (classify(ProbeResponse::TimedOut), None),
            Err(err) => {
                debug!("Health probe for '{}' at {url} failed: {err}", service.id);
                (classify(ProbeResponse::ConnectionFailed), None)
            }
        };

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(
            "Probed '{}' at {url}: {outcome} in {latency_ms:.1}ms",
            service.id
        );

        let sample = HealthSample::new(outcome, latency_ms);
        match code {
            Some(code) => sample.with_status_code(code),
            None => sample,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Directive;
    use httpmock::prelude::*;
    use std::net::TcpListener;

    fn spec_for(server: &MockServer) -> ServiceSpec {
        ServiceSpec::new("api", server.port(), &[], Directive::new("true", "."))
    }

    #[test]
    fn classify_is_a_function_of_status_and_transport() {
        let ok = ProbeResponse::Status {
            code: 200,
            body: None,
        };
        assert_eq!(classify(ok), HealthOutcome::Healthy);
        for code in [404, 500, 503, 204] {
            let response = ProbeResponse::Status { code, body: None };
            assert_eq!(classify(response), HealthOutcome::Unhealthy, "code {code}");
        }
        assert_eq!(classify(ProbeResponse::TimedOut), HealthOutcome::Timeout);
        assert_eq!(
            classify(ProbeResponse::ConnectionFailed),
            HealthOutcome::ConnectionError
        );
    }

    #[test]
    fn classify_honours_structured_status_field() {
        let healthy = ProbeResponse::Status {
            code: 200,
            body: Some(r#"{"status": "Healthy", "uptime": 12}"#),
        };
        assert_eq!(classify(healthy), HealthOutcome::Healthy);

        let degraded = ProbeResponse::Status {
            code: 200,
            body: Some(r#"{"status": "degraded"}"#),
        };
        assert_eq!(classify(degraded), HealthOutcome::Unhealthy);

        let plain = ProbeResponse::Status {
            code: 200,
            body: Some("OK"),
        };
        assert_eq!(classify(plain), HealthOutcome::Healthy);

        let no_status = ProbeResponse::Status {
            code: 200,
            body: Some(r#"{"version": "1.2.0"}"#),
        };
        assert_eq!(classify(no_status), HealthOutcome::Healthy);

        let wrong_code = ProbeResponse::Status {
            code: 500,
            body: Some(r#"{"status": "healthy"}"#),
        };
        assert_eq!(classify(wrong_code), HealthOutcome::Unhealthy);
    }

    #[test]
    fn http_prober_reports_healthy_endpoint() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"status": "healthy"}"#);
        });

        let prober = HttpProber::new().unwrap();
        let sample = prober.probe(&spec_for(&server), Duration::from_secs(2));
        assert_eq!(sample.outcome, HealthOutcome::Healthy);
        assert_eq!(sample.status_code, Some(200));
        assert!(sample.latency_ms >= 0.0);
    }

    #[test]
    fn http_prober_reports_server_errors_as_unhealthy() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(500);
        });

        let prober = HttpProber::new().unwrap();
        let sample = prober.probe(&spec_for(&server), Duration::from_secs(2));
        assert_eq!(sample.outcome, HealthOutcome::Unhealthy);
        assert_eq!(sample.status_code, Some(500));
    }

    #[test]
    fn http_prober_times_out_on_slow_endpoint() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(200).delay(Duration::from_millis(1500));
        });

        let prober = HttpProber::new().unwrap();
        let sample = prober.probe(&spec_for(&server), Duration::from_millis(200));
        assert_eq!(sample.outcome, HealthOutcome::Timeout);
        assert!(sample.latency_ms < 1500.0);
    }

    #[test]
    fn http_prober_reports_refused_connections() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let spec = ServiceSpec::new("gone", port, &[], Directive::new("true", "."));

        let prober = HttpProber::new().unwrap();
        let sample = prober.probe(&spec, Duration::from_secs(1));
        assert_eq!(sample.outcome, HealthOutcome::ConnectionError);
        assert_eq!(sample.status_code, None);
    }
}

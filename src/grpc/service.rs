//! Admission service implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use super::proto::floodgate::admission::v1::{
    admission_service_server::AdmissionService, rejection::Reason, AdmitRequest, AdmitResponse,
    CompleteRequest, CompleteResponse, Rejection as RejectionMessage,
};

use crate::admission::{resolve_client_ip, AdmissionControl, Decision, Rejection, RequestIdentity};
use crate::breaker::ProbeId;
use crate::error::AdmissionError;

/// Implementation of the `floodgate.admission.v1.AdmissionService` interface.
pub struct AdmissionServiceImpl<A: AdmissionControl> {
    /// The admission layer answering requests
    admission: Arc<A>,
}

impl<A: AdmissionControl> AdmissionServiceImpl<A> {
    pub fn new(admission: Arc<A>) -> Self {
        Self { admission }
    }
}

#[tonic::async_trait]
impl<A: AdmissionControl + 'static> AdmissionService for AdmissionServiceImpl<A> {
    /// Decide whether a request may reach its handler.
    ///
    /// The caller is expected to answer a rejection itself using the returned
    /// status and body, and to report admitted requests through `Complete`.
    #[instrument(skip(self, request), fields(path = %request.get_ref().path))]
    async fn admit(&self, request: Request<AdmitRequest>) -> Result<Response<AdmitResponse>, Status> {
        let req = request.into_inner();

        if req.path.is_empty() {
            warn!("Received admit request with empty path");
            return Err(Status::invalid_argument("path is required"));
        }

        let client_ip = if req.client_ip.is_empty() {
            let remote = peer_ip(&req.remote_addr);
            resolve_client_ip(&req.headers, remote.as_deref())
        } else {
            req.client_ip
        };

        let mut identity = RequestIdentity::new(req.path).with_ip(client_ip);
        if !req.user_id.is_empty() {
            identity = identity.with_user(req.user_id);
        }

        let response = match self.admission.before(&identity) {
            Decision::Admit(ticket) => {
                debug!(path = %ticket.path(), probe = ticket.is_probe(), "Request admitted");
                let probe_id = ticket.probe_id().map_or(0, |p| p.get());
                // The outcome arrives later through `complete`.
                ticket.detach();
                AdmitResponse {
                    allowed: true,
                    rejection: None,
                    probe_id,
                }
            }
            Decision::Reject(rejection) => AdmitResponse {
                allowed: false,
                rejection: Some(to_message(&rejection)),
                probe_id: 0,
            },
        };

        Ok(Response::new(response))
    }

    #[instrument(skip(self, request), fields(path = %request.get_ref().path))]
    async fn complete(
        &self,
        request: Request<CompleteRequest>,
    ) -> Result<Response<CompleteResponse>, Status> {
        let req = request.into_inner();

        if req.path.is_empty() {
            warn!("Received complete request with empty path");
            return Err(Status::invalid_argument("path is required"));
        }

        self.admission.complete(
            &req.path,
            Duration::from_millis(req.elapsed_ms),
            req.failed,
            ProbeId::from_raw(req.probe_id),
        );

        Ok(Response::new(CompleteResponse {}))
    }
}

/// Strip the port from a peer address; anything unparseable is used as is.
fn peer_ip(remote_addr: &str) -> Option<String> {
    if remote_addr.is_empty() {
        return None;
    }
    match remote_addr.parse::<SocketAddr>() {
        Ok(addr) => Some(addr.ip().to_string()),
        Err(_) => Some(remote_addr.to_string()),
    }
}

fn to_message(rejection: &Rejection) -> RejectionMessage {
    let (reason, dimension, key) = match &rejection.reason {
        AdmissionError::RateLimited { dimension, key } => {
            (Reason::RateLimited, dimension.as_str().to_string(), key.clone())
        }
        AdmissionError::CircuitOpen { path } => (Reason::CircuitOpen, String::new(), path.clone()),
    };

    RejectionMessage {
        http_status: u32::from(rejection.status()),
        body: rejection.to_json(),
        reason: reason.into(),
        dimension,
        key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionMiddleware;
    use crate::clock::MockClock;
    use crate::config::{AdmissionConfig, BreakerConfig, DimensionLimit, ThresholdMode};
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    fn service() -> AdmissionServiceImpl<AdmissionMiddleware> {
        service_with_clock(MockClock::new())
    }

    fn service_with_clock(clock: MockClock) -> AdmissionServiceImpl<AdmissionMiddleware> {
        let config = AdmissionConfig {
            ip: DimensionLimit::new(1.0, 2),
            breaker: BreakerConfig {
                threshold_mode: ThresholdMode::Count,
                error_threshold: 2.0,
                half_open_max_probes: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let middleware = AdmissionMiddleware::with_clock(&config, Arc::new(clock));
        AdmissionServiceImpl::new(Arc::new(middleware))
    }

    fn admit_request(path: &str, client_ip: &str) -> Request<AdmitRequest> {
        Request::new(AdmitRequest {
            path: path.to_string(),
            client_ip: client_ip.to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_empty_path_rejected() {
        let service = service();

        let status = assert_err!(service.admit(admit_request("", "10.0.0.1")).await);
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = assert_err!(
            service
                .complete(Request::new(CompleteRequest::default()))
                .await
        );
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_admit_then_rate_limited() {
        let service = service();

        for _ in 0..2 {
            let response = service
                .admit(admit_request("/api/orders", "10.0.0.1"))
                .await
                .unwrap()
                .into_inner();
            assert!(response.allowed);
            assert!(response.rejection.is_none());
        }

        let response = service
            .admit(admit_request("/api/orders", "10.0.0.1"))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.allowed);

        let rejection = response.rejection.unwrap();
        assert_eq!(rejection.http_status, 429);
        assert_eq!(rejection.reason, i32::from(Reason::RateLimited));
        assert_eq!(rejection.dimension, "ip");
        assert_eq!(rejection.key, "10.0.0.1");
        assert_eq!(
            rejection.body,
            r#"{"code":429,"message":"Too many requests, please retry later"}"#
        );
    }

    #[tokio::test]
    async fn test_client_ip_resolved_from_headers() {
        let service = service();
        let mut headers = HashMap::new();
        headers.insert("X-Forwarded-For".to_string(), "203.0.113.9, 10.0.0.1".to_string());

        for expected_allowed in [true, true, false] {
            let request = Request::new(AdmitRequest {
                path: "/api/orders".to_string(),
                headers: headers.clone(),
                remote_addr: "10.0.0.1:50000".to_string(),
                ..Default::default()
            });
            let response = assert_ok!(service.admit(request).await).into_inner();
            assert_eq!(response.allowed, expected_allowed);
            if let Some(rejection) = response.rejection {
                assert_eq!(rejection.key, "203.0.113.9");
            }
        }
    }

    #[tokio::test]
    async fn test_completions_open_circuit() {
        let service = service();

        for i in 0..2 {
            service
                .admit(admit_request("/api/flaky", &format!("10.0.1.{}", i)))
                .await
                .unwrap();
            service
                .complete(Request::new(CompleteRequest {
                    path: "/api/flaky".to_string(),
                    elapsed_ms: 12,
                    failed: true,
                    probe_id: 0,
                }))
                .await
                .unwrap();
        }

        let response = service
            .admit(admit_request("/api/flaky", "10.0.1.9"))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.allowed);

        let rejection = response.rejection.unwrap();
        assert_eq!(rejection.http_status, 429);
        assert_eq!(rejection.reason, i32::from(Reason::CircuitOpen));
        assert_eq!(rejection.key, "/api/flaky");
        assert!(rejection.dimension.is_empty());
    }

    #[tokio::test]
    async fn test_probe_id_round_trip_recovers_circuit() {
        let clock = MockClock::new();
        let service = service_with_clock(clock.clone());
        let fail = |path: &str| {
            Request::new(CompleteRequest {
                path: path.to_string(),
                elapsed_ms: 12,
                failed: true,
                probe_id: 0,
            })
        };

        assert_ok!(service.complete(fail("/api/flaky")).await);
        assert_ok!(service.complete(fail("/api/flaky")).await);
        clock.advance(Duration::from_secs(30));

        // The first probe's completion is lost.
        let lost = assert_ok!(service.admit(admit_request("/api/flaky", "10.0.2.1")).await)
            .into_inner();
        assert!(lost.allowed);
        assert_ne!(lost.probe_id, 0);
        let denied = assert_ok!(service.admit(admit_request("/api/flaky", "10.0.2.2")).await)
            .into_inner();
        assert!(!denied.allowed);

        clock.advance(Duration::from_secs(60));
        let probe = assert_ok!(service.admit(admit_request("/api/flaky", "10.0.2.3")).await)
            .into_inner();
        assert!(probe.allowed);
        assert_ne!(probe.probe_id, lost.probe_id);

        // A completion without the id does not count as the probe's outcome.
        let mut success = CompleteRequest {
            path: "/api/flaky".to_string(),
            elapsed_ms: 12,
            failed: false,
            probe_id: 0,
        };
        assert_ok!(service.complete(Request::new(success.clone())).await);
        let still_half_open = assert_ok!(service.admit(admit_request("/api/flaky", "10.0.2.4")).await)
            .into_inner();
        assert!(!still_half_open.allowed);

        success.probe_id = probe.probe_id;
        assert_ok!(service.complete(Request::new(success)).await);
        let recovered = assert_ok!(service.admit(admit_request("/api/flaky", "10.0.2.5")).await)
            .into_inner();
        assert!(recovered.allowed);
        assert_eq!(recovered.probe_id, 0);
    }

    #[test]
    fn test_peer_ip() {
        assert_eq!(peer_ip(""), None);
        assert_eq!(peer_ip("10.0.0.7:51544").as_deref(), Some("10.0.0.7"));
        assert_eq!(peer_ip("[::1]:8080").as_deref(), Some("::1"));
        assert_eq!(peer_ip("10.0.0.7").as_deref(), Some("10.0.0.7"));
    }
}

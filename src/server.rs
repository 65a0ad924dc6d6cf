use std::{net::IpAddr, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing, Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info, Span};

use crate::{email::OutboundMessage, relay::Relay, validate::validate_submission};

pub const CONTACT_PATH: &str = "/api/contact";

const ALLOW_METHODS: &str = "POST, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type";
const MAX_AGE: &str = "86400";

pub struct AppState<R> {
    /// `None` when no SMTP credentials were provided.
    pub relay: Option<R>,
    pub allowed_origins: Vec<String>,
}

impl<R: Relay> AppState<R> {
    pub fn new(relay: Option<R>, allowed_origins: Vec<String>) -> Self {
        Self {
            relay,
            allowed_origins,
        }
    }
}

#[derive(Serialize)]
struct ApiError<'a> {
    error: &'a str,
}

#[derive(Serialize)]
struct ApiSuccess {
    success: bool,
    message: &'static str,
}

pub async fn serve<R: Relay>(state: AppState<R>, host: IpAddr, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .await
        .map_err(Into::into)
}

pub fn router<R: Relay>(state: AppState<R>) -> Router<()> {
    let router = Router::new()
        .route(
            CONTACT_PATH,
            routing::post(send_message::<R>).options(preflight::<R>),
        )
        .with_state(Arc::new(state));
    trace(router)
}

fn trace(router: Router<()>) -> Router<()> {
    router.layer(
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(make_span)
            .on_request(on_request)
            .on_response(on_response)
            .on_body_chunk(())
            .on_eos(())
            .on_failure(()),
    )
}

fn make_span(request: &Request) -> Span {
    let version = request.version();
    let method = request.method();
    let route = request.uri();
    tracing::debug_span!("http-request", ?version, %method, %route)
}

fn on_request(_request: &Request, _span: &Span) {
    debug!("started processing request")
}

fn on_response(response: &Response, latency: Duration, _span: &Span) {
    let status = response.status();
    debug!(?latency, %status, "finished processing request")
}

async fn send_message<R: Relay>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let cors = cors_headers(&state.allowed_origins, &headers);

    let Some(relay) = &state.relay else {
        error!("smtp credentials are not configured");
        return error(StatusCode::SERVICE_UNAVAILABLE, "Service temporarily unavailable", cors);
    };

    let Ok(raw) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return error(StatusCode::BAD_REQUEST, "Invalid JSON", cors);
    };

    let submission = match validate_submission(&raw) {
        Ok(submission) => submission,
        Err(errors) => {
            let reason = errors
                .first()
                .map(ToString::to_string)
                .unwrap_or_default();
            debug!("rejected submission: {reason}");
            return error(StatusCode::BAD_REQUEST, &reason, cors);
        }
    };

    match relay.relay(OutboundMessage::from(&submission)).await {
        Ok(()) => {
            info!("contact message relayed");
            let body = ApiSuccess {
                success: true,
                message: "Message sent successfully",
            };
            (StatusCode::OK, cors, Json(body)).into_response()
        }
        Err(err) => {
            error!("failed to relay contact message: {err}");
            error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to send message. Please try again later.",
                cors,
            )
        }
    }
}

async fn preflight<R: Relay>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
) -> Response {
    let cors = cors_headers(&state.allowed_origins, &headers);
    (StatusCode::NO_CONTENT, cors).into_response()
}

fn error(code: StatusCode, error: &str, cors: HeaderMap) -> Response {
    (code, cors, Json(ApiError { error })).into_response()
}

/// The CORS headers for a request from the given `Origin`.
///
/// The origin is echoed back only if it exactly matches an allowed one.
pub fn cors_headers(allowed_origins: &[String], request: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static(MAX_AGE),
    );
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));

    let origin = request.get(header::ORIGIN);
    if let Some(origin) = origin.filter(|origin| {
        origin
            .to_str()
            .is_ok_and(|origin| allowed_origins.iter().any(|allowed| allowed == origin))
    }) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    }
    headers
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::Credentials,
        relay::{MockRelay, RelaySettings, SmtpRelay},
        smtp::Error,
        transport::testing::{reply, Event, ScriptedConnector},
        validate::Submission,
    };

    const ORIGIN: &str = "https://novumi.nl";

    fn state<R: Relay>(relay: Option<R>) -> Arc<AppState<R>> {
        Arc::new(AppState::new(
            relay,
            vec![ORIGIN.to_string(), "http://localhost:3000".to_string()],
        ))
    }

    fn request_headers(origin: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_str(origin).unwrap());
        headers
    }

    async fn call<R: Relay>(state: Arc<AppState<R>>, body: &str) -> (StatusCode, HeaderMap, Value) {
        let response = send_message(
            State(state),
            request_headers(ORIGIN),
            Bytes::copy_from_slice(body.as_bytes()),
        )
        .await;
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, serde_json::from_slice(&body).unwrap())
    }

    fn valid_body() -> Value {
        json!({
            "name": "Jane Doe",
            "email": "jane@example.com",
            "company": "ACME Corp",
            "interests": ["Background verification"],
            "message": "Hello"
        })
    }

    fn expected_message() -> OutboundMessage {
        OutboundMessage::from(&Submission {
            name: "Jane Doe".into(),
            email: "jane@example.com".into(),
            phone: String::new(),
            company: "ACME Corp".into(),
            job_title: String::new(),
            company_size: String::new(),
            screenings_per_year: String::new(),
            interests: vec!["Background verification".into()],
            message: "Hello".into(),
        })
    }

    #[tokio::test]
    async fn send_message_ok() {
        let mut relay = MockRelay::new();
        relay
            .expect_relay()
            .once()
            .with(eq(expected_message()))
            .return_once(|_| Box::pin(std::future::ready(Ok(()))));

        let (status, headers, body) = call(state(Some(relay)), &valid_body().to_string()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"success": true, "message": "Message sent successfully"})
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], ORIGIN);
    }

    #[tokio::test]
    async fn send_message_relay_failure() {
        let mut relay = MockRelay::new();
        relay.expect_relay().once().return_once(|_| {
            Box::pin(std::future::ready(Err(Error::AuthFailed(
                "535 5.7.8 Authentication failed".into(),
            ))))
        });

        let (status, _, body) = call(state(Some(relay)), &valid_body().to_string()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body,
            json!({"error": "Failed to send message. Please try again later."})
        );
    }

    #[tokio::test]
    async fn send_message_without_credentials() {
        let (status, headers, body) = call(state::<MockRelay>(None), "not even json").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, json!({"error": "Service temporarily unavailable"}));
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], ALLOW_METHODS);
    }

    #[tokio::test]
    async fn send_message_invalid_json() {
        let mut relay = MockRelay::new();
        relay.expect_relay().never();

        let (status, _, body) = call(state(Some(relay)), "{\"name\": ").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "Invalid JSON"}));
    }

    #[tokio::test]
    async fn send_message_reports_first_validation_error() {
        for (input, expected) in [
            (json!({"email": "jane@example.com"}), "Name is required"),
            (json!({}), "Name is required"),
            (json!({"name": "Jane"}), "Email is required"),
            (json!({"name": "Jane", "email": "nope"}), "Invalid email format"),
            (json!(["Jane"]), "Invalid request body"),
            (json!(null), "Invalid request body"),
        ] {
            let mut relay = MockRelay::new();
            relay.expect_relay().never();

            let (status, _, body) = call(state(Some(relay)), &input.to_string()).await;

            assert_eq!(status, StatusCode::BAD_REQUEST, "{input}");
            assert_eq!(body, json!({ "error": expected }), "{input}");
        }
    }

    #[tokio::test]
    async fn preflight_returns_no_content() {
        let response = preflight(
            State(state::<MockRelay>(None)),
            request_headers("http://localhost:3000"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], ALLOW_METHODS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], ALLOW_HEADERS);
        assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], MAX_AGE);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn cors_origin_must_match_exactly() {
        let allowed = vec![ORIGIN.to_string()];

        for origin in [
            "https://novumi.nl.evil.com",
            "http://novumi.nl",
            "https://novumi.nl/",
            "https://NOVUMI.nl",
        ] {
            let headers = cors_headers(&allowed, &request_headers(origin));
            assert!(
                !headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN),
                "{origin}"
            );
            assert_eq!(headers[header::VARY], "Origin");
        }

        let headers = cors_headers(&allowed, &HeaderMap::new());
        assert!(!headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));

        let headers = cors_headers(&allowed, &request_headers(ORIGIN));
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], ORIGIN);
    }

    #[tokio::test]
    async fn relays_over_smtp() {
        let connector = ScriptedConnector::new([
            reply("220 smtp.example.org ESMTP\r\n"),
            reply("250-smtp.example.org\r\n250 STARTTLS\r\n"),
            reply("220 Ready\r\n"),
            reply("250 AUTH LOGIN\r\n"),
            reply("334 VXNlcm5hbWU6\r\n"),
            reply("334 UGFzc3dvcmQ6\r\n"),
            reply("235 Authenticated\r\n"),
            reply("250 Ok\r\n"),
            reply("250 Ok\r\n"),
            reply("354 Go ahead\r\n"),
            reply("250 Queued\r\n"),
        ]);
        let log = connector.log();
        let relay = SmtpRelay::new(
            connector,
            RelaySettings {
                ehlo_domain: "novumi.nl".into(),
                sender_name: "Novumi Website".into(),
                recipient: None,
                credentials: Credentials {
                    username: "relay@example.org".into(),
                    token: "secret".into(),
                },
                timeout: Duration::from_secs(30),
            },
        );

        let (status, _, _) = call(state(Some(relay)), &valid_body().to_string()).await;

        assert_eq!(status, StatusCode::OK);
        let events = log.events();
        assert_eq!(events.first(), Some(&Event::Connect));
        assert_eq!(events.last(), Some(&Event::Close));
        assert_eq!(log.count(&Event::Upgrade), 1);
        let subject = "Subject: New Contact Form Submission from Jane Doe\r\n";
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::Sent(data) if data.contains(subject))));
    }

    #[tokio::test]
    async fn router_serves_contact_route() {
        let mut relay = MockRelay::new();
        relay
            .expect_relay()
            .once()
            .with(eq(expected_message()))
            .return_once(|_| Box::pin(std::future::ready(Ok(()))));
        let router = router(AppState::new(Some(relay), vec![ORIGIN.to_string()]));

        let request = |method: &str, uri: &str, body: String| {
            axum::http::Request::builder()
                .method(method)
                .uri(uri)
                .header(header::ORIGIN, ORIGIN)
                .header(header::CONTENT_TYPE, "application/json")
                .body(axum::body::Body::from(body))
                .unwrap()
        };

        let response = router
            .clone()
            .oneshot(request("POST", CONTACT_PATH, valid_body().to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], ORIGIN);

        let response = router
            .clone()
            .oneshot(request("OPTIONS", CONTACT_PATH, String::new()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_MAX_AGE], MAX_AGE);

        let response = router
            .clone()
            .oneshot(request("GET", CONTACT_PATH, String::new()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = router
            .oneshot(request("POST", "/api/other", valid_body().to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

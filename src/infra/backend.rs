//! REST client for the record collection, its statistics and the health check.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, Url, header};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::application::error::SyncError;
use crate::application::repos::{HealthProbe, RecordsApi};
use crate::config::{BackendSettings, EndpointPaths, ID_PLACEHOLDER};
use crate::domain::{
    AggregateSnapshot, CreateResponse, HealthReport, MutationAck, NewRecord, Record, RecordId,
    RecordPatch,
};
use sentinel_api_types::CollectionEnvelope;

use super::error::InfraError;
use super::push::SseTransport;

/// Session credentials attached to every backend request.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    session_cookie: Option<String>,
    api_token: Option<String>,
}

impl Credentials {
    pub fn new(session_cookie: Option<String>, api_token: Option<String>) -> Self {
        Self {
            session_cookie,
            api_token,
        }
    }

    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        let request = match &self.session_cookie {
            Some(cookie) => request.header(header::COOKIE, cookie),
            None => request,
        };
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// [`RecordsApi`] and [`HealthProbe`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base: Url,
    paths: EndpointPaths,
    credentials: Credentials,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(
        base: Url,
        paths: EndpointPaths,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::client(err.to_string()))?;
        Ok(Self {
            client,
            base: with_trailing_slash(base),
            paths,
            credentials,
            timeout,
        })
    }

    pub fn from_settings(settings: &BackendSettings) -> Result<Self, InfraError> {
        let base = settings.base_url.clone().ok_or_else(|| {
            InfraError::configuration(
                "backend.base_url is required (use --backend-url or SENTINEL__BACKEND__BASE_URL)",
            )
        })?;
        Self::new(
            base,
            settings.paths.clone(),
            Credentials::new(settings.session_cookie.clone(), settings.api_token.clone()),
            settings.request_timeout,
        )
    }

    pub fn user_agent() -> &'static str {
        concat!("sentinel-sync/", env!("CARGO_PKG_VERSION"))
    }

    /// Resolve an endpoint path under the base URL. Paths are taken relative
    /// to the base, so a base of `https://host/sentinel` keeps its prefix.
    pub fn url(&self, path: &str) -> Result<Url, SyncError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|err| SyncError::invalid_input(format!("invalid endpoint `{path}`: {err}")))
    }

    fn item_url(&self, id: RecordId) -> Result<Url, SyncError> {
        self.url(&self.paths.item.replace(ID_PLACEHOLDER, &id.to_string()))
    }

    /// Push transport for the configured events endpoint, sharing this
    /// backend's credentials.
    pub fn push_transport(&self) -> Result<SseTransport, InfraError> {
        let url = self
            .url(&self.paths.events)
            .map_err(|err| InfraError::configuration(err.to_string()))?;
        SseTransport::new(url, self.credentials.clone(), self.timeout)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SyncError> {
        let response = self
            .credentials
            .apply(request)
            .send()
            .await
            .map_err(SyncError::network)?;
        Self::handle(response).await
    }

    async fn handle<T: DeserializeOwned>(response: Response) -> Result<T, SyncError> {
        let status = response.status();
        let bytes = response.bytes().await.map_err(SyncError::network)?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes).into_owned();
            return Err(SyncError::http(status.as_u16(), body));
        }
        let body: &[u8] = if bytes.is_empty() { b"{}" } else { &bytes };
        serde_json::from_slice(body).map_err(|err| SyncError::parse(format!("failed to parse body: {err}")))
    }
}

#[async_trait]
impl RecordsApi for HttpBackend {
    async fn list_records(&self) -> Result<Vec<Record>, SyncError> {
        let url = self.url(&self.paths.collection)?;
        let envelope: CollectionEnvelope = self.send(self.client.get(url)).await?;
        debug!(records = envelope.bans.len(), "Fetched collection");
        Ok(envelope.bans)
    }

    async fn statistics(&self) -> Result<AggregateSnapshot, SyncError> {
        let url = self.url(&self.paths.statistics)?;
        self.send(self.client.get(url)).await
    }

    async fn create_record(&self, record: &NewRecord) -> Result<CreateResponse, SyncError> {
        let url = self.url(&self.paths.collection)?;
        self.send(self.client.post(url).json(record)).await
    }

    async fn update_record(
        &self,
        id: RecordId,
        patch: &RecordPatch,
    ) -> Result<MutationAck, SyncError> {
        let url = self.item_url(id)?;
        self.send(self.client.put(url).json(patch)).await
    }

    async fn delete_record(&self, id: RecordId) -> Result<MutationAck, SyncError> {
        let url = self.item_url(id)?;
        self.send(self.client.request(Method::DELETE, url)).await
    }
}

#[async_trait]
impl HealthProbe for HttpBackend {
    /// A non-2xx response still counts as a report when its body is one, so an
    /// unhealthy backend answering 503 is reported rather than treated as an
    /// outage.
    async fn check(&self) -> Result<HealthReport, SyncError> {
        let url = self.url(&self.paths.health)?;
        let response = self
            .credentials
            .apply(self.client.get(url))
            .send()
            .await
            .map_err(SyncError::network)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(SyncError::network)?;

        match serde_json::from_slice::<HealthReport>(&bytes) {
            Ok(report) => Ok(report),
            Err(_) if !status.is_success() => Err(SyncError::http(
                status.as_u16(),
                String::from_utf8_lossy(&bytes).into_owned(),
            )),
            Err(err) => Err(SyncError::parse(format!("failed to parse health report: {err}"))),
        }
    }
}

fn with_trailing_slash(mut base: Url) -> Url {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;
    use serde_json::json;

    use super::*;
    use crate::domain::HealthStatus;

    fn backend(server: &MockServer) -> HttpBackend {
        HttpBackend::new(
            Url::parse(&server.base_url()).expect("base url"),
            EndpointPaths::default(),
            Credentials::new(Some("session=abc".into()), Some("tok".into())),
            Duration::from_secs(5),
        )
        .expect("backend")
    }

    #[test]
    fn endpoint_paths_resolve_under_the_base_path() {
        let origin = HttpBackend::new(
            Url::parse("http://localhost:5000").expect("base url"),
            EndpointPaths::default(),
            Credentials::new(None, None),
            Duration::from_secs(5),
        )
        .expect("backend");
        assert_eq!(
            origin.url("/api/bans").expect("url").as_str(),
            "http://localhost:5000/api/bans"
        );

        let prefixed = HttpBackend::new(
            Url::parse("https://mod.example.com/sentinel").expect("base url"),
            EndpointPaths::default(),
            Credentials::new(None, None),
            Duration::from_secs(5),
        )
        .expect("backend");
        assert_eq!(
            prefixed.url("/api/bans/statistics").expect("url").as_str(),
            "https://mod.example.com/sentinel/api/bans/statistics"
        );
        assert_eq!(
            prefixed.item_url(7).expect("url").as_str(),
            "https://mod.example.com/sentinel/api/ban/7"
        );
    }

    #[tokio::test]
    async fn base_url_path_prefix_is_kept_on_requests() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("GET").path("/sentinel/api/bans");
            then.status(200).json_body(json!({ "bans": [] }));
        });
        let backend = HttpBackend::new(
            Url::parse(&server.url("/sentinel")).expect("base url"),
            EndpointPaths::default(),
            Credentials::new(None, None),
            Duration::from_secs(5),
        )
        .expect("backend");

        let records = backend.list_records().await.expect("records");
        assert!(records.is_empty());
        mock.assert();
    }

    #[tokio::test]
    async fn list_records_unwraps_envelope_and_sends_credentials() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("GET")
                .path("/api/bans")
                .header("cookie", "session=abc")
                .header("authorization", "Bearer tok");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "bans": [{
                        "banId": 3,
                        "reason": null,
                        "capturedMessage": "buy now",
                        "memberId": "11",
                        "serverId": "22",
                        "createdAt": "2024-05-01T08:00:00"
                    }]
                }));
        });

        let records = backend(&server).list_records().await.expect("records");
        mock.assert();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 3);
        assert_eq!(records[0].reason, "");
    }

    #[tokio::test]
    async fn non_success_status_maps_to_http_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("GET").path("/api/bans/statistics");
            then.status(401).body("Unauthorized");
        });

        let err = backend(&server).statistics().await.expect_err("401");
        assert!(err.is_auth_failure());
        assert_eq!(err, SyncError::http(401, "Unauthorized"));
    }

    #[tokio::test]
    async fn malformed_body_maps_to_parse_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("GET").path("/api/bans/statistics");
            then.status(200).body("<html>");
        });

        let err = backend(&server).statistics().await.expect_err("bad body");
        assert!(matches!(err, SyncError::Parse(_)));
    }

    #[tokio::test]
    async fn update_puts_only_set_fields_to_item_path() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("PUT")
                .path("/api/ban/42")
                .json_body(json!({ "reason": "raid" }));
            then.status(200)
                .json_body(json!({ "message": "Ban updated successfully" }));
        });

        let ack = backend(&server)
            .update_record(42, &RecordPatch::new().reason("raid"))
            .await
            .expect("ack");
        mock.assert();
        assert_eq!(ack.message.as_deref(), Some("Ban updated successfully"));
    }

    #[tokio::test]
    async fn delete_tolerates_empty_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("DELETE").path("/api/ban/7");
            then.status(204);
        });

        let ack = backend(&server).delete_record(7).await.expect("ack");
        mock.assert();
        assert!(ack.message.is_none());
    }

    #[tokio::test]
    async fn create_surfaces_conflict() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("POST").path("/api/bans");
            then.status(409)
                .json_body(json!({ "error": "Ban already exists" }));
        });

        let record = NewRecord {
            member_id: "1".into(),
            username: "u".into(),
            display_name: None,
            server_id: "2".into(),
            server_name: "s".into(),
            reason: None,
            captured_message: String::new(),
        };
        let err = backend(&server).create_record(&record).await.expect_err("409");
        assert_eq!(err.status(), Some(409));
    }

    #[tokio::test]
    async fn unhealthy_report_is_returned_despite_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("GET").path("/healthcheck");
            then.status(503).json_body(json!({
                "status": "unhealthy",
                "components": { "database": "disconnected" }
            }));
        });

        let report = backend(&server).check().await.expect("report");
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.components.len(), 1);
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_network_error() {
        let backend = HttpBackend::new(
            Url::parse("http://127.0.0.1:9").expect("url"),
            EndpointPaths::default(),
            Credentials::default(),
            Duration::from_secs(1),
        )
        .expect("backend");

        let err = backend.list_records().await.expect_err("refused");
        assert!(matches!(err, SyncError::Network(_)));
    }

    #[test]
    fn from_settings_requires_base_url() {
        let settings = BackendSettings {
            base_url: None,
            paths: EndpointPaths::default(),
            session_cookie: None,
            api_token: None,
            request_timeout: Duration::from_secs(30),
        };
        let err = HttpBackend::from_settings(&settings).expect_err("missing url");
        assert!(matches!(err, InfraError::Configuration { .. }));
    }
}

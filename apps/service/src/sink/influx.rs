use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::line_protocol::encode_batch;
use super::{MetricRecord, MetricsSink};
use crate::config::{InfluxAuthMethod, InfluxDbConfig};
use crate::error::SinkError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

enum Auth {
    /// InfluxDB 1.x: database name plus optional user credentials
    Basic { username: Option<String>, password: Option<String> },
    /// InfluxDB 2.x: API token scoped to an organization; the database is the bucket
    Token { token: String, organization: String },
}

/// Writes points to InfluxDB over its HTTP API
pub struct InfluxSink {
    client: Client,
    base: Url,
    database: String,
    auth: Auth,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<QueryResult>,
}

#[derive(Deserialize)]
struct QueryResult {
    #[serde(default)]
    series: Vec<Series>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct Series {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct BucketList {
    #[serde(default)]
    buckets: Vec<Bucket>,
}

#[derive(Deserialize)]
struct Bucket {
    name: String,
}

impl InfluxSink {
    pub fn new(config: &InfluxDbConfig) -> Result<Self, SinkError> {
        let mut path = config.path.trim().to_string();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if !path.ends_with('/') {
            path.push('/');
        }
        let base = Url::parse(&format!(
            "{}://{}:{}{}",
            config.protocol, config.hostname, config.port, path
        ))
        .map_err(|e| SinkError::Settings(format!("invalid InfluxDB address: {e}")))?;

        let auth = match config.auth_method {
            InfluxAuthMethod::Basic => Auth::Basic {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            InfluxAuthMethod::Token => Auth::Token {
                token: config
                    .token
                    .clone()
                    .ok_or_else(|| SinkError::Settings("token authentication needs a token".into()))?,
                organization: config
                    .organization
                    .clone()
                    .ok_or_else(|| SinkError::Settings("token authentication needs an organization".into()))?,
            },
        };

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(config.ignore_ssl)
            .build()?;

        Ok(Self {
            client,
            base,
            database: config.database.clone(),
            auth,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SinkError> {
        self.base
            .join(path)
            .map_err(|e| SinkError::Settings(format!("invalid InfluxDB path: {e}")))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::Basic { username: Some(username), password } => {
                request.query(&[("u", username.as_str()), ("p", password.as_deref().unwrap_or(""))])
            }
            Auth::Basic { .. } => request,
            Auth::Token { token, .. } => request.header(reqwest::header::AUTHORIZATION, format!("Token {token}")),
        }
    }

    async fn expect_success(response: Response) -> Result<Response, SinkError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Status { status: status.as_u16(), body })
    }
}

#[async_trait]
impl MetricsSink for InfluxSink {
    async fn check_connection(&self) -> Result<(), SinkError> {
        let found = match &self.auth {
            Auth::Basic { .. } => {
                let request = self
                    .client
                    .get(self.endpoint("query")?)
                    .query(&[("q", "SHOW DATABASES")]);
                let response = Self::expect_success(self.authorize(request).send().await?).await?;
                let body: QueryResponse = response.json().await?;
                if body.results.is_empty() {
                    return Err(SinkError::InvalidResponse("SHOW DATABASES returned no results".into()));
                }
                if let Some(error) = body.results.iter().find_map(|result| result.error.clone()) {
                    return Err(SinkError::InvalidResponse(error));
                }
                body.results
                    .iter()
                    .flat_map(|result| &result.series)
                    .flat_map(|series| &series.values)
                    .filter_map(|row| row.first().and_then(|name| name.as_str()))
                    .any(|name| name == self.database)
            }
            Auth::Token { organization, .. } => {
                let request = self
                    .client
                    .get(self.endpoint("api/v2/buckets")?)
                    .query(&[("org", organization.as_str()), ("name", self.database.as_str())]);
                let response = Self::expect_success(self.authorize(request).send().await?).await?;
                let body: BucketList = response.json().await?;
                body.buckets.iter().any(|bucket| bucket.name == self.database)
            }
        };

        if !found {
            return Err(SinkError::DatabaseMissing(self.database.clone()));
        }
        info!(database = %self.database, "connected to InfluxDB");
        Ok(())
    }

    async fn write_points(&self, records: &[MetricRecord]) -> Result<(), SinkError> {
        let body = encode_batch(records);
        if body.is_empty() {
            return Ok(());
        }

        let request = match &self.auth {
            Auth::Basic { .. } => self
                .client
                .post(self.endpoint("write")?)
                .query(&[("db", self.database.as_str()), ("precision", "ns")]),
            Auth::Token { organization, .. } => self
                .client
                .post(self.endpoint("api/v2/write")?)
                .query(&[
                    ("org", organization.as_str()),
                    ("bucket", self.database.as_str()),
                    ("precision", "ns"),
                ]),
        };

        let response = self
            .authorize(request)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;
        Self::expect_success(response).await?;
        debug!(points = records.len(), "wrote points to InfluxDB");
        Ok(())
    }
}

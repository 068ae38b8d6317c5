//! BigQuery Execution Engine
//!
//! Single call per query through the REST `jobs.query` endpoint, authenticated
//! with a service-account JWT exchanged for an access token. The whole call is
//! wrapped in one wall-clock timeout. A timed-out job keeps running remotely;
//! the engine only logs it.

use crate::config::HarnessConfig;
use crate::dialect::Dialect;
use crate::execution::engine::{ExecutionEngine, ExecutionResult};
use crate::execution::result::{RenderOptions, ResultSet};
use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const API_ROOT: &str = "https://bigquery.googleapis.com/bigquery/v2";

#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    project_id: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    job_reference: Option<JobReference>,
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<TableField>,
}

#[derive(Debug, Deserialize)]
struct TableField {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    v: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

/// Failure inside one call, before mapping to a status code.
#[derive(Debug)]
enum CallError {
    InvalidQuery(String),
    Other(String),
}

pub struct BigQueryEngine {
    key_path: Option<PathBuf>,
    timeout: Duration,
    render: RenderOptions,
}

impl BigQueryEngine {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            key_path: config.bigquery_key_path.clone(),
            timeout: config.timeouts.bigquery,
            render: RenderOptions {
                max_rows: config.output.max_rows,
                max_columns: config.output.max_columns,
                token_budget: config.output.token_budget,
            },
        }
    }

    fn load_key(&self) -> Result<ServiceAccountKey, CallError> {
        let path = self
            .key_path
            .as_ref()
            .ok_or_else(|| CallError::Other("no BigQuery service-account key configured".to_string()))?;
        let text = std::fs::read_to_string(path)
            .map_err(|e| CallError::Other(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text).map_err(|e| CallError::Other(format!("malformed key file: {}", e)))
    }

    async fn access_token(&self, client: &Client, key: &ServiceAccountKey) -> Result<String, CallError> {
        let token_uri = key.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
        let now = chrono::Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &key.client_email,
            scope: BIGQUERY_SCOPE,
            aud: token_uri,
            iat: now,
            exp: now + 3600,
        };
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| CallError::Other(format!("invalid private key: {}", e)))?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|e| CallError::Other(format!("cannot sign token request: {}", e)))?;

        let response = client
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CallError::Other(format!("token request failed: {}", e)))?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CallError::Other(format!("token request rejected: {}", text)));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CallError::Other(format!("malformed token response: {}", e)))?;
        Ok(token.access_token)
    }

    async fn run_query(&self, query: &str, fetch: bool) -> Result<Option<ResultSet>, CallError> {
        let key = self.load_key()?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CallError::Other(format!("cannot create HTTP client: {}", e)))?;
        let token = self.access_token(&client, &key).await?;

        let url = format!("{}/projects/{}/queries", API_ROOT, key.project_id);
        let body = serde_json::json!({
            "query": query,
            "useLegacySql": false,
            "timeoutMs": 10_000,
        });
        let response = client.post(&url).bearer_auth(&token).json(&body).send().await;
        let mut page = read_response(response).await?;

        let job = page.job_reference.take();
        let mut schema = page.schema.take();
        let mut rows = std::mem::take(&mut page.rows);
        let mut complete = page.job_complete;
        let mut page_token = page.page_token.take();

        // Poll getQueryResults until the job completes and every page is read.
        while !complete || (fetch && page_token.is_some()) {
            let job = job
                .as_ref()
                .ok_or_else(|| CallError::Other("incomplete job without a job reference".to_string()))?;
            let mut url = format!(
                "{}/projects/{}/queries/{}?timeoutMs=10000",
                API_ROOT, key.project_id, job.job_id
            );
            if let Some(location) = &job.location {
                url.push_str(&format!("&location={}", location));
            }
            if let Some(next_page) = &page_token {
                url.push_str(&format!("&pageToken={}", next_page));
            }
            let next = read_response(client.get(&url).bearer_auth(&token).send().await).await?;
            complete = next.job_complete;
            page_token = next.page_token;
            if schema.is_none() {
                schema = next.schema;
            }
            rows.extend(next.rows);
            if !complete {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            if rows.len() > 10_000 {
                break;
            }
        }

        if !fetch {
            return Ok(None);
        }
        let columns: Vec<String> = schema.map(|s| s.fields.into_iter().map(|f| f.name).collect()).unwrap_or_default();
        let mut set = ResultSet::new(columns);
        for row in rows {
            set.push_row(row.f.into_iter().map(|cell| cell_text(cell.v)).collect());
        }
        Ok(Some(set))
    }
}

async fn read_response(response: reqwest::Result<reqwest::Response>) -> Result<QueryResponse, CallError> {
    let response = response.map_err(|e| CallError::Other(format!("request failed: {}", e)))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| CallError::Other(format!("cannot read response: {}", e)))?;
    if !status.is_success() {
        return Err(classify_api_error(&text));
    }
    serde_json::from_str(&text).map_err(|e| CallError::Other(format!("malformed response: {}", e)))
}

fn classify_api_error(body: &str) -> CallError {
    let parsed: serde_json::Value = serde_json::from_str(body).unwrap_or(serde_json::Value::Null);
    let message = parsed["error"]["message"].as_str().unwrap_or(body).to_string();
    let invalid = parsed["error"]["errors"]
        .as_array()
        .map(|errs| errs.iter().any(|e| e["reason"] == "invalidQuery"))
        .unwrap_or(false)
        || message.contains("Syntax error");
    if invalid {
        CallError::InvalidQuery(message)
    } else {
        CallError::Other(message)
    }
}

fn cell_text(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl ExecutionEngine for BigQueryEngine {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    fn dialect(&self) -> Dialect {
        Dialect::BigQuery
    }

    async fn execute(&self, query: &str, _target: &str, fetch: bool) -> ExecutionResult {
        let started = Instant::now();
        debug!("BigQuery query: {}", query);
        match tokio::time::timeout(self.timeout, self.run_query(query, fetch)).await {
            Err(_) => {
                warn!("BigQuery job abandoned after {}s; it may still be running remotely", self.timeout.as_secs());
                ExecutionResult::unknown(format!("Execution timed out after {} seconds.", self.timeout.as_secs()))
            }
            Ok(Ok(None)) => ExecutionResult::success(None),
            Ok(Ok(Some(set))) => {
                info!("✅ BigQuery returned {} rows", set.rows.len());
                ExecutionResult::success(Some(set.render(started.elapsed(), &self.render)))
            }
            Ok(Err(CallError::InvalidQuery(message))) => {
                ExecutionResult::programming_error(format!("BigQuery Programming Error: {}", message))
            }
            Ok(Err(CallError::Other(message))) => {
                ExecutionResult::unknown(format!("BigQuery Error: {}", message))
            }
        }
    }
}

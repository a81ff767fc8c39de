use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::catalog::{FetchKind, Resource};
use crate::shopify::models;
use shopsync_common::record::Record;

#[derive(Debug, Clone)]
pub struct ShopifyClientConfig {
    pub shop_url: String,
    pub access_token: String,
    pub api_version: String,
    pub page_size: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub metaobject_types: Vec<String>,
}

impl ShopifyClientConfig {
    /// Load Shopify config from environment.
    ///
    /// Returns `Ok(None)` if Shopify is not configured (shop URL / token
    /// missing). Returns `Err` if `SHOPIFY_METAOBJECT_TYPES` is set but
    /// contains no usable entries (fail-fast on misconfiguration).
    pub fn from_env() -> Result<Option<Self>, String> {
        let shop_url = match std::env::var("SHOPIFY_SHOP_URL").ok() {
            Some(v) => v,
            None => return Ok(None),
        };
        let access_token = match std::env::var("SHOPIFY_ACCESS_TOKEN").ok() {
            Some(v) => v,
            None => return Ok(None),
        };

        let api_version =
            std::env::var("SHOPIFY_API_VERSION").unwrap_or_else(|_| "2024-01".to_string());
        let page_size = std::env::var("SHOPIFY_PAGE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(250);
        let max_retries = std::env::var("SHOPIFY_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);
        let timeout_secs = std::env::var("SHOPIFY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let metaobject_types = match std::env::var("SHOPIFY_METAOBJECT_TYPES") {
            Ok(_) => parse_csv_types("SHOPIFY_METAOBJECT_TYPES")?,
            Err(_) => Vec::new(),
        };

        Ok(Some(Self {
            shop_url,
            access_token,
            api_version,
            page_size,
            max_retries,
            timeout_secs,
            metaobject_types,
        }))
    }
}

/// Parse a comma-separated list of metaobject types from an env var.
/// Returns `Err` if the var is set but all entries are blank after trimming.
pub fn parse_csv_types(env_key: &str) -> Result<Vec<String>, String> {
    let raw = std::env::var(env_key).map_err(|_| format!("{env_key} is not set"))?;

    let types: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if types.is_empty() {
        return Err(format!("{env_key} is set but contains no valid types"));
    }

    Ok(types)
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("missing access scope {scope} for {resource}")]
    MissingScope { resource: String, scope: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("graphql error: {0}")]
    Graphql(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

/// Timestamps in window filters, second precision, always UTC.
pub(crate) fn window_param(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[derive(Clone)]
pub struct ShopifyClient {
    client: Client,
    config: ShopifyClientConfig,
}

impl ShopifyClient {
    pub fn new(config: ShopifyClientConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ShopifyClientConfig {
        &self.config
    }

    pub(crate) fn http(&self) -> &Client {
        &self.client
    }

    pub(crate) fn base_url(&self) -> String {
        let raw = self.config.shop_url.trim_end_matches('/');
        if raw.starts_with("http://") || raw.starts_with("https://") {
            raw.to_string()
        } else {
            format!("https://{raw}")
        }
    }

    /// Whether this resource can be fetched with the current configuration.
    pub fn is_configured(&self, resource: &Resource) -> bool {
        match resource.kind {
            FetchKind::Graphql { per_type: true, .. } => !self.config.metaobject_types.is_empty(),
            _ => true,
        }
    }

    /// Fetch every record of `resource` whose updated-at falls in
    /// `[start, end)`, following the API's pagination to the last page.
    pub async fn fetch_window(
        &self,
        resource: &Resource,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Record>, FetchError> {
        tracing::debug!(resource = resource.name, %start, %end, "fetching window");

        let mut records = match resource.kind {
            FetchKind::Rest { path, envelope } => {
                self.fetch_rest(resource, path, envelope, start, end).await?
            }
            FetchKind::Graphql { .. } => self.fetch_graphql(resource, start, end).await?,
        };

        // The server-side filter is only a pre-filter; the half-open window
        // is enforced here.
        records.retain(|r| r.updated_at >= start && r.updated_at < end);

        Ok(records)
    }

    async fn fetch_rest(
        &self,
        resource: &Resource,
        path: &str,
        envelope: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Record>, FetchError> {
        let base = self.base_url();
        let version = &self.config.api_version;
        let mut records = Vec::new();
        let mut page_info: Option<String> = None;

        loop {
            // Filters are only valid on the first request; the page_info
            // token carries them forward.
            let url = match &page_info {
                None => {
                    let mut url = format!(
                        "{base}/admin/api/{version}/{path}.json?limit={}&updated_at_min={}&updated_at_max={}",
                        self.config.page_size,
                        window_param(start),
                        window_param(end),
                    );
                    for &(k, v) in resource.extra_query {
                        url.push_str(&format!("&{k}={v}"));
                    }
                    url
                }
                Some(info) => format!(
                    "{base}/admin/api/{version}/{path}.json?limit={}&page_info={info}",
                    self.config.page_size
                ),
            };

            let (body, next) = self.get_with_retry(resource, &url).await?;
            for item in models::parse_envelope(&body, envelope)? {
                records.push(models::to_record(item, resource)?);
            }

            match next {
                Some(info) => page_info = Some(info),
                None => break,
            }
        }

        Ok(records)
    }

    async fn get_with_retry(
        &self,
        resource: &Resource,
        url: &str,
    ) -> Result<(Value, Option<String>), FetchError> {
        let mut last_error = String::new();

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff_secs = std::cmp::min(1u64 << attempt, 30);
                tracing::warn!(attempt, backoff_secs, "retrying after backoff");
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
            }

            let response = match self
                .client
                .get(url)
                .header("X-Shopify-Access-Token", &self.config.access_token)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = e.to_string();
                    if e.is_timeout() || e.is_connect() {
                        continue;
                    }
                    return Err(FetchError::Request(e));
                }
            };

            let status = response.status();

            if status.is_success() {
                let next = response
                    .headers()
                    .get("link")
                    .and_then(|v| v.to_str().ok())
                    .and_then(models::next_page_info);

                let body = response.json::<Value>().await.map_err(FetchError::Request)?;
                return Ok((body, next));
            }

            // Missing read scope: operator action required, never retried.
            if status == StatusCode::FORBIDDEN {
                return Err(FetchError::MissingScope {
                    resource: resource.name.to_string(),
                    scope: resource.required_scope.to_string(),
                });
            }

            // Honor Retry-After header for 429
            if status == StatusCode::TOO_MANY_REQUESTS {
                if let Some(retry_after) = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    let wait = std::cmp::min(retry_after, 60);
                    tracing::warn!(wait, "rate-limited, waiting Retry-After");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                last_error = "429 Too Many Requests".to_string();
                continue;
            }

            // Retry on 5xx
            if status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                last_error = format!("{status}: {body}");
                continue;
            }

            // Fail fast on remaining 4xx
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Http { status, body });
        }

        Err(FetchError::MaxRetriesExceeded {
            attempts: self.config.max_retries + 1,
            last_error,
        })
    }
}

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;

use crate::catalog::{FetchKind, Resource};
use crate::shopify::client::{window_param, FetchError, ShopifyClient};
use crate::shopify::models;
use shopsync_common::record::Record;

fn gql_error_code(error: &Value) -> Option<&str> {
    error.pointer("/extensions/code").and_then(Value::as_str)
}

impl ShopifyClient {
    /// Fetch one GraphQL resource over its connection, one page at a time
    /// via `pageInfo.endCursor`. Per-type resources run one pass for each
    /// configured type.
    pub(crate) async fn fetch_graphql(
        &self,
        resource: &Resource,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Record>, FetchError> {
        let FetchKind::Graphql {
            root,
            query,
            filterable,
            per_type,
        } = resource.kind
        else {
            return Err(FetchError::Malformed(format!(
                "{} is not a graphql resource",
                resource.name
            )));
        };

        let url = format!(
            "{}/admin/api/{}/graphql.json",
            self.base_url(),
            self.config().api_version
        );
        let first = self.config().page_size.min(100);

        let passes: Vec<Option<String>> = if per_type {
            self.config()
                .metaobject_types
                .iter()
                .map(|t| Some(t.clone()))
                .collect()
        } else {
            vec![None]
        };

        let mut records = Vec::new();

        for pass_type in passes {
            let mut after: Option<String> = None;

            loop {
                let mut variables = serde_json::json!({ "first": first });
                if let Some(cursor) = &after {
                    variables["after"] = Value::String(cursor.clone());
                }
                if filterable {
                    variables["query"] = Value::String(format!(
                        "updated_at:>='{}' AND updated_at:<'{}'",
                        window_param(start),
                        window_param(end)
                    ));
                }
                if let Some(t) = &pass_type {
                    variables["type"] = Value::String(t.clone());
                }

                let body = serde_json::json!({ "query": query, "variables": variables });
                let payload = self.post_with_retry(resource, &url, &body).await?;
                let (nodes, cursor) = models::parse_connection(&payload, root)?;

                for node in nodes {
                    records.push(models::to_record(node, resource)?);
                }

                match cursor {
                    Some(c) => after = Some(c),
                    None => break,
                }
            }
        }

        Ok(records)
    }

    async fn post_with_retry(
        &self,
        resource: &Resource,
        url: &str,
        body: &Value,
    ) -> Result<Value, FetchError> {
        let mut last_error = String::new();

        for attempt in 0..=self.config().max_retries {
            if attempt > 0 {
                let backoff_secs = std::cmp::min(1u64 << attempt, 30);
                tracing::warn!(attempt, backoff_secs, "retrying after backoff");
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
            }

            let response = match self
                .http()
                .post(url)
                .header("X-Shopify-Access-Token", &self.config().access_token)
                .json(body)
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

            if status == StatusCode::FORBIDDEN {
                return Err(FetchError::MissingScope {
                    resource: resource.name.to_string(),
                    scope: resource.required_scope.to_string(),
                });
            }

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

            if status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                last_error = format!("{status}: {body}");
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(FetchError::Http { status, body });
            }

            let payload = response.json::<Value>().await.map_err(FetchError::Request)?;

            // GraphQL transport succeeds even when the query fails; errors
            // ride in the body.
            if let Some(errors) = payload
                .get("errors")
                .and_then(Value::as_array)
                .filter(|e| !e.is_empty())
            {
                if errors.iter().any(|e| gql_error_code(e) == Some("THROTTLED")) {
                    last_error = "graphql throttled".to_string();
                    continue;
                }
                if errors
                    .iter()
                    .any(|e| gql_error_code(e) == Some("ACCESS_DENIED"))
                {
                    return Err(FetchError::MissingScope {
                        resource: resource.name.to_string(),
                        scope: resource.required_scope.to_string(),
                    });
                }
                let messages = errors
                    .iter()
                    .filter_map(|e| e.get("message").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(FetchError::Graphql(messages));
            }

            return Ok(payload);
        }

        Err(FetchError::MaxRetriesExceeded {
            attempts: self.config().max_retries + 1,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use chrono::TimeZone;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str) -> crate::shopify::ShopifyClientConfig {
        crate::shopify::ShopifyClientConfig {
            shop_url: base_url.to_string(),
            access_token: "shpat-test".to_string(),
            api_version: "2024-01".to_string(),
            page_size: 100,
            max_retries: 2,
            timeout_secs: 5,
            metaobject_types: vec!["faq".to_string(), "size_chart".to_string()],
        }
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        )
    }

    fn inventory_page(ids: &[i64], has_next: bool, cursor: Option<&str>) -> serde_json::Value {
        let edges: Vec<serde_json::Value> = ids
            .iter()
            .map(|i| {
                serde_json::json!({"node": {
                    "id": format!("gid://shopify/InventoryItem/{i}"),
                    "sku": format!("SKU-{i}"),
                    "updatedAt": "2024-01-15T00:00:00Z"
                }})
            })
            .collect();
        serde_json::json!({"data": {"inventoryItems": {
            "edges": edges,
            "pageInfo": {"hasNextPage": has_next, "endCursor": cursor}
        }}})
    }

    fn metaobject_page(ty: &str, ids: &[i64]) -> serde_json::Value {
        let edges: Vec<serde_json::Value> = ids
            .iter()
            .map(|i| {
                serde_json::json!({"node": {
                    "id": format!("gid://shopify/Metaobject/{i}"),
                    "type": ty,
                    "updatedAt": "2024-01-15T00:00:00Z"
                }})
            })
            .collect();
        serde_json::json!({"data": {"metaobjects": {
            "edges": edges,
            "pageInfo": {"hasNextPage": false, "endCursor": null}
        }}})
    }

    #[tokio::test]
    async fn follows_end_cursor() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/admin/api/2024-01/graphql.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(inventory_page(&[1, 2], true, Some("c1"))),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/admin/api/2024-01/graphql.json"))
            .and(body_partial_json(serde_json::json!({"variables": {"after": "c1"}})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(inventory_page(&[3], false, None)),
            )
            .mount(&server)
            .await;

        let client = ShopifyClient::new(test_config(&server.uri())).unwrap();
        let (start, end) = window();
        let records = client
            .fetch_window(catalog::find("inventory_levels").unwrap(), start, end)
            .await
            .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[2].key.to_string(), "gid://shopify/InventoryItem/3");
    }

    #[tokio::test]
    async fn metaobjects_run_one_pass_per_type() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/admin/api/2024-01/graphql.json"))
            .and(body_partial_json(serde_json::json!({"variables": {"type": "faq"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(metaobject_page("faq", &[1])))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/admin/api/2024-01/graphql.json"))
            .and(body_partial_json(
                serde_json::json!({"variables": {"type": "size_chart"}}),
            ))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(metaobject_page("size_chart", &[2, 3])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = ShopifyClient::new(test_config(&server.uri())).unwrap();
        let (start, end) = window();
        let records = client
            .fetch_window(catalog::find("metaobjects").unwrap(), start, end)
            .await
            .unwrap();

        assert_eq!(records.len(), 3);
    }

    #[tokio::test]
    async fn access_denied_maps_to_missing_scope() {
        let server = MockServer::start().await;

        let denied = serde_json::json!({"errors": [
            {"message": "Access denied for inventoryItems",
             "extensions": {"code": "ACCESS_DENIED"}}
        ]});
        Mock::given(method("POST"))
            .and(path("/admin/api/2024-01/graphql.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&denied))
            .mount(&server)
            .await;

        let client = ShopifyClient::new(test_config(&server.uri())).unwrap();
        let (start, end) = window();
        let err = client
            .fetch_window(catalog::find("inventory_levels").unwrap(), start, end)
            .await
            .unwrap_err();

        match err {
            FetchError::MissingScope { resource, scope } => {
                assert_eq!(resource, "inventory_levels");
                assert_eq!(scope, "read_inventory");
            }
            other => panic!("expected MissingScope, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn throttled_is_retried() {
        let server = MockServer::start().await;

        let throttled = serde_json::json!({"errors": [
            {"message": "Throttled", "extensions": {"code": "THROTTLED"}}
        ]});
        Mock::given(method("POST"))
            .and(path("/admin/api/2024-01/graphql.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&throttled))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/admin/api/2024-01/graphql.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(inventory_page(&[5], false, None)),
            )
            .mount(&server)
            .await;

        let client = ShopifyClient::new(test_config(&server.uri())).unwrap();
        let (start, end) = window();
        let records = client
            .fetch_window(catalog::find("inventory_levels").unwrap(), start, end)
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn other_graphql_errors_fail() {
        let server = MockServer::start().await;

        let broken = serde_json::json!({"errors": [
            {"message": "Field 'nope' doesn't exist"}
        ]});
        Mock::given(method("POST"))
            .and(path("/admin/api/2024-01/graphql.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&broken))
            .mount(&server)
            .await;

        let client = ShopifyClient::new(test_config(&server.uri())).unwrap();
        let (start, end) = window();
        let err = client
            .fetch_window(catalog::find("inventory_levels").unwrap(), start, end)
            .await
            .unwrap_err();

        match err {
            FetchError::Graphql(msg) => assert!(msg.contains("doesn't exist")),
            other => panic!("expected Graphql, got: {other:?}"),
        }
    }
}

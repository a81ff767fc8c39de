use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::catalog::Resource;
use crate::shopify::client::FetchError;
use shopsync_common::record::{Record, RecordKey};

/// Extract the `page_info` token from a `Link` header's `rel="next"` entry.
pub(crate) fn next_page_info(link_header: &str) -> Option<String> {
    for part in link_header.split(',') {
        if !part.contains("rel=\"next\"") {
            continue;
        }
        let url = part
            .split(';')
            .next()?
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>');
        let query = url.split('?').nth(1)?;
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("page_info=") {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Pull the item array out of a REST response envelope,
/// e.g. `{"orders": [...]}`.
pub(crate) fn parse_envelope(body: &Value, envelope: &str) -> Result<Vec<Value>, FetchError> {
    body.get(envelope)
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| FetchError::Malformed(format!("response missing '{envelope}' array")))
}

/// Pull nodes and the next cursor out of a GraphQL connection under
/// `data.<root>`. The cursor is `None` once `hasNextPage` is false.
pub(crate) fn parse_connection(
    body: &Value,
    root: &str,
) -> Result<(Vec<Value>, Option<String>), FetchError> {
    let connection = body
        .get("data")
        .and_then(|d| d.get(root))
        .filter(|c| !c.is_null())
        .ok_or_else(|| FetchError::Malformed(format!("response missing 'data.{root}'")))?;

    let edges = connection
        .get("edges")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::Malformed(format!("'data.{root}' has no edges")))?;

    let nodes = edges
        .iter()
        .filter_map(|edge| edge.get("node"))
        .cloned()
        .collect();

    let page_info = connection.get("pageInfo");
    let has_next = page_info
        .and_then(|p| p.get("hasNextPage"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let cursor = if has_next {
        page_info
            .and_then(|p| p.get("endCursor"))
            .and_then(Value::as_str)
            .map(str::to_owned)
    } else {
        None
    };

    Ok((nodes, cursor))
}

/// Normalize one payload item into a `Record`: pull out the key and parse
/// the updated-at field. An item missing either fails the whole page.
pub(crate) fn to_record(item: Value, resource: &Resource) -> Result<Record, FetchError> {
    let key = match item.get(resource.key_field) {
        Some(Value::Number(n)) if n.is_i64() => RecordKey::Int(n.as_i64().unwrap_or_default()),
        Some(Value::String(s)) => RecordKey::Text(s.clone()),
        other => {
            return Err(FetchError::Malformed(format!(
                "{} item has no usable '{}' key: {:?}",
                resource.name, resource.key_field, other
            )));
        }
    };

    let raw = item
        .get(resource.updated_at_field)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            FetchError::Malformed(format!(
                "{} item {} has no '{}' field",
                resource.name, key, resource.updated_at_field
            ))
        })?;

    let updated_at = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| {
            FetchError::Malformed(format!(
                "{} item {}: bad timestamp '{raw}': {e}",
                resource.name, key
            ))
        })?
        .with_timezone(&Utc);

    Ok(Record {
        key,
        updated_at,
        payload: item,
    })
}

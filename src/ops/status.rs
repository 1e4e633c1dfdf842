//! Query a node's admin API

use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::common::{Error, Result};
use crate::node::http::{ContentDetail, ContentSummary, HealthResponse, StatsResponse};
use crate::state::PeerRecord;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Health and stats of one node
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub health: HealthResponse,
    pub stats: StatsResponse,
}

async fn get_json<T: DeserializeOwned>(admin_url: &str, path: &str) -> Result<T> {
    let url = format!("{}{}", admin_url.trim_end_matches('/'), path);
    let response = reqwest::Client::new()
        .get(&url)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await?;

    match response.status() {
        reqwest::StatusCode::NOT_FOUND => Err(Error::ContentNotFound(path.to_string())),
        status if !status.is_success() => Err(Error::Internal(format!(
            "{} returned HTTP {}",
            url, status
        ))),
        _ => Ok(response.json().await?),
    }
}

pub async fn node_status(admin_url: &str) -> Result<NodeStatus> {
    tracing::debug!("Querying node status at {}", admin_url);
    Ok(NodeStatus {
        health: get_json(admin_url, "/health").await?,
        stats: get_json(admin_url, "/stats").await?,
    })
}

pub async fn list_peers(admin_url: &str) -> Result<Vec<PeerRecord>> {
    get_json(admin_url, "/peers").await
}

/// Every tracked content id, optionally only those below target
pub async fn list_content(admin_url: &str, under_replicated_only: bool) -> Result<Vec<ContentSummary>> {
    let mut content: Vec<ContentSummary> = get_json(admin_url, "/content").await?;
    if under_replicated_only {
        content.retain(|c| c.under_replicated);
    }
    Ok(content)
}

pub async fn content_detail(admin_url: &str, content_id: &str) -> Result<ContentDetail> {
    get_json(admin_url, &format!("/content/{}", content_id))
        .await
        .map_err(|e| match e {
            Error::ContentNotFound(_) => Error::ContentNotFound(content_id.to_string()),
            other => other,
        })
}

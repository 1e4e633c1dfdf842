//! Content store backed by a Kubo (go-ipfs) daemon
//!
//! Uses the RPC API (`/api/v0/...`, all POST):
//! - `pin/ls` to enumerate and test recursive pins
//! - `pin/add` to materialize an object locally
//! - `files/stat` for cumulative object size
//!
//! Free disk space is read from the filesystem holding `disk_path`.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::ContentStore;
use crate::common::{Error, Result};

/// Timeout for metadata calls (pin/ls, files/stat); pins are not bounded here
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct PinLsResponse {
    #[serde(rename = "Keys", default)]
    keys: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FilesStatResponse {
    #[serde(rename = "CumulativeSize")]
    cumulative_size: u64,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(rename = "Message", default)]
    message: String,
}

pub struct IpfsContentStore {
    client: reqwest::Client,
    api_url: String,
    disk_path: PathBuf,
}

impl IpfsContentStore {
    pub fn new(api_url: impl Into<String>, disk_path: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            disk_path: disk_path.into(),
        })
    }

    fn endpoint(&self, command: &str) -> String {
        format!("{}/api/v0/{}", self.api_url, command)
    }

    /// Read the daemon's error message from a failed response
    async fn rpc_error(response: reqwest::Response) -> String {
        let status = response.status();
        match response.json::<RpcError>().await {
            Ok(err) if !err.message.is_empty() => err.message,
            _ => format!("HTTP {}", status),
        }
    }
}

#[async_trait]
impl ContentStore for IpfsContentStore {
    async fn list_held(&self) -> Result<BTreeSet<String>> {
        let response = self
            .client
            .post(self.endpoint("pin/ls"))
            .query(&[("type", "recursive")])
            .timeout(RPC_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::ContentStore(format!("pin/ls failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::ContentStore(format!(
                "pin/ls failed: {}",
                Self::rpc_error(response).await
            )));
        }

        let body: PinLsResponse = response.json().await?;
        Ok(body.keys.into_keys().collect())
    }

    async fn size_of(&self, content_id: &str) -> Result<u64> {
        let response = self
            .client
            .post(self.endpoint("files/stat"))
            .query(&[("arg", format!("/ipfs/{}", content_id))])
            .timeout(RPC_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::ContentStore(format!("files/stat failed: {}", e)))?;

        if !response.status().is_success() {
            let message = Self::rpc_error(response).await;
            tracing::debug!(content_id, %message, "files/stat failed");
            return Err(Error::ContentNotFound(content_id.to_string()));
        }

        let body: FilesStatResponse = response.json().await?;
        Ok(body.cumulative_size)
    }

    async fn pin(&self, content_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint("pin/add"))
            .query(&[("arg", content_id)])
            .send()
            .await
            .map_err(|e| Error::Pin {
                content_id: content_id.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::Pin {
                content_id: content_id.to_string(),
                reason: Self::rpc_error(response).await,
            });
        }
        Ok(())
    }

    async fn free_disk_space(&self) -> Result<u64> {
        let path = self.disk_path.clone();
        tokio::task::spawn_blocking(move || available_space(&path))
            .await
            .map_err(|e| Error::Internal(format!("disk query task failed: {}", e)))?
    }

    async fn holds(&self, content_id: &str) -> Result<bool> {
        let response = self
            .client
            .post(self.endpoint("pin/ls"))
            .query(&[("arg", content_id), ("type", "recursive")])
            .timeout(RPC_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::ContentStore(format!("pin/ls failed: {}", e)))?;

        if response.status().is_success() {
            let body: PinLsResponse = response.json().await?;
            return Ok(!body.keys.is_empty());
        }

        // Kubo answers 500 "... is not pinned" for unpinned paths
        let message = Self::rpc_error(response).await;
        if message.contains("not pinned") {
            Ok(false)
        } else {
            Err(Error::ContentStore(format!("pin/ls failed: {}", message)))
        }
    }
}

/// Available bytes on the mount with the longest prefix of `path`
fn available_space(path: &Path) -> Result<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
        .ok_or_else(|| {
            Error::ContentStore(format!("no mounted disk contains {}", path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let store = IpfsContentStore::new("http://127.0.0.1:5001/", "/").unwrap();
        assert_eq!(store.endpoint("pin/ls"), "http://127.0.0.1:5001/api/v0/pin/ls");
    }

    #[test]
    fn test_parse_pin_ls() {
        let body = r#"{"Keys":{"QmA":{"Type":"recursive"},"QmB":{"Type":"recursive"}}}"#;
        let parsed: PinLsResponse = serde_json::from_str(body).unwrap();
        let mut keys: Vec<_> = parsed.keys.into_keys().collect();
        keys.sort();
        assert_eq!(keys, vec!["QmA".to_string(), "QmB".to_string()]);

        let empty: PinLsResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.keys.is_empty());
    }

    #[test]
    fn test_parse_files_stat() {
        let body = r#"{"Hash":"QmA","Size":0,"CumulativeSize":2048,"Blocks":3,"Type":"directory"}"#;
        let parsed: FilesStatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.cumulative_size, 2048);
    }
}

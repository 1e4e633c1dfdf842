//! Broadcast transport over Kubo pubsub
//!
//! - publish: `POST /api/v0/pubsub/pub?arg=<topic>` with the payload as a
//!   multipart file
//! - subscribe: `POST /api/v0/pubsub/sub?arg=<topic>`, a long-lived response
//!   of newline-delimited JSON messages
//!
//! Topics and message data are multibase encoded (`u` = base64url, no
//! padding). A lost subscription stream is re-established after a delay.

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{Transport, SUBSCRIPTION_BUFFER};
use crate::common::{Error, Result};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct PubsubMessage {
    #[serde(default)]
    data: String,
}

/// Multibase base64url encoding used for pubsub topics
fn encode_topic(topic: &str) -> String {
    format!("u{}", URL_SAFE_NO_PAD.encode(topic.as_bytes()))
}

/// Decode multibase message data (`u` base64url or `m` base64)
fn decode_data(data: &str) -> Result<Bytes> {
    let mut chars = data.chars();
    let decoded = match chars.next() {
        Some('u') => URL_SAFE_NO_PAD.decode(chars.as_str()),
        Some('m') => STANDARD_NO_PAD.decode(chars.as_str()),
        Some(other) => {
            return Err(Error::Transport(format!(
                "unsupported multibase prefix '{}'",
                other
            )))
        }
        None => return Ok(Bytes::new()),
    };
    decoded
        .map(Bytes::from)
        .map_err(|e| Error::Transport(format!("bad message data: {}", e)))
}

pub struct IpfsPubsub {
    client: reqwest::Client,
    api_url: String,
}

impl IpfsPubsub {
    pub fn new(api_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, command: &str) -> String {
        format!("{}/api/v0/{}", self.api_url, command)
    }
}

#[async_trait]
impl Transport for IpfsPubsub {
    async fn broadcast(&self, channel: &str, payload: Bytes) -> Result<()> {
        let part = reqwest::multipart::Part::bytes(payload.to_vec()).file_name("data");
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.endpoint("pubsub/pub"))
            .query(&[("arg", encode_topic(channel))])
            .multipart(form)
            .timeout(PUBLISH_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("pubsub/pub failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "pubsub/pub failed: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let client = self.client.clone();
        let url = self.endpoint("pubsub/sub");
        let topic = encode_topic(channel);
        let channel = channel.to_string();

        tokio::spawn(async move {
            while !tx.is_closed() {
                match stream_subscription(&client, &url, &topic, &tx).await {
                    Ok(()) => tracing::warn!(%channel, "Pubsub subscription ended, resubscribing"),
                    Err(e) => tracing::warn!(%channel, "Pubsub subscription failed: {}", e),
                }
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        });

        Ok(rx)
    }
}

/// Forward messages from one subscription response until it ends
async fn stream_subscription(
    client: &reqwest::Client,
    url: &str,
    topic: &str,
    tx: &mpsc::Sender<Bytes>,
) -> Result<()> {
    let response = client
        .post(url)
        .query(&[("arg", topic)])
        .send()
        .await
        .map_err(|e| Error::Transport(format!("pubsub/sub failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(Error::Transport(format!(
            "pubsub/sub failed: HTTP {}",
            response.status()
        )));
    }

    let mut stream = response.bytes_stream();
    let mut buffer = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Transport(format!("pubsub stream error: {}", e)))?;
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line = buffer.split_to(pos + 1);
            let line = &line[..pos];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let payload = serde_json::from_slice::<PubsubMessage>(line)
                .map_err(Error::from)
                .and_then(|message| decode_data(&message.data));
            match payload {
                Ok(payload) => {
                    if tx.send(payload).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => tracing::debug!("Skipping undecodable pubsub frame: {}", e),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_topic() {
        assert_eq!(encode_topic("tnet-announce"), "udG5ldC1hbm5vdW5jZQ");
    }

    #[test]
    fn test_decode_data() {
        let encoded = format!("u{}", URL_SAFE_NO_PAD.encode(b"{\"type\":\"announce\"}"));
        assert_eq!(
            decode_data(&encoded).unwrap(),
            Bytes::from_static(b"{\"type\":\"announce\"}")
        );
        let std = format!("m{}", STANDARD_NO_PAD.encode(b"hi"));
        assert_eq!(decode_data(&std).unwrap(), Bytes::from_static(b"hi"));

        assert!(decode_data("zabc").is_err());
        assert!(decode_data("u!!!").is_err());
        assert!(decode_data("").unwrap().is_empty());
    }
}

//! HTTP transport for the payload server

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};

use crate::crypto::{Digest, DIGEST_SIZE};

use super::{Request, Stage0Response, Stage1Response, Transport, TransportError};

/// Talks to `http://nas.<domain>`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// Shared connection pool
    client: Client,
    /// Scheme and host, without a trailing slash
    base_url: String,
}

impl HttpTransport {
    /// Transport for the service at `domain`
    pub fn new(domain: &str) -> Result<Self, TransportError> {
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self::with_client(client, format!("http://nas.{domain}")))
    }

    /// Transport using `client` against `base_url`
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self { client, base_url }
    }

    /// Scheme and host requests go to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends a GET for `path` with the game and salt as query parameters
    async fn get(&self, path: &str, request: &Request) -> Result<Response, TransportError> {
        self.client
            .get(format!("{}{path}", self.base_url))
            .query(&[("g", request.game.name()), ("s", request.salt.to_hex())])
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }
}

/// Parses the hex digest in a stage0 body
fn parse_digest(body: &str) -> Result<Digest, TransportError> {
    let mut digest = [0; DIGEST_SIZE];
    hex::decode_to_slice(body.trim(), &mut digest)
        .map_err(|e| TransportError::Response(format!("invalid digest: {e}")))?;
    Ok(digest)
}

/// `Retry-After` as a number of seconds, if present
fn retry_after(response: &Response) -> Option<Duration> {
    let value = response.headers().get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse().ok().map(Duration::from_secs)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn stage0(&self, request: &Request) -> Result<Stage0Response, TransportError> {
        let response = self.get("/payload/stage0", request).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(Stage0Response::Missing),
            StatusCode::OK => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| TransportError::Response(e.to_string()))?;
                Ok(Stage0Response::Available {
                    digest: parse_digest(&body)?,
                })
            }
            status => Err(TransportError::Response(format!("stage0 status {status}"))),
        }
    }

    async fn stage1(
        &self,
        request: &Request,
        max_size: usize,
    ) -> Result<Stage1Response, TransportError> {
        let response = self.get("/payload", request).await?;
        match response.status() {
            StatusCode::OK => {
                let declared = response.content_length().unwrap_or(0) as usize;
                if declared > max_size {
                    return Err(TransportError::Alloc {
                        size: declared,
                        max: max_size,
                    });
                }
                // chunked bodies carry no length, so the cap is enforced while reading
                let mut body = Vec::with_capacity(declared);
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| TransportError::Response(e.to_string()))?;
                    if body.len() + chunk.len() > max_size {
                        return Err(TransportError::Alloc {
                            size: body.len() + chunk.len(),
                            max: max_size,
                        });
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(Stage1Response::Payload(body))
            }
            StatusCode::ACCEPTED | StatusCode::SERVICE_UNAVAILABLE => Ok(Stage1Response::Waiting {
                retry_after: retry_after(&response),
            }),
            status => Err(TransportError::Response(format!("stage1 status {status}"))),
        }
    }
}

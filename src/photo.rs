use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use thiserror::Error;
use tokio::time::timeout;

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum PhotoError {
    #[error("photo is {bytes} bytes, above the {limit} byte ceiling")]
    TooLarge { bytes: usize, limit: usize },
    #[error("photo fetch timed out")]
    Timeout,
    #[error("photo fetch failed: {0}")]
    Http(String),
    #[error("photo could not be decoded: {0}")]
    Decode(String),
    #[error("photo payload is empty")]
    Empty,
}

impl From<reqwest::Error> for PhotoError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PhotoError::Timeout
        } else {
            PhotoError::Http(err.to_string())
        }
    }
}

#[async_trait]
pub trait PhotoSource: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, PhotoError>;
    /// Second attempt that yields the photo as a `data:` URI.
    async fn fetch_data_uri(&self, url: &str) -> Result<String, PhotoError>;
}

/// Splits `data:<mime>;base64,<payload>` into its mime type and decoded bytes.
pub fn decode_data_uri(uri: &str) -> Result<(String, Vec<u8>), PhotoError> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| PhotoError::Decode("not a data uri".into()))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| PhotoError::Decode("data uri without payload".into()))?;
    let mime = meta.strip_suffix(";base64").ok_or_else(|| {
        PhotoError::Decode("only base64 data uris can be embedded".into())
    })?;
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| PhotoError::Decode(err.to_string()))?;
    if bytes.is_empty() {
        return Err(PhotoError::Empty);
    }
    Ok((mime.to_string(), bytes))
}

#[derive(Clone)]
pub struct HttpPhotoSource {
    http: Client,
    fetch_timeout: Duration,
    hard_limit: usize,
}

impl HttpPhotoSource {
    pub fn new(config: &AppConfig) -> Result<Self, PhotoError> {
        let http = Client::builder()
            .timeout(config.photo_fetch_timeout())
            .build()?;
        Ok(Self {
            http,
            fetch_timeout: config.photo_fetch_timeout(),
            hard_limit: config.photo_hard_limit_bytes,
        })
    }

    async fn download(&self, url: &str) -> Result<(Option<String>, Vec<u8>), PhotoError> {
        let request = async {
            let response = self.http.get(url).send().await?.error_for_status()?;
            if let Some(length) = response.content_length() {
                if length as usize > self.hard_limit {
                    return Err(PhotoError::TooLarge {
                        bytes: length as usize,
                        limit: self.hard_limit,
                    });
                }
            }
            let mime = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());

            let mut stream = response.bytes_stream();
            let mut buffer = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if buffer.len() + chunk.len() > self.hard_limit {
                    return Err(PhotoError::TooLarge {
                        bytes: buffer.len() + chunk.len(),
                        limit: self.hard_limit,
                    });
                }
                buffer.extend_from_slice(&chunk);
            }
            if buffer.is_empty() {
                return Err(PhotoError::Empty);
            }
            Ok::<_, PhotoError>((mime, buffer))
        };
        timeout(self.fetch_timeout, request)
            .await
            .map_err(|_| PhotoError::Timeout)?
    }
}

#[async_trait]
impl PhotoSource for HttpPhotoSource {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, PhotoError> {
        if url.starts_with("data:") {
            return decode_data_uri(url).map(|(_, bytes)| bytes);
        }
        self.download(url).await.map(|(_, bytes)| bytes)
    }

    async fn fetch_data_uri(&self, url: &str) -> Result<String, PhotoError> {
        if url.starts_with("data:") {
            return Ok(url.to_string());
        }
        let (mime, bytes) = self.download(url).await?;
        let mime = mime
            .filter(|m| m.starts_with("image/"))
            .unwrap_or_else(|| "image/jpeg".to_string());
        Ok(format!("data:{mime};base64,{}", STANDARD.encode(bytes)))
    }
}

//! Delivery collaborator: the messaging endpoint files are relayed to.
//!
//! `TelegramMessenger` talks to the Bot API. Files are streamed from disk
//! into the multipart body rather than read into memory.

use crate::errors::RelayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, io, path::Path, time::Duration};
use thiserror::Error;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Opaque identifier of a delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryRef(pub String);

impl fmt::Display for DeliveryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("delivery transport failure: {0}")]
    Transport(String),
    #[error("delivery rejected ({code}): {description}")]
    Rejected { code: i64, description: String },
    #[error("reading file for delivery: {0}")]
    Io(#[from] io::Error),
}

impl From<MessengerError> for RelayError {
    fn from(err: MessengerError) -> Self {
        // Quota and rejection errors share the transport backoff path.
        RelayError::Transport(err.to_string())
    }
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_document(
        &self,
        destination: &str,
        path: &Path,
        caption: &str,
    ) -> Result<DeliveryRef, MessengerError>;

    async fn send_text(&self, destination: &str, text: &str) -> Result<DeliveryRef, MessengerError>;
}

pub struct TelegramMessenger {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl fmt::Debug for TelegramMessenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramMessenger")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    result: Option<ApiMessage>,
    error_code: Option<i64>,
    description: Option<String>,
    parameters: Option<ApiParameters>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct ApiParameters {
    retry_after: Option<u64>,
}

impl TelegramMessenger {
    pub fn new(api_url: &str, token: &str, connect_timeout: Duration) -> Result<Self, RelayError> {
        if token.trim().is_empty() {
            return Err(RelayError::Configuration("bot token is empty".into()));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| RelayError::Configuration(format!("building delivery client: {}", err)))?;

        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.token, method)
    }

    async fn call(&self, request: reqwest::RequestBuilder) -> Result<DeliveryRef, MessengerError> {
        // Strip the URL from errors: it embeds the bot token.
        let response = request
            .send()
            .await
            .map_err(|err| MessengerError::Transport(err.without_url().to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| MessengerError::Transport(err.without_url().to_string()))?;

        interpret_response(status.as_u16(), &body)
    }
}

fn interpret_response(status: u16, body: &str) -> Result<DeliveryRef, MessengerError> {
    let parsed: ApiResponse = serde_json::from_str(body).map_err(|_| {
        MessengerError::Transport(format!(
            "unexpected response ({}): {}",
            status,
            body.chars().take(200).collect::<String>()
        ))
    })?;

    match parsed {
        ApiResponse {
            ok: true,
            result: Some(message),
            ..
        } => Ok(DeliveryRef(message.message_id.to_string())),
        ApiResponse {
            error_code,
            description,
            parameters,
            ..
        } => {
            let mut description = description.unwrap_or_else(|| "no description".to_string());
            if let Some(retry_after) = parameters.and_then(|p| p.retry_after) {
                description.push_str(&format!(" (retry after {}s)", retry_after));
            }
            Err(MessengerError::Rejected {
                code: error_code.unwrap_or(i64::from(status)),
                description,
            })
        }
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_document(
        &self,
        destination: &str,
        path: &Path,
        caption: &str,
    ) -> Result<DeliveryRef, MessengerError> {
        let file = File::open(path).await?;
        let length = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        debug!("sending document {} ({} bytes)", file_name, length);

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = reqwest::multipart::Part::stream_with_length(body, length).file_name(file_name);
        let form = reqwest::multipart::Form::new()
            .text("chat_id", destination.to_string())
            .text("caption", caption.to_string())
            .text("parse_mode", "HTML")
            .part("document", part);

        self.call(self.http.post(self.method_url("sendDocument")).multipart(form))
            .await
    }

    async fn send_text(&self, destination: &str, text: &str) -> Result<DeliveryRef, MessengerError> {
        let payload = serde_json::json!({
            "chat_id": destination,
            "text": text,
            "parse_mode": "HTML",
        });

        self.call(self.http.post(self.method_url("sendMessage")).json(&payload))
            .await
    }
}

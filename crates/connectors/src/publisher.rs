use std::sync::Mutex;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("missing auth token for destination {0}")]
    MissingToken(String),
}

/// One publish target: a destination chat plus the caption template and
/// optional per-destination token override described in the route config.
#[derive(Debug, Clone)]
pub struct Destination {
    pub chat_id: String,
    pub mode: String,
    pub caption_template: String,
    pub token: Option<String>,
}

/// A single upload request handed to a `Publisher`.
#[derive(Debug, Clone)]
pub struct PublishRequest<'a> {
    pub destination: &'a Destination,
    pub filename: String,
    pub bytes: &'a [u8],
    pub caption: String,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, req: PublishRequest<'_>) -> Result<(), PublisherError>;
}

/// Uploads a document to a Telegram chat via the bot API's `sendDocument`.
pub struct TelegramPublisher {
    client: reqwest::Client,
    fallback_token: Option<String>,
}

impl TelegramPublisher {
    pub fn new(fallback_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            fallback_token,
        }
    }

    fn resolve_token(&self, destination: &Destination) -> Result<String, PublisherError> {
        destination
            .token
            .clone()
            .or_else(|| self.fallback_token.clone())
            .ok_or_else(|| PublisherError::MissingToken(destination.chat_id.clone()))
    }
}

#[async_trait]
impl Publisher for TelegramPublisher {
    async fn publish(&self, req: PublishRequest<'_>) -> Result<(), PublisherError> {
        let token = self.resolve_token(req.destination)?;
        let url = format!("https://api.telegram.org/bot{token}/sendDocument");

        let part = reqwest::multipart::Part::bytes(req.bytes.to_vec()).file_name(req.filename.clone());
        let form = reqwest::multipart::Form::new()
            .text("chat_id", req.destination.chat_id.clone())
            .text("caption", req.caption.clone())
            .part("document", part);

        let response = self.client.post(&url).multipart(form).send().await?;
        response.error_for_status()?;
        Ok(())
    }
}

/// Recording test double: never touches the network, just remembers every
/// call so tests can assert on it.
#[derive(Default)]
pub struct RecordingPublisher {
    calls: Mutex<Vec<(String, String, String)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, req: PublishRequest<'_>) -> Result<(), PublisherError> {
        self.calls.lock().unwrap().push((
            req.destination.chat_id.clone(),
            req.filename.clone(),
            req.caption.clone(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_publisher_captures_calls() {
        let publisher = RecordingPublisher::new();
        let dest = Destination {
            chat_id: "123".into(),
            mode: "document".into(),
            caption_template: "{sha12}".into(),
            token: None,
        };
        publisher
            .publish(PublishRequest {
                destination: &dest,
                filename: "route.npvt".into(),
                bytes: b"data",
                caption: "abc123456789".into(),
            })
            .await
            .unwrap();
        let calls = publisher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "123");
    }
}

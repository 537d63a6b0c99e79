//! HTTP clients for the two legs this process bridges: the chat provider's
//! long-poll "get updates" endpoint, and the pulse HTTP Ingress's schedule
//! endpoint.

use serde::Deserialize;

/// A failure from either leg, classified so the caller knows whether to
/// back off and retry or give up entirely.
#[derive(Debug, thiserror::Error)]
pub enum ChatPollError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ChatPollError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChatPollError::Fatal(_))
    }
}

#[derive(Debug, Clone)]
pub struct ChatUpdate {
    pub update_id: u64,
    pub peer_id: String,
    pub user: String,
    pub text: String,
}

#[derive(Deserialize)]
struct GetUpdatesEnvelope {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Vec<RawUpdate>,
}

#[derive(Deserialize)]
struct RawUpdate {
    update_id: u64,
    #[serde(default)]
    message: Option<RawMessage>,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    text: Option<String>,
    from: RawSender,
}

#[derive(Deserialize)]
struct RawSender {
    id: serde_json::Value,
    #[serde(default)]
    username: Option<String>,
}

pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> reqwest::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                // Must exceed the provider's own ~100s long-poll wait.
                .timeout(std::time::Duration::from_secs(120))
                .build()?,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    /// Long-poll for updates after `offset`, waiting up to ~100s server-side.
    /// Every update returned (matching or not) must still advance the
    /// caller's offset — non-matching peers are filtered by the caller,
    /// not by skipping the update_id here.
    pub async fn get_updates(&self, offset: u64) -> Result<Vec<ChatUpdate>, ChatPollError> {
        let url = format!("{}/bot{}/getUpdates", self.base_url, self.token);
        let response = self
            .http
            .get(&url)
            .query(&[("offset", offset.to_string()), ("timeout", "100".to_string())])
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ChatPollError::Fatal(format!(
                "chat provider rejected credentials ({status})"
            )));
        }
        if status.is_server_error() {
            return Err(ChatPollError::Transient(format!("chat provider returned {status}")));
        }
        if !status.is_success() {
            return Err(ChatPollError::Fatal(format!("chat provider returned {status}")));
        }

        let envelope: GetUpdatesEnvelope = response
            .json()
            .await
            .map_err(|e| ChatPollError::Transient(format!("failed to parse getUpdates response: {e}")))?;
        if !envelope.ok {
            return Err(ChatPollError::Transient(
                envelope.description.unwrap_or_else(|| "getUpdates returned ok=false".to_string()),
            ));
        }

        Ok(envelope
            .result
            .into_iter()
            .filter_map(|raw| {
                let message = raw.message?;
                let text = message.text?;
                let peer_id = match message.from.id {
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::String(s) => s,
                    _ => return None,
                };
                Some(ChatUpdate {
                    update_id: raw.update_id,
                    peer_id,
                    user: message.from.username.unwrap_or_else(|| "unknown".to_string()),
                    text,
                })
            })
            .collect())
    }
}

pub struct PulseApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl PulseApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> reqwest::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    pub async fn schedule_pulse(
        &self,
        prompt: &str,
        priority: &str,
        source: &str,
        tags: &[&str],
    ) -> Result<(), ChatPollError> {
        let url = format!("{}/api/pulse/schedule", self.base_url);
        let body = serde_json::json!({
            "prompt": prompt,
            "scheduled_at": "now",
            "priority": priority,
            "source": source,
            "tags": tags,
        });
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ChatPollError::Fatal(format!("pulse API rejected the request ({status})")));
        }
        if status.is_server_error() {
            return Err(ChatPollError::Transient(format!("pulse API returned {status}")));
        }
        Err(ChatPollError::Fatal(format!("pulse API returned {status}")))
    }
}

/// Network-level failures (timeouts, connection refused, DNS) are always
/// transient — only an HTTP status tells us whether the far end has
/// permanently rejected us.
fn classify_reqwest_error(e: reqwest::Error) -> ChatPollError {
    ChatPollError::Transient(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_fatal_classification() {
        assert!(ChatPollError::Fatal("x".into()).is_fatal());
        assert!(!ChatPollError::Transient("x".into()).is_fatal());
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://api.ro.am/v1";
/// Per-request limit unless `ClientOptions::timeout` says otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Channel (group address) ids. Ordered so request payloads are stable.
pub type ChannelSet = BTreeSet<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    Network,
    AuthRejected,
    InvalidChannel,
    Unknown,
}

impl fmt::Display for SendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SendErrorKind::Network => "network",
            SendErrorKind::AuthRejected => "auth rejected",
            SendErrorKind::InvalidChannel => "invalid channel",
            SendErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no channels to send to: none given and no default channels configured")]
    EmptyChannelSet,
    #[error("{kind} error: {detail}")]
    Remote { kind: SendErrorKind, detail: String },
}

impl SendError {
    pub fn remote(kind: SendErrorKind, detail: impl Into<String>) -> Self {
        SendError::Remote {
            kind,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> Option<SendErrorKind> {
        match self {
            SendError::EmptyChannelSet => None,
            SendError::Remote { kind, .. } => Some(*kind),
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_connect() || err.is_timeout() || err.is_request() {
            SendErrorKind::Network
        } else if let Some(status) = err.status() {
            kind_for_status(status)
        } else {
            SendErrorKind::Unknown
        };
        SendError::remote(kind, err.to_string())
    }
}

fn kind_for_status(status: StatusCode) -> SendErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SendErrorKind::AuthRejected,
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            SendErrorKind::InvalidChannel
        }
        _ => SendErrorKind::Unknown,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientBuildError {
    #[error("invalid header name '{0}'")]
    HeaderName(String),
    #[error("invalid value for header '{0}'")]
    HeaderValue(String),
    #[error("building HTTP client")]
    Http(#[from] reqwest::Error),
}

/// Who the bot is to the remote API. Never mutated after construction.
#[derive(Clone)]
pub struct BotIdentity {
    pub name: String,
    pub id: String,
    pub avatar_url: String,
    token: String,
    pub default_channels: ChannelSet,
}

impl BotIdentity {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        avatar_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            avatar_url: avatar_url.into(),
            token: token.into(),
            default_channels: ChannelSet::new(),
        }
    }

    pub fn with_default_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for BotIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotIdentity")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("avatar_url", &self.avatar_url)
            .field("token", &"<redacted>")
            .field("default_channels", &self.default_channels)
            .finish()
    }
}

/// Explicit channels replace the defaults entirely; they are never merged.
pub fn resolve_channels(
    defaults: &ChannelSet,
    explicit: Option<&ChannelSet>,
) -> Result<ChannelSet, SendError> {
    let resolved = explicit.unwrap_or(defaults);
    if resolved.is_empty() {
        return Err(SendError::EmptyChannelSet);
    }
    Ok(resolved.clone())
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send `message` to `channels`, or to the default channels when `None`.
    async fn send(&self, message: &str, channels: Option<&ChannelSet>) -> Result<(), SendError>;

    /// Ids of the channels visible to this bot. Queries the remote each call.
    async fn list_channels(&self) -> Result<Vec<String>, SendError>;
}

/// A group as returned by `groups.list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoamGroup {
    pub address_id: String,
    #[serde(default)]
    pub roam_id: Option<i64>,
    #[serde(default)]
    pub account_id: Option<i64>,
    #[serde(default)]
    pub group_type: Option<String>,
    pub name: String,
    #[serde(default)]
    pub access_mode: Option<String>,
    #[serde(default)]
    pub group_management: Option<String>,
    #[serde(default)]
    pub enforce_threaded_mode: Option<String>,
    #[serde(default)]
    pub date_created: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Sender<'a> {
    id: &'a str,
    name: &'a str,
    image_url: &'a str,
}

#[derive(Serialize)]
struct SendMessagePayload<'a> {
    sender: Sender<'a>,
    text: &'a str,
    recipients: &'a ChannelSet,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    /// Added to, or overriding, the default JSON and bearer headers.
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            headers: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// HTTP client for the Roam chat API. Build once and share by reference.
#[derive(Debug, Clone)]
pub struct RoamClient {
    identity: BotIdentity,
    base_url: String,
    http: reqwest::Client,
}

impl RoamClient {
    pub fn new(identity: BotIdentity) -> Result<Self, ClientBuildError> {
        Self::with_options(identity, ClientOptions::default())
    }

    pub fn with_options(
        identity: BotIdentity,
        options: ClientOptions,
    ) -> Result<Self, ClientBuildError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {}", identity.token()))
            .map_err(|_| ClientBuildError::HeaderValue(AUTHORIZATION.to_string()))?;
        headers.insert(AUTHORIZATION, bearer);

        for (name, value) in &options.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ClientBuildError::HeaderName(name.clone()))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| ClientBuildError::HeaderValue(name.clone()))?;
            headers.insert(header_name, header_value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(options.timeout)
            .build()?;

        Ok(Self {
            identity,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn identity(&self) -> &BotIdentity {
        &self.identity
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    pub async fn send_message(
        &self,
        message: &str,
        channels: Option<&ChannelSet>,
    ) -> Result<(), SendError> {
        let recipients = resolve_channels(&self.identity.default_channels, channels)?;
        let payload = SendMessagePayload {
            sender: Sender {
                id: &self.identity.id,
                name: &self.identity.name,
                image_url: &self.identity.avatar_url,
            },
            text: message,
            recipients: &recipients,
        };

        tracing::debug!(recipients = recipients.len(), "sending roam message");
        let resp = self
            .http
            .post(self.url("chat.sendMessage"))
            .json(&payload)
            .send()
            .await
            .map_err(SendError::from_reqwest)?;
        check_status(resp).await?;
        Ok(())
    }

    pub async fn list_groups(&self) -> Result<Vec<RoamGroup>, SendError> {
        let resp = self
            .http
            .get(self.url("groups.list"))
            .send()
            .await
            .map_err(SendError::from_reqwest)?;
        let body: serde_json::Value = check_status(resp)
            .await?
            .json()
            .await
            .map_err(SendError::from_reqwest)?;

        if !body.is_array() {
            return Err(SendError::remote(
                SendErrorKind::Unknown,
                "unexpected response from Roam server: expected a list of groups",
            ));
        }
        serde_json::from_value(body)
            .map_err(|e| SendError::remote(SendErrorKind::Unknown, format!("decoding groups: {e}")))
    }

    /// Whether the API accepts this bot's token.
    pub async fn ping(&self) -> Result<bool, SendError> {
        #[derive(Deserialize)]
        struct Status {
            status: Option<String>,
        }

        let resp = self
            .http
            .get(self.url("test"))
            .send()
            .await
            .map_err(SendError::from_reqwest)?;
        let status: Status = check_status(resp)
            .await?
            .json()
            .await
            .map_err(SendError::from_reqwest)?;
        Ok(status.status.as_deref() == Some("ok"))
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {body}")
    };
    Err(SendError::remote(kind_for_status(status), detail))
}

#[async_trait]
impl MessageSender for RoamClient {
    async fn send(&self, message: &str, channels: Option<&ChannelSet>) -> Result<(), SendError> {
        self.send_message(message, channels).await
    }

    async fn list_channels(&self) -> Result<Vec<String>, SendError> {
        Ok(self
            .list_groups()
            .await?
            .into_iter()
            .map(|g| g.address_id)
            .collect())
    }
}

//! Time-limited access URLs for message attachments.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::models::messages::{Message, MessageView};

#[async_trait]
pub trait AttachmentSigner: Send + Sync {
    /// Signed URL for the object stored under `key`, valid for `ttl`.
    async fn sign(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Signed URL a client can PUT a new object of `content_type` to.
    async fn sign_upload(&self, key: &str, content_type: &str, ttl: Duration) -> Result<String>;
}

/// How long a client has to use an upload URL.
pub const UPLOAD_URL_TTL: Duration = Duration::from_secs(600);

/// Where a client should upload a new attachment, and the key to send back
/// as `attachmentRef` afterwards.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadTicket {
    pub unique_file_name: String,
    pub upload_url: String,
}

/// Mints a collision-free object key for `file_name` and signs an upload to it.
pub async fn request_upload(
    signer: &dyn AttachmentSigner,
    file_name: &str,
    content_type: &str,
) -> Result<UploadTicket> {
    let unique_file_name = format!("{}_{}", Uuid::new_v4(), file_name);
    let upload_url = signer
        .sign_upload(&unique_file_name, content_type, UPLOAD_URL_TTL)
        .await?;
    Ok(UploadTicket {
        unique_file_name,
        upload_url,
    })
}

/// Asks an external signing endpoint:
/// `GET {base}/presign?key=..&expiresIn=..` and
/// `GET {base}/presign-upload?key=..&contentType=..&expiresIn=..`, both answering `{"url": ..}`.
pub struct HttpAttachmentSigner {
    client: Client,
    endpoint: Url,
    upload_endpoint: Url,
}

#[derive(Deserialize)]
struct PresignResponse {
    url: String,
}

impl HttpAttachmentSigner {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .with_context(|| format!("invalid attachment signer url '{}'", base_url))?;
        let endpoint = base.join("presign")?;
        let upload_endpoint = base.join("presign-upload")?;

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("chat_engine/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build attachment signer http client")?;

        Ok(Self {
            client,
            endpoint,
            upload_endpoint,
        })
    }

    async fn fetch(&self, url: Url) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("presign request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("presign request returned {}", status);
        }

        let body: PresignResponse = response
            .json()
            .await
            .context("failed to parse presign response")?;
        Ok(body.url)
    }
}

#[async_trait]
impl AttachmentSigner for HttpAttachmentSigner {
    async fn sign(&self, key: &str, ttl: Duration) -> Result<String> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("key", key)
            .append_pair("expiresIn", &ttl.as_secs().to_string());
        self.fetch(url).await
    }

    async fn sign_upload(&self, key: &str, content_type: &str, ttl: Duration) -> Result<String> {
        let mut url = self.upload_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("key", key)
            .append_pair("contentType", content_type)
            .append_pair("expiresIn", &ttl.as_secs().to_string());
        self.fetch(url).await
    }
}

/// Used when no signing endpoint is configured; every attachment stays unresolved.
pub struct DisabledAttachmentSigner;

#[async_trait]
impl AttachmentSigner for DisabledAttachmentSigner {
    async fn sign(&self, _key: &str, _ttl: Duration) -> Result<String> {
        Err(anyhow!("attachment signing is not configured"))
    }

    async fn sign_upload(&self, _key: &str, _content_type: &str, _ttl: Duration) -> Result<String> {
        Err(anyhow!("attachment signing is not configured"))
    }
}

/// Resolves attachment references for a batch of messages. A failure only
/// nulls the URL of the message it concerns.
pub async fn resolve_all(
    signer: &dyn AttachmentSigner,
    ttl: Duration,
    messages: Vec<Message>,
) -> Vec<MessageView> {
    let mut views = Vec::with_capacity(messages.len());
    for message in messages {
        views.push(resolve(signer, ttl, message).await);
    }
    views
}

pub async fn resolve(signer: &dyn AttachmentSigner, ttl: Duration, message: Message) -> MessageView {
    let attachment_url = match message.attachment_ref.as_deref() {
        Some(key) => match signer.sign(key, ttl).await {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(message_id = %message.id, error = %e, "attachment url unavailable");
                None
            }
        },
        None => None,
    };

    MessageView {
        message,
        attachment_url,
    }
}

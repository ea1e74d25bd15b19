// src/outbound.rs
//
// Delivery through external providers. Email goes to a JSON HTTP API
// (Resend/Postmark style); SMS and WhatsApp go through Twilio's Messages
// endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{Config, EmailProviderConfig, TwilioConfig};
use crate::models::Channel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub to: String,
    pub subject: Option<String>,
    pub text: String,
    pub html: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SendReceipt {
    pub provider_message_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no provider configured for {0}")]
    NotConfigured(Channel),
    #[error("network error: {0}")]
    Network(String),
    #[error("provider rejected message ({status}): {body}")]
    Provider { status: u16, body: String },
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError>;
}

pub fn build_sender(cfg: &Config) -> Arc<dyn MessageSender> {
    if cfg.outbound_dry_run {
        tracing::warn!("OUTBOUND_DRY_RUN is set: messages will be logged, not delivered");
        return Arc::new(DryRunSender);
    }
    if cfg.email.is_none() {
        tracing::warn!("email provider not configured; email steps will fail");
    }
    if cfg.twilio.is_none() {
        tracing::warn!("twilio not configured; sms/whatsapp steps will fail");
    }
    Arc::new(HttpSender::new(cfg.email.clone(), cfg.twilio.clone()))
}

pub struct DryRunSender;

#[async_trait]
impl MessageSender for DryRunSender {
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        tracing::info!(
            channel = %message.channel,
            to = %message.to,
            subject = message.subject.as_deref().unwrap_or(""),
            "dry run: message not delivered"
        );
        Ok(SendReceipt::default())
    }
}

pub struct HttpSender {
    client: Client,
    email: Option<EmailProviderConfig>,
    twilio: Option<TwilioConfig>,
}

#[derive(Debug, Serialize)]
struct EmailPayload<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmailApiResponse {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TwilioMessageResponse {
    sid: Option<String>,
}

impl HttpSender {
    pub fn new(email: Option<EmailProviderConfig>, twilio: Option<TwilioConfig>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            email,
            twilio,
        }
    }

    async fn send_email(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        let cfg = self
            .email
            .as_ref()
            .ok_or(SendError::NotConfigured(Channel::Email))?;

        let payload = EmailPayload {
            from: &cfg.from,
            to: [message.to.as_str()],
            subject: message.subject.as_deref().unwrap_or(""),
            text: &message.text,
            html: message.html.as_deref(),
        };

        let response = self
            .client
            .post(&cfg.api_url)
            .bearer_auth(&cfg.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SendError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Provider { status, body });
        }

        // Providers disagree on the response body; the id is nice to have.
        let parsed: Option<EmailApiResponse> = response.json().await.ok();
        Ok(SendReceipt {
            provider_message_id: parsed.and_then(|r| r.id),
        })
    }

    async fn send_twilio(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        let cfg = self
            .twilio
            .as_ref()
            .ok_or(SendError::NotConfigured(message.channel))?;

        let (from, to) = match message.channel {
            Channel::Whatsapp => (
                cfg.whatsapp_from
                    .as_ref()
                    .map(|f| format!("whatsapp:{f}"))
                    .ok_or(SendError::NotConfigured(Channel::Whatsapp))?,
                format!("whatsapp:{}", message.to),
            ),
            _ => (
                cfg.from_number
                    .clone()
                    .ok_or(SendError::NotConfigured(Channel::Sms))?,
                message.to.clone(),
            ),
        };

        let url = format!("{}/Accounts/{}/Messages.json", cfg.base_url, cfg.account_sid);
        let params = [("To", to), ("From", from), ("Body", message.text.clone())];

        let response = self
            .client
            .post(&url)
            .basic_auth(&cfg.account_sid, Some(&cfg.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| SendError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Provider { status, body });
        }

        let parsed: Option<TwilioMessageResponse> = response.json().await.ok();
        Ok(SendReceipt {
            provider_message_id: parsed.and_then(|r| r.sid),
        })
    }
}

#[async_trait]
impl MessageSender for HttpSender {
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        match message.channel {
            Channel::Email => self.send_email(message).await,
            Channel::Sms | Channel::Whatsapp => self.send_twilio(message).await,
        }
    }
}

//! Built-in `AlertSink` implementations for common webhook destinations.

use super::{sink_error, AlertSink};
use crate::error::Result;
use crate::event::Event;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;

/// Posts the event as JSON to an arbitrary HTTP endpoint.
pub struct HttpWebhookSink {
    url: String,
    client: Client,
}

impl HttpWebhookSink {
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { url: url.into(), client: Client::new() })
    }
}

#[async_trait]
impl AlertSink for HttpWebhookSink {
    async fn send(&self, event: &Event) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| sink_error(&self.url, e))?;
        if !response.status().is_success() {
            return Err(sink_error(&self.url, format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

/// Posts a condensed, human-readable payload shaped for chat webhooks
/// (Slack/Teams/Discord-compatible `{"text": ...}` body).
pub struct ChatWebhookSink {
    url: String,
    client: Client,
}

impl ChatWebhookSink {
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { url: url.into(), client: Client::new() })
    }
}

#[async_trait]
impl AlertSink for ChatWebhookSink {
    async fn send(&self, event: &Event) -> Result<()> {
        let text = format!(
            "[{:?}] {} — {}",
            event.severity,
            event.kind.as_str(),
            event.suggestion.as_deref().unwrap_or("no further detail")
        );
        let body = serde_json::json!({ "text": text });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| sink_error(&self.url, e))?;
        if !response.status().is_success() {
            return Err(sink_error(&self.url, format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

/// Opens an incident via a generic incident-management webhook (PagerDuty
/// Events-API-shaped: `{"payload": {...}, "event_action": "trigger"}`).
pub struct IncidentWebhookSink {
    url: String,
    routing_key: String,
    client: Client,
}

impl IncidentWebhookSink {
    pub fn new(url: impl Into<String>, routing_key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { url: url.into(), routing_key: routing_key.into(), client: Client::new() })
    }
}

#[async_trait]
impl AlertSink for IncidentWebhookSink {
    async fn send(&self, event: &Event) -> Result<()> {
        let body = serde_json::json!({
            "routing_key": self.routing_key,
            "event_action": "trigger",
            "payload": {
                "summary": format!("{}: {}", event.kind.as_str(), event.suggestion.as_deref().unwrap_or("")),
                "severity": format!("{:?}", event.severity).to_lowercase(),
                "source": event.source,
                "custom_details": event.payload,
            }
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| sink_error(&self.url, e))?;
        if !response.status().is_success() {
            return Err(sink_error(&self.url, format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

//! 通知の配送方式
//!
//! webhook は Discord 互換のJSONを、push は通知中継サーバー向けのJSONを送る。

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use super::DeliveryError;
use crate::error::HighliveResult;
use crate::models::{Endpoint, NotificationPayload, TransportKind};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn deliver(
        &self,
        endpoint: &Endpoint,
        payload: &NotificationPayload,
        idempotency_key: Uuid,
    ) -> Result<(), DeliveryError>;
}

/// HTTPステータスを配送結果に分類する
pub fn classify_status(status: reqwest::StatusCode) -> Result<(), DeliveryError> {
    if status.is_success() {
        return Ok(());
    }
    match status.as_u16() {
        404 | 410 => Err(DeliveryError::Permanent {
            status: status.as_u16(),
        }),
        408 | 429 => Err(DeliveryError::Transient(format!("status {}", status))),
        s if s >= 500 => Err(DeliveryError::Transient(format!("status {}", status))),
        _ => Err(DeliveryError::Other(format!("status {}", status))),
    }
}

fn classify_error(error: reqwest::Error) -> DeliveryError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        DeliveryError::Transient(error.to_string())
    } else {
        DeliveryError::Other(error.to_string())
    }
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
    idempotency_key: Uuid,
) -> Result<(), DeliveryError> {
    let response = client
        .post(url)
        .header(IDEMPOTENCY_HEADER, idempotency_key.to_string())
        .json(body)
        .send()
        .await
        .map_err(classify_error)?;
    classify_status(response.status())
}

fn build_client(timeout: Duration) -> HighliveResult<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

pub struct WebhookTransport {
    client: reqwest::Client,
}

impl WebhookTransport {
    pub fn new(timeout: Duration) -> HighliveResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }

    /// ペイロードのdataがオブジェクトならそのまま、なければ本文から組み立てる
    fn body(payload: &NotificationPayload) -> serde_json::Value {
        if payload.data.is_object() {
            payload.data.clone()
        } else {
            json!({
                "username": payload.title,
                "content": payload.body,
            })
        }
    }
}

#[async_trait]
impl NotificationTransport for WebhookTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Webhook
    }

    async fn deliver(
        &self,
        endpoint: &Endpoint,
        payload: &NotificationPayload,
        idempotency_key: Uuid,
    ) -> Result<(), DeliveryError> {
        post_json(&self.client, &endpoint.url, &Self::body(payload), idempotency_key).await
    }
}

pub struct PushTransport {
    client: reqwest::Client,
}

impl PushTransport {
    pub fn new(timeout: Duration) -> HighliveResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl NotificationTransport for PushTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Push
    }

    async fn deliver(
        &self,
        endpoint: &Endpoint,
        payload: &NotificationPayload,
        idempotency_key: Uuid,
    ) -> Result<(), DeliveryError> {
        let body = json!({
            "notification": {
                "title": payload.title,
                "body": payload.body,
            },
            "data": payload.data,
            "idempotency_key": idempotency_key,
        });
        post_json(&self.client, &endpoint.url, &body, idempotency_key).await
    }
}

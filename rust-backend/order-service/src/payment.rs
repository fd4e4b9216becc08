//! Hosted checkout sessions and signed payment notifications (Stripe wire
//! format).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{PricedLine, ProductUnit};
use crate::pricing::round_money;

/// Maximum age of a signed notification.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("payment provider error: {0}")]
    Provider(String),
    #[error("invalid webhook signature: {0}")]
    InvalidSignature(&'static str),
    #[error("malformed webhook payload: {0}")]
    Malformed(String),
    #[error("payments are not configured")]
    NotConfigured,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutLine {
    pub name: String,
    /// Minor currency units.
    pub unit_amount: i64,
    pub quantity: u32,
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub order_id: Uuid,
    pub public_id: String,
    pub currency: String,
    pub lines: Vec<CheckoutLine>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEventKind {
    Completed,
    Expired,
    AsyncFailed,
    Ignored(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotification {
    pub kind: PaymentEventKind,
    pub order_id: Option<Uuid>,
    pub session_id: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PaymentError>;

    /// Verifies the signature header and decodes the notification.
    fn parse_notification(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<PaymentNotification, PaymentError>;
}

pub fn to_minor_units(amount: Decimal) -> i64 {
    (round_money(amount) * Decimal::ONE_HUNDRED)
        .to_i64()
        .unwrap_or_default()
}

/// Weight-sold products become a single line priced at their full weight;
/// unit-sold products keep their integer quantity. A non-zero delivery fee is
/// its own line.
pub fn checkout_lines(lines: &[PricedLine], delivery_fee: Decimal) -> Vec<CheckoutLine> {
    let mut out: Vec<CheckoutLine> = lines
        .iter()
        .map(|line| match line.unit {
            ProductUnit::PerKg => CheckoutLine {
                name: format!("{} ({} kg)", line.name, line.quantity.normalize()),
                unit_amount: to_minor_units(line.line_total()),
                quantity: 1,
            },
            ProductUnit::PerUnit => CheckoutLine {
                name: line.name.clone(),
                unit_amount: to_minor_units(line.unit_price),
                quantity: line.quantity.to_u32().unwrap_or(1),
            },
        })
        .collect();

    if delivery_fee > Decimal::ZERO {
        out.push(CheckoutLine {
            name: "Delivery".to_string(),
            unit_amount: to_minor_units(delivery_fee),
            quantity: 1,
        });
    }
    out
}

fn signature_for(secret: &str, timestamp: &str, payload: &[u8]) -> Option<Hmac<Sha256>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    Some(mac)
}

/// Checks a `t=<unix>,v1=<hex>` header against HMAC-SHA256(`t.payload`).
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now_unix: i64,
) -> Result<(), PaymentError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(PaymentError::InvalidSignature("missing timestamp"))?;
    let issued: i64 = timestamp
        .parse()
        .map_err(|_| PaymentError::InvalidSignature("bad timestamp"))?;
    if (now_unix - issued).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(PaymentError::InvalidSignature("timestamp outside tolerance"));
    }

    for candidate in candidates {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mac = signature_for(secret, timestamp, payload)
            .ok_or(PaymentError::InvalidSignature("unusable secret"))?;
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    Err(PaymentError::InvalidSignature("no matching signature"))
}

#[derive(Debug, Deserialize)]
struct ProviderEvent {
    #[serde(rename = "type")]
    kind: String,
    data: ProviderEventData,
}

#[derive(Debug, Deserialize)]
struct ProviderEventData {
    object: ProviderSession,
}

#[derive(Debug, Deserialize)]
struct ProviderSession {
    id: Option<String>,
    client_reference_id: Option<String>,
    payment_status: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

pub fn decode_notification(payload: &[u8]) -> Result<PaymentNotification, PaymentError> {
    let event: ProviderEvent =
        serde_json::from_slice(payload).map_err(|e| PaymentError::Malformed(e.to_string()))?;
    let session = event.data.object;

    let kind = match event.kind.as_str() {
        "checkout.session.completed" => match session.payment_status.as_deref() {
            Some("paid") | Some("no_payment_required") => PaymentEventKind::Completed,
            // delayed methods settle through async_payment_succeeded
            _ => PaymentEventKind::Ignored(event.kind.clone()),
        },
        "checkout.session.async_payment_succeeded" => PaymentEventKind::Completed,
        "checkout.session.expired" => PaymentEventKind::Expired,
        "checkout.session.async_payment_failed" => PaymentEventKind::AsyncFailed,
        _ => PaymentEventKind::Ignored(event.kind.clone()),
    };

    let order_id = session
        .metadata
        .get("order_id")
        .or(session.client_reference_id.as_ref())
        .and_then(|raw| Uuid::parse_str(raw).ok());

    Ok(PaymentNotification {
        kind,
        order_id,
        session_id: session.id,
    })
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    id: String,
    url: Option<String>,
}

pub struct StripeCheckout {
    client: reqwest::Client,
    api_base: String,
    secret_key: Option<String>,
    webhook_secret: Option<String>,
}

impl StripeCheckout {
    pub fn new(
        api_base: &str,
        secret_key: Option<String>,
        webhook_secret: Option<String>,
    ) -> Result<Self, PaymentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key,
            webhook_secret,
        })
    }

    fn form(request: &CheckoutRequest) -> Vec<(String, String)> {
        let mut form = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), request.success_url.clone()),
            ("cancel_url".to_string(), request.cancel_url.clone()),
            ("client_reference_id".to_string(), request.order_id.to_string()),
            ("metadata[order_id]".to_string(), request.order_id.to_string()),
            ("metadata[public_id]".to_string(), request.public_id.clone()),
        ];

        for (i, line) in request.lines.iter().enumerate() {
            let prefix = format!("line_items[{i}]");
            form.push((format!("{prefix}[quantity]"), line.quantity.to_string()));
            form.push((format!("{prefix}[price_data][currency]"), request.currency.clone()));
            form.push((format!("{prefix}[price_data][unit_amount]"), line.unit_amount.to_string()));
            form.push((format!("{prefix}[price_data][product_data][name]"), line.name.clone()));
        }
        form
    }
}

#[async_trait]
impl PaymentProvider for StripeCheckout {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, PaymentError> {
        let secret_key = self.secret_key.as_deref().ok_or(PaymentError::NotConfigured)?;

        let resp = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(secret_key)
            .form(&Self::form(request))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PaymentError::Provider(format!("{status}: {body}")));
        }

        let created: SessionCreated = resp.json().await?;
        let url = created
            .url
            .ok_or_else(|| PaymentError::Provider("session has no checkout url".into()))?;
        Ok(CheckoutSession { id: created.id, url })
    }

    fn parse_notification(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<PaymentNotification, PaymentError> {
        let secret = self.webhook_secret.as_deref().ok_or(PaymentError::NotConfigured)?;
        let header = signature.ok_or(PaymentError::InvalidSignature("missing header"))?;
        verify_signature(payload, header, secret, chrono::Utc::now().timestamp())?;
        decode_notification(payload)
    }
}

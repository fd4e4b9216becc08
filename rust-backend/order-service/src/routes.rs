use actix_web::{get, post, web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::app::AppState;
use crate::db::PaymentConfirmation;
use crate::errors::OrderError;
use crate::models::{CreateOrderRequest, DeliveryQuoteRequest, OrderDetails};
use crate::payment::PaymentError;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";
pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

/// Shared-secret check. An unset secret locks the endpoint instead of opening it.
fn authorize(expected: Option<&str>, provided: Option<&str>) -> Result<(), OrderError> {
    match (expected, provided) {
        (Some(expected), Some(provided)) if expected == provided => Ok(()),
        _ => Err(OrderError::Unauthorized),
    }
}

fn admin(req: &HttpRequest, state: &AppState) -> Result<(), OrderError> {
    let provided = req
        .headers()
        .get(ADMIN_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    authorize(state.admin_secret.as_deref(), provided)
}

#[post("/orders")]
pub async fn create_order(
    state: web::Data<AppState>,
    req: web::Json<CreateOrderRequest>,
) -> Result<HttpResponse, OrderError> {
    let created = state.orchestrator.create_order(req.into_inner()).await?;
    Ok(HttpResponse::Ok().json(created))
}

#[post("/delivery-fee")]
pub async fn quote_delivery(
    state: web::Data<AppState>,
    req: web::Json<DeliveryQuoteRequest>,
) -> Result<HttpResponse, OrderError> {
    let quote = state.orchestrator.quote_delivery(&req).await?;
    Ok(HttpResponse::Ok().json(quote))
}

#[get("/orders/{id}")]
pub async fn get_order(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, OrderError> {
    let order_id = path.into_inner();
    let order = state.orders.get_order(order_id).await?.ok_or(OrderError::NotFound)?;
    let items = state.orders.get_items(order_id).await?;
    Ok(HttpResponse::Ok().json(OrderDetails { order, items }))
}

#[post("/orders/{id}/cancel")]
pub async fn cancel_order(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, OrderError> {
    let order = state.settlement.cancel_order(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(order))
}

#[post("/orders/{id}/mark-paid")]
pub async fn mark_paid(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, OrderError> {
    admin(&req, &state)?;

    let order_id = path.into_inner();
    let outcome = match state.settlement.confirm_payment(order_id).await? {
        PaymentConfirmation::Confirmed => "confirmed",
        PaymentConfirmation::AlreadyPaid => "already_paid",
        PaymentConfirmation::OrderCancelled => "order_cancelled",
        PaymentConfirmation::NotFound => return Err(OrderError::NotFound),
    };
    tracing::info!(%order_id, outcome, "order marked paid by admin");
    Ok(HttpResponse::Ok().json(json!({ "ok": true, "outcome": outcome })))
}

#[get("/orders/{id}/fulfillment")]
pub async fn fulfillment_preview(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, OrderError> {
    admin(&req, &state)?;

    let order_id = path.into_inner();
    state.orders.get_order(order_id).await?.ok_or(OrderError::NotFound)?;
    let lines = state.stock.preview(order_id).await?;
    Ok(HttpResponse::Ok().json(json!({ "order_id": order_id, "lines": lines })))
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    secret: Option<String>,
}

#[post("/cleanup")]
pub async fn cleanup(
    state: web::Data<AppState>,
    query: web::Query<CleanupQuery>,
) -> Result<HttpResponse, OrderError> {
    authorize(state.cleanup_secret.as_deref(), query.secret.as_deref())?;

    let released = state.sweeper.sweep().await?;
    Ok(HttpResponse::Ok().json(json!({ "ok": true, "released": released })))
}

/// Always acknowledged once the signature checks out: a non-2xx makes the
/// provider redeliver, and anything left half-done is picked up by the sweeper
/// or an operator.
#[post("/webhooks/payment")]
pub async fn payment_webhook(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> HttpResponse {
    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let notification = match state.payments.parse_notification(&body, signature) {
        Ok(notification) => notification,
        Err(e @ (PaymentError::InvalidSignature(_) | PaymentError::NotConfigured)) => {
            tracing::warn!(error = %e, "rejected payment webhook");
            return HttpResponse::BadRequest().json(json!({ "error": e.to_string() }));
        }
        Err(e) => {
            tracing::error!(error = %e, "unreadable payment webhook acknowledged");
            return HttpResponse::Ok().json(json!({ "received": true }));
        }
    };

    if let Err(e) = state.settlement.handle_notification(&notification).await {
        tracing::error!(
            order_id = ?notification.order_id,
            kind = ?notification.kind,
            error = %e,
            "payment notification handling failed"
        );
    }

    HttpResponse::Ok().json(json!({ "received": true }))
}

//! HTTP surface
//!
//! Public endpoints for account onboarding and purchases, push-callback
//! endpoints for the wallet and gateway rails, and an operator surface
//! guarded by a constant-time token check.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;

use relaypass_core::{CoreError, PaymentOutcome, PaymentStatus, ProviderKind, VerifyOutcome};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/plans", get(list_plans))
        .route("/api/accounts", post(create_account))
        .route("/api/accounts/{external_id}", get(account_status))
        .route("/api/payments", post(create_payment))
        .route("/api/payments/{id}", get(payment_status))
        .route("/api/payments/{id}/verify", post(verify_payment))
        .route("/callbacks/gateway", post(gateway_callback))
        .route("/callbacks/wallet", post(wallet_callback))
        .route("/admin/accounts/{id}/extend", post(admin_extend))
        .route("/admin/accounts/{id}/trial", post(admin_trial))
        .route("/admin/accounts/{id}/region", post(admin_region))
        .route("/admin/accounts/{id}/rotate", post(admin_rotate))
        .route("/admin/accounts/{id}/referrals", get(admin_referrals))
        .route("/admin/payouts", get(admin_list_payouts))
        .route("/admin/payouts/request", post(admin_request_payout))
        .route("/admin/payouts/{id}/complete", post(admin_complete_payout))
        .route("/admin/invariants", get(admin_invariants))
        .route("/admin/stats", get(admin_stats))
        .route("/admin/audit", get(admin_audit))
        .with_state(state)
}

/// Constant-time admin token check against the `x-admin-token` header.
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let expected = state.admin_token.as_bytes();
    let ok = provided.len() == expected.len()
        && provided.as_bytes().ct_eq(expected).unwrap_u8() == 1;
    if ok {
        Ok(())
    } else {
        Err(ApiError(CoreError::NotFound("resource".to_string())))
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    let status = if db_ok { "ok" } else { "degraded" };
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!({ "status": status, "database": db_ok })))
}

async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let plans = state.core.subscriptions.active_plans().await?;
    let plans: Vec<_> = plans
        .into_iter()
        .map(|p| {
            json!({
                "id": p.id,
                "name": p.name,
                "duration_days": p.duration_days,
                "price_cents": p.price_cents,
            })
        })
        .collect();
    Ok(Json(json!({ "plans": plans })))
}

#[derive(Deserialize)]
struct CreateAccountRequest {
    external_id: i64,
    username: Option<String>,
    referral_code: Option<String>,
}

async fn create_account(
    State(state): State<AppState>,
    Json(req): Json<CreateAccountRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let account = state
        .core
        .accounts
        .find_or_create(
            req.external_id,
            req.username.as_deref(),
            req.referral_code.as_deref(),
        )
        .await?;
    Ok(Json(json!({
        "id": account.id,
        "external_id": account.external_id,
        "referral_code": account.referral_code,
        "region": account.region,
    })))
}

async fn account_status(
    State(state): State<AppState>,
    Path(external_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let account = state
        .core
        .accounts
        .by_external_id(external_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("account for principal {external_id}")))?;

    let grant = state.core.subscriptions.active_grant(account.id).await?;
    let credential = state
        .core
        .credentials
        .active_credential(account.id, &account.region)
        .await?;
    let earnings = state.core.accounts.referral_earnings(account.id).await?;

    let credential_json = match credential {
        Some(ref c) => {
            let (username, password) = state.core.credentials.decrypt_pair(c)?;
            json!({
                "region": c.region,
                "host": c.relay_host,
                "port": c.relay_port,
                "username": username,
                "password": password,
            })
        }
        None => serde_json::Value::Null,
    };

    Ok(Json(json!({
        "account": {
            "id": account.id,
            "external_id": account.external_id,
            "region": account.region,
            "referral_code": account.referral_code,
        },
        "grant": grant.map(|g| json!({
            "id": g.id,
            "status": g.status_raw,
            "ends_at": g.ends_at.to_string(),
            "is_trial": g.is_trial,
        })),
        "credential": credential_json,
        "referral_earnings": {
            "total_cents": earnings.total_cents,
            "unpaid_cents": earnings.unpaid_cents,
        },
    })))
}

#[derive(Deserialize)]
struct CreatePaymentRequest {
    external_id: i64,
    plan_id: i64,
    /// Optional rail selection; omitted means full fallback order.
    provider: Option<String>,
}

async fn create_payment(
    State(state): State<AppState>,
    Json(req): Json<CreatePaymentRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let account = state
        .core
        .accounts
        .by_external_id(req.external_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("account for principal {}", req.external_id)))?;
    let plan = state.core.subscriptions.plan(req.plan_id).await?;

    let preferred = match req.provider.as_deref() {
        Some(p) => Some(ProviderKind::parse(p)?),
        None => None,
    };

    let (payment, handle) = state
        .core
        .payments
        .create_payment(
            &account,
            plan.price_cents,
            &format!("{} ({} days)", plan.name, plan.duration_days),
            Some(plan.id),
            preferred,
        )
        .await?;

    Ok(Json(json!({
        "payment_id": payment.id,
        "provider": handle.provider.as_str(),
        "amount_cents": payment.amount_cents,
        "instructions": handle.payload,
    })))
}

/// Read-only payment view. For a pending payment the provider is polled for
/// its raw settlement state, without triggering any settlement effects.
async fn payment_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let payment = state.core.payments.get(id).await?;
    let provider_state = match payment.status()? {
        PaymentStatus::Pending => match state.core.payments.provider_status(&payment).await {
            Ok(VerifyOutcome::Confirmed { tx_ref }) => json!({
                "settled": true,
                "tx_ref": tx_ref,
            }),
            Ok(VerifyOutcome::NotFound) => json!({ "settled": false }),
            Err(e) => {
                tracing::debug!(payment_id = id, error = %e, "Provider status unavailable");
                serde_json::Value::Null
            }
        },
        _ => serde_json::Value::Null,
    };
    Ok(Json(json!({
        "payment_id": payment.id,
        "provider": payment.provider,
        "status": payment.status_raw,
        "amount_cents": payment.amount_cents,
        "grant_id": payment.grant_id,
        "provider_state": provider_state,
    })))
}

async fn verify_payment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state.core.payments.verify_payment(id).await?;
    Ok(Json(outcome_json(&outcome)))
}

fn outcome_json(outcome: &PaymentOutcome) -> serde_json::Value {
    match outcome {
        PaymentOutcome::Confirmed { grant_id } => json!({
            "outcome": "confirmed",
            "grant_id": grant_id,
        }),
        PaymentOutcome::AlreadyCompleted => json!({ "outcome": "already_completed" }),
        PaymentOutcome::NotConfirmed { detail } => json!({
            "outcome": "not_confirmed",
            "detail": detail,
        }),
    }
}

/// Gateway IPN callback. The payload's signature is stored alongside the
/// payment and checked during verification, so a forged callback can be
/// recorded but never settles anything.
async fn gateway_callback(
    State(state): State<AppState>,
    Json(callback): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let order_id = callback
        .get("order_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::Verification("callback has no order_id".to_string()))?;

    let payment = state
        .core
        .payments
        .by_gateway_order(order_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("payment for order {order_id}")))?;

    state
        .core
        .payments
        .record_gateway_callback(payment.id, &callback)
        .await?;
    let outcome = state.core.payments.verify_payment(payment.id).await?;

    tracing::info!(
        payment_id = payment.id,
        order_id = order_id,
        outcome = ?outcome,
        "Gateway callback processed"
    );
    Ok(Json(outcome_json(&outcome)))
}

#[derive(Deserialize)]
struct WalletCallbackRequest {
    external_id: i64,
    charge_id: String,
}

/// Wallet platform charge notification: attach the charge to the most
/// recent pending wallet payment and verify it. The platform authenticates
/// itself with the shared secret in `x-wallet-secret`; without it the
/// callback is rejected before any state is touched.
async fn wallet_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<WalletCallbackRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let provided = headers
        .get("x-wallet-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    state.core.payments.verify_wallet_callback_secret(provided)?;

    let account = state
        .core
        .accounts
        .by_external_id(req.external_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("account for principal {}", req.external_id)))?;

    let payment = state
        .core
        .payments
        .latest_pending(account.id, ProviderKind::WalletBalance)
        .await?
        .ok_or_else(|| {
            CoreError::NotFound(format!("pending wallet payment for account {}", account.id))
        })?;

    state
        .core
        .payments
        .record_wallet_charge(payment.id, &req.charge_id)
        .await?;
    let outcome = state.core.payments.verify_payment(payment.id).await?;
    Ok(Json(outcome_json(&outcome)))
}

#[derive(Deserialize)]
struct ExtendRequest {
    days: i64,
}

async fn admin_extend(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<ExtendRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    let grant = state.core.admin.extend_grant(id, req.days).await?;
    Ok(Json(json!({
        "grant_id": grant.id,
        "ends_at": grant.ends_at.to_string(),
    })))
}

#[derive(Deserialize)]
struct TrialRequest {
    days: Option<i64>,
}

async fn admin_trial(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    body: Option<Json<TrialRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    let days = body.and_then(|Json(req)| req.days);
    let grant = state.core.admin.grant_trial(id, days).await?;
    Ok(Json(json!({
        "grant_id": grant.id,
        "status": grant.status_raw,
        "ends_at": grant.ends_at.to_string(),
    })))
}

#[derive(Deserialize)]
struct RegionRequest {
    region: String,
}

async fn admin_region(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<RegionRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    state.core.admin.change_region(id, &req.region).await?;
    Ok(Json(json!({ "region": req.region })))
}

async fn admin_rotate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    let credential = state.core.admin.rotate_credentials(id).await?;
    Ok(Json(json!({
        "credential_id": credential.id,
        "region": credential.region,
    })))
}

async fn admin_referrals(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    let rows = state.core.accounts.referral_rows(id).await?;
    let referrals: Vec<_> = rows
        .into_iter()
        .map(|r| {
            json!({
                "referred_id": r.referred_id,
                "unpaid_cents": r.amount_cents,
                "total_earned_cents": r.total_earned_cents,
                "last_paid_at": r.last_paid_at.map(|t| t.to_string()),
            })
        })
        .collect();
    Ok(Json(json!({ "referrals": referrals })))
}

async fn admin_list_payouts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    let payouts = state.core.admin.pending_payouts().await?;
    let payouts: Vec<_> = payouts
        .into_iter()
        .map(|p| {
            json!({
                "id": p.id,
                "account_id": p.account_id,
                "amount_cents": p.amount_cents,
                "created_at": p.created_at.to_string(),
            })
        })
        .collect();
    Ok(Json(json!({ "payouts": payouts })))
}

#[derive(Deserialize)]
struct PayoutRequest {
    account_id: i64,
}

async fn admin_request_payout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PayoutRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    match state.core.admin.request_payout(req.account_id).await? {
        Some(payout) => Ok(Json(json!({
            "payout_id": payout.id,
            "amount_cents": payout.amount_cents,
        }))),
        None => Ok(Json(json!({ "payout_id": null, "amount_cents": 0 }))),
    }
}

#[derive(Deserialize)]
struct CompletePayoutRequest {
    notes: Option<String>,
}

async fn admin_complete_payout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<CompletePayoutRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    let payout = state
        .core
        .admin
        .mark_payout_completed(id, req.notes.as_deref())
        .await?;
    Ok(Json(json!({
        "payout_id": payout.id,
        "status": payout.status_raw,
    })))
}

#[derive(Deserialize)]
struct InvariantQuery {
    check: Option<String>,
}

async fn admin_invariants(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<InvariantQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    match query.check {
        Some(name) => {
            let violations = state.core.invariants.run_check(&name).await?;
            Ok(Json(json!({ "check": name, "violations": violations })))
        }
        None => {
            let summary = state.core.invariants.run_all_checks().await?;
            Ok(Json(serde_json::to_value(&summary).unwrap_or_default()))
        }
    }
}

async fn admin_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    let active_credentials = state.core.credentials.active_count(None).await?;
    let by_region = state.core.credentials.region_breakdown().await?;
    let by_region: Vec<_> = by_region
        .into_iter()
        .map(|(region, count)| json!({ "region": region, "active": count }))
        .collect();
    Ok(Json(json!({
        "active_credentials": active_credentials,
        "regions": by_region,
    })))
}

#[derive(Deserialize)]
struct AuditQuery {
    limit: Option<i64>,
    account_id: Option<i64>,
}

async fn admin_audit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(&state, &headers)?;
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let entries = match query.account_id {
        Some(account_id) => {
            state
                .core
                .audit
                .recent_for_account(account_id, limit)
                .await?
        }
        None => state.core.audit.recent(limit).await?,
    };
    let entries: Vec<_> = entries
        .into_iter()
        .map(|e| {
            json!({
                "id": e.id,
                "kind": e.kind,
                "account_id": e.account_id,
                "outcome": e.outcome,
                "detail": e.detail,
                "created_at": e.created_at.to_string(),
            })
        })
        .collect();
    Ok(Json(json!({ "entries": entries })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serialization() {
        let confirmed = outcome_json(&PaymentOutcome::Confirmed { grant_id: Some(9) });
        assert_eq!(confirmed["outcome"], "confirmed");
        assert_eq!(confirmed["grant_id"], 9);

        let pending = outcome_json(&PaymentOutcome::NotConfirmed {
            detail: "waiting".to_string(),
        });
        assert_eq!(pending["outcome"], "not_confirmed");
    }
}

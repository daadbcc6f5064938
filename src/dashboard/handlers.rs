use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use std::sync::Arc;

use super::types::*;
use super::AppState;
use crate::config::{clamp_interval, SETTING_REFRESH_INTERVAL};
use crate::device_flow::{DeviceStart, PollStatus};
use crate::models::{Account, AccountKind, AccountType, CopilotPlan, NewAccount, Period};
use crate::providers::Verification;
use crate::scheduler::{self, RefreshReport};
use crate::store::Store;

type ApiResult<T> = Result<T, ApiError>;

fn account_view(store: &Store, account: Account, period: Period) -> anyhow::Result<AccountView> {
    let usage = match store.usage_for(account.id, period)? {
        Some(history) => {
            let details = store.details_for(history.id)?;
            Some(UsageView { history, details })
        }
        None => None,
    };
    Ok(AccountView::new(account, usage))
}

fn load_account(store: &Store, id: i64) -> ApiResult<Account> {
    store.get_account(id)?.ok_or_else(|| ApiError::not_found(id))
}

/// Empty or whitespace-only input means "clear".
fn non_empty(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|v| !v.is_empty())
}

fn parse_copilot_plan(plan: &str) -> ApiResult<CopilotPlan> {
    CopilotPlan::parse(plan).ok_or_else(|| ApiError::bad_request(format!("unknown plan: {plan}")))
}

/// Refresh a newly stored credential without holding up the response.
fn spawn_refresh(state: &AppState, id: i64) {
    let reconciler = Arc::clone(&state.reconciler);
    tokio::spawn(async move {
        if let Err(e) = reconciler.refresh_account(id).await {
            tracing::warn!(account_id = id, error = %e, "initial refresh failed");
        }
    });
}

pub async fn list_accounts(State(state): State<AppState>) -> ApiResult<Json<Vec<AccountView>>> {
    let store = state.reconciler.store();
    let period = Period::containing(Utc::now());
    let views = store
        .list_accounts()?
        .into_iter()
        .map(|account| account_view(store, account, period))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Json(views))
}

pub async fn create_account(
    State(state): State<AppState>,
    Json(req): Json<CreateAccountRequest>,
) -> ApiResult<(StatusCode, Json<AccountView>)> {
    let username = req.username.trim().to_string();
    if username.is_empty() {
        return Err(ApiError::bad_request("username is required"));
    }
    let token = req.token.trim().to_string();
    let refresh_token = req.refresh_token.as_deref().unwrap_or("").trim().to_string();
    if token.is_empty() && refresh_token.is_empty() {
        return Err(ApiError::bad_request("token is required"));
    }

    let reconciler = &state.reconciler;
    if reconciler.store().find_account(&username)?.is_some() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("account {username} already exists"),
        ));
    }

    let (mut detected_plan, mut detected_name) = (None, None);
    if req.verify && !token.is_empty() {
        let check = reconciler
            .verify_credential(req.account_type, &token, &username)
            .await;
        if !check.valid {
            let message = check
                .error
                .unwrap_or_else(|| "credential verification failed".to_string());
            return Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, message));
        }
        detected_plan = check.plan;
        detected_name = check.display_name;
    }

    let plan = req
        .plan
        .as_deref()
        .and_then(non_empty)
        .map(String::from)
        .or(detected_plan);
    let kind = match req.account_type {
        AccountType::Copilot => AccountKind::Copilot {
            pat_token: token,
            plan: plan.as_deref().map(parse_copilot_plan).transpose()?,
            billing_org: req.billing_org.as_deref().and_then(non_empty).map(String::from),
        },
        AccountType::ClaudeCode => AccountKind::ClaudeCode {
            admin_key: token,
            plan,
        },
        AccountType::ClaudeWeb => AccountKind::ClaudeWeb {
            oauth_token: token,
            refresh_token,
            expires_at: req.expires_at,
            plan,
        },
    };
    let id = reconciler.add_account(NewAccount {
        username,
        display_name: req
            .display_name
            .as_deref()
            .and_then(non_empty)
            .map(String::from)
            .or(detected_name),
        kind,
    })?;
    tracing::info!(account_id = id, account_type = %req.account_type, "account added");
    spawn_refresh(&state, id);

    let account = load_account(reconciler.store(), id)?;
    Ok((StatusCode::CREATED, Json(AccountView::new(account, None))))
}

pub async fn update_account(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateAccountRequest>,
) -> ApiResult<Json<AccountView>> {
    let reconciler = &state.reconciler;
    let store = reconciler.store();
    let account = load_account(store, id)?;

    if let Some(name) = &req.display_name {
        store.set_display_name(id, non_empty(name))?;
    }
    if let Some(paused) = req.is_paused {
        store.set_paused(id, paused)?;
    }
    if let Some(favorite) = req.is_favorite {
        store.set_favorite(id, favorite)?;
    }
    if let Some(plan) = &req.plan {
        match (account.account_type(), non_empty(plan)) {
            (AccountType::Copilot, Some(p)) => {
                store.set_plan(id, Some(parse_copilot_plan(p)?.as_str()))?
            }
            (_, p) => store.set_plan(id, p)?,
        }
    }
    if let Some(org) = &req.billing_org {
        if account.account_type() != AccountType::Copilot {
            return Err(ApiError::bad_request("billing_org applies to copilot accounts"));
        }
        store.set_billing_org(id, non_empty(org))?;
    }

    let token = req.token.as_deref().and_then(non_empty);
    let refresh_token = req.refresh_token.as_deref().and_then(non_empty);
    match (&account.kind, token, refresh_token) {
        (_, None, None) => {}
        (
            AccountKind::ClaudeWeb {
                oauth_token,
                refresh_token: current_refresh,
                ..
            },
            access,
            refresh,
        ) => {
            let vault = reconciler.vault();
            let access = match access {
                Some(a) => vault.encrypt(a)?,
                None => oauth_token.clone(),
            };
            let refresh = match refresh {
                Some(r) => vault.encrypt(r)?,
                None => current_refresh.clone(),
            };
            store.update_oauth_tokens(id, &access, &refresh, None)?;
        }
        (_, Some(token), _) => reconciler.replace_credential(id, token)?,
        (_, None, Some(_)) => {
            return Err(ApiError::bad_request(
                "refresh_token applies to claude_web accounts",
            ))
        }
    }
    if token.is_some() || refresh_token.is_some() {
        tracing::info!(account_id = id, "credential replaced");
        spawn_refresh(&state, id);
    }

    let account = load_account(store, id)?;
    Ok(Json(account_view(store, account, Period::containing(Utc::now()))?))
}

pub async fn delete_account(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    if state.reconciler.delete_account(id)? {
        tracing::info!(account_id = id, "account removed");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(id))
    }
}

pub async fn refresh_account(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<RefreshResponse>> {
    let outcome = state.reconciler.refresh_account(id).await?;
    Ok(Json(RefreshResponse {
        account_id: outcome.account_id,
        period: outcome.period,
        history_id: outcome.history_id,
        usage: outcome.usage,
    }))
}

pub async fn refresh_all(State(state): State<AppState>) -> Json<RefreshReport> {
    Json(scheduler::refresh_all(&state.reconciler).await)
}

pub async fn verify(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> Json<Verification> {
    Json(
        state
            .reconciler
            .verify_credential(req.account_type, &req.token, req.identity.trim())
            .await,
    )
}

pub async fn set_refresh_interval(
    State(state): State<AppState>,
    Json(body): Json<RefreshIntervalBody>,
) -> ApiResult<Json<RefreshIntervalBody>> {
    let minutes = clamp_interval(body.minutes);
    state
        .reconciler
        .store()
        .set_setting(SETTING_REFRESH_INTERVAL, &minutes.to_string())?;
    let minutes = state.scheduler.start_auto_refresh(minutes);
    Ok(Json(RefreshIntervalBody { minutes }))
}

pub async fn device_start(State(state): State<AppState>) -> ApiResult<Json<DeviceStart>> {
    Ok(Json(state.device_flow.start().await?))
}

pub async fn device_poll(
    State(state): State<AppState>,
    Json(req): Json<DevicePollRequest>,
) -> ApiResult<Json<DevicePollResponse>> {
    let status = state.device_flow.poll(&req.session_id).await?;
    let token = match status {
        PollStatus::Complete(token) => token,
        PollStatus::SlowDown { interval } => {
            return Ok(Json(DevicePollResponse {
                status: "slow_down",
                interval: Some(interval),
                account_id: None,
            }))
        }
        other => {
            let status = match other {
                PollStatus::Pending => "pending",
                PollStatus::Denied => "denied",
                _ => "expired",
            };
            return Ok(Json(DevicePollResponse {
                status,
                interval: None,
                account_id: None,
            }));
        }
    };

    let reconciler = &state.reconciler;
    let store = reconciler.store();
    let id = match req.account_id {
        Some(id) => {
            let account = load_account(store, id)?;
            if account.account_type() != AccountType::Copilot {
                return Err(ApiError::bad_request("device flow tokens are for copilot accounts"));
            }
            reconciler.replace_credential(id, &token)?;
            id
        }
        None => {
            let user = reconciler
                .providers()
                .copilot
                .user(&token)
                .await
                .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()))?;
            match store.find_account(&user.login)? {
                Some(existing) if existing.account_type() == AccountType::Copilot => {
                    reconciler.replace_credential(existing.id, &token)?;
                    existing.id
                }
                Some(_) => {
                    return Err(ApiError::new(
                        StatusCode::CONFLICT,
                        format!("{} is already used by another account type", user.login),
                    ))
                }
                None => reconciler.add_account(NewAccount {
                    username: user.login.clone(),
                    display_name: user.name.clone(),
                    kind: AccountKind::Copilot {
                        pat_token: token.as_str().to_string(),
                        plan: None,
                        billing_org: None,
                    },
                })?,
            }
        }
    };
    tracing::info!(account_id = id, "device flow token stored");
    spawn_refresh(&state, id);

    Ok(Json(DevicePollResponse {
        status: "complete",
        interval: None,
        account_id: Some(id),
    }))
}

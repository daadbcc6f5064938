//! Per-account usage reconciliation: resolve a working billing source,
//! keep OAuth tokens current, and upsert the month's usage.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

use crate::config::Settings;
use crate::crypto::Vault;
use crate::models::{
    Account, AccountKind, AccountType, CopilotPlan, NewAccount, Period, Profile, UsageSnapshot,
};
use crate::providers::claude_admin::{self, AnthropicAdminClient, ClaudeAdminApi};
use crate::providers::claude_web::{self, AnthropicOAuthClient, ClaudeWebApi};
use crate::providers::copilot::{
    self, BillingSource, CopilotApi, CopilotUsage, GithubClient, SeatInfo, SourceOutcome,
};
use crate::providers::{http_client, ProviderError, Verification};
use crate::store::Store;
use crate::token::{self, AnthropicTokenRefresher, TokenError, TokenRefresher};

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("account {0} not found")]
    NotFound(i64),
    #[error("no credential stored")]
    NoCredential,
    #[error("credential rejected: {0}")]
    CredentialInvalid(String),
    #[error("billing data not accessible with this credential: {0}")]
    BillingInaccessible(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("re-authentication required: {0}")]
    ReauthRequired(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<ProviderError> for RefreshError {
    fn from(e: ProviderError) -> Self {
        if e.is_unauthorized() {
            RefreshError::CredentialInvalid(e.to_string())
        } else if e.is_no_access() {
            RefreshError::BillingInaccessible(e.to_string())
        } else {
            RefreshError::Unavailable(e.to_string())
        }
    }
}

impl From<TokenError> for RefreshError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::InvalidGrant | TokenError::MissingRefreshToken => {
                RefreshError::ReauthRequired(e.to_string())
            }
            TokenError::Provider(p) => p.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub account_id: i64,
    pub period: Period,
    pub history_id: i64,
    pub usage: UsageSnapshot,
}

/// The provider APIs a [`Reconciler`] talks to.
#[derive(Clone)]
pub struct Providers {
    pub copilot: Arc<dyn CopilotApi>,
    pub claude_admin: Arc<dyn ClaudeAdminApi>,
    pub claude_web: Arc<dyn ClaudeWebApi>,
    pub tokens: Arc<dyn TokenRefresher>,
}

impl Providers {
    pub fn http(settings: &Settings) -> reqwest::Result<Self> {
        let client = http_client(settings.http_timeout)?;
        Ok(Self {
            copilot: Arc::new(GithubClient::new(
                client.clone(),
                settings.github_api_base.as_str(),
            )),
            claude_admin: Arc::new(AnthropicAdminClient::new(
                client.clone(),
                settings.anthropic_api_base.as_str(),
            )),
            claude_web: Arc::new(AnthropicOAuthClient::new(
                client.clone(),
                settings.anthropic_api_base.as_str(),
            )),
            tokens: Arc::new(AnthropicTokenRefresher::new(
                client,
                settings.anthropic_token_url.as_str(),
                settings.oauth_client_id.as_str(),
            )),
        })
    }
}

pub struct Reconciler {
    store: Arc<Store>,
    vault: Arc<Vault>,
    providers: Providers,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(store: Arc<Store>, vault: Arc<Vault>, providers: Providers) -> Self {
        Self {
            store,
            vault,
            providers,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    /// Encrypt the plaintext secrets of `account` and insert it.
    pub fn add_account(&self, account: NewAccount) -> anyhow::Result<i64> {
        let kind = match account.kind {
            AccountKind::Copilot {
                pat_token,
                plan,
                billing_org,
            } => AccountKind::Copilot {
                pat_token: self.vault.encrypt(&pat_token)?,
                plan,
                billing_org,
            },
            AccountKind::ClaudeCode { admin_key, plan } => AccountKind::ClaudeCode {
                admin_key: self.vault.encrypt(&admin_key)?,
                plan,
            },
            AccountKind::ClaudeWeb {
                oauth_token,
                refresh_token,
                expires_at,
                plan,
            } => AccountKind::ClaudeWeb {
                oauth_token: self.vault.encrypt(&oauth_token)?,
                refresh_token: self.vault.encrypt(&refresh_token)?,
                expires_at,
                plan,
            },
        };
        self.store.insert_account(&NewAccount { kind, ..account })
    }

    /// Replace the primary credential (PAT or admin key) of an account.
    pub fn replace_credential(&self, id: i64, plaintext: &str) -> anyhow::Result<()> {
        let sealed = self.vault.encrypt(plaintext)?;
        self.store.set_credential(id, &sealed)
    }

    pub fn delete_account(&self, id: i64) -> anyhow::Result<bool> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.store.delete_account(id)
    }

    fn account_lock(&self, id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id)
            .or_default()
            .clone()
    }

    pub async fn refresh_account(&self, id: i64) -> Result<RefreshOutcome, RefreshError> {
        self.refresh_at(id, Utc::now()).await
    }

    /// Refresh one account as of `now`. Refreshes of the same account are
    /// serialized; the outcome is recorded in the account's `last_error`.
    pub async fn refresh_at(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<RefreshOutcome, RefreshError> {
        let lock = self.account_lock(id);
        let _guard = lock.lock().await;

        let account = self.store.get_account(id)?.ok_or(RefreshError::NotFound(id))?;
        let result = match &account.kind {
            AccountKind::Copilot {
                pat_token,
                plan,
                billing_org,
            } => {
                self.reconcile_copilot(&account, pat_token, *plan, billing_org.as_deref(), now)
                    .await
            }
            AccountKind::ClaudeCode { admin_key, .. } => {
                self.reconcile_claude_code(&account, admin_key, now).await
            }
            AccountKind::ClaudeWeb {
                oauth_token,
                refresh_token,
                expires_at,
                ..
            } => {
                self.reconcile_claude_web(&account, oauth_token, refresh_token, *expires_at, now)
                    .await
            }
        };

        match &result {
            Ok(outcome) => {
                tracing::info!(
                    account = %account.username,
                    period = %outcome.period,
                    source = outcome.usage.source.as_deref().unwrap_or("-"),
                    "usage refreshed"
                );
                self.store.set_last_error(id, None)?;
            }
            Err(e) => {
                tracing::warn!(account = %account.username, error = %e, "refresh failed");
                if let Err(store_err) = self.store.set_last_error(id, Some(&e.to_string())) {
                    tracing::warn!(
                        account = %account.username,
                        error = %store_err,
                        "could not record refresh error"
                    );
                }
            }
        }
        result
    }

    async fn reconcile_copilot(
        &self,
        account: &Account,
        pat_ciphertext: &str,
        plan: Option<CopilotPlan>,
        billing_org: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RefreshOutcome, RefreshError> {
        let token = self.open_secret(pat_ciphertext)?;
        let api = self.providers.copilot.as_ref();
        let user = api.user(&token).await.map_err(|e| {
            if e.is_unauthorized() {
                RefreshError::CredentialInvalid(e.to_string())
            } else {
                RefreshError::Unavailable(e.to_string())
            }
        })?;
        let period = Period::containing(now);
        let mut probe = Probe::new(api, &token, &user.login, period);

        let mut hit = None;
        if let Some(org) = billing_org {
            hit = probe.first_nonzero(&BillingSource::org_chain(org)).await;
        }
        if hit.is_none() {
            hit = probe
                .first_nonzero(&[BillingSource::UserPremium, BillingSource::UserBilling])
                .await;
        }

        let mut scanned_orgs = None;
        let org_plan = plan.is_some_and(|p| p.is_org_plan());
        if hit.is_none() && (org_plan || billing_org.is_some() || !probe.personal_answered) {
            match api.orgs(&token).await {
                Ok(orgs) => {
                    for org in orgs.iter().filter(|o| Some(o.as_str()) != billing_org) {
                        hit = probe.first_nonzero(&BillingSource::org_chain(org)).await;
                        if hit.is_some() {
                            break;
                        }
                    }
                    scanned_orgs = Some(orgs);
                }
                Err(e) => probe.failures.push(e.to_string()),
            }
        }

        // A zero row is stored only when every source that answered said zero
        // and none failed transiently; otherwise the last known row stays.
        let (source, usage, discovered) = match hit {
            Some((source, usage)) => (source, usage, true),
            None if !probe.failures.is_empty() => {
                return Err(RefreshError::Unavailable(probe.failures.join("; ")));
            }
            None => match probe.first_zero.take() {
                Some((source, usage)) => (source, usage, false),
                None => {
                    return Err(RefreshError::BillingInaccessible(format!(
                        "none of {} billing sources are readable",
                        probe.no_access
                    )));
                }
            },
        };

        if discovered {
            if let Some(org) = source.org().filter(|o| Some(*o) != billing_org) {
                tracing::info!(account = %account.username, org, "discovered billing organization");
                self.store.set_billing_org(account.id, Some(org))?;
            }
        }

        let seat = match source.org().or(billing_org) {
            Some(org) => api.seat(&token, org, &user.login).await.unwrap_or_else(|e| {
                tracing::debug!(org, error = %e, "copilot seat lookup failed");
                None
            }),
            None => None,
        };
        let plan = match plan {
            Some(p) => p,
            None => match copilot::detect_plan(usage.included_quantity, seat.as_ref()) {
                Some(detected) => {
                    tracing::info!(
                        account = %account.username,
                        plan = detected.as_str(),
                        "detected copilot plan"
                    );
                    self.store.set_plan(account.id, Some(detected.as_str()))?;
                    detected
                }
                None => CopilotPlan::default(),
            },
        };

        self.store.set_profile(
            account.id,
            &merge_profile(&account.profile, user.avatar_url, scanned_orgs, seat),
        )?;

        let (snapshot, details) = usage.to_usage(plan, Some(source.label()));
        let history_id = self
            .store
            .upsert_usage(account.id, period, &snapshot, &details, now)?;
        Ok(RefreshOutcome {
            account_id: account.id,
            period,
            history_id,
            usage: snapshot,
        })
    }

    async fn reconcile_claude_code(
        &self,
        account: &Account,
        key_ciphertext: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshOutcome, RefreshError> {
        let key = self.open_secret(key_ciphertext)?;
        let period = Period::containing(now);
        let usage = claude_admin::fetch_month(
            self.providers.claude_admin.as_ref(),
            &key,
            &account.username,
            period,
            now.date_naive(),
        )
        .await?;
        let (snapshot, details) = usage.to_usage();
        let history_id = self
            .store
            .upsert_usage(account.id, period, &snapshot, &details, now)?;
        Ok(RefreshOutcome {
            account_id: account.id,
            period,
            history_id,
            usage: snapshot,
        })
    }

    async fn reconcile_claude_web(
        &self,
        account: &Account,
        access_ciphertext: &str,
        refresh_ciphertext: &str,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<RefreshOutcome, RefreshError> {
        let access = self.vault.decrypt_secret(access_ciphertext);
        let refresh = self.vault.decrypt_secret(refresh_ciphertext);
        if access.is_empty() && refresh.is_empty() {
            return Err(RefreshError::NoCredential);
        }

        let valid = token::get_valid_token(
            self.providers.tokens.as_ref(),
            &access,
            &refresh,
            expires_at,
            now,
        )
        .await?;
        let valid_access = Zeroizing::new(valid.access_token);
        if valid.refreshed {
            // Persist the rotated pair before it is used.
            let sealed_access = self.vault.encrypt(&valid_access)?;
            let sealed_refresh = self.vault.encrypt(&valid.refresh_token)?;
            self.store.update_oauth_tokens(
                account.id,
                &sealed_access,
                &sealed_refresh,
                valid.expires_at,
            )?;
            tracing::info!(account = %account.username, "rotated oauth tokens");
        }

        let usage = self
            .providers
            .claude_web
            .usage(&valid_access)
            .await
            .map_err(|e| {
                if e.is_unauthorized() {
                    RefreshError::ReauthRequired(e.to_string())
                } else {
                    e.into()
                }
            })?;
        let period = Period::containing(now);
        let snapshot = usage.to_usage();
        let history_id = self
            .store
            .upsert_usage(account.id, period, &snapshot, &[], now)?;
        Ok(RefreshOutcome {
            account_id: account.id,
            period,
            history_id,
            usage: snapshot,
        })
    }

    /// Decrypt a stored secret; an undecryptable secret counts as absent.
    fn open_secret(&self, ciphertext: &str) -> Result<Zeroizing<String>, RefreshError> {
        let secret = self.vault.decrypt_secret(ciphertext);
        if secret.is_empty() {
            return Err(RefreshError::NoCredential);
        }
        Ok(secret)
    }

    /// Check a plaintext credential before it is stored.
    pub async fn verify_credential(
        &self,
        account_type: AccountType,
        secret: &str,
        identity: &str,
    ) -> Verification {
        let secret = secret.trim();
        if secret.is_empty() {
            return Verification::invalid("credential is empty");
        }
        let now = Utc::now();
        match account_type {
            AccountType::Copilot => {
                copilot::verify(
                    self.providers.copilot.as_ref(),
                    secret,
                    identity,
                    Period::containing(now),
                )
                .await
            }
            AccountType::ClaudeCode => {
                claude_admin::verify(
                    self.providers.claude_admin.as_ref(),
                    secret,
                    now.date_naive(),
                )
                .await
            }
            AccountType::ClaudeWeb => {
                claude_web::verify(self.providers.claude_web.as_ref(), secret, identity).await
            }
        }
    }
}

fn merge_profile(
    current: &Profile,
    avatar_url: Option<String>,
    orgs: Option<Vec<String>>,
    seat: Option<SeatInfo>,
) -> Profile {
    Profile {
        avatar_url: avatar_url.or_else(|| current.avatar_url.clone()),
        orgs: orgs.unwrap_or_else(|| current.orgs.clone()),
        last_activity: seat
            .and_then(|s| s.last_activity_at)
            .or_else(|| current.last_activity.clone()),
    }
}

/// Walks Copilot billing sources and remembers what each one said.
struct Probe<'a> {
    api: &'a dyn CopilotApi,
    token: &'a str,
    login: &'a str,
    period: Period,
    /// First source that answered with zero usage.
    first_zero: Option<(BillingSource, CopilotUsage)>,
    personal_answered: bool,
    no_access: usize,
    failures: Vec<String>,
}

impl<'a> Probe<'a> {
    fn new(api: &'a dyn CopilotApi, token: &'a str, login: &'a str, period: Period) -> Self {
        Self {
            api,
            token,
            login,
            period,
            first_zero: None,
            personal_answered: false,
            no_access: 0,
            failures: Vec::new(),
        }
    }

    async fn first_nonzero(
        &mut self,
        sources: &[BillingSource],
    ) -> Option<(BillingSource, CopilotUsage)> {
        for source in sources {
            let outcome = self
                .api
                .usage(self.token, self.login, source, self.period)
                .await;
            match outcome {
                SourceOutcome::Data(usage) if usage.gross_quantity > 0.0 => {
                    return Some((source.clone(), usage));
                }
                SourceOutcome::Data(usage) => {
                    tracing::debug!(source = %source.label(), "billing source reports zero usage");
                    if source.org().is_none() {
                        self.personal_answered = true;
                    }
                    self.first_zero.get_or_insert((source.clone(), usage));
                }
                SourceOutcome::NoAccess(reason) => {
                    tracing::debug!(
                        source = %source.label(),
                        %reason,
                        "billing source not accessible"
                    );
                    self.no_access += 1;
                }
                SourceOutcome::Unavailable(reason) => {
                    tracing::warn!(source = %source.label(), %reason, "billing source unavailable");
                    self.failures.push(format!("{}: {reason}", source.label()));
                }
            }
        }
        None
    }
}

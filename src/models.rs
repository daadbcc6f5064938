use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Copilot,
    ClaudeCode,
    ClaudeWeb,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Copilot => "copilot",
            AccountType::ClaudeCode => "claude_code",
            AccountType::ClaudeWeb => "claude_web",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "copilot" => Some(AccountType::Copilot),
            "claude_code" | "claude-code" => Some(AccountType::ClaudeCode),
            "claude_web" | "claude-web" => Some(AccountType::ClaudeWeb),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GitHub Copilot plan tiers and their monthly premium-request allowance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CopilotPlan {
    Free,
    #[default]
    Pro,
    ProPlus,
    Business,
    Enterprise,
}

impl CopilotPlan {
    pub fn monthly_limit(&self) -> f64 {
        match self {
            CopilotPlan::Free => 50.0,
            CopilotPlan::Pro => 300.0,
            CopilotPlan::ProPlus => 1500.0,
            CopilotPlan::Business => 300.0,
            CopilotPlan::Enterprise => 1000.0,
        }
    }

    /// Business and Enterprise seats are billed through an organization.
    pub fn is_org_plan(&self) -> bool {
        matches!(self, CopilotPlan::Business | CopilotPlan::Enterprise)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CopilotPlan::Free => "free",
            CopilotPlan::Pro => "pro",
            CopilotPlan::ProPlus => "pro_plus",
            CopilotPlan::Business => "business",
            CopilotPlan::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "free" => Some(CopilotPlan::Free),
            "pro" | "individual" => Some(CopilotPlan::Pro),
            "pro_plus" | "proplus" | "pro+" => Some(CopilotPlan::ProPlus),
            "business" => Some(CopilotPlan::Business),
            "enterprise" => Some(CopilotPlan::Enterprise),
            _ => None,
        }
    }
}

/// Type-specific credential fields. Every secret holds vault ciphertext,
/// never plaintext.
#[derive(Debug, Clone, PartialEq)]
pub enum AccountKind {
    Copilot {
        pat_token: String,
        plan: Option<CopilotPlan>,
        billing_org: Option<String>,
    },
    ClaudeCode {
        admin_key: String,
        plan: Option<String>,
    },
    ClaudeWeb {
        oauth_token: String,
        refresh_token: String,
        expires_at: Option<DateTime<Utc>>,
        plan: Option<String>,
    },
}

impl AccountKind {
    pub fn account_type(&self) -> AccountType {
        match self {
            AccountKind::Copilot { .. } => AccountType::Copilot,
            AccountKind::ClaudeCode { .. } => AccountType::ClaudeCode,
            AccountKind::ClaudeWeb { .. } => AccountType::ClaudeWeb,
        }
    }

    pub fn plan_label(&self) -> Option<String> {
        match self {
            AccountKind::Copilot { plan, .. } => plan.map(|p| p.as_str().to_string()),
            AccountKind::ClaudeCode { plan, .. } | AccountKind::ClaudeWeb { plan, .. } => {
                plan.clone()
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub orgs: Vec<String>,
    pub last_activity: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub display_name: Option<String>,
    pub is_paused: bool,
    pub is_favorite: bool,
    pub profile: Profile,
    /// Message of the last failed refresh, cleared on success.
    pub last_error: Option<String>,
    pub created_at: String,
    pub kind: AccountKind,
}

impl Account {
    pub fn account_type(&self) -> AccountType {
        self.kind.account_type()
    }
}

/// Plaintext input for creating an account. Secrets are encrypted by the
/// store caller before they are written.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub display_name: Option<String>,
    pub kind: AccountKind,
}

/// Calendar month a usage row belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    pub fn containing(now: DateTime<Utc>) -> Self {
        Self::new(now.year(), now.month())
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    pub fn days_in_month(&self) -> u32 {
        let (y, m) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        match (self.first_day(), NaiveDate::from_ymd_opt(y, m, 1)) {
            (Some(start), Some(next)) => (next - start).num_days() as u32,
            _ => 0,
        }
    }

    /// Days of this month that have data: up to `today` for the current
    /// month, the whole month for past months, none for future months.
    pub fn days_until(&self, today: NaiveDate) -> Vec<NaiveDate> {
        let Some(start) = self.first_day() else {
            return Vec::new();
        };
        let last = if Period::new(today.year(), today.month()) == *self {
            today.day()
        } else if *self < Period::new(today.year(), today.month()) {
            self.days_in_month()
        } else {
            0
        };
        (0..last)
            .filter_map(|offset| start.checked_add_days(chrono::Days::new(offset as u64)))
            .collect()
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

/// Normalized usage for one account and month, shared by every provider.
/// Fields a provider does not report stay at their zero/`None` default.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UsageSnapshot {
    // ── Copilot premium requests ────────────────────────────────────────────
    pub gross_quantity: f64,
    pub included_quantity: f64,
    pub net_amount: f64,
    pub percentage: f64,
    // ── Claude Code productivity ────────────────────────────────────────────
    pub sessions: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub commits: u64,
    pub pull_requests: u64,
    pub cost_usd: f64,
    // ── Claude subscription windows ─────────────────────────────────────────
    pub session_percent: Option<f64>,
    pub weekly_percent: Option<f64>,
    pub opus_percent: Option<f64>,
    pub session_resets_at: Option<String>,
    pub weekly_resets_at: Option<String>,
    pub extra_usage_limit: Option<f64>,
    pub extra_usage_spent: Option<f64>,
    pub extra_usage_balance: Option<f64>,
    /// Which endpoint produced the data (e.g. `org:acme:premium`).
    pub source: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UsageDetail {
    pub model: String,
    pub quantity: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct UsageHistory {
    pub id: i64,
    pub account_id: i64,
    pub period: Period,
    pub usage: UsageSnapshot,
    pub fetched_at: String,
}

/// Round to one decimal place.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns `~/.tally/<name>`.
pub fn tally_path(name: &str) -> PathBuf {
    home_dir().join(".tally").join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn plan_limits() {
        assert_eq!(CopilotPlan::Free.monthly_limit(), 50.0);
        assert_eq!(CopilotPlan::Pro.monthly_limit(), 300.0);
        assert_eq!(CopilotPlan::ProPlus.monthly_limit(), 1500.0);
        assert!(CopilotPlan::Enterprise.is_org_plan());
        assert!(!CopilotPlan::ProPlus.is_org_plan());
    }

    #[test]
    fn plan_parse_accepts_variants() {
        assert_eq!(CopilotPlan::parse("Pro+"), Some(CopilotPlan::ProPlus));
        assert_eq!(CopilotPlan::parse("pro-plus"), Some(CopilotPlan::ProPlus));
        assert_eq!(CopilotPlan::parse("business"), Some(CopilotPlan::Business));
        assert_eq!(CopilotPlan::parse("team"), None);
    }

    #[test]
    fn account_type_round_trips_names() {
        for t in [
            AccountType::Copilot,
            AccountType::ClaudeCode,
            AccountType::ClaudeWeb,
        ] {
            assert_eq!(AccountType::parse(t.as_str()), Some(t));
        }
        assert_eq!(AccountType::parse("claude-web"), Some(AccountType::ClaudeWeb));
    }

    #[test]
    fn days_until_current_month_stops_at_today() {
        let today = NaiveDate::from_ymd_opt(2026, 2, 10).unwrap();
        let days = Period::new(2026, 2).days_until(today);
        assert_eq!(days.len(), 10);
        assert_eq!(days[0], NaiveDate::from_ymd_opt(2026, 2, 1).unwrap());
        assert_eq!(days[9], today);
    }

    #[test]
    fn days_until_past_month_is_full() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();
        assert_eq!(Period::new(2026, 2).days_until(today).len(), 28);
        assert_eq!(Period::new(2025, 12).days_until(today).len(), 31);
        assert!(Period::new(2026, 4).days_until(today).is_empty());
    }

    #[test]
    fn period_containing_and_display() {
        let now = Utc.with_ymd_and_hms(2026, 7, 31, 23, 0, 0).unwrap();
        let p = Period::containing(now);
        assert_eq!(p, Period::new(2026, 7));
        assert_eq!(p.to_string(), "2026-07");
    }

    #[test]
    fn round1_rounds_half_up() {
        assert_eq!(round1(40.0), 40.0);
        assert_eq!(round1(33.333), 33.3);
        assert_eq!(round1(66.66), 66.7);
    }
}

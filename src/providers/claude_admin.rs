use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::join_all;

use super::{as_f64, as_u64, send_json, ProviderError, Verification};
use crate::models::{Period, UsageDetail, UsageSnapshot};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const REPORT_PATH: &str = "/v1/organizations/usage_report/claude_code";
const PAGE_LIMIT: &str = "1000";
/// Day reports fetched concurrently per batch.
pub const DAY_BATCH: usize = 5;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelTokens {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost_usd: f64,
}

/// One actor's Claude Code activity on one day.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DayRecord {
    pub email: Option<String>,
    pub api_key_name: Option<String>,
    pub sessions: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub commits: u64,
    pub pull_requests: u64,
    pub models: Vec<ModelTokens>,
}

impl DayRecord {
    pub fn from_json(record: &serde_json::Value) -> Self {
        let metrics = &record["core_metrics"];
        let models = record["model_breakdown"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|m| ModelTokens {
                        model: m["model"].as_str().unwrap_or("unknown").to_string(),
                        input_tokens: as_u64(&m["tokens"]["input"]),
                        output_tokens: as_u64(&m["tokens"]["output"]),
                        cache_read_tokens: as_u64(&m["tokens"]["cache_read"]),
                        cache_write_tokens: as_u64(&m["tokens"]["cache_creation"]),
                        cost_usd: as_f64(&m["estimated_cost"]["amount"]).unwrap_or(0.0) / 100.0,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            email: record["actor"]["email_address"].as_str().map(String::from),
            api_key_name: record["actor"]["api_key_name"].as_str().map(String::from),
            sessions: as_u64(&metrics["num_sessions"]),
            lines_added: as_u64(&metrics["lines_of_code"]["added"]),
            lines_removed: as_u64(&metrics["lines_of_code"]["removed"]),
            commits: as_u64(&metrics["commits_by_claude_code"]),
            pull_requests: as_u64(&metrics["pull_requests_by_claude_code"]),
            models,
        }
    }

    /// An empty identity matches every actor in the organization.
    pub fn belongs_to(&self, identity: &str) -> bool {
        let identity = identity.trim();
        identity.is_empty()
            || self
                .email
                .as_deref()
                .is_some_and(|e| e.eq_ignore_ascii_case(identity))
            || self.api_key_name.as_deref() == Some(identity)
    }
}

#[async_trait]
pub trait ClaudeAdminApi: Send + Sync {
    /// Every record for `day`, following pagination to the end.
    async fn day_report(
        &self,
        admin_key: &str,
        day: NaiveDate,
    ) -> Result<Vec<DayRecord>, ProviderError>;
}

pub struct AnthropicAdminClient {
    client: reqwest::Client,
    base: String,
}

impl AnthropicAdminClient {
    pub fn new(client: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ClaudeAdminApi for AnthropicAdminClient {
    async fn day_report(
        &self,
        admin_key: &str,
        day: NaiveDate,
    ) -> Result<Vec<DayRecord>, ProviderError> {
        let starting_at = day.format("%Y-%m-%d").to_string();
        let mut records = Vec::new();
        let mut page: Option<String> = None;
        loop {
            let mut query = vec![("starting_at", starting_at.as_str()), ("limit", PAGE_LIMIT)];
            if let Some(p) = page.as_deref() {
                query.push(("page", p));
            }
            let request = self
                .client
                .get(format!("{}{REPORT_PATH}", self.base))
                .header("x-api-key", admin_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .query(&query);
            let body = send_json(request, REPORT_PATH).await?;
            if let Some(data) = body["data"].as_array() {
                records.extend(data.iter().map(DayRecord::from_json));
            }
            page = match (body["has_more"].as_bool(), body["next_page"].as_str()) {
                (Some(true), Some(next)) if !next.is_empty() => Some(next.to_string()),
                _ => break,
            };
        }
        Ok(records)
    }
}

/// Aggregated Claude Code activity for one identity and month.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaudeCodeUsage {
    pub sessions: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub commits: u64,
    pub pull_requests: u64,
    pub cost_usd: f64,
    pub models: Vec<ModelTokens>,
}

impl ClaudeCodeUsage {
    fn add(&mut self, record: &DayRecord) {
        self.sessions += record.sessions;
        self.lines_added += record.lines_added;
        self.lines_removed += record.lines_removed;
        self.commits += record.commits;
        self.pull_requests += record.pull_requests;
        for m in &record.models {
            self.cost_usd += m.cost_usd;
            match self.models.iter_mut().find(|x| x.model == m.model) {
                Some(x) => {
                    x.input_tokens += m.input_tokens;
                    x.output_tokens += m.output_tokens;
                    x.cache_read_tokens += m.cache_read_tokens;
                    x.cache_write_tokens += m.cache_write_tokens;
                    x.cost_usd += m.cost_usd;
                }
                None => self.models.push(m.clone()),
            }
        }
    }

    pub fn to_usage(&self) -> (UsageSnapshot, Vec<UsageDetail>) {
        let usage = UsageSnapshot {
            sessions: self.sessions,
            lines_added: self.lines_added,
            lines_removed: self.lines_removed,
            commits: self.commits,
            pull_requests: self.pull_requests,
            cost_usd: self.cost_usd,
            source: Some("claude_code_analytics".to_string()),
            ..Default::default()
        };
        let details = self
            .models
            .iter()
            .map(|m| UsageDetail {
                model: m.model.clone(),
                quantity: (m.input_tokens + m.output_tokens) as f64,
                input_tokens: m.input_tokens,
                output_tokens: m.output_tokens,
                cache_read_tokens: m.cache_read_tokens,
                cache_write_tokens: m.cache_write_tokens,
                cost_usd: m.cost_usd,
            })
            .collect();
        (usage, details)
    }
}

/// Sum every day of `period` up to `today`, [`DAY_BATCH`] days at a time.
///
/// A failed day contributes nothing. Only when every day fails is the first
/// error returned.
pub async fn fetch_month(
    api: &dyn ClaudeAdminApi,
    admin_key: &str,
    identity: &str,
    period: Period,
    today: NaiveDate,
) -> Result<ClaudeCodeUsage, ProviderError> {
    let days = period.days_until(today);
    let mut usage = ClaudeCodeUsage::default();
    let mut first_error = None;
    let mut succeeded = 0usize;

    for batch in days.chunks(DAY_BATCH) {
        let results = join_all(batch.iter().map(|day| api.day_report(admin_key, *day))).await;
        for (day, result) in batch.iter().zip(results) {
            match result {
                Ok(records) => {
                    succeeded += 1;
                    records
                        .iter()
                        .filter(|r| r.belongs_to(identity))
                        .for_each(|r| usage.add(r));
                }
                Err(e) => {
                    tracing::warn!(%day, error = %e, "claude code report unavailable for day");
                    first_error.get_or_insert(e);
                }
            }
        }
    }

    match first_error {
        Some(e) if succeeded == 0 => Err(e),
        _ => {
            usage
                .models
                .sort_by(|a, b| b.cost_usd.total_cmp(&a.cost_usd));
            Ok(usage)
        }
    }
}

pub async fn verify(api: &dyn ClaudeAdminApi, admin_key: &str, today: NaiveDate) -> Verification {
    match api.day_report(admin_key, today).await {
        Ok(_) => Verification::ok("claude_code_analytics"),
        Err(e) if e.is_unauthorized() => Verification::invalid("Anthropic rejected the admin key"),
        Err(e) if e.is_no_access() => {
            Verification::invalid("admin key cannot read Claude Code analytics")
        }
        Err(e) => Verification::invalid(e.to_string()),
    }
}

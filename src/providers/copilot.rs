use async_trait::async_trait;
use serde::Serialize;

use super::{as_f64, send_json, ProviderError, Verification};
use crate::models::{round1, CopilotPlan, Period, UsageDetail, UsageSnapshot};

const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const GITHUB_API_VERSION: &str = "2022-11-28";

/// One candidate endpoint in the Copilot billing fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BillingSource {
    /// Organization premium-request report, optionally filtered to the user.
    OrgPremium { org: String, filter_user: bool },
    /// Organization general billing report.
    OrgBilling { org: String },
    UserPremium,
    UserBilling,
}

impl BillingSource {
    pub fn label(&self) -> String {
        match self {
            BillingSource::OrgPremium {
                org,
                filter_user: true,
            } => format!("org:{org}:premium:user"),
            BillingSource::OrgPremium {
                org,
                filter_user: false,
            } => format!("org:{org}:premium"),
            BillingSource::OrgBilling { org } => format!("org:{org}:billing"),
            BillingSource::UserPremium => "user:premium".to_string(),
            BillingSource::UserBilling => "user:billing".to_string(),
        }
    }

    pub fn org(&self) -> Option<&str> {
        match self {
            BillingSource::OrgPremium { org, .. } | BillingSource::OrgBilling { org } => Some(org),
            _ => None,
        }
    }

    /// Filtered premium → unfiltered premium → general billing.
    pub fn org_chain(org: &str) -> [BillingSource; 3] {
        [
            BillingSource::OrgPremium {
                org: org.to_string(),
                filter_user: true,
            },
            BillingSource::OrgPremium {
                org: org.to_string(),
                filter_user: false,
            },
            BillingSource::OrgBilling {
                org: org.to_string(),
            },
        ]
    }
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct ModelUsage {
    pub model: String,
    pub quantity: f64,
    pub net_amount: f64,
}

/// Copilot premium-request usage for one month.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct CopilotUsage {
    pub gross_quantity: f64,
    pub included_quantity: f64,
    pub net_amount: f64,
    pub models: Vec<ModelUsage>,
}

impl CopilotUsage {
    pub fn percentage(&self, plan: CopilotPlan) -> f64 {
        let limit = plan.monthly_limit();
        if limit <= 0.0 {
            return 0.0;
        }
        round1(self.gross_quantity / limit * 100.0)
    }

    pub fn to_usage(
        &self,
        plan: CopilotPlan,
        source: Option<String>,
    ) -> (UsageSnapshot, Vec<UsageDetail>) {
        let usage = UsageSnapshot {
            gross_quantity: self.gross_quantity,
            included_quantity: self.included_quantity,
            net_amount: self.net_amount,
            percentage: self.percentage(plan),
            cost_usd: self.net_amount,
            source,
            ..Default::default()
        };
        let details = self
            .models
            .iter()
            .map(|m| UsageDetail {
                model: m.model.clone(),
                quantity: m.quantity,
                cost_usd: m.net_amount,
                ..Default::default()
            })
            .collect();
        (usage, details)
    }
}

/// What a single billing endpoint said about a user's usage.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    /// The endpoint answered; the usage may legitimately be zero.
    Data(CopilotUsage),
    /// The token cannot see this endpoint (401/403/404 or a rejected filter).
    NoAccess(String),
    /// Network failure, timeout, 5xx or undecodable body.
    Unavailable(String),
}

impl From<Result<CopilotUsage, ProviderError>> for SourceOutcome {
    fn from(result: Result<CopilotUsage, ProviderError>) -> Self {
        match result {
            Ok(usage) => SourceOutcome::Data(usage),
            Err(e) => match e.status() {
                Some(408 | 429) => SourceOutcome::Unavailable(e.to_string()),
                Some(status) if (400..500).contains(&status) => {
                    SourceOutcome::NoAccess(e.to_string())
                }
                _ => SourceOutcome::Unavailable(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GithubUser {
    pub login: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SeatInfo {
    pub plan_type: Option<String>,
    pub last_activity_at: Option<String>,
}

#[async_trait]
pub trait CopilotApi: Send + Sync {
    async fn user(&self, token: &str) -> Result<GithubUser, ProviderError>;

    async fn orgs(&self, token: &str) -> Result<Vec<String>, ProviderError>;

    /// Copilot seat assignment of `login` in `org`; `None` if unassigned.
    async fn seat(
        &self,
        token: &str,
        org: &str,
        login: &str,
    ) -> Result<Option<SeatInfo>, ProviderError>;

    async fn usage(
        &self,
        token: &str,
        login: &str,
        source: &BillingSource,
        period: Period,
    ) -> SourceOutcome;
}

pub struct GithubClient {
    client: reqwest::Client,
    base: String,
}

impl GithubClient {
    pub fn new(client: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    fn get(&self, token: &str, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{path}", self.base))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, GITHUB_ACCEPT)
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
    }

    async fn fetch_usage(
        &self,
        token: &str,
        login: &str,
        source: &BillingSource,
        period: Period,
    ) -> Result<CopilotUsage, ProviderError> {
        let mut query = vec![
            ("year", period.year.to_string()),
            ("month", period.month.to_string()),
        ];
        let path = match source {
            BillingSource::OrgPremium { org, filter_user } => {
                if *filter_user {
                    query.push(("user", login.to_string()));
                }
                format!("/organizations/{org}/settings/billing/premium_request/usage")
            }
            BillingSource::OrgBilling { org } => {
                format!("/organizations/{org}/settings/billing/usage")
            }
            BillingSource::UserPremium => {
                format!("/users/{login}/settings/billing/premium_request/usage")
            }
            BillingSource::UserBilling => format!("/users/{login}/settings/billing/usage"),
        };
        let body = send_json(self.get(token, &path).query(&query), &path).await?;
        Ok(parse_usage_items(&body))
    }
}

#[async_trait]
impl CopilotApi for GithubClient {
    async fn user(&self, token: &str) -> Result<GithubUser, ProviderError> {
        let body = send_json(self.get(token, "/user"), "/user").await?;
        let login = body["login"]
            .as_str()
            .ok_or_else(|| ProviderError::Decode {
                endpoint: "/user".to_string(),
                message: "missing login".to_string(),
            })?;
        Ok(GithubUser {
            login: login.to_string(),
            name: body["name"].as_str().map(String::from),
            avatar_url: body["avatar_url"].as_str().map(String::from),
        })
    }

    async fn orgs(&self, token: &str) -> Result<Vec<String>, ProviderError> {
        let path = "/user/orgs";
        let body = send_json(self.get(token, path).query(&[("per_page", "100")]), path).await?;
        Ok(body
            .as_array()
            .map(|orgs| {
                orgs.iter()
                    .filter_map(|o| o["login"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn seat(
        &self,
        token: &str,
        org: &str,
        login: &str,
    ) -> Result<Option<SeatInfo>, ProviderError> {
        let path = format!("/orgs/{org}/members/{login}/copilot");
        match send_json(self.get(token, &path), &path).await {
            Ok(body) => Ok(Some(SeatInfo {
                plan_type: body["plan_type"].as_str().map(String::from),
                last_activity_at: body["last_activity_at"].as_str().map(String::from),
            })),
            Err(e) if e.status() == Some(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn usage(
        &self,
        token: &str,
        login: &str,
        source: &BillingSource,
        period: Period,
    ) -> SourceOutcome {
        self.fetch_usage(token, login, source, period).await.into()
    }
}

/// Sum the Copilot request-metered line items of a billing report.
///
/// Premium-request reports carry `grossQuantity`; the general billing report
/// carries `quantity`. Seat licences and other products are ignored.
pub fn parse_usage_items(body: &serde_json::Value) -> CopilotUsage {
    let mut usage = CopilotUsage::default();
    let Some(items) = body["usageItems"].as_array() else {
        return usage;
    };
    for item in items {
        let product = item["product"].as_str().unwrap_or("");
        if !product.eq_ignore_ascii_case("copilot") {
            continue;
        }
        let unit = item["unitType"].as_str().unwrap_or("requests");
        if !unit.to_ascii_lowercase().contains("request") {
            continue;
        }
        let quantity = as_f64(&item["grossQuantity"])
            .or_else(|| as_f64(&item["quantity"]))
            .unwrap_or(0.0);
        let price = as_f64(&item["pricePerUnit"]).unwrap_or(0.0);
        let discount = as_f64(&item["discountAmount"]).unwrap_or(0.0);
        let net = as_f64(&item["netAmount"]).unwrap_or(0.0);

        usage.gross_quantity += quantity;
        if price > 0.0 {
            usage.included_quantity += discount / price;
        }
        usage.net_amount += net;

        let model = item["model"]
            .as_str()
            .or_else(|| item["sku"].as_str())
            .unwrap_or("unknown");
        match usage.models.iter_mut().find(|m| m.model == model) {
            Some(m) => {
                m.quantity += quantity;
                m.net_amount += net;
            }
            None => usage.models.push(ModelUsage {
                model: model.to_string(),
                quantity,
                net_amount: net,
            }),
        }
    }
    usage.models.sort_by(|a, b| b.quantity.total_cmp(&a.quantity));
    usage
}

/// Infer the plan from an organization seat or from how much of the
/// allowance was consumed. `None` when the evidence is inconclusive.
pub fn detect_plan(included_quantity: f64, seat: Option<&SeatInfo>) -> Option<CopilotPlan> {
    if let Some(plan_type) = seat.and_then(|s| s.plan_type.as_deref()) {
        match plan_type.to_ascii_lowercase().as_str() {
            "enterprise" => return Some(CopilotPlan::Enterprise),
            "business" => return Some(CopilotPlan::Business),
            _ => {}
        }
    }
    if included_quantity > CopilotPlan::Pro.monthly_limit() {
        Some(CopilotPlan::ProPlus)
    } else if included_quantity > CopilotPlan::Free.monthly_limit() {
        Some(CopilotPlan::Pro)
    } else {
        None
    }
}

/// Confirm the token belongs to `username` and can read some billing source.
pub async fn verify(
    api: &dyn CopilotApi,
    token: &str,
    username: &str,
    period: Period,
) -> Verification {
    let user = match api.user(token).await {
        Ok(u) => u,
        Err(e) if e.is_unauthorized() => {
            return Verification::invalid("GitHub rejected the token");
        }
        Err(e) => return Verification::invalid(e.to_string()),
    };
    let username = username.trim();
    if !username.is_empty() && !user.login.eq_ignore_ascii_case(username) {
        return Verification::invalid(format!(
            "token belongs to {}, not {username}",
            user.login
        ));
    }

    for source in [BillingSource::UserPremium, BillingSource::UserBilling] {
        if let SourceOutcome::Data(_) = api.usage(token, &user.login, &source, period).await {
            return Verification::ok(source.label());
        }
    }
    if let Ok(orgs) = api.orgs(token).await {
        for org in orgs {
            for source in BillingSource::org_chain(&org) {
                if let SourceOutcome::Data(_) = api.usage(token, &user.login, &source, period).await
                {
                    return Verification::ok(source.label());
                }
            }
        }
    }
    Verification::invalid("token is valid but cannot read Copilot billing (missing billing scope)")
}

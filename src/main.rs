use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::Arc;

use tally::config::Settings;
use tally::crypto::{self, Vault};
use tally::models::{Account, AccountKind, AccountType, CopilotPlan, NewAccount, Period};
use tally::reconcile::{Providers, Reconciler};
use tally::scheduler;
use tally::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty()
        || args.iter().any(|a| a == "--help" || a == "-h")
        || args.first().map(|s| s.as_str()) == Some("help")
    {
        print_help();
        return Ok(());
    }

    let rest = &args[1..];
    match args[0].as_str() {
        "generate-key" => generate_key(),
        "serve" => serve(rest).await,
        "refresh" => refresh(rest).await,
        "verify" => verify(rest).await,
        "accounts" => list_accounts(),
        "add" => add(rest).await,
        "pause" => set_paused(rest, true),
        "resume" => set_paused(rest, false),
        "remove" => remove(rest),
        other => {
            print_help();
            bail!("unknown command: {other}")
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tally=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open_store() -> Result<(Settings, Store)> {
    let mut settings = Settings::load();
    let store = Store::open(&settings.db_path)?;
    settings
        .apply_persisted(&store)
        .context("reading persisted settings")?;
    Ok((settings, store))
}

fn open_reconciler() -> Result<(Settings, Arc<Reconciler>)> {
    let (settings, store) = open_store()?;
    let vault = Vault::load_or_create().context("loading credential secret")?;
    let providers = Providers::http(&settings).context("building http client")?;
    let reconciler = Reconciler::new(Arc::new(store), Arc::new(vault), providers);
    Ok((settings, Arc::new(reconciler)))
}

fn find_by_name(store: &Store, name: &str) -> Result<Account> {
    store
        .find_account(name)?
        .with_context(|| format!("no account named {name}"))
}

#[cfg(feature = "dashboard")]
async fn serve(args: &[String]) -> Result<()> {
    use tally::dashboard::{self, AppState};
    use tally::device_flow::DeviceFlow;
    use tally::providers::http_client;
    use tally::scheduler::Scheduler;

    let (settings, reconciler) = open_reconciler()?;
    let port = match get_flag(args, "--port") {
        Some(p) => p.parse().with_context(|| format!("invalid port: {p}"))?,
        None => settings.port,
    };

    let scheduler = Arc::new(Scheduler::new(Arc::clone(&reconciler)));
    scheduler.start_auto_refresh(settings.refresh_interval_minutes);

    let device_flow = DeviceFlow::new(
        http_client(settings.http_timeout).context("building http client")?,
        settings.github_web_base.clone(),
        settings.github_client_id.clone(),
    );
    let state = AppState::new(&settings, reconciler, Arc::clone(&scheduler), device_flow);
    let result = dashboard::run(state, port).await;
    scheduler.stop();
    result
}

#[cfg(not(feature = "dashboard"))]
async fn serve(_args: &[String]) -> Result<()> {
    bail!("tally was built without the dashboard feature")
}

async fn refresh(args: &[String]) -> Result<()> {
    let (_, reconciler) = open_reconciler()?;
    if let Some(name) = get_flag(args, "--account") {
        let account = find_by_name(reconciler.store(), &name)?;
        let outcome = reconciler.refresh_account(account.id).await?;
        println!(
            "{}  {}  {:.1}%  ({})",
            account.username,
            outcome.period,
            outcome.usage.percentage,
            outcome.usage.source.as_deref().unwrap_or("-")
        );
        return Ok(());
    }

    let report = scheduler::refresh_all(&reconciler).await;
    println!("refreshed {}, failed {}", report.refreshed, report.failed);
    for (username, message) in &report.errors {
        println!("  {username}: {message}");
    }
    Ok(())
}

async fn verify(args: &[String]) -> Result<()> {
    let account_type = parse_type(args)?;
    let token = get_flag(args, "--token").context("--token is required")?;
    let identity = get_flag(args, "--user").unwrap_or_default();

    let (_, reconciler) = open_reconciler()?;
    let result = reconciler
        .verify_credential(account_type, &token, &identity)
        .await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.valid {
        std::process::exit(1);
    }
    Ok(())
}

fn list_accounts() -> Result<()> {
    let (_, store) = open_store()?;
    let accounts = store.list_accounts()?;
    if accounts.is_empty() {
        println!("no accounts. add one with `tally add`.");
        return Ok(());
    }

    let period = Period::containing(Utc::now());
    println!(
        "{:>4}  {:<12} {:<24} {:<10} {:>8}  STATUS",
        "ID",
        "TYPE",
        "USERNAME",
        "PLAN",
        period.to_string()
    );
    for account in accounts {
        let usage = store
            .usage_for(account.id, period)?
            .map(|h| format!("{:.1}%", h.usage.percentage))
            .unwrap_or_else(|| "-".to_string());
        let status = match (&account.last_error, account.is_paused) {
            (_, true) => "paused".to_string(),
            (Some(e), false) => format!("error: {e}"),
            (None, false) => "ok".to_string(),
        };
        println!(
            "{:>4}  {:<12} {:<24} {:<10} {:>8}  {status}",
            account.id,
            account.account_type().as_str(),
            account.username,
            account.kind.plan_label().unwrap_or_else(|| "-".to_string()),
            usage,
        );
    }
    Ok(())
}

async fn add(args: &[String]) -> Result<()> {
    let account_type = parse_type(args)?;
    let username = get_flag(args, "--user").context("--user is required")?;
    let token = get_flag(args, "--token").context("--token is required")?;
    let plan = get_flag(args, "--plan");

    let mut kind = match account_type {
        AccountType::Copilot => AccountKind::Copilot {
            pat_token: token.clone(),
            plan: plan
                .as_deref()
                .map(|p| CopilotPlan::parse(p).with_context(|| format!("unknown plan: {p}")))
                .transpose()?,
            billing_org: get_flag(args, "--org"),
        },
        AccountType::ClaudeCode => AccountKind::ClaudeCode {
            admin_key: token.clone(),
            plan,
        },
        AccountType::ClaudeWeb => AccountKind::ClaudeWeb {
            oauth_token: token.clone(),
            refresh_token: get_flag(args, "--refresh-token").unwrap_or_default(),
            expires_at: None,
            plan,
        },
    };

    let (_, reconciler) = open_reconciler()?;
    let mut display_name = None;
    if !args.iter().any(|a| a == "--no-verify") {
        let check = reconciler
            .verify_credential(account_type, &token, &username)
            .await;
        if !check.valid {
            bail!(
                "credential rejected: {}",
                check.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        if let AccountKind::ClaudeWeb { plan, .. } = &mut kind {
            if plan.is_none() {
                *plan = check.plan;
            }
        }
        display_name = check.display_name;
    }

    let id = reconciler.add_account(NewAccount {
        username: username.clone(),
        display_name,
        kind,
    })?;
    println!("added {username} (id {id})");
    match reconciler.refresh_account(id).await {
        Ok(outcome) => println!("  {}: {:.1}%", outcome.period, outcome.usage.percentage),
        Err(e) => println!("  first refresh failed: {e}"),
    }
    Ok(())
}

fn set_paused(args: &[String], paused: bool) -> Result<()> {
    let name = args.first().context("account name is required")?;
    let (_, store) = open_store()?;
    let account = find_by_name(&store, name)?;
    store.set_paused(account.id, paused)?;
    println!("{} {name}", if paused { "paused" } else { "resumed" });
    Ok(())
}

fn remove(args: &[String]) -> Result<()> {
    let name = args.first().context("account name is required")?;
    let (_, store) = open_store()?;
    let account = find_by_name(&store, name)?;
    store.delete_account(account.id)?;
    println!("removed {name}");
    Ok(())
}

fn generate_key() -> Result<()> {
    println!("{}", crypto::generate_secret_b64());
    eprintln!(
        "set it as TALLY_SECRET, or save it to {}",
        crypto::secret_file_path().display()
    );
    Ok(())
}

fn parse_type(args: &[String]) -> Result<AccountType> {
    let raw = get_flag(args, "--type").context("--type is required")?;
    AccountType::parse(&raw)
        .with_context(|| format!("unknown account type: {raw} (copilot, claude_code, claude_web)"))
}

fn get_flag(args: &[String], flag: &str) -> Option<String> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone())
}

fn print_help() {
    println!("tally {}", env!("CARGO_PKG_VERSION"));
    println!("Keeps Copilot and Claude usage in sync across accounts.\n");
    println!("USAGE:");
    println!("  tally serve    [--port N]                 Run the JSON API and auto-refresh");
    println!("  tally refresh  [--account NAME]           Refresh one account or all of them");
    println!("  tally verify   --type T --token S [--user ID]");
    println!("                                            Check a credential without saving it");
    println!("  tally accounts                            List accounts and this month's usage");
    println!("  tally add      --type T --user NAME --token S");
    println!("                 [--refresh-token S] [--org ORG] [--plan P] [--no-verify]");
    println!("  tally pause    NAME                       Skip an account in scheduled refreshes");
    println!("  tally resume   NAME");
    println!("  tally remove   NAME                       Delete an account and its history");
    println!("  tally generate-key                        Print a new base64 vault secret\n");
    println!("ACCOUNT TYPES:");
    println!("  copilot       GitHub personal access token");
    println!("  claude_code   Anthropic admin API key");
    println!("  claude_web    Claude OAuth access token (+ refresh token)\n");
    println!("ENVIRONMENT:");
    println!("  TALLY_SECRET                    Base64 vault secret (default: ~/.tally/secret.key)");
    println!("  TALLY_DB_PATH                   Database path (default: ~/.tally/tally.db)");
    println!("  TALLY_PORT                      API port (default: 7420)");
    println!("  TALLY_REFRESH_INTERVAL_MINUTES  Auto-refresh interval, 1-1440 (default: 60)");
    println!("  TALLY_GITHUB_CLIENT_ID          OAuth app id enabling the GitHub device flow");
    println!("  RUST_LOG                        Log filter (default: tally=info)");
}

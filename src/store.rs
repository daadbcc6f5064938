use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::models::{
    Account, AccountKind, AccountType, CopilotPlan, NewAccount, Period, Profile, UsageDetail,
    UsageHistory, UsageSnapshot,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    username         TEXT NOT NULL UNIQUE,
    display_name     TEXT,
    account_type     TEXT NOT NULL,
    pat_token        TEXT NOT NULL DEFAULT '',
    oauth_token      TEXT NOT NULL DEFAULT '',
    refresh_token    TEXT NOT NULL DEFAULT '',
    token_expires_at TEXT,
    plan             TEXT,
    billing_org      TEXT,
    is_paused        INTEGER NOT NULL DEFAULT 0,
    is_favorite      INTEGER NOT NULL DEFAULT 0,
    avatar_url       TEXT,
    orgs             TEXT NOT NULL DEFAULT '[]',
    last_activity    TEXT,
    last_error       TEXT,
    created_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS usage_history (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id          INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    year                INTEGER NOT NULL,
    month               INTEGER NOT NULL,
    gross_quantity      REAL NOT NULL DEFAULT 0,
    included_quantity   REAL NOT NULL DEFAULT 0,
    net_amount          REAL NOT NULL DEFAULT 0,
    percentage          REAL NOT NULL DEFAULT 0,
    sessions            INTEGER NOT NULL DEFAULT 0,
    lines_added         INTEGER NOT NULL DEFAULT 0,
    lines_removed       INTEGER NOT NULL DEFAULT 0,
    commits             INTEGER NOT NULL DEFAULT 0,
    pull_requests       INTEGER NOT NULL DEFAULT 0,
    cost_usd            REAL NOT NULL DEFAULT 0,
    session_percent     REAL,
    weekly_percent      REAL,
    opus_percent        REAL,
    session_resets_at   TEXT,
    weekly_resets_at    TEXT,
    extra_usage_limit   REAL,
    extra_usage_spent   REAL,
    extra_usage_balance REAL,
    source              TEXT,
    fetched_at          TEXT NOT NULL,
    UNIQUE (account_id, year, month)
);

CREATE TABLE IF NOT EXISTS usage_details (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    history_id         INTEGER NOT NULL REFERENCES usage_history(id) ON DELETE CASCADE,
    model              TEXT NOT NULL,
    quantity           REAL NOT NULL DEFAULT 0,
    input_tokens       INTEGER NOT NULL DEFAULT 0,
    output_tokens      INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens  INTEGER NOT NULL DEFAULT 0,
    cache_write_tokens INTEGER NOT NULL DEFAULT 0,
    cost_usd           REAL NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_usage_details_history ON usage_details(history_id);

CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const ACCOUNT_COLUMNS: &str = "id, username, display_name, account_type, pat_token, oauth_token, \
     refresh_token, token_expires_at, plan, billing_org, is_paused, is_favorite, avatar_url, \
     orgs, last_activity, last_error, created_at";

const HISTORY_COLUMNS: &str = "id, account_id, year, month, gross_quantity, included_quantity, \
     net_amount, percentage, sessions, lines_added, lines_removed, commits, pull_requests, \
     cost_usd, session_percent, weekly_percent, opus_percent, session_resets_at, \
     weekly_resets_at, extra_usage_limit, extra_usage_spent, extra_usage_balance, source, \
     fetched_at";

/// SQLite-backed account and usage storage. The connection is held only
/// for the duration of a single statement or transaction.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("creating database directory")?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open database at {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA).context("creating schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Accounts ────────────────────────────────────────────────────────────

    /// Insert an account whose secrets are already vault ciphertext.
    pub fn insert_account(&self, account: &NewAccount) -> Result<i64> {
        let cols = KindColumns::from(&account.kind);
        let conn = self.conn();
        conn.execute(
            "INSERT INTO accounts (username, display_name, account_type, pat_token, oauth_token,
                refresh_token, token_expires_at, plan, billing_org, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                account.username.trim(),
                account.display_name,
                account.kind.account_type().as_str(),
                cols.pat_token,
                cols.oauth_token,
                cols.refresh_token,
                cols.expires_at,
                cols.plan,
                cols.billing_org,
                Utc::now().to_rfc3339(),
            ],
        )
        .with_context(|| format!("inserting account {}", account.username))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1");
        self.conn()
            .query_row(&sql, [id], row_to_account)
            .optional()
            .context("loading account")
    }

    pub fn find_account(&self, username: &str) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE username = ?1");
        self.conn()
            .query_row(&sql, [username.trim()], row_to_account)
            .optional()
            .context("loading account")
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        self.query_accounts("1 = 1")
    }

    /// Accounts eligible for scheduled and bulk refresh.
    pub fn list_active_accounts(&self) -> Result<Vec<Account>> {
        self.query_accounts("is_paused = 0")
    }

    fn query_accounts(&self, filter: &str) -> Result<Vec<Account>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE {filter}
             ORDER BY is_favorite DESC, username COLLATE NOCASE"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_account)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("listing accounts")
    }

    /// Deletes the account and, by cascade, its usage rows.
    pub fn delete_account(&self, id: i64) -> Result<bool> {
        let n = self
            .conn()
            .execute("DELETE FROM accounts WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    pub fn set_paused(&self, id: i64, paused: bool) -> Result<()> {
        self.update_column(id, "is_paused", paused)
    }

    pub fn set_favorite(&self, id: i64, favorite: bool) -> Result<()> {
        self.update_column(id, "is_favorite", favorite)
    }

    pub fn set_display_name(&self, id: i64, name: Option<&str>) -> Result<()> {
        self.update_column(id, "display_name", name)
    }

    pub fn set_billing_org(&self, id: i64, org: Option<&str>) -> Result<()> {
        self.update_column(id, "billing_org", org)
    }

    pub fn set_plan(&self, id: i64, plan: Option<&str>) -> Result<()> {
        self.update_column(id, "plan", plan)
    }

    pub fn set_last_error(&self, id: i64, error: Option<&str>) -> Result<()> {
        self.update_column(id, "last_error", error)
    }

    /// Replace the primary credential (PAT or admin key) with new ciphertext.
    pub fn set_credential(&self, id: i64, ciphertext: &str) -> Result<()> {
        self.update_column(id, "pat_token", ciphertext)
    }

    /// Persist a rotated OAuth token pair (ciphertext) and its expiry.
    pub fn update_oauth_tokens(
        &self,
        id: i64,
        access_ciphertext: &str,
        refresh_ciphertext: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE accounts SET oauth_token = ?1, refresh_token = ?2, token_expires_at = ?3
                 WHERE id = ?4",
                params![
                    access_ciphertext,
                    refresh_ciphertext,
                    expires_at.map(|t| t.to_rfc3339()),
                    id
                ],
            )
            .context("saving rotated tokens")?;
        Ok(())
    }

    pub fn set_profile(&self, id: i64, profile: &Profile) -> Result<()> {
        let orgs = serde_json::to_string(&profile.orgs)?;
        self.conn()
            .execute(
                "UPDATE accounts SET avatar_url = ?1, orgs = ?2, last_activity = ?3 WHERE id = ?4",
                params![profile.avatar_url, orgs, profile.last_activity, id],
            )
            .context("saving profile")?;
        Ok(())
    }

    fn update_column<T: rusqlite::ToSql>(&self, id: i64, column: &str, value: T) -> Result<()> {
        let sql = format!("UPDATE accounts SET {column} = ?1 WHERE id = ?2");
        self.conn()
            .execute(&sql, params![value, id])
            .with_context(|| format!("updating {column}"))?;
        Ok(())
    }

    // ── Usage ───────────────────────────────────────────────────────────────

    /// Insert or overwrite the (account, month) row and replace its details.
    pub fn upsert_usage(
        &self,
        account_id: i64,
        period: Period,
        usage: &UsageSnapshot,
        details: &[UsageDetail],
        fetched_at: DateTime<Utc>,
    ) -> Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let history_id: i64 = tx
            .query_row(
                "INSERT INTO usage_history (account_id, year, month, gross_quantity,
                    included_quantity, net_amount, percentage, sessions, lines_added,
                    lines_removed, commits, pull_requests, cost_usd, session_percent,
                    weekly_percent, opus_percent, session_resets_at, weekly_resets_at,
                    extra_usage_limit, extra_usage_spent, extra_usage_balance, source, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19, ?20, ?21, ?22, ?23)
                 ON CONFLICT (account_id, year, month) DO UPDATE SET
                    gross_quantity = excluded.gross_quantity,
                    included_quantity = excluded.included_quantity,
                    net_amount = excluded.net_amount,
                    percentage = excluded.percentage,
                    sessions = excluded.sessions,
                    lines_added = excluded.lines_added,
                    lines_removed = excluded.lines_removed,
                    commits = excluded.commits,
                    pull_requests = excluded.pull_requests,
                    cost_usd = excluded.cost_usd,
                    session_percent = excluded.session_percent,
                    weekly_percent = excluded.weekly_percent,
                    opus_percent = excluded.opus_percent,
                    session_resets_at = excluded.session_resets_at,
                    weekly_resets_at = excluded.weekly_resets_at,
                    extra_usage_limit = excluded.extra_usage_limit,
                    extra_usage_spent = excluded.extra_usage_spent,
                    extra_usage_balance = excluded.extra_usage_balance,
                    source = excluded.source,
                    fetched_at = excluded.fetched_at
                 RETURNING id",
                params![
                    account_id,
                    period.year,
                    period.month,
                    usage.gross_quantity,
                    usage.included_quantity,
                    usage.net_amount,
                    usage.percentage,
                    usage.sessions as i64,
                    usage.lines_added as i64,
                    usage.lines_removed as i64,
                    usage.commits as i64,
                    usage.pull_requests as i64,
                    usage.cost_usd,
                    usage.session_percent,
                    usage.weekly_percent,
                    usage.opus_percent,
                    usage.session_resets_at,
                    usage.weekly_resets_at,
                    usage.extra_usage_limit,
                    usage.extra_usage_spent,
                    usage.extra_usage_balance,
                    usage.source,
                    fetched_at.to_rfc3339(),
                ],
                |row| row.get(0),
            )
            .context("upserting usage row")?;

        tx.execute(
            "DELETE FROM usage_details WHERE history_id = ?1",
            [history_id],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO usage_details (history_id, model, quantity, input_tokens,
                    output_tokens, cache_read_tokens, cache_write_tokens, cost_usd)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for d in details {
                insert.execute(params![
                    history_id,
                    d.model,
                    d.quantity,
                    d.input_tokens as i64,
                    d.output_tokens as i64,
                    d.cache_read_tokens as i64,
                    d.cache_write_tokens as i64,
                    d.cost_usd,
                ])?;
            }
        }
        tx.commit().context("committing usage")?;
        Ok(history_id)
    }

    pub fn usage_for(&self, account_id: i64, period: Period) -> Result<Option<UsageHistory>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM usage_history
             WHERE account_id = ?1 AND year = ?2 AND month = ?3"
        );
        self.conn()
            .query_row(
                &sql,
                params![account_id, period.year, period.month],
                row_to_history,
            )
            .optional()
            .context("loading usage")
    }

    /// All months for an account, newest first.
    pub fn usage_history(&self, account_id: i64) -> Result<Vec<UsageHistory>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM usage_history WHERE account_id = ?1
             ORDER BY year DESC, month DESC"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([account_id], row_to_history)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("loading usage history")
    }

    pub fn details_for(&self, history_id: i64) -> Result<Vec<UsageDetail>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT model, quantity, input_tokens, output_tokens, cache_read_tokens,
                cache_write_tokens, cost_usd
             FROM usage_details WHERE history_id = ?1 ORDER BY cost_usd DESC, quantity DESC",
        )?;
        let rows = stmt.query_map([history_id], |row| {
            Ok(UsageDetail {
                model: row.get(0)?,
                quantity: row.get(1)?,
                input_tokens: row.get::<_, i64>(2)?.max(0) as u64,
                output_tokens: row.get::<_, i64>(3)?.max(0) as u64,
                cache_read_tokens: row.get::<_, i64>(4)?.max(0) as u64,
                cache_write_tokens: row.get::<_, i64>(5)?.max(0) as u64,
                cost_usd: row.get(6)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("loading usage details")
    }

    // ── Settings ────────────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn()
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .context("loading setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .context("saving setting")?;
        Ok(())
    }
}

/// Column values for the type-specific part of an account row.
struct KindColumns<'a> {
    pat_token: &'a str,
    oauth_token: &'a str,
    refresh_token: &'a str,
    expires_at: Option<String>,
    plan: Option<String>,
    billing_org: Option<&'a str>,
}

impl<'a> From<&'a AccountKind> for KindColumns<'a> {
    fn from(kind: &'a AccountKind) -> Self {
        match kind {
            AccountKind::Copilot {
                pat_token,
                plan,
                billing_org,
            } => Self {
                pat_token,
                oauth_token: "",
                refresh_token: "",
                expires_at: None,
                plan: plan.map(|p| p.as_str().to_string()),
                billing_org: billing_org.as_deref(),
            },
            AccountKind::ClaudeCode { admin_key, plan } => Self {
                pat_token: admin_key,
                oauth_token: "",
                refresh_token: "",
                expires_at: None,
                plan: plan.clone(),
                billing_org: None,
            },
            AccountKind::ClaudeWeb {
                oauth_token,
                refresh_token,
                expires_at,
                plan,
            } => Self {
                pat_token: "",
                oauth_token,
                refresh_token,
                expires_at: expires_at.map(|t| t.to_rfc3339()),
                plan: plan.clone(),
                billing_org: None,
            },
        }
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        anyhow::anyhow!(message).into(),
    )
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    let type_name: String = row.get(3)?;
    let account_type = AccountType::parse(&type_name)
        .ok_or_else(|| conversion_error(3, format!("unknown account type {type_name:?}")))?;
    let pat_token: String = row.get(4)?;
    let plan: Option<String> = row.get(8)?;

    let kind = match account_type {
        AccountType::Copilot => AccountKind::Copilot {
            pat_token,
            plan: plan.as_deref().and_then(CopilotPlan::parse),
            billing_org: row
                .get::<_, Option<String>>(9)?
                .filter(|o| !o.trim().is_empty()),
        },
        AccountType::ClaudeCode => AccountKind::ClaudeCode {
            admin_key: pat_token,
            plan,
        },
        AccountType::ClaudeWeb => AccountKind::ClaudeWeb {
            oauth_token: row.get(5)?,
            refresh_token: row.get(6)?,
            expires_at: row
                .get::<_, Option<String>>(7)?
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
            plan,
        },
    };

    let orgs_json: String = row.get(13)?;
    Ok(Account {
        id: row.get(0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        is_paused: row.get(10)?,
        is_favorite: row.get(11)?,
        profile: Profile {
            avatar_url: row.get(12)?,
            orgs: serde_json::from_str(&orgs_json).unwrap_or_default(),
            last_activity: row.get(14)?,
        },
        last_error: row.get(15)?,
        created_at: row.get(16)?,
        kind,
    })
}

fn row_to_history(row: &Row<'_>) -> rusqlite::Result<UsageHistory> {
    let count = |idx: usize| -> rusqlite::Result<u64> { Ok(row.get::<_, i64>(idx)?.max(0) as u64) };
    Ok(UsageHistory {
        id: row.get(0)?,
        account_id: row.get(1)?,
        period: Period::new(row.get(2)?, row.get(3)?),
        usage: UsageSnapshot {
            gross_quantity: row.get(4)?,
            included_quantity: row.get(5)?,
            net_amount: row.get(6)?,
            percentage: row.get(7)?,
            sessions: count(8)?,
            lines_added: count(9)?,
            lines_removed: count(10)?,
            commits: count(11)?,
            pull_requests: count(12)?,
            cost_usd: row.get(13)?,
            session_percent: row.get(14)?,
            weekly_percent: row.get(15)?,
            opus_percent: row.get(16)?,
            session_resets_at: row.get(17)?,
            weekly_resets_at: row.get(18)?,
            extra_usage_limit: row.get(19)?,
            extra_usage_spent: row.get(20)?,
            extra_usage_balance: row.get(21)?,
            source: row.get(22)?,
        },
        fetched_at: row.get(23)?,
    })
}

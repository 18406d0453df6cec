//! SQLite-backed plumes ledger.
//!
//! Each call opens its own connection on a blocking thread. Balance checks
//! live inside the `UPDATE ... WHERE` so concurrent requests from the same
//! device serialize in SQLite rather than in application code.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;
use tracing::{debug, info};

use super::{
    normalize_code, ConsumeOutcome, DailyClaim, PlumesAccount, PlumesLedger, PromoError,
    PromoRedemption, DAILY_REWARD, DEFAULT_BALANCE,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct SqlitePlumesLedger {
    db_path: PathBuf,
}

fn connect(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Lazily create the account row. A no-op when it already exists.
fn ensure_account(conn: &Connection, device_id: &str) -> rusqlite::Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT OR IGNORE INTO plumes_accounts (device_id, balance, is_premium, created_at, updated_at)
         VALUES (?1, ?2, 0, ?3, ?3)",
        params![device_id, DEFAULT_BALANCE, &now],
    )?;
    Ok(())
}

fn read_account(conn: &Connection, device_id: &str) -> rusqlite::Result<PlumesAccount> {
    conn.query_row(
        "SELECT device_id, balance, is_premium, last_daily_reward_at FROM plumes_accounts WHERE device_id = ?1",
        params![device_id],
        |row| {
            let last: Option<i64> = row.get(3)?;
            Ok(PlumesAccount {
                device_id: row.get(0)?,
                balance: row.get(1)?,
                is_premium: row.get(2)?,
                last_daily_reward_at: last.and_then(DateTime::<Utc>::from_timestamp_millis),
            })
        },
    )
}

impl SqlitePlumesLedger {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            let conn = connect(&path_clone)?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS plumes_accounts (
                    device_id TEXT PRIMARY KEY,
                    balance INTEGER NOT NULL CHECK (balance >= 0),
                    is_premium INTEGER NOT NULL DEFAULT 0,
                    last_daily_reward_at INTEGER,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS promo_codes (
                    code TEXT PRIMARY KEY,
                    bonus_amount INTEGER NOT NULL DEFAULT 0,
                    grants_premium INTEGER NOT NULL DEFAULT 0
                );
                CREATE TABLE IF NOT EXISTS promo_redemptions (
                    code TEXT NOT NULL REFERENCES promo_codes(code),
                    device_id TEXT NOT NULL,
                    redeemed_at TEXT NOT NULL,
                    PRIMARY KEY (code, device_id)
                );
                "#,
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
        .context("Failed to initialize plumes ledger schema")?;

        info!("Plumes ledger ready at {}", path.display());
        Ok(Self { db_path: path })
    }
}

#[async_trait]
impl PlumesLedger for SqlitePlumesLedger {
    async fn get_account(&self, device_id: &str) -> Result<PlumesAccount> {
        let path = self.db_path.clone();
        let device = device_id.to_string();

        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            ensure_account(&conn, &device)?;
            Ok::<_, anyhow::Error>(read_account(&conn, &device)?)
        })
        .await?
    }

    async fn consume(&self, device_id: &str, amount: i64) -> Result<ConsumeOutcome> {
        if amount < 0 {
            bail!("cannot consume a negative amount ({})", amount);
        }
        let path = self.db_path.clone();
        let device = device_id.to_string();

        let outcome = task::spawn_blocking(move || {
            let mut conn = connect(&path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_account(&tx, &device)?;

            let premium: bool = tx.query_row(
                "SELECT is_premium FROM plumes_accounts WHERE device_id = ?1",
                params![&device],
                |row| row.get(0),
            )?;
            if premium {
                tx.commit()?;
                return Ok::<_, anyhow::Error>(ConsumeOutcome::Unlimited);
            }

            let now = Utc::now().to_rfc3339();
            let debited: Option<i64> = tx
                .query_row(
                    "UPDATE plumes_accounts SET balance = balance - ?2, updated_at = ?3
                     WHERE device_id = ?1 AND balance >= ?2
                     RETURNING balance",
                    params![&device, amount, &now],
                    |row| row.get(0),
                )
                .optional()?;

            let outcome = match debited {
                Some(balance) => ConsumeOutcome::Consumed { balance },
                None => {
                    let balance: i64 = tx.query_row(
                        "SELECT balance FROM plumes_accounts WHERE device_id = ?1",
                        params![&device],
                        |row| row.get(0),
                    )?;
                    ConsumeOutcome::Insufficient { balance }
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
        .await??;

        debug!("consume({}, {}) -> {:?}", device_id, amount, outcome);
        Ok(outcome)
    }

    async fn credit(&self, device_id: &str, amount: i64) -> Result<i64> {
        if amount < 0 {
            bail!("cannot credit a negative amount ({})", amount);
        }
        let path = self.db_path.clone();
        let device = device_id.to_string();

        let balance = task::spawn_blocking(move || {
            let conn = connect(&path)?;
            ensure_account(&conn, &device)?;
            let now = Utc::now().to_rfc3339();
            let balance: i64 = conn.query_row(
                "UPDATE plumes_accounts SET balance = balance + ?2, updated_at = ?3
                 WHERE device_id = ?1
                 RETURNING balance",
                params![&device, amount, &now],
                |row| row.get(0),
            )?;
            Ok::<_, anyhow::Error>(balance)
        })
        .await??;

        info!("Credited {} plumes to {} (balance {})", amount, device_id, balance);
        Ok(balance)
    }

    async fn claim_daily(&self, device_id: &str, now: DateTime<Utc>) -> Result<DailyClaim> {
        let path = self.db_path.clone();
        let device = device_id.to_string();
        let now_ms = now.timestamp_millis();
        let threshold_ms = (now - ChronoDuration::hours(24)).timestamp_millis();

        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            ensure_account(&conn, &device)?;
            let claimed: Option<i64> = conn
                .query_row(
                    "UPDATE plumes_accounts
                     SET balance = balance + ?2, last_daily_reward_at = ?3, updated_at = ?4
                     WHERE device_id = ?1
                       AND (last_daily_reward_at IS NULL OR last_daily_reward_at <= ?5)
                     RETURNING balance",
                    params![&device, DAILY_REWARD, now_ms, Utc::now().to_rfc3339(), threshold_ms],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(balance) = claimed {
                return Ok::<_, anyhow::Error>(DailyClaim::Claimed { balance });
            }

            let last = read_account(&conn, &device)?
                .last_daily_reward_at
                .context("daily claim refused without a previous claim")?;
            Ok(DailyClaim::TooEarly {
                next_claim_at: last + ChronoDuration::hours(24),
            })
        })
        .await?
    }

    async fn set_premium(&self, device_id: &str, premium: bool) -> Result<()> {
        let path = self.db_path.clone();
        let device = device_id.to_string();

        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            ensure_account(&conn, &device)?;
            conn.execute(
                "UPDATE plumes_accounts SET is_premium = ?2, updated_at = ?3 WHERE device_id = ?1",
                params![&device, premium, Utc::now().to_rfc3339()],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        info!("Device {} premium = {}", device_id, premium);
        Ok(())
    }

    async fn register_promo(&self, code: &str, bonus: i64, grants_premium: bool) -> Result<()> {
        if bonus < 0 {
            bail!("promo bonus must not be negative");
        }
        let path = self.db_path.clone();
        let code = normalize_code(code);

        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            conn.execute(
                "INSERT INTO promo_codes (code, bonus_amount, grants_premium) VALUES (?1, ?2, ?3)
                 ON CONFLICT(code) DO UPDATE SET bonus_amount = excluded.bonus_amount,
                                                grants_premium = excluded.grants_premium",
                params![&code, bonus, grants_premium],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    async fn redeem_promo(&self, device_id: &str, code: &str) -> Result<PromoRedemption, PromoError> {
        let path = self.db_path.clone();
        let device = device_id.to_string();
        let normalized = normalize_code(code);
        let code = normalized.clone();

        let redemption = task::spawn_blocking(move || {
            let mut conn = connect(&path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_account(&tx, &device)?;

            let promo: Option<(i64, bool)> = tx
                .query_row(
                    "SELECT bonus_amount, grants_premium FROM promo_codes WHERE code = ?1",
                    params![&code],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((bonus, grants_premium)) = promo else {
                return Err(PromoError::Invalid);
            };

            let now = Utc::now().to_rfc3339();
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO promo_redemptions (code, device_id, redeemed_at) VALUES (?1, ?2, ?3)",
                params![&code, &device, &now],
            )?;
            if inserted == 0 {
                return Err(PromoError::AlreadyRedeemed);
            }

            let redemption = if grants_premium {
                tx.execute(
                    "UPDATE plumes_accounts SET is_premium = 1, updated_at = ?2 WHERE device_id = ?1",
                    params![&device, &now],
                )?;
                PromoRedemption::PremiumGranted
            } else {
                let balance: i64 = tx.query_row(
                    "UPDATE plumes_accounts SET balance = balance + ?2, updated_at = ?3
                     WHERE device_id = ?1
                     RETURNING balance",
                    params![&device, bonus, &now],
                    |row| row.get(0),
                )?;
                PromoRedemption::Credited { bonus, balance }
            };
            tx.commit()?;
            Ok(redemption)
        })
        .await
        .map_err(|e| PromoError::Storage(e.into()))??;

        info!("Promo {} redeemed by {}: {:?}", normalized, device_id, redemption);
        Ok(redemption)
    }
}

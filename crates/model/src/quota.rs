//! The per-user quota ledger. `reserve` is the concurrency primitive for
//! every write path: one conditional UPDATE that checks the tier limit and
//! debits in the same statement, serialized by the database.

use anyhow::Context;
use common::types::UserId;
use errors::ErrorMetadata;
use rusqlite::params;

use crate::Database;

pub fn user_not_found(owner_id: UserId) -> ErrorMetadata {
    ErrorMetadata::not_found("UserNotFound", format!("user {owner_id} does not exist"))
}

impl Database {
    pub fn create_tier(&self, tier_id: &str, name: &str, limit_bytes: u64) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO tiers (id, name, limit_bytes) VALUES (?1, ?2, ?3)",
                params![tier_id, name, limit_bytes as i64],
            )?;
            Ok(())
        })
    }

    pub fn ensure_user(&self, owner_id: UserId, tier_id: &str) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO users (id, tier_id, used_bytes) VALUES (?1, ?2, 0)",
                params![owner_id.to_string(), tier_id],
            )?;
            Ok(())
        })
    }

    /// Debits `amount` bytes iff the user stays within their tier limit.
    /// The check and the debit are one statement, so two racing
    /// reservations can never jointly overshoot the limit.
    pub fn reserve(&self, owner_id: UserId, amount: u64) -> anyhow::Result<()> {
        if amount == 0 {
            return Ok(());
        }
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE users SET used_bytes = used_bytes + ?2 \
                 WHERE id = ?1 AND used_bytes + ?2 <= \
                     (SELECT limit_bytes FROM tiers WHERE tiers.id = users.tier_id)",
                params![owner_id.to_string(), amount as i64],
            )?;
            if updated == 1 {
                return Ok(());
            }
            let mut stmt = conn.prepare("SELECT 1 FROM users WHERE id = ?1")?;
            if !stmt.exists(params![owner_id.to_string()])? {
                anyhow::bail!(user_not_found(owner_id));
            }
            anyhow::bail!(ErrorMetadata::quota_exceeded(format!(
                "storing {amount} more bytes would exceed the storage quota"
            )));
        })
    }

    /// Returns `amount` bytes to the user. Clamped at zero so a compensation
    /// path that over-releases cannot underflow the ledger.
    pub fn release(&self, owner_id: UserId, amount: u64) -> anyhow::Result<()> {
        if amount == 0 {
            return Ok(());
        }
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE users SET used_bytes = MAX(0, used_bytes - ?2) WHERE id = ?1",
                params![owner_id.to_string(), amount as i64],
            )?;
            anyhow::ensure!(updated == 1, user_not_found(owner_id));
            Ok(())
        })
    }

    /// Signed form for update-in-place workflows.
    pub fn adjust(&self, owner_id: UserId, delta: i64) -> anyhow::Result<()> {
        if delta >= 0 {
            self.reserve(owner_id, delta as u64)
        } else {
            self.release(owner_id, delta.unsigned_abs())
        }
    }

    /// Compensation-only variant of [`Database::adjust`]: skips the tier
    /// check so a rollback always lands, clamped at zero. Never use this on
    /// a forward path.
    pub fn force_adjust(&self, owner_id: UserId, delta: i64) -> anyhow::Result<()> {
        if delta == 0 {
            return Ok(());
        }
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE users SET used_bytes = MAX(0, used_bytes + ?2) WHERE id = ?1",
                params![owner_id.to_string(), delta],
            )?;
            anyhow::ensure!(updated == 1, user_not_found(owner_id));
            Ok(())
        })
    }

    pub fn used_bytes(&self, owner_id: UserId) -> anyhow::Result<u64> {
        self.with_conn(|conn| {
            let used: i64 = conn
                .query_row(
                    "SELECT used_bytes FROM users WHERE id = ?1",
                    params![owner_id.to_string()],
                    |row| row.get(0),
                )
                .context(user_not_found(owner_id))?;
            Ok(used as u64)
        })
    }
}

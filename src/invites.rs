//! Invite records. Codes only ever exist in plaintext in memory; everything
//! written to the `invite` table goes through the database's cipher first.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::prelude::GuildId;
use surrealdb::RecordId;
use tokio::sync::Mutex;

use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use crate::queue::InviteLookup;

/// A decrypted invite record.
#[derive(Debug, Clone)]
pub struct InviteRecord {
    pub id: RecordId,
    pub guild_id: GuildId,
    pub code: String,
    pub is_permanent: bool,
    pub is_valid: bool,
    pub is_checked: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InviteRecord {
    /// Validity of a checked record at `now`. Permanent invites never
    /// expire by time; everything else is only valid before `expires_at`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.is_valid && (self.is_permanent || self.expires_at.is_some_and(|at| now < at))
    }
}

/// Outcome of validating a code, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InviteStatus {
    pub expires_at: Option<DateTime<Utc>>,
    pub is_permanent: bool,
    pub is_valid: bool,
}

impl InviteStatus {
    pub fn from_lookup(lookup: Option<&InviteLookup>) -> Self {
        match lookup {
            Some(lookup) => Self {
                expires_at: lookup.expires_at,
                is_permanent: lookup.is_permanent(),
                is_valid: true,
            },
            None => Self {
                expires_at: None,
                is_permanent: false,
                is_valid: false,
            },
        }
    }
}

/// Row filters for [`Database::read_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteFilter {
    /// Checked and currently valid.
    CheckedValid,
    /// Awaiting first validation.
    Unchecked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrder {
    OldestCreated,
    OldestUpdated,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct InviteRow {
    pub(crate) guild_id: GuildId,
    /// Sealed code.
    pub(crate) code: String,
    pub(crate) is_permanent: bool,
    pub(crate) is_valid: bool,
    pub(crate) is_checked: bool,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub(crate) expires_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub(crate) created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub(crate) updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct StoredInvite {
    id: RecordId,
    guild_id: GuildId,
    code: String,
    is_permanent: bool,
    is_valid: bool,
    is_checked: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    updated_at: DateTime<Utc>,
}

impl Database {
    fn open(&self, stored: StoredInvite) -> StoreResult<InviteRecord> {
        Ok(InviteRecord {
            code: self.cipher.open(&stored.code)?,
            id: stored.id,
            guild_id: stored.guild_id,
            is_permanent: stored.is_permanent,
            is_valid: stored.is_valid,
            is_checked: stored.is_checked,
            expires_at: stored.expires_at,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        })
    }

    pub(crate) fn checked_row(
        &self,
        guild_id: GuildId,
        code: &str,
        status: InviteStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<InviteRow> {
        Ok(InviteRow {
            guild_id,
            code: self.cipher.seal(code)?,
            is_permanent: status.is_permanent,
            is_valid: status.is_valid,
            is_checked: true,
            expires_at: status.expires_at,
            created_at: now,
            updated_at: now,
        })
    }

    pub(crate) fn unchecked_row(
        &self,
        guild_id: GuildId,
        code: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<InviteRow> {
        Ok(InviteRow {
            guild_id,
            code: self.cipher.seal(code)?,
            is_permanent: false,
            is_valid: false,
            is_checked: false,
            expires_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub(crate) async fn insert_rows(&self, rows: Vec<InviteRow>) -> StoreResult<Vec<InviteRecord>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut response = self
            .db
            .query("INSERT INTO invite $rows")
            .bind(("rows", rows))
            .await?;
        let stored: Vec<StoredInvite> = response.take(0)?;
        stored.into_iter().map(|s| self.open(s)).collect()
    }

    /// Every known invite for a guild, keyed by plaintext code.
    pub async fn read_guild_invites(
        &self,
        guild_id: GuildId,
    ) -> StoreResult<HashMap<String, InviteRecord>> {
        let mut response = self
            .db
            .query("SELECT * FROM invite WHERE guild_id = $guild_id")
            .bind(("guild_id", guild_id))
            .await?;
        let stored: Vec<StoredInvite> = response.take(0)?;

        let mut invites = HashMap::with_capacity(stored.len());
        for stored in stored {
            let invite = self.open(stored)?;
            invites.insert(invite.code.clone(), invite);
        }
        Ok(invites)
    }

    fn invite_lock(&self, guild_id: GuildId) -> Arc<Mutex<()>> {
        self.invite_locks.entry(guild_id).or_default().clone()
    }

    /// Records a code that has just been validated.
    ///
    /// The passive listener may have stored the same code since the caller
    /// last read the guild, so the records are re-read under the guild's
    /// write lock and an existing one is updated in place.
    pub async fn insert_invite(
        &self,
        guild_id: GuildId,
        code: &str,
        status: InviteStatus,
    ) -> StoreResult<InviteRecord> {
        let lock = self.invite_lock(guild_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.read_guild_invites(guild_id).await?.remove(code) {
            debug!(guild_id = %guild_id, "invite already stored, updating it");
            self.update_invite(&existing.id, status).await?;
            return Ok(InviteRecord {
                is_permanent: status.is_permanent,
                is_valid: status.is_valid,
                is_checked: true,
                expires_at: status.expires_at,
                updated_at: Utc::now(),
                ..existing
            });
        }

        let row = self.checked_row(guild_id, code, status, Utc::now())?;
        self.insert_rows(vec![row])
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::NotWritten("invite"))
    }

    /// Records codes seen in passing, to be validated later.
    ///
    /// Codes the guild already has a record for, and repeats within the
    /// batch, are skipped. Returns how many records were created.
    pub async fn insert_unchecked(&self, pending: &[(GuildId, String)]) -> StoreResult<usize> {
        let mut by_guild: HashMap<GuildId, Vec<&str>> = HashMap::new();
        for (guild_id, code) in pending {
            by_guild.entry(*guild_id).or_default().push(code);
        }

        let now = Utc::now();
        let mut count = 0;
        for (guild_id, codes) in by_guild {
            let lock = self.invite_lock(guild_id);
            let _guard = lock.lock().await;

            let known = self.read_guild_invites(guild_id).await?;
            let mut seen = HashSet::new();
            let mut rows = Vec::new();
            for code in codes {
                if known.contains_key(code) || !seen.insert(code) {
                    continue;
                }
                rows.push(self.unchecked_row(guild_id, code, now)?);
            }
            count += rows.len();
            self.insert_rows(rows).await?;
        }
        Ok(count)
    }

    /// Stores a fresh validation result for an existing record.
    pub async fn update_invite(&self, id: &RecordId, status: InviteStatus) -> StoreResult<()> {
        self.db
            .query(
                "UPDATE $id SET expires_at = $expires_at, is_permanent = $is_permanent, is_valid = $is_valid, is_checked = true, updated_at = $now",
            )
            .bind(("id", id.clone()))
            .bind(("expires_at", status.expires_at.map(|at| at.timestamp_millis())))
            .bind(("is_permanent", status.is_permanent))
            .bind(("is_valid", status.is_valid))
            .bind(("now", Utc::now().timestamp_millis()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn delete_guild_invites(&self, guild_id: GuildId) -> StoreResult<()> {
        self.db
            .query("DELETE invite WHERE guild_id = $guild_id")
            .bind(("guild_id", guild_id))
            .await?
            .check()?;
        Ok(())
    }

    /// Retires every record created more than `retention_days` ago.
    ///
    /// Codes that were still valid come back as new unchecked records, so
    /// they get audited again; everything else is simply dropped. Returns
    /// how many codes were reinserted.
    pub async fn recycle(&self, retention_days: u32) -> StoreResult<usize> {
        self.recycle_before(Utc::now() - Duration::days(i64::from(retention_days)))
            .await
    }

    pub(crate) async fn recycle_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let stale = self.stale_valid(cutoff).await?;
        self.retire(cutoff, stale).await
    }

    /// Valid records created at or before `cutoff`.
    pub(crate) async fn stale_valid(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<InviteRecord>> {
        let mut response = self
            .db
            .query("SELECT * FROM invite WHERE is_valid = true AND created_at <= $cutoff")
            .bind(("cutoff", cutoff.timestamp_millis()))
            .await?;
        let stored: Vec<StoredInvite> = response.take(0)?;
        stored.into_iter().map(|s| self.open(s)).collect()
    }

    /// Deletes the old invalid records plus exactly the `stale` ones, and
    /// reinserts each stale code once as unchecked.
    ///
    /// A record that turned valid after `stale` was read is left alone; the
    /// next pass picks it up.
    pub(crate) async fn retire(
        &self,
        cutoff: DateTime<Utc>,
        stale: Vec<InviteRecord>,
    ) -> StoreResult<usize> {
        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(stale.len());
        let mut rows = Vec::with_capacity(stale.len());
        for invite in stale {
            if seen.insert((invite.guild_id, invite.code.clone())) {
                rows.push(self.unchecked_row(invite.guild_id, &invite.code, now)?);
            }
            ids.push(invite.id);
        }
        let count = rows.len();

        // Delete and reinsert atomically so a crash cannot lose the codes.
        let query = if rows.is_empty() {
            "DELETE invite WHERE created_at <= $cutoff AND is_valid = false"
        } else {
            "BEGIN TRANSACTION; DELETE invite WHERE created_at <= $cutoff AND (is_valid = false OR id IN $stale); INSERT INTO invite $rows; COMMIT TRANSACTION;"
        };
        self.db
            .query(query)
            .bind(("cutoff", cutoff.timestamp_millis()))
            .bind(("stale", ids))
            .bind(("rows", rows))
            .await?
            .check()?;

        debug!(reinserted = count, "recycled invites");
        Ok(count)
    }

    /// Paginated read for maintenance sweeps.
    pub async fn read_batch(
        &self,
        filter: InviteFilter,
        limit: usize,
        order: BatchOrder,
    ) -> StoreResult<Vec<InviteRecord>> {
        let query = match (filter, order) {
            (InviteFilter::CheckedValid, BatchOrder::OldestCreated) => {
                "SELECT * FROM invite WHERE is_checked = true AND is_valid = true ORDER BY created_at ASC LIMIT $limit"
            }
            (InviteFilter::CheckedValid, BatchOrder::OldestUpdated) => {
                "SELECT * FROM invite WHERE is_checked = true AND is_valid = true ORDER BY updated_at ASC LIMIT $limit"
            }
            (InviteFilter::Unchecked, BatchOrder::OldestCreated) => {
                "SELECT * FROM invite WHERE is_checked = false ORDER BY created_at ASC LIMIT $limit"
            }
            (InviteFilter::Unchecked, BatchOrder::OldestUpdated) => {
                "SELECT * FROM invite WHERE is_checked = false ORDER BY updated_at ASC LIMIT $limit"
            }
        };
        let mut response = self
            .db
            .query(query)
            .bind(("limit", limit as i64))
            .await?;
        let stored: Vec<StoredInvite> = response.take(0)?;
        stored.into_iter().map(|s| self.open(s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::memory_database;

    const GUILD: GuildId = GuildId(42);

    fn checked(is_valid: bool, is_permanent: bool, expires_at: Option<DateTime<Utc>>) -> InviteRecord {
        InviteRecord {
            id: RecordId::from_table_key("invite", "x"),
            guild_id: GUILD,
            code: "x".into(),
            is_permanent,
            is_valid,
            is_checked: true,
            expires_at,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn permanent_invites_never_expire_by_time() {
        let invite = checked(true, true, None);
        let far_future = Utc::now() + Duration::days(365 * 50);
        assert!(invite.is_valid_at(far_future));

        let invalid = checked(false, true, None);
        assert!(!invalid.is_valid_at(Utc::now()));
    }

    #[test]
    fn temporary_invites_expire() {
        let expires = Utc::now() + Duration::hours(1);
        let invite = checked(true, false, Some(expires));

        assert!(invite.is_valid_at(expires - Duration::minutes(1)));
        assert!(!invite.is_valid_at(expires));
        assert!(!invite.is_valid_at(expires + Duration::days(1)));
        assert!(!checked(true, false, None).is_valid_at(Utc::now()));
    }

    #[tokio::test]
    async fn codes_are_sealed_at_rest() {
        let db = memory_database().await;
        db.insert_invite(GUILD, "plaintext-code", InviteStatus::from_lookup(Some(&InviteLookup::default())))
            .await
            .unwrap();

        let mut response = db.db.query("SELECT VALUE code FROM invite").await.unwrap();
        let raw: Vec<String> = response.take(0).unwrap();
        assert_eq!(raw.len(), 1);
        assert!(!raw[0].contains("plaintext-code"));

        let invites = db.read_guild_invites(GUILD).await.unwrap();
        let invite = &invites["plaintext-code"];
        assert!(invite.is_checked && invite.is_valid && invite.is_permanent);
    }

    #[tokio::test]
    async fn unchecked_insert_skips_known_codes() {
        let db = memory_database().await;
        db.insert_invite(GUILD, "known", InviteStatus::from_lookup(None))
            .await
            .unwrap();

        let inserted = db
            .insert_unchecked(&[
                (GUILD, "known".into()),
                (GUILD, "fresh".into()),
                (GUILD, "fresh".into()),
                (GuildId(7), "known".into()),
            ])
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let invites = db.read_guild_invites(GUILD).await.unwrap();
        assert_eq!(invites.len(), 2);
        assert!(!invites["fresh"].is_checked);
        assert!(invites["known"].is_checked);
        assert_eq!(db.read_guild_invites(GuildId(7)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn validated_code_reuses_record_stored_meanwhile() {
        let db = memory_database().await;
        db.insert_unchecked(&[(GUILD, "late".into())]).await.unwrap();

        let valid = InviteStatus { expires_at: None, is_permanent: true, is_valid: true };
        let record = db.insert_invite(GUILD, "late", valid).await.unwrap();
        assert!(record.is_checked && record.is_valid);

        let mut response = db.db.query("SELECT VALUE id FROM invite").await.unwrap();
        let ids: Vec<RecordId> = response.take(0).unwrap();
        assert_eq!(ids, vec![record.id]);

        // And the other way round: nothing new once the code is known.
        assert_eq!(db.insert_unchecked(&[(GUILD, "late".into())]).await.unwrap(), 0);
        assert!(db.read_guild_invites(GUILD).await.unwrap()["late"].is_checked);
    }

    #[tokio::test]
    async fn update_marks_checked() {
        let db = memory_database().await;
        db.insert_unchecked(&[(GUILD, "pending".into())]).await.unwrap();
        let before = db.read_guild_invites(GUILD).await.unwrap().remove("pending").unwrap();

        let expires = Utc::now() + Duration::days(1);
        db.update_invite(
            &before.id,
            InviteStatus { expires_at: Some(expires), is_permanent: false, is_valid: true },
        )
        .await
        .unwrap();

        let after = db.read_guild_invites(GUILD).await.unwrap().remove("pending").unwrap();
        assert!(after.is_checked && after.is_valid && !after.is_permanent);
        assert_eq!(after.expires_at.map(|t| t.timestamp_millis()), Some(expires.timestamp_millis()));
        assert!(after.updated_at >= before.updated_at);
    }

    #[tokio::test]
    async fn recycle_reinserts_only_old_valid_codes() {
        let db = memory_database().await;
        let long_ago = Utc::now() - Duration::days(40);
        let valid = InviteStatus { expires_at: None, is_permanent: true, is_valid: true };
        let invalid = InviteStatus::from_lookup(None);

        db.insert_rows(vec![
            db.checked_row(GUILD, "old-valid", valid, long_ago).unwrap(),
            db.checked_row(GUILD, "old-invalid", invalid, long_ago).unwrap(),
            db.checked_row(GUILD, "new-valid", valid, Utc::now()).unwrap(),
        ])
        .await
        .unwrap();

        assert_eq!(db.recycle(30).await.unwrap(), 1);

        let invites = db.read_guild_invites(GUILD).await.unwrap();
        let mut codes: Vec<&str> = invites.keys().map(String::as_str).collect();
        codes.sort_unstable();
        assert_eq!(codes, vec!["new-valid", "old-valid"]);
        assert!(!invites["old-valid"].is_checked);
        assert!(invites["old-valid"].created_at > long_ago);
        assert!(invites["new-valid"].is_checked);

        // Nothing left old enough for a second pass.
        assert_eq!(db.recycle(30).await.unwrap(), 0);
        assert_eq!(db.read_guild_invites(GUILD).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn retire_spares_records_revalidated_after_selection() {
        let db = memory_database().await;
        let long_ago = Utc::now() - Duration::days(40);
        let cutoff = Utc::now() - Duration::days(30);
        let valid = InviteStatus { expires_at: None, is_permanent: true, is_valid: true };

        let rows = db
            .insert_rows(vec![
                db.checked_row(GUILD, "old-valid", valid, long_ago).unwrap(),
                db.checked_row(GUILD, "flipped", InviteStatus::from_lookup(None), long_ago).unwrap(),
            ])
            .await
            .unwrap();
        let flipped = rows.iter().find(|r| r.code == "flipped").unwrap();

        let stale = db.stale_valid(cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        db.update_invite(&flipped.id, valid).await.unwrap();

        assert_eq!(db.retire(cutoff, stale).await.unwrap(), 1);

        let invites = db.read_guild_invites(GUILD).await.unwrap();
        assert_eq!(invites.len(), 2);
        assert!(!invites["old-valid"].is_checked);
        assert_eq!(invites["flipped"].id, flipped.id);
        assert!(invites["flipped"].is_valid);

        // The survivor is old and valid, so the next pass recycles it.
        assert_eq!(db.recycle_before(cutoff).await.unwrap(), 1);
        assert!(!db.read_guild_invites(GUILD).await.unwrap()["flipped"].is_checked);
    }

    #[tokio::test]
    async fn read_batch_filters_and_orders() {
        let db = memory_database().await;
        let now = Utc::now();
        let valid = InviteStatus { expires_at: None, is_permanent: true, is_valid: true };

        db.insert_rows(vec![
            db.checked_row(GUILD, "newer", valid, now - Duration::hours(1)).unwrap(),
            db.checked_row(GUILD, "older", valid, now - Duration::hours(2)).unwrap(),
            db.checked_row(GUILD, "dead", InviteStatus::from_lookup(None), now).unwrap(),
            db.unchecked_row(GUILD, "waiting", now).unwrap(),
        ])
        .await
        .unwrap();

        let checked = db
            .read_batch(InviteFilter::CheckedValid, 10, BatchOrder::OldestUpdated)
            .await
            .unwrap();
        let codes: Vec<&str> = checked.iter().map(|i| i.code.as_str()).collect();
        assert_eq!(codes, vec!["older", "newer"]);

        let limited = db
            .read_batch(InviteFilter::CheckedValid, 1, BatchOrder::OldestCreated)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].code, "older");

        let unchecked = db
            .read_batch(InviteFilter::Unchecked, 10, BatchOrder::OldestCreated)
            .await
            .unwrap();
        assert_eq!(unchecked.len(), 1);
        assert_eq!(unchecked[0].code, "waiting");
    }
}

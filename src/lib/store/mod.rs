/*!
Durable single-writer storage.

Everything the bot persists goes through here: cached messages and their
versions, member join times, avatar state and history, role snapshots,
guild/runtime metadata, the moderation case counter, the typed blob cache
and the per-day counters. Other components never touch the database file.
*/

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use twilight_model::id::marker::{
    ChannelMarker, GuildMarker, MessageMarker, RoleMarker, UserMarker,
};
use twilight_model::id::Id;

use crate::utils::day_key;
use crate::utils::prelude::*;

mod schema;

/// Runtime metadata key for the liveness heartbeat.
pub const META_HEARTBEAT: &str = "heartbeat";
/// Runtime metadata key for the last gateway event.
pub const META_LAST_EVENT: &str = "last_event";

/// Storage failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cache entry encoding error")]
    Encoding(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A cached message row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub guild_id: Id<GuildMarker>,
    pub message_id: Id<MessageMarker>,
    pub channel_id: Id<ChannelMarker>,
    pub author_id: Id<UserMarker>,
    pub author_username: String,
    pub author_avatar: Option<String>,
    pub content: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Kind of event that produced a message version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEventType {
    Create,
    Edit,
    Delete,
}

impl MessageEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Delete => "delete",
        }
    }

    fn from_str(text: &str) -> Option<Self> {
        match text {
            "create" => Some(Self::Create),
            "edit" => Some(Self::Edit),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Append-only message revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageVersion {
    pub guild_id: Id<GuildMarker>,
    pub message_id: Id<MessageMarker>,
    /// Non-positive means "assign the next version number".
    pub version: i64,
    pub event_type: MessageEventType,
    pub content: String,
    pub attachment_count: u32,
    pub embed_count: u32,
    pub sticker_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Avatar transition row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarChange {
    pub old_hash: String,
    pub new_hash: String,
    pub changed_at: DateTime<Utc>,
}

/// Per-guild bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildMeta {
    pub bot_since: DateTime<Utc>,
    pub owner_id: Option<Id<UserMarker>>,
}

/// Typed blob cache row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub entry_type: String,
    pub data: serde_json::Value,
    pub cached_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Embedded SQL store. Single writer, shared by reference.
pub struct Store {
    conn: Mutex<Connection>,
}

fn to_unix(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

fn parse_id<T>(text: &str) -> Option<Id<T>> {
    text.parse::<u64>().ok().and_then(Id::new_checked)
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::init(Connection::open(path)?)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(schema::SCHEMA)?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    // ---- messages ----

    /// Write-through a message, replacing all columns on conflict.
    pub fn upsert_message(&self, record: &MessageRecord) -> StoreResult<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO messages \
             (guild_id, message_id, channel_id, author_id, author_username, author_avatar, \
              content, cached_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.guild_id.to_string(),
                record.message_id.to_string(),
                record.channel_id.to_string(),
                record.author_id.to_string(),
                record.author_username,
                record.author_avatar,
                record.content,
                to_unix(record.cached_at),
                record.expires_at.map(to_unix),
            ],
        )?;

        Ok(())
    }

    /// Fetch a message, expired rows are invisible.
    pub fn get_message(
        &self,
        guild_id: Id<GuildMarker>,
        message_id: Id<MessageMarker>,
    ) -> StoreResult<Option<MessageRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT guild_id, message_id, channel_id, author_id, author_username, \
                        author_avatar, content, cached_at, expires_at \
                 FROM messages \
                 WHERE guild_id = ?1 AND message_id = ?2 \
                   AND (expires_at IS NULL OR expires_at > ?3)",
                params![
                    guild_id.to_string(),
                    message_id.to_string(),
                    to_unix(Utc::now())
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, Option<i64>>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((g, m, c, a, name, avatar, content, cached, expires)) = row else {
            return Ok(None);
        };

        let record = (|| {
            Some(MessageRecord {
                guild_id: parse_id(&g)?,
                message_id: parse_id(&m)?,
                channel_id: parse_id(&c)?,
                author_id: parse_id(&a)?,
                author_username: name,
                author_avatar: avatar,
                content,
                cached_at: from_unix(cached),
                expires_at: expires.map(from_unix),
            })
        })();

        Ok(record)
    }

    /// Idempotent delete.
    pub fn delete_message(
        &self,
        guild_id: Id<GuildMarker>,
        message_id: Id<MessageMarker>,
    ) -> StoreResult<()> {
        self.conn.lock().execute(
            "DELETE FROM messages WHERE guild_id = ?1 AND message_id = ?2",
            params![guild_id.to_string(), message_id.to_string()],
        )?;

        Ok(())
    }

    /// Reap rows whose TTL has passed. Returns the number deleted.
    pub fn cleanup_expired_messages(&self) -> StoreResult<usize> {
        let deleted = self.conn.lock().execute(
            "DELETE FROM messages WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![to_unix(Utc::now())],
        )?;

        Ok(deleted)
    }

    /// Append a message version. A non-positive version gets the next number.
    pub fn insert_message_version(&self, version: &MessageVersion) -> StoreResult<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let number = if version.version > 0 {
            version.version
        } else {
            tx.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM message_versions \
                 WHERE guild_id = ?1 AND message_id = ?2",
                params![
                    version.guild_id.to_string(),
                    version.message_id.to_string()
                ],
                |row| row.get(0),
            )?
        };

        tx.execute(
            "INSERT INTO message_versions \
             (guild_id, message_id, version, event_type, content, \
              attachment_count, embed_count, sticker_count, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                version.guild_id.to_string(),
                version.message_id.to_string(),
                number,
                version.event_type.as_str(),
                version.content,
                version.attachment_count,
                version.embed_count,
                version.sticker_count,
                to_unix(version.created_at),
            ],
        )?;
        tx.commit()?;

        Ok(number)
    }

    /// All versions of a message, oldest first.
    pub fn get_message_versions(
        &self,
        guild_id: Id<GuildMarker>,
        message_id: Id<MessageMarker>,
    ) -> StoreResult<Vec<MessageVersion>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT version, event_type, content, attachment_count, embed_count, \
                    sticker_count, created_at \
             FROM message_versions \
             WHERE guild_id = ?1 AND message_id = ?2 \
             ORDER BY version ASC",
        )?;

        let rows = stmt.query_map(
            params![guild_id.to_string(), message_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )?;

        let mut versions = Vec::new();
        for row in rows {
            let (number, kind, content, attachments, embeds, stickers, created) = row?;
            let Some(event_type) = MessageEventType::from_str(&kind) else {
                continue;
            };
            versions.push(MessageVersion {
                guild_id,
                message_id,
                version: number,
                event_type,
                content,
                attachment_count: attachments,
                embed_count: embeds,
                sticker_count: stickers,
                created_at: from_unix(created),
            });
        }

        Ok(versions)
    }

    // ---- member joins ----

    /// Record a join time, keeping the earliest value seen.
    pub fn upsert_member_join(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
        joined_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.conn.lock().execute(
            "INSERT INTO member_joins (guild_id, user_id, joined_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT (guild_id, user_id) \
             DO UPDATE SET joined_at = MIN(joined_at, excluded.joined_at)",
            params![
                guild_id.to_string(),
                user_id.to_string(),
                to_unix(joined_at)
            ],
        )?;

        Ok(())
    }

    pub fn get_member_join(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let at = self
            .conn
            .lock()
            .query_row(
                "SELECT joined_at FROM member_joins WHERE guild_id = ?1 AND user_id = ?2",
                params![guild_id.to_string(), user_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;

        Ok(at.map(from_unix))
    }

    /// The whole guild-wide join mapping.
    pub fn get_all_member_joins(
        &self,
        guild_id: Id<GuildMarker>,
    ) -> StoreResult<HashMap<Id<UserMarker>, DateTime<Utc>>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT user_id, joined_at FROM member_joins WHERE guild_id = ?1")?;

        let rows = stmt.query_map(params![guild_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut joins = HashMap::new();
        for row in rows {
            let (user, at) = row?;
            if let Some(user) = parse_id(&user) {
                joins.insert(user, from_unix(at));
            }
        }

        Ok(joins)
    }

    /// Join rows are never deleted; tenure for members leaving arbitrarily
    /// later depends on them. Reports how many rows a purge would touch.
    pub fn cleanup_obsolete_member_joins(&self, guild_id: Id<GuildMarker>) -> StoreResult<usize> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM member_joins WHERE guild_id = ?1",
            params![guild_id.to_string()],
            |row| row.get(0),
        )?;
        debug!("Keeping {count} member join rows for guild {guild_id}");

        Ok(0)
    }

    // ---- avatars ----

    /// Update the current avatar. Returns `(changed, old_hash)`; on a real
    /// transition the history row is appended in the same transaction.
    pub fn upsert_avatar(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
        new_hash: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<(bool, Option<String>)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let old: Option<String> = tx
            .query_row(
                "SELECT avatar_hash FROM avatars WHERE guild_id = ?1 AND user_id = ?2",
                params![guild_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        if old.as_deref() == Some(new_hash) {
            return Ok((false, old));
        }

        tx.execute(
            "INSERT OR REPLACE INTO avatars (guild_id, user_id, avatar_hash, updated_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                guild_id.to_string(),
                user_id.to_string(),
                new_hash,
                to_unix(at)
            ],
        )?;

        if let Some(old_hash) = &old {
            tx.execute(
                "INSERT INTO avatar_history (guild_id, user_id, old_hash, new_hash, changed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    guild_id.to_string(),
                    user_id.to_string(),
                    old_hash,
                    new_hash,
                    to_unix(at)
                ],
            )?;
        }

        tx.commit()?;

        Ok((true, old))
    }

    pub fn get_avatar(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
    ) -> StoreResult<Option<(String, DateTime<Utc>)>> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT avatar_hash, updated_at FROM avatars \
                 WHERE guild_id = ?1 AND user_id = ?2",
                params![guild_id.to_string(), user_id.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        Ok(row.map(|(hash, at)| (hash, from_unix(at))))
    }

    /// Avatar transitions for a member, oldest first.
    pub fn get_avatar_history(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
    ) -> StoreResult<Vec<AvatarChange>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT old_hash, new_hash, changed_at FROM avatar_history \
             WHERE guild_id = ?1 AND user_id = ?2 \
             ORDER BY changed_at ASC, id ASC",
        )?;

        let rows = stmt.query_map(
            params![guild_id.to_string(), user_id.to_string()],
            |row| {
                Ok(AvatarChange {
                    old_hash: row.get(0)?,
                    new_hash: row.get(1)?,
                    changed_at: from_unix(row.get(2)?),
                })
            },
        )?;

        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Drop history rows older than `days`.
    pub fn cleanup_avatar_history(&self, days: i64) -> StoreResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let deleted = self.conn.lock().execute(
            "DELETE FROM avatar_history WHERE changed_at < ?1",
            params![to_unix(cutoff)],
        )?;

        Ok(deleted)
    }

    // ---- role snapshots ----

    /// Transactional replace of a member's role set.
    pub fn upsert_member_roles(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
        roles: &HashSet<Id<RoleMarker>>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM member_roles WHERE guild_id = ?1 AND user_id = ?2",
            params![guild_id.to_string(), user_id.to_string()],
        )?;

        for role in roles {
            tx.execute(
                "INSERT INTO member_roles (guild_id, user_id, role_id, updated_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    guild_id.to_string(),
                    user_id.to_string(),
                    role.to_string(),
                    to_unix(at)
                ],
            )?;
        }

        tx.commit()?;

        Ok(())
    }

    pub fn get_member_roles(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
    ) -> StoreResult<HashSet<Id<RoleMarker>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT role_id FROM member_roles WHERE guild_id = ?1 AND user_id = ?2",
        )?;

        let rows = stmt.query_map(
            params![guild_id.to_string(), user_id.to_string()],
            |row| row.get::<_, String>(0),
        )?;

        let mut roles = HashSet::new();
        for row in rows {
            if let Some(role) = parse_id(&row?) {
                roles.insert(role);
            }
        }

        Ok(roles)
    }

    /// Role snapshots for every member of a guild.
    pub fn get_all_member_roles(
        &self,
        guild_id: Id<GuildMarker>,
    ) -> StoreResult<HashMap<Id<UserMarker>, HashSet<Id<RoleMarker>>>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT user_id, role_id FROM member_roles WHERE guild_id = ?1")?;

        let rows = stmt.query_map(params![guild_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut map: HashMap<Id<UserMarker>, HashSet<Id<RoleMarker>>> = HashMap::new();
        for row in rows {
            let (user, role) = row?;
            if let (Some(user), Some(role)) = (parse_id(&user), parse_id(&role)) {
                map.entry(user).or_default().insert(role);
            }
        }

        Ok(map)
    }

    /// Set difference of `current` against the stored snapshot.
    pub fn diff_member_roles(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
        current: &HashSet<Id<RoleMarker>>,
    ) -> StoreResult<(Vec<Id<RoleMarker>>, Vec<Id<RoleMarker>>)> {
        let stored = self.get_member_roles(guild_id, user_id)?;

        let mut added: Vec<_> = current.difference(&stored).copied().collect();
        let mut removed: Vec<_> = stored.difference(current).copied().collect();
        added.sort_unstable_by_key(|id| id.get());
        removed.sort_unstable_by_key(|id| id.get());

        Ok((added, removed))
    }

    // ---- guild / runtime metadata ----

    /// Record guild bookkeeping. `bot_since` keeps the earliest value.
    pub fn upsert_guild_meta(
        &self,
        guild_id: Id<GuildMarker>,
        bot_since: DateTime<Utc>,
        owner_id: Option<Id<UserMarker>>,
    ) -> StoreResult<()> {
        self.conn.lock().execute(
            "INSERT INTO guild_meta (guild_id, bot_since, owner_id) VALUES (?1, ?2, ?3) \
             ON CONFLICT (guild_id) DO UPDATE SET \
                 bot_since = MIN(bot_since, excluded.bot_since), \
                 owner_id = COALESCE(excluded.owner_id, owner_id)",
            params![
                guild_id.to_string(),
                to_unix(bot_since),
                owner_id.map(|id| id.to_string()),
            ],
        )?;

        Ok(())
    }

    pub fn get_guild_meta(&self, guild_id: Id<GuildMarker>) -> StoreResult<Option<GuildMeta>> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT bot_since, owner_id FROM guild_meta WHERE guild_id = ?1",
                params![guild_id.to_string()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;

        Ok(row.map(|(since, owner)| GuildMeta {
            bot_since: from_unix(since),
            owner_id: owner.as_deref().and_then(parse_id),
        }))
    }

    pub fn set_metadata(&self, key: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO runtime_meta (key, at) VALUES (?1, ?2)",
            params![key, to_unix(at)],
        )?;

        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let at = self
            .conn
            .lock()
            .query_row(
                "SELECT at FROM runtime_meta WHERE key = ?1",
                params![key],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;

        Ok(at.map(from_unix))
    }

    pub fn set_heartbeat(&self, at: DateTime<Utc>) -> StoreResult<()> {
        self.set_metadata(META_HEARTBEAT, at)
    }

    pub fn get_heartbeat(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.get_metadata(META_HEARTBEAT)
    }

    pub fn set_last_event(&self, at: DateTime<Utc>) -> StoreResult<()> {
        self.set_metadata(META_LAST_EVENT, at)
    }

    pub fn get_last_event(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.get_metadata(META_LAST_EVENT)
    }

    /// Atomically allocate the next per-guild moderation case number.
    pub fn next_moderation_case_number(&self, guild_id: Id<GuildMarker>) -> StoreResult<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO moderation_cases (guild_id, last_case) VALUES (?1, 0)",
            params![guild_id.to_string()],
        )?;
        tx.execute(
            "UPDATE moderation_cases SET last_case = last_case + 1 WHERE guild_id = ?1",
            params![guild_id.to_string()],
        )?;
        let number = tx.query_row(
            "SELECT last_case FROM moderation_cases WHERE guild_id = ?1",
            params![guild_id.to_string()],
            |row| row.get(0),
        )?;
        tx.commit()?;

        Ok(number)
    }

    // ---- persistent blob cache ----

    pub fn upsert_cache_entry(
        &self,
        key: &str,
        entry_type: &str,
        data: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let now = Utc::now();
        let expires = ttl.map(|ttl| {
            now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero())
        });

        self.conn.lock().execute(
            "INSERT OR REPLACE INTO cache_entries (key, entry_type, data, cached_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key,
                entry_type,
                serde_json::to_string(data)?,
                to_unix(now),
                expires.map(to_unix),
            ],
        )?;

        Ok(())
    }

    pub fn get_cache_entry(&self, key: &str) -> StoreResult<Option<CacheEntry>> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT key, entry_type, data, cached_at, expires_at FROM cache_entries \
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, to_unix(Utc::now())],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((key, entry_type, data, cached, expires)) = row else {
            return Ok(None);
        };

        Ok(Some(CacheEntry {
            key,
            entry_type,
            data: serde_json::from_str(&data)?,
            cached_at: from_unix(cached),
            expires_at: expires.map(from_unix),
        }))
    }

    pub fn get_cache_entries_by_type(&self, entry_type: &str) -> StoreResult<Vec<CacheEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, entry_type, data, cached_at, expires_at FROM cache_entries \
             WHERE entry_type = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        )?;

        let rows = stmt.query_map(params![entry_type, to_unix(Utc::now())], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, entry_type, data, cached, expires) = row?;
            entries.push(CacheEntry {
                key,
                entry_type,
                data: serde_json::from_str(&data)?,
                cached_at: from_unix(cached),
                expires_at: expires.map(from_unix),
            });
        }

        Ok(entries)
    }

    pub fn delete_cache_entry(&self, key: &str) -> StoreResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;

        Ok(())
    }

    pub fn delete_cache_entries_by_prefix(&self, prefix: &str) -> StoreResult<usize> {
        // Escape LIKE wildcards so the prefix matches literally.
        let escaped = prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        let deleted = self.conn.lock().execute(
            "DELETE FROM cache_entries WHERE key LIKE ?1 ESCAPE '\\'",
            params![format!("{escaped}%")],
        )?;

        Ok(deleted)
    }

    pub fn cleanup_expired_cache_entries(&self) -> StoreResult<usize> {
        let deleted = self.conn.lock().execute(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![to_unix(Utc::now())],
        )?;

        Ok(deleted)
    }

    // ---- per-day counters ----

    pub fn increment_daily_message_count(
        &self,
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
        user_id: Id<UserMarker>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.conn.lock().execute(
            "INSERT INTO daily_message_counts (guild_id, channel_id, user_id, day, count) \
             VALUES (?1, ?2, ?3, ?4, 1) \
             ON CONFLICT (guild_id, channel_id, user_id, day) \
             DO UPDATE SET count = count + 1",
            params![
                guild_id.to_string(),
                channel_id.to_string(),
                user_id.to_string(),
                day_key(at)
            ],
        )?;

        Ok(())
    }

    pub fn increment_daily_reaction_count(
        &self,
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
        user_id: Id<UserMarker>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.conn.lock().execute(
            "INSERT INTO daily_reaction_counts (guild_id, channel_id, user_id, day, count) \
             VALUES (?1, ?2, ?3, ?4, 1) \
             ON CONFLICT (guild_id, channel_id, user_id, day) \
             DO UPDATE SET count = count + 1",
            params![
                guild_id.to_string(),
                channel_id.to_string(),
                user_id.to_string(),
                day_key(at)
            ],
        )?;

        Ok(())
    }

    pub fn increment_daily_join_count(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.conn.lock().execute(
            "INSERT INTO daily_join_counts (guild_id, user_id, day, count) \
             VALUES (?1, ?2, ?3, 1) \
             ON CONFLICT (guild_id, user_id, day) DO UPDATE SET count = count + 1",
            params![guild_id.to_string(), user_id.to_string(), day_key(at)],
        )?;

        Ok(())
    }

    pub fn increment_daily_leave_count(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.conn.lock().execute(
            "INSERT INTO daily_leave_counts (guild_id, user_id, day, count) \
             VALUES (?1, ?2, ?3, 1) \
             ON CONFLICT (guild_id, user_id, day) DO UPDATE SET count = count + 1",
            params![guild_id.to_string(), user_id.to_string(), day_key(at)],
        )?;

        Ok(())
    }

    pub fn get_daily_message_count(
        &self,
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
        user_id: Id<UserMarker>,
        day: &str,
    ) -> StoreResult<u64> {
        let count = self
            .conn
            .lock()
            .query_row(
                "SELECT count FROM daily_message_counts \
                 WHERE guild_id = ?1 AND channel_id = ?2 AND user_id = ?3 AND day = ?4",
                params![
                    guild_id.to_string(),
                    channel_id.to_string(),
                    user_id.to_string(),
                    day
                ],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;

        Ok(count.unwrap_or(0).max(0) as u64)
    }

    pub fn get_daily_join_count(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
        day: &str,
    ) -> StoreResult<u64> {
        let count = self
            .conn
            .lock()
            .query_row(
                "SELECT count FROM daily_join_counts \
                 WHERE guild_id = ?1 AND user_id = ?2 AND day = ?3",
                params![guild_id.to_string(), user_id.to_string(), day],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;

        Ok(count.unwrap_or(0).max(0) as u64)
    }

    pub fn get_daily_leave_count(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
        day: &str,
    ) -> StoreResult<u64> {
        let count = self
            .conn
            .lock()
            .query_row(
                "SELECT count FROM daily_leave_counts \
                 WHERE guild_id = ?1 AND user_id = ?2 AND day = ?3",
                params![guild_id.to_string(), user_id.to_string(), day],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;

        Ok(count.unwrap_or(0).max(0) as u64)
    }

    pub fn get_daily_reaction_count(
        &self,
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
        user_id: Id<UserMarker>,
        day: &str,
    ) -> StoreResult<u64> {
        let count = self
            .conn
            .lock()
            .query_row(
                "SELECT count FROM daily_reaction_counts \
                 WHERE guild_id = ?1 AND channel_id = ?2 AND user_id = ?3 AND day = ?4",
                params![
                    guild_id.to_string(),
                    channel_id.to_string(),
                    user_id.to_string(),
                    day
                ],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;

        Ok(count.unwrap_or(0).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    fn store() -> Store {
        Store::open_in_memory().expect("in-memory store")
    }

    fn gid(n: u64) -> Id<GuildMarker> {
        Id::new(n)
    }

    fn uid(n: u64) -> Id<UserMarker> {
        Id::new(n)
    }

    fn rid(n: u64) -> Id<RoleMarker> {
        Id::new(n)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        from_unix(secs)
    }

    #[test]
    fn member_join_keeps_minimum() {
        let store = store();
        let (g, u) = (gid(1), uid(2));

        store.upsert_member_join(g, u, at(1_000)).unwrap();
        store.upsert_member_join(g, u, at(2_000)).unwrap();
        assert_eq!(store.get_member_join(g, u).unwrap(), Some(at(1_000)));

        // An earlier observation wins.
        store.upsert_member_join(g, u, at(500)).unwrap();
        assert_eq!(store.get_member_join(g, u).unwrap(), Some(at(500)));
    }

    #[test]
    fn member_join_cleanup_is_a_no_op() {
        let store = store();
        store.upsert_member_join(gid(1), uid(2), at(1_000)).unwrap();

        assert_eq!(store.cleanup_obsolete_member_joins(gid(1)).unwrap(), 0);
        assert_eq!(store.get_member_join(gid(1), uid(2)).unwrap(), Some(at(1_000)));
    }

    #[test]
    fn avatar_history_tracks_transitions() {
        let store = store();
        let (g, u) = (gid(1), uid(2));

        let (changed, old) = store.upsert_avatar(g, u, "h0", at(10)).unwrap();
        assert!(changed);
        assert_eq!(old, None);

        // Same hash is not a transition.
        let (changed, old) = store.upsert_avatar(g, u, "h0", at(20)).unwrap();
        assert!(!changed);
        assert_eq!(old.as_deref(), Some("h0"));

        store.upsert_avatar(g, u, "h1", at(30)).unwrap();
        store.upsert_avatar(g, u, "h2", at(40)).unwrap();

        let history = store.get_avatar_history(g, u).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].old_hash, "h0");
        assert_eq!(history[0].new_hash, "h1");
        assert_eq!(history[1].old_hash, "h1");
        assert_eq!(history[1].new_hash, "h2");

        let (hash, _) = store.get_avatar(g, u).unwrap().unwrap();
        assert_eq!(hash, "h2");
    }

    #[test]
    fn role_snapshot_replace_and_diff() {
        let store = store();
        let (g, u) = (gid(1), uid(2));

        let initial: HashSet<_> = [rid(10), rid(11)].into();
        store.upsert_member_roles(g, u, &initial, at(100)).unwrap();
        assert_eq!(store.get_member_roles(g, u).unwrap(), initial);

        let current: HashSet<_> = [rid(11), rid(12)].into();
        let (added, removed) = store.diff_member_roles(g, u, &current).unwrap();
        assert_eq!(added, vec![rid(12)]);
        assert_eq!(removed, vec![rid(10)]);

        store.upsert_member_roles(g, u, &current, at(200)).unwrap();
        assert_eq!(store.get_member_roles(g, u).unwrap(), current);

        let (added, removed) = store.diff_member_roles(g, u, &current).unwrap();
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn message_roundtrip_and_ttl() {
        let store = store();
        let record = MessageRecord {
            guild_id: gid(1),
            message_id: Id::new(99),
            channel_id: Id::new(5),
            author_id: uid(7),
            author_username: "alice".to_string(),
            author_avatar: Some("hash".to_string()),
            content: "hello".to_string(),
            cached_at: Utc::now(),
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
        };

        store.upsert_message(&record).unwrap();
        let got = store.get_message(gid(1), Id::new(99)).unwrap().unwrap();
        assert_eq!(got.content, "hello");

        // Expired rows are invisible and reaped.
        let expired = MessageRecord {
            message_id: Id::new(100),
            expires_at: Some(Utc::now() - ChronoDuration::hours(1)),
            ..record
        };
        store.upsert_message(&expired).unwrap();
        assert!(store.get_message(gid(1), Id::new(100)).unwrap().is_none());
        assert_eq!(store.cleanup_expired_messages().unwrap(), 1);

        // Delete is idempotent.
        store.delete_message(gid(1), Id::new(99)).unwrap();
        store.delete_message(gid(1), Id::new(99)).unwrap();
        assert!(store.get_message(gid(1), Id::new(99)).unwrap().is_none());
    }

    #[test]
    fn message_versions_are_monotonic() {
        let store = store();
        let base = MessageVersion {
            guild_id: gid(1),
            message_id: Id::new(50),
            version: 0,
            event_type: MessageEventType::Create,
            content: "a".to_string(),
            attachment_count: 0,
            embed_count: 0,
            sticker_count: 0,
            created_at: at(1_000),
        };

        assert_eq!(store.insert_message_version(&base).unwrap(), 1);
        let edit = MessageVersion {
            event_type: MessageEventType::Edit,
            content: "b".to_string(),
            ..base.clone()
        };
        assert_eq!(store.insert_message_version(&edit).unwrap(), 2);

        let versions = store.get_message_versions(gid(1), Id::new(50)).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, 1);
        assert_eq!(versions[0].event_type, MessageEventType::Create);
        assert_eq!(versions[1].version, 2);
        assert_eq!(versions[1].content, "b");
    }

    #[test]
    fn case_numbers_are_strictly_monotone() {
        let store = store();
        let mut last = 0;
        for _ in 0..10 {
            let number = store.next_moderation_case_number(gid(1)).unwrap();
            assert!(number > last);
            last = number;
        }
        // Independent per guild.
        assert_eq!(store.next_moderation_case_number(gid(2)).unwrap(), 1);
    }

    #[test]
    fn metadata_roundtrip() {
        let store = store();
        assert_eq!(store.get_metadata("missing").unwrap(), None);

        store.set_metadata("k", at(42)).unwrap();
        assert_eq!(store.get_metadata("k").unwrap(), Some(at(42)));
        // Same write is a no-op on the stored value.
        store.set_metadata("k", at(42)).unwrap();
        assert_eq!(store.get_metadata("k").unwrap(), Some(at(42)));

        store.set_heartbeat(at(7)).unwrap();
        assert_eq!(store.get_heartbeat().unwrap(), Some(at(7)));
        store.set_last_event(at(8)).unwrap();
        assert_eq!(store.get_last_event().unwrap(), Some(at(8)));
    }

    #[test]
    fn guild_meta_keeps_earliest_bot_since() {
        let store = store();
        store.upsert_guild_meta(gid(1), at(1_000), Some(uid(9))).unwrap();
        store.upsert_guild_meta(gid(1), at(500), None).unwrap();
        store.upsert_guild_meta(gid(1), at(2_000), Some(uid(10))).unwrap();

        let meta = store.get_guild_meta(gid(1)).unwrap().unwrap();
        assert_eq!(meta.bot_since, at(500));
        assert_eq!(meta.owner_id, Some(uid(10)));
    }

    #[test]
    fn cache_entries_expire_and_prefix_delete() {
        let store = store();
        let data = serde_json::json!({"v": 1});

        store.upsert_cache_entry("a:1", "t", &data, None).unwrap();
        store.upsert_cache_entry("a:2", "t", &data, Some(Duration::from_secs(3600))).unwrap();
        store.upsert_cache_entry("b:1", "t", &data, Some(Duration::ZERO)).unwrap();

        assert!(store.get_cache_entry("a:1").unwrap().is_some());
        assert!(store.get_cache_entry("b:1").unwrap().is_none());
        assert_eq!(store.get_cache_entries_by_type("t").unwrap().len(), 2);

        assert_eq!(store.delete_cache_entries_by_prefix("a:").unwrap(), 2);
        assert!(store.get_cache_entry("a:2").unwrap().is_none());

        assert_eq!(store.cleanup_expired_cache_entries().unwrap(), 1);
    }

    #[test]
    fn daily_counters_increment() {
        let store = store();
        let now = Utc::now();
        let day = day_key(now);
        let (g, c, u) = (gid(1), Id::new(2), uid(3));

        for _ in 0..3 {
            store.increment_daily_message_count(g, c, u, now).unwrap();
        }
        store.increment_daily_reaction_count(g, c, u, now).unwrap();
        store.increment_daily_join_count(g, u, now).unwrap();
        store.increment_daily_leave_count(g, u, now).unwrap();
        store.increment_daily_leave_count(g, u, now).unwrap();

        assert_eq!(store.get_daily_message_count(g, c, u, &day).unwrap(), 3);
        assert_eq!(store.get_daily_reaction_count(g, c, u, &day).unwrap(), 1);
        assert_eq!(store.get_daily_join_count(g, u, &day).unwrap(), 1);
        assert_eq!(store.get_daily_leave_count(g, u, &day).unwrap(), 2);
        assert_eq!(store.get_daily_join_count(g, u, "1999-01-01").unwrap(), 0);
    }
}

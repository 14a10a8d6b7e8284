/*!
Unified in-memory cache.

Four typed tables (members, guilds, roles, channels) with per-table TTL and
size bounds. Entries are lightweight snapshots of the twilight models, so
they can be persisted through the store's blob cache across restarts.
*/

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use twilight_model::channel::{Channel, ChannelType};
use twilight_model::guild::{Guild, Member, Role};
use twilight_model::id::marker::{ChannelMarker, GuildMarker, RoleMarker, UserMarker};
use twilight_model::id::Id;

use crate::store::Store;
use crate::utils::prelude::*;

/// Member snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedMember {
    pub user_id: Id<UserMarker>,
    pub username: String,
    pub avatar: Option<String>,
    pub roles: Vec<Id<RoleMarker>>,
    pub joined_at: Option<i64>,
    pub bot: bool,
}

impl From<&Member> for CachedMember {
    fn from(member: &Member) -> Self {
        Self {
            user_id: member.user.id,
            username: member.user.name.clone(),
            avatar: member.user.avatar.map(|hash| hash.to_string()),
            roles: member.roles.clone(),
            joined_at: Some(member.joined_at.as_secs()),
            bot: member.user.bot,
        }
    }
}

/// Guild snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedGuildMeta {
    pub name: String,
    pub owner_id: Id<UserMarker>,
    pub member_count: Option<u64>,
}

impl From<&Guild> for CachedGuildMeta {
    fn from(guild: &Guild) -> Self {
        Self {
            name: guild.name.clone(),
            owner_id: guild.owner_id,
            member_count: guild.member_count,
        }
    }
}

/// Role snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedRoleMeta {
    pub name: String,
    pub permissions: u64,
    pub managed: bool,
    pub position: i64,
}

impl From<&Role> for CachedRoleMeta {
    fn from(role: &Role) -> Self {
        Self {
            name: role.name.clone(),
            permissions: role.permissions.bits(),
            managed: role.managed,
            position: role.position,
        }
    }
}

/// Channel snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedChannelMeta {
    pub name: Option<String>,
    pub kind: ChannelType,
    pub guild_id: Option<Id<GuildMarker>>,
}

impl From<&Channel> for CachedChannelMeta {
    fn from(channel: &Channel) -> Self {
        Self {
            name: channel.name.clone(),
            kind: channel.kind,
            guild_id: channel.guild_id,
        }
    }
}

struct Entry<T> {
    value: T,
    inserted_at: Instant,
}

/// One semantic table: TTL, size bound, hit/miss counters.
struct Table<K, T> {
    entries: RwLock<HashMap<K, Entry<T>>>,
    ttl: Duration,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Eq + Hash + Clone, T: Clone> Table<K, T> {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn get(&self, key: &K) -> Option<T> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            },
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            },
        }
    }

    fn insert(&self, key: K, value: T) {
        let mut entries = self.entries.write();

        // Over the bound, evict the oldest insertion first.
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(key, Entry { value, inserted_at: Instant::now() });
    }

    fn remove(&self, key: &K) {
        self.entries.write().remove(key);
    }

    fn cleanup(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);

        before - entries.len()
    }

    fn snapshot(&self) -> Vec<(K, T)> {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() < self.ttl)
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    fn stats(&self) -> TableStats {
        TableStats {
            entries: self.entries.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Hit/miss counters for one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub members: TableStats,
    pub guilds: TableStats,
    pub roles: TableStats,
    pub channels: TableStats,
}

/// Tuning knobs, one TTL and bound per table.
#[derive(Debug, Clone, Copy)]
pub struct UnifiedCacheConfig {
    pub member_ttl: Duration,
    pub guild_ttl: Duration,
    pub role_ttl: Duration,
    pub channel_ttl: Duration,
    pub member_capacity: usize,
    pub guild_capacity: usize,
    pub role_capacity: usize,
    pub channel_capacity: usize,
}

impl Default for UnifiedCacheConfig {
    fn default() -> Self {
        Self {
            member_ttl: Duration::from_secs(300),
            guild_ttl: Duration::from_secs(600),
            role_ttl: Duration::from_secs(300),
            channel_ttl: Duration::from_secs(600),
            member_capacity: 10_000,
            guild_capacity: 1_000,
            role_capacity: 5_000,
            channel_capacity: 5_000,
        }
    }
}

const ENTRY_TYPE_MEMBER: &str = "unified:member";
const ENTRY_TYPE_GUILD: &str = "unified:guild";
const ENTRY_TYPE_ROLE: &str = "unified:role";
const ENTRY_TYPE_CHANNEL: &str = "unified:channel";

/// Typed in-memory cache over Discord objects.
pub struct UnifiedCache {
    members: Table<(Id<GuildMarker>, Id<UserMarker>), CachedMember>,
    guilds: Table<Id<GuildMarker>, CachedGuildMeta>,
    roles: Table<(Id<GuildMarker>, Id<RoleMarker>), CachedRoleMeta>,
    channels: Table<Id<ChannelMarker>, CachedChannelMeta>,
}

impl UnifiedCache {
    pub fn new(config: UnifiedCacheConfig) -> Self {
        Self {
            members: Table::new(config.member_ttl, config.member_capacity),
            guilds: Table::new(config.guild_ttl, config.guild_capacity),
            roles: Table::new(config.role_ttl, config.role_capacity),
            channels: Table::new(config.channel_ttl, config.channel_capacity),
        }
    }

    pub fn member(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
    ) -> Option<CachedMember> {
        self.members.get(&(guild_id, user_id))
    }

    pub fn insert_member(&self, guild_id: Id<GuildMarker>, member: CachedMember) {
        self.members.insert((guild_id, member.user_id), member);
    }

    pub fn remove_member(&self, guild_id: Id<GuildMarker>, user_id: Id<UserMarker>) {
        self.members.remove(&(guild_id, user_id));
    }

    pub fn guild(&self, guild_id: Id<GuildMarker>) -> Option<CachedGuildMeta> {
        self.guilds.get(&guild_id)
    }

    pub fn insert_guild(&self, guild_id: Id<GuildMarker>, guild: CachedGuildMeta) {
        self.guilds.insert(guild_id, guild);
    }

    pub fn role(
        &self,
        guild_id: Id<GuildMarker>,
        role_id: Id<RoleMarker>,
    ) -> Option<CachedRoleMeta> {
        self.roles.get(&(guild_id, role_id))
    }

    pub fn insert_role(
        &self,
        guild_id: Id<GuildMarker>,
        role_id: Id<RoleMarker>,
        role: CachedRoleMeta,
    ) {
        self.roles.insert((guild_id, role_id), role);
    }

    pub fn channel(&self, channel_id: Id<ChannelMarker>) -> Option<CachedChannelMeta> {
        self.channels.get(&channel_id)
    }

    pub fn insert_channel(&self, channel_id: Id<ChannelMarker>, channel: CachedChannelMeta) {
        self.channels.insert(channel_id, channel);
    }

    /// Drop expired entries from every table. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        self.members.cleanup()
            + self.guilds.cleanup()
            + self.roles.cleanup()
            + self.channels.cleanup()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            members: self.members.stats(),
            guilds: self.guilds.stats(),
            roles: self.roles.stats(),
            channels: self.channels.stats(),
        }
    }

    /// Write live entries through to the store's blob cache.
    pub fn persist(&self, store: &Store) -> AnyResult<usize> {
        let mut written = 0;

        written += persist_table(
            store,
            ENTRY_TYPE_MEMBER,
            self.members.ttl,
            self.members.snapshot(),
            |(guild, user)| format!("{ENTRY_TYPE_MEMBER}:{guild}:{user}"),
        )?;
        written += persist_table(
            store,
            ENTRY_TYPE_GUILD,
            self.guilds.ttl,
            self.guilds.snapshot(),
            |guild| format!("{ENTRY_TYPE_GUILD}:{guild}"),
        )?;
        written += persist_table(
            store,
            ENTRY_TYPE_ROLE,
            self.roles.ttl,
            self.roles.snapshot(),
            |(guild, role)| format!("{ENTRY_TYPE_ROLE}:{guild}:{role}"),
        )?;
        written += persist_table(
            store,
            ENTRY_TYPE_CHANNEL,
            self.channels.ttl,
            self.channels.snapshot(),
            |channel| format!("{ENTRY_TYPE_CHANNEL}:{channel}"),
        )?;

        Ok(written)
    }

    /// Read persisted entries back in. Expired rows are skipped by the store.
    pub fn warm_up(&self, store: &Store) -> AnyResult<usize> {
        let mut loaded = 0;

        for entry in store.get_cache_entries_by_type(ENTRY_TYPE_MEMBER)? {
            let Some((guild, user)) = parse_key2(&entry.key) else {
                continue;
            };
            if let Ok(member) = serde_json::from_value::<CachedMember>(entry.data) {
                self.members.insert((guild, user), member);
                loaded += 1;
            }
        }

        for entry in store.get_cache_entries_by_type(ENTRY_TYPE_GUILD)? {
            let Some(guild) = parse_key1(&entry.key) else {
                continue;
            };
            if let Ok(meta) = serde_json::from_value::<CachedGuildMeta>(entry.data) {
                self.guilds.insert(guild, meta);
                loaded += 1;
            }
        }

        for entry in store.get_cache_entries_by_type(ENTRY_TYPE_ROLE)? {
            let Some((guild, role)) = parse_key2(&entry.key) else {
                continue;
            };
            if let Ok(meta) = serde_json::from_value::<CachedRoleMeta>(entry.data) {
                self.roles.insert((guild, role), meta);
                loaded += 1;
            }
        }

        for entry in store.get_cache_entries_by_type(ENTRY_TYPE_CHANNEL)? {
            let Some(channel) = parse_key1(&entry.key) else {
                continue;
            };
            if let Ok(meta) = serde_json::from_value::<CachedChannelMeta>(entry.data) {
                self.channels.insert(channel, meta);
                loaded += 1;
            }
        }

        debug!("Warmed up unified cache with {loaded} entries");

        Ok(loaded)
    }
}

impl Default for UnifiedCache {
    fn default() -> Self {
        Self::new(UnifiedCacheConfig::default())
    }
}

fn persist_table<K, T: Serialize + DeserializeOwned>(
    store: &Store,
    entry_type: &str,
    ttl: Duration,
    entries: Vec<(K, T)>,
    key_fn: impl Fn(&K) -> String,
) -> AnyResult<usize> {
    let mut written = 0;
    for (key, value) in entries {
        let data = serde_json::to_value(&value)?;
        store.upsert_cache_entry(&key_fn(&key), entry_type, &data, Some(ttl))?;
        written += 1;
    }

    Ok(written)
}

/// Parse `<type>:<id>` keys.
fn parse_key1<T>(key: &str) -> Option<Id<T>> {
    key.rsplit(':').next()?.parse::<u64>().ok().and_then(Id::new_checked)
}

/// Parse `<type>:<a>:<b>` keys.
fn parse_key2<A, B>(key: &str) -> Option<(Id<A>, Id<B>)> {
    let mut parts = key.rsplit(':');
    let b = parts.next()?.parse::<u64>().ok().and_then(Id::new_checked)?;
    let a = parts.next()?.parse::<u64>().ok().and_then(Id::new_checked)?;

    Some((a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gid(n: u64) -> Id<GuildMarker> {
        Id::new(n)
    }

    fn uid(n: u64) -> Id<UserMarker> {
        Id::new(n)
    }

    fn member(n: u64) -> CachedMember {
        CachedMember {
            user_id: uid(n),
            username: format!("user-{n}"),
            avatar: None,
            roles: Vec::new(),
            joined_at: None,
            bot: false,
        }
    }

    fn small_cache(ttl: Duration, capacity: usize) -> UnifiedCache {
        UnifiedCache::new(UnifiedCacheConfig {
            member_ttl: ttl,
            member_capacity: capacity,
            ..UnifiedCacheConfig::default()
        })
    }

    #[test]
    fn hits_and_misses_are_counted() {
        let cache = small_cache(Duration::from_secs(60), 16);
        cache.insert_member(gid(1), member(1));

        assert!(cache.member(gid(1), uid(1)).is_some());
        assert!(cache.member(gid(1), uid(2)).is_none());

        let stats = cache.stats().members;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn expired_entries_are_invisible_and_cleaned() {
        let cache = small_cache(Duration::ZERO, 16);
        cache.insert_member(gid(1), member(1));

        assert!(cache.member(gid(1), uid(1)).is_none());
        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.stats().members.entries, 0);
    }

    #[test]
    fn eviction_removes_oldest_insertion() {
        let cache = small_cache(Duration::from_secs(60), 2);
        cache.insert_member(gid(1), member(1));
        std::thread::sleep(Duration::from_millis(5));
        cache.insert_member(gid(1), member(2));
        std::thread::sleep(Duration::from_millis(5));
        // Over the bound: user 1 is the oldest insert.
        cache.insert_member(gid(1), member(3));

        assert!(cache.member(gid(1), uid(1)).is_none());
        assert!(cache.member(gid(1), uid(2)).is_some());
        assert!(cache.member(gid(1), uid(3)).is_some());
    }

    #[test]
    fn persist_and_warm_up_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let cache = small_cache(Duration::from_secs(60), 16);

        cache.insert_member(gid(1), member(1));
        cache.insert_guild(
            gid(1),
            CachedGuildMeta {
                name: "guild".to_string(),
                owner_id: uid(9),
                member_count: Some(3),
            },
        );
        cache.insert_role(
            gid(1),
            Id::new(4),
            CachedRoleMeta {
                name: "role".to_string(),
                permissions: 8,
                managed: false,
                position: 1,
            },
        );
        cache.insert_channel(
            Id::new(5),
            CachedChannelMeta {
                name: Some("general".to_string()),
                kind: ChannelType::GuildText,
                guild_id: Some(gid(1)),
            },
        );

        assert_eq!(cache.persist(&store).unwrap(), 4);

        let fresh = small_cache(Duration::from_secs(60), 16);
        assert_eq!(fresh.warm_up(&store).unwrap(), 4);
        assert_eq!(fresh.member(gid(1), uid(1)).unwrap().username, "user-1");
        assert_eq!(fresh.guild(gid(1)).unwrap().name, "guild");
        assert_eq!(fresh.role(gid(1), Id::new(4)).unwrap().permissions, 8);
        assert_eq!(
            fresh.channel(Id::new(5)).unwrap().kind,
            ChannelType::GuildText
        );
    }
}

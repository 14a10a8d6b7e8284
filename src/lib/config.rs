use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::prelude::*;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use twilight_model::id::marker::{ChannelMarker, GuildMarker, RoleMarker};
use twilight_model::id::Id;

use crate::utils::prelude::*;

pub const CONFIG_FILE: &str = "./data/bot.json";
pub const GUILD_CONFIG_DIR: &str = "./data/guilds/";

fn default_true() -> bool {
    true
}

/// Runtime kill switches. These always win over feature toggles.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub disable_message_logs: bool,
    #[serde(default)]
    pub disable_entry_exit_logs: bool,
    #[serde(default)]
    pub disable_user_logs: bool,
    #[serde(default)]
    pub disable_automod_logs: bool,
    #[serde(default = "default_true")]
    pub moderation_logging: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            disable_message_logs: false,
            disable_entry_exit_logs: false,
            disable_user_logs: false,
            disable_automod_logs: false,
            moderation_logging: true,
        }
    }
}

/// Per-event logging feature toggles, all on by default.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LoggingFeatures {
    #[serde(default = "default_true")]
    pub message_edit: bool,
    #[serde(default = "default_true")]
    pub message_delete: bool,
    #[serde(default = "default_true")]
    pub member_join: bool,
    #[serde(default = "default_true")]
    pub member_leave: bool,
    #[serde(default = "default_true")]
    pub avatar_change: bool,
    #[serde(default = "default_true")]
    pub role_change: bool,
    #[serde(default = "default_true")]
    pub automod_action: bool,
    #[serde(default = "default_true")]
    pub moderation_case: bool,
}

impl Default for LoggingFeatures {
    fn default() -> Self {
        Self {
            message_edit: true,
            message_delete: true,
            member_join: true,
            member_leave: true,
            avatar_change: true,
            role_change: true,
            automod_action: true,
            moderation_case: true,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    #[serde(default)]
    pub logging: LoggingFeatures,
}

/// Configured log channel slots.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogChannels {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_leave: Option<Id<ChannelMarker>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_activity: Option<Id<ChannelMarker>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_audit: Option<Id<ChannelMarker>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moderation: Option<Id<ChannelMarker>>,
}

impl LogChannels {
    /// All configured slots, for exclusivity checks.
    pub fn configured(&self) -> Vec<Id<ChannelMarker>> {
        [
            self.entry_leave,
            self.user_activity,
            self.message_audit,
            self.moderation,
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Composite auto-role: grant `target` iff both prerequisites are held.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoRoleConfig {
    pub target: Id<RoleMarker>,
    pub require_a: Id<RoleMarker>,
    pub require_b: Id<RoleMarker>,
}

/// Unverified-member purge settings.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PurgeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "PurgeConfig::default_grace_days")]
    pub grace_days: u32,
    pub verification_role: Id<RoleMarker>,
    #[serde(default)]
    pub exempt_roles: Vec<Id<RoleMarker>>,
    #[serde(default = "PurgeConfig::default_max_kicks")]
    pub max_kicks_per_run: usize,
    #[serde(default = "PurgeConfig::default_kicks_per_second")]
    pub kicks_per_second: f64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "PurgeConfig::default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "PurgeConfig::default_initial_delay")]
    pub initial_delay_secs: u64,
}

impl PurgeConfig {
    fn default_grace_days() -> u32 {
        7
    }

    fn default_max_kicks() -> usize {
        10
    }

    fn default_kicks_per_second() -> f64 {
        1.0
    }

    fn default_scan_interval() -> u64 {
        3_600
    }

    fn default_initial_delay() -> u64 {
        60
    }
}

/// Backfill windows: a per-channel start day, or a global initial date.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_date: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub start_day: HashMap<Id<ChannelMarker>, String>,
}

/// Per-guild settings. Serialized to separate files, like the global config.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct GuildSettings {
    #[serde(default)]
    pub channels: LogChannels,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_role: Option<AutoRoleConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purge: Option<PurgeConfig>,
    #[serde(default)]
    pub backfill: BackfillSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_actor_role: Option<Id<RoleMarker>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles_cache_ttl_secs: Option<u64>,
}

/// Global defaults applied where a guild has no override.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub features: Features,
}

/// Serializable bot configuration.
#[derive(Deserialize, Serialize, Debug, Default, Clone)]
pub struct Config {
    pub global: Settings,
    // Guild settings are serialized to separate files.
    #[serde(skip_serializing, default)]
    pub guilds: HashMap<Id<GuildMarker>, GuildSettings>,
}

impl Config {
    /// Load the configuration file from `CONFIG_FILE`.
    pub fn load() -> AnyResult<Config> {
        info!("Loading config file");

        let mut cfg = String::new();
        {
            let mut config = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(CONFIG_FILE)?;

            config.read_to_string(&mut cfg)?;
        }

        match serde_json::from_str::<Config>(&cfg) {
            Ok(mut c) => {
                c.load_guild_settings()?;

                Ok(c)
            },
            Err(e) => {
                debug!("Could not load config: {}", e);
                info!("Creating a default config file");

                let def = Config::default();
                def.write()?;

                Ok(def)
            },
        }
    }

    /// Write the configuration to a file in `CONFIG_FILE`.
    /// # Notes
    /// This will truncate and overwrite the file, any changes that are not in the new data will be lost.
    pub fn write(&self) -> AnyResult<()> {
        info!("Updating config file");

        let config = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(CONFIG_FILE)?;

        serde_json::to_writer_pretty(config, self)?;

        // Write guild configuration files.
        self.write_guild_settings()?;

        Ok(())
    }

    /// Get guild's config.
    pub fn guild(&self, guild_id: Id<GuildMarker>) -> Option<&GuildSettings> {
        self.guilds.get(&guild_id)
    }

    /// Get mutable reference to guild's config. Creates default if not yet found.
    pub fn guild_or_default(&mut self, guild_id: Id<GuildMarker>) -> &mut GuildSettings {
        self.guilds.entry(guild_id).or_default()
    }

    /// Runtime toggles for a guild, falling back to the global defaults.
    pub fn resolve_runtime(&self, guild_id: Id<GuildMarker>) -> RuntimeConfig {
        self.guild(guild_id)
            .and_then(|g| g.runtime.clone())
            .unwrap_or_else(|| self.global.runtime.clone())
    }

    /// Feature toggles for a guild, falling back to the global defaults.
    pub fn resolve_features(&self, guild_id: Id<GuildMarker>) -> Features {
        self.guild(guild_id)
            .and_then(|g| g.features.clone())
            .unwrap_or_else(|| self.global.features.clone())
    }

    /// Look up all guild configurations in `GUILD_CONFIG_DIR` and save them to `self`.
    fn load_guild_settings(&mut self) -> AnyResult<()> {
        fs::create_dir_all(GUILD_CONFIG_DIR)
            .map_err(|e| anyhow::anyhow!("Failed to create guilds dir: {}", e))?;

        let paths = fs::read_dir(GUILD_CONFIG_DIR)?.flatten().map(|p| p.path());

        for path in paths {
            let content = fs::read_to_string(&path)?;
            let settings = serde_json::from_str::<GuildSettings>(&content)?;
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| anyhow::anyhow!("Invalid file name"))?;

            match name.parse() {
                Ok(id) => {
                    self.guilds.insert(id, settings);
                },
                Err(e) => {
                    let path = path.display();
                    warn!("Could not parse guild config file name '{path}': {e}");
                },
            }
        }

        Ok(())
    }

    /// Save guild configurations in `self` to `GUILD_CONFIG_DIR`.
    fn write_guild_settings(&self) -> AnyResult<()> {
        fs::create_dir_all(GUILD_CONFIG_DIR)
            .map_err(|e| anyhow::anyhow!("Failed to create guilds dir: {}", e))?;

        for (id, settings) in self.guilds.iter() {
            let file_name = format!("{id}.json");

            let guild_config = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(Path::new(GUILD_CONFIG_DIR).join(file_name))?;

            serde_json::to_writer_pretty(guild_config, settings)?;
        }

        Ok(())
    }
}

/// Shared, lock-protected access to the bot configuration.
pub struct ConfigManager {
    inner: RwLock<Config>,
}

impl ConfigManager {
    /// Load from disk.
    pub fn load() -> AnyResult<Self> {
        Ok(Self { inner: RwLock::new(Config::load()?) })
    }

    /// Wrap an already-built config (tests).
    pub fn from_config(config: Config) -> Self {
        Self { inner: RwLock::new(config) }
    }

    /// A point-in-time copy of the whole configuration.
    pub fn config(&self) -> Config {
        self.inner.read().clone()
    }

    pub fn guild(&self, guild_id: Id<GuildMarker>) -> Option<GuildSettings> {
        self.inner.read().guild(guild_id).cloned()
    }

    pub fn guild_ids(&self) -> Vec<Id<GuildMarker>> {
        self.inner.read().guilds.keys().copied().collect()
    }

    pub fn resolve_runtime(&self, guild_id: Id<GuildMarker>) -> RuntimeConfig {
        self.inner.read().resolve_runtime(guild_id)
    }

    pub fn resolve_features(&self, guild_id: Id<GuildMarker>) -> Features {
        self.inner.read().resolve_features(guild_id)
    }

    /// Ensure a guild has a config entry. Returns `true` if one was created.
    pub fn register_guild(&self, guild_id: Id<GuildMarker>) -> bool {
        let mut inner = self.inner.write();
        if inner.guilds.contains_key(&guild_id) {
            return false;
        }
        inner.guild_or_default(guild_id);

        true
    }

    /// Mutate a guild's settings in place, creating the entry if missing.
    pub fn update_guild(
        &self,
        guild_id: Id<GuildMarker>,
        update: impl FnOnce(&mut GuildSettings),
    ) {
        update(self.inner.write().guild_or_default(guild_id));
    }

    /// Replace the global runtime toggles.
    pub fn set_global_runtime(&self, runtime: RuntimeConfig) {
        self.inner.write().global.runtime = runtime;
    }

    /// Persist the current state to disk.
    pub fn save(&self) -> AnyResult<()> {
        self.inner.read().write()
    }

    /// The guild's configured backfill start instant, if any.
    pub fn backfill_initial_date(&self, guild_id: Id<GuildMarker>) -> Option<DateTime<Utc>> {
        let raw = self
            .inner
            .read()
            .guild(guild_id)
            .and_then(|g| g.backfill.initial_date.clone())?;

        match dateparser::parse_with_timezone(&raw, &Utc) {
            Ok(at) => Some(at.with_timezone(&Utc)),
            Err(e) => {
                warn!("Invalid backfill initial date '{raw}' for guild {guild_id}: {e}");
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gid(n: u64) -> Id<GuildMarker> {
        Id::new(n)
    }

    #[test]
    fn runtime_resolution_prefers_guild_override() {
        let mut config = Config::default();
        config.global.runtime.disable_message_logs = true;

        let manager = ConfigManager::from_config(config);
        assert!(manager.resolve_runtime(gid(1)).disable_message_logs);

        manager.update_guild(gid(1), |g| {
            g.runtime = Some(RuntimeConfig {
                disable_message_logs: false,
                ..RuntimeConfig::default()
            });
        });
        assert!(!manager.resolve_runtime(gid(1)).disable_message_logs);
        // Other guilds still see the global default.
        assert!(manager.resolve_runtime(gid(2)).disable_message_logs);
    }

    #[test]
    fn features_default_to_enabled() {
        let manager = ConfigManager::from_config(Config::default());
        let features = manager.resolve_features(gid(1));
        assert!(features.logging.message_edit);
        assert!(features.logging.moderation_case);
    }

    #[test]
    fn register_guild_is_idempotent() {
        let manager = ConfigManager::from_config(Config::default());
        assert!(manager.register_guild(gid(3)));
        assert!(!manager.register_guild(gid(3)));
        assert!(manager.guild(gid(3)).is_some());
    }

    #[test]
    fn guild_settings_json_roundtrip() {
        let settings = GuildSettings {
            channels: LogChannels {
                entry_leave: Some(Id::new(10)),
                moderation: Some(Id::new(11)),
                ..LogChannels::default()
            },
            auto_role: Some(AutoRoleConfig {
                target: Id::new(1),
                require_a: Id::new(2),
                require_b: Id::new(3),
            }),
            ..GuildSettings::default()
        };

        let json = serde_json::to_string(&settings).unwrap();
        let back: GuildSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
        assert_eq!(back.channels.configured().len(), 2);
    }

    #[test]
    fn missing_toggles_deserialize_to_defaults() {
        let runtime: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert!(runtime.moderation_logging);
        assert!(!runtime.disable_user_logs);

        let features: LoggingFeatures =
            serde_json::from_str(r#"{"message_edit": false}"#).unwrap();
        assert!(!features.message_edit);
        assert!(features.member_join);
    }

    #[test]
    fn backfill_initial_date_parses() {
        let manager = ConfigManager::from_config(Config::default());
        manager.update_guild(gid(1), |g| {
            g.backfill.initial_date = Some("2024-01-15".to_string());
        });

        let at = manager.backfill_initial_date(gid(1)).unwrap();
        assert_eq!(at.format("%Y-%m-%d").to_string(), "2024-01-15");
        assert_eq!(manager.backfill_initial_date(gid(2)), None);
    }
}

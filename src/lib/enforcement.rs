/*!
Enforcement loops.

Two slow-moving guardians: the unverified-member purge (throttled kicks of
members who never verified within the grace window) and the monthly native
prune. Both emit moderation-case embeds with allocated case numbers.
*/

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use twilight_http::request::AuditLogReason;
use twilight_mention::Mention;
use twilight_model::id::marker::{GuildMarker, RoleMarker, UserMarker};
use twilight_model::id::Id;

use crate::config::{ConfigManager, PurgeConfig};
use crate::notify::{ModerationCaseLog, NotificationSender};
use crate::store::Store;
use crate::utils::prelude::*;
use crate::utils::{humanize_duration, truncate_bytes};
use crate::Session;

/// Audit reasons are capped by the platform.
pub const AUDIT_REASON_MAX: usize = 512;
/// Purge scan interval floor.
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_secs(300);
/// Kick throttle floor.
pub const MIN_KICK_INTERVAL: Duration = Duration::from_millis(50);

/// Day of month the native prune runs, UTC.
pub const PRUNE_DAY_OF_MONTH: u32 = 28;
/// Native prune inactivity window.
pub const PRUNE_WINDOW_DAYS: u16 = 30;

/// Purge candidates: joined before the cutoff, unverified, not exempt.
/// Oldest joins first, capped at the per-run maximum.
pub fn select_candidates(
    joins: &HashMap<Id<UserMarker>, DateTime<Utc>>,
    roles: &HashMap<Id<UserMarker>, HashSet<Id<RoleMarker>>>,
    config: &PurgeConfig,
    now: DateTime<Utc>,
) -> Vec<(Id<UserMarker>, DateTime<Utc>)> {
    let cutoff = now - chrono::Duration::days(i64::from(config.grace_days));

    let mut candidates: Vec<_> = joins
        .iter()
        .filter(|(user_id, joined_at)| {
            if **joined_at > cutoff {
                return false;
            }
            let member_roles = roles.get(*user_id);
            let verified = member_roles
                .is_some_and(|roles| roles.contains(&config.verification_role));
            let exempt = member_roles.is_some_and(|roles| {
                config.exempt_roles.iter().any(|role| roles.contains(role))
            });
            !verified && !exempt
        })
        .map(|(user_id, joined_at)| (*user_id, *joined_at))
        .collect();

    candidates.sort_by_key(|(_, joined_at)| *joined_at);
    candidates.truncate(config.max_kicks_per_run);

    candidates
}

/// Token interval for the kick throttle.
pub fn kick_interval(kicks_per_second: f64) -> Duration {
    if kicks_per_second <= 0.0 {
        return Duration::from_secs(1);
    }
    Duration::from_secs_f64(1.0 / kicks_per_second).max(MIN_KICK_INTERVAL)
}

fn same_year_month(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

/// Whether the monthly prune is due. Idempotent within a UTC month.
pub fn should_run_prune(now: DateTime<Utc>, last_run: Option<DateTime<Utc>>) -> bool {
    now.day() == PRUNE_DAY_OF_MONTH
        && !last_run.is_some_and(|last| same_year_month(last, now))
}

fn prune_last_run_key(guild_id: Id<GuildMarker>) -> String {
    format!("user_prune_last_run:{guild_id}")
}

/// Throttled kick loop for members who never verified.
pub struct UnverifiedPurge {
    session: Arc<Session>,
    store: Arc<Store>,
    config: Arc<ConfigManager>,
    notifier: Arc<NotificationSender>,
    handle: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl UnverifiedPurge {
    pub fn new(
        session: Arc<Session>,
        store: Arc<Store>,
        config: Arc<ConfigManager>,
        notifier: Arc<NotificationSender>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            store,
            config,
            notifier,
            handle: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn start(self: &Arc<Self>, stop: watch::Receiver<bool>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let this = Arc::clone(self);
        *self.handle.lock() = Some(tokio::spawn(this.run_loop(stop)));

        info!("Unverified purge loop started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }

        info!("Unverified purge loop stopped");
    }

    async fn run_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let initial_delay = self
            .enabled_configs()
            .iter()
            .map(|(_, config)| config.initial_delay_secs)
            .min()
            .unwrap_or(60);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(initial_delay)) => {},
            _ = stop.changed() => return,
        }

        loop {
            for (guild_id, config) in self.enabled_configs() {
                if *stop.borrow() {
                    return;
                }
                self.scan_guild(guild_id, &config, &mut stop).await;
            }

            let interval = self
                .enabled_configs()
                .iter()
                .map(|(_, config)| Duration::from_secs(config.scan_interval_secs))
                .min()
                .unwrap_or(Duration::from_secs(3_600))
                .max(MIN_SCAN_INTERVAL);

            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = stop.changed() => return,
            }
        }
    }

    fn enabled_configs(&self) -> Vec<(Id<GuildMarker>, PurgeConfig)> {
        self.config
            .guild_ids()
            .into_iter()
            .filter_map(|guild_id| {
                let purge = self.config.guild(guild_id)?.purge?;
                purge.enabled.then_some((guild_id, purge))
            })
            .collect()
    }

    async fn scan_guild(
        &self,
        guild_id: Id<GuildMarker>,
        config: &PurgeConfig,
        stop: &mut watch::Receiver<bool>,
    ) {
        let now = Utc::now();

        let joins = match self.store.get_all_member_joins(guild_id) {
            Ok(joins) => joins,
            Err(e) => {
                warn!("Purge scan: join load failed for {guild_id}: {e}");
                return;
            },
        };
        let roles = match self.store.get_all_member_roles(guild_id) {
            Ok(roles) => roles,
            Err(e) => {
                warn!("Purge scan: role load failed for {guild_id}: {e}");
                return;
            },
        };

        let candidates = select_candidates(&joins, &roles, config, now);
        if candidates.is_empty() {
            return;
        }

        let interval = kick_interval(config.kicks_per_second);
        let mut kicked = 0usize;
        let mut affected = Vec::new();

        for (user_id, joined_at) in &candidates {
            // Throttle token, and a stop check between tokens.
            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = stop.changed() => return,
            }

            // Fresh member state before acting.
            let member = match self.session.member(guild_id, *user_id).await {
                Ok(member) => member,
                Err(e) => {
                    debug!("Purge: member {user_id} gone or unreadable: {}", e.oneliner());
                    continue;
                },
            };
            if member.user.bot
                || member.roles.contains(&config.verification_role)
                || config.exempt_roles.iter().any(|role| member.roles.contains(role))
            {
                continue;
            }

            let tenure = humanize_duration(now - *joined_at);

            if config.dry_run {
                info!("Purge dry-run: would kick {user_id} from {guild_id} (joined {tenure} ago)");
                affected.push(format!("{} (would kick)", user_id.mention()));
                continue;
            }

            let reason = truncate_bytes(
                &format!(
                    "Unverified for {} days (joined {tenure} ago)",
                    config.grace_days
                ),
                AUDIT_REASON_MAX,
            );

            let request = self
                .session
                .http
                .remove_guild_member(guild_id, *user_id)
                .reason(&reason);
            match request {
                Ok(request) => match request.await {
                    Ok(_) => {
                        kicked += 1;
                        affected.push(user_id.mention().to_string());
                        info!("Purged unverified member {user_id} from {guild_id}");
                    },
                    Err(e) => warn!("Purge kick of {user_id} failed: {e}"),
                },
                Err(e) => warn!("Purge kick reason invalid: {e}"),
            }
        }

        if affected.is_empty() {
            return;
        }

        let case_number = match self.store.next_moderation_case_number(guild_id) {
            Ok(number) => number,
            Err(e) => {
                warn!("Case number allocation failed for {guild_id}: {e}");
                return;
            },
        };

        let log = ModerationCaseLog {
            guild_id,
            action_tag: "unverified purge".to_string(),
            case_number,
            lines: vec![
                ("Removed".to_string(), kicked.to_string()),
                ("Candidates".to_string(), candidates.len().to_string()),
                (
                    "Grace".to_string(),
                    format!("{} days", config.grace_days),
                ),
                (
                    "Responsible moderator".to_string(),
                    self.session.user.id.mention().to_string(),
                ),
                (
                    "Affected".to_string(),
                    truncate_bytes(&affected.join(", "), 1024),
                ),
                (
                    "ID".to_string(),
                    format!("{guild_id} | <t:{}:F>", now.timestamp()),
                ),
            ],
        };
        if let Err(e) = self.notifier.notify_moderation_case(log).await {
            warn!("Purge moderation log failed: {}", e.oneliner());
        }
    }
}

/// Monthly native prune, once per UTC month on day 28.
pub struct UserPrune {
    session: Arc<Session>,
    store: Arc<Store>,
    config: Arc<ConfigManager>,
    notifier: Arc<NotificationSender>,
    handle: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl UserPrune {
    pub fn new(
        session: Arc<Session>,
        store: Arc<Store>,
        config: Arc<ConfigManager>,
        notifier: Arc<NotificationSender>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            store,
            config,
            notifier,
            handle: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn start(self: &Arc<Self>, stop: watch::Receiver<bool>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let this = Arc::clone(self);
        *self.handle.lock() = Some(tokio::spawn(this.run_loop(stop)));

        info!("User prune loop started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }

        info!("User prune loop stopped");
    }

    async fn run_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(3_600));

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = stop.changed() => return,
            }

            let now = Utc::now();
            for guild_id in self.config.guild_ids() {
                let key = prune_last_run_key(guild_id);
                let last_run = self.store.get_metadata(&key).ok().flatten();

                if !should_run_prune(now, last_run) {
                    continue;
                }

                self.prune_guild(guild_id, now).await;
            }
        }
    }

    async fn prune_guild(&self, guild_id: Id<GuildMarker>, now: DateTime<Utc>) {
        // Estimate first; the count is advisory.
        let estimated = self.estimate(guild_id).await;

        let reason = format!(
            "Monthly prune of members inactive for {PRUNE_WINDOW_DAYS} days"
        );

        let pruned = match self.execute(guild_id, &reason).await {
            Ok(pruned) => pruned,
            Err(e) => {
                warn!("Prune of {guild_id} failed: {}", e.oneliner());
                return;
            },
        };

        if let Err(e) = self.store.set_metadata(&prune_last_run_key(guild_id), now) {
            warn!("Prune bookkeeping failed for {guild_id}: {e}");
        }

        let case_number = match self.store.next_moderation_case_number(guild_id) {
            Ok(number) => number,
            Err(e) => {
                warn!("Case number allocation failed for {guild_id}: {e}");
                return;
            },
        };

        let mut lines = vec![
            (
                "Pruned".to_string(),
                pruned.map_or_else(|| "unknown".to_string(), |count| count.to_string()),
            ),
            ("Window".to_string(), format!("{PRUNE_WINDOW_DAYS} days")),
            (
                "Responsible moderator".to_string(),
                self.session.user.id.mention().to_string(),
            ),
        ];
        if let Some(estimated) = estimated {
            lines.push(("Estimated".to_string(), estimated.to_string()));
        }
        lines.push(("Reason".to_string(), reason.clone()));
        lines.push((
            "ID".to_string(),
            format!("{guild_id} | <t:{}:F>", now.timestamp()),
        ));

        let log = ModerationCaseLog {
            guild_id,
            action_tag: "prune".to_string(),
            case_number,
            lines,
        };
        if let Err(e) = self.notifier.notify_moderation_case(log).await {
            warn!("Prune moderation log failed: {}", e.oneliner());
        }

        info!("Monthly prune completed for {guild_id}");
    }

    async fn estimate(&self, guild_id: Id<GuildMarker>) -> Option<u64> {
        let request = self
            .session
            .http
            .guild_prune_count(guild_id)
            .days(PRUNE_WINDOW_DAYS)
            .ok()?;

        match request.await {
            Ok(response) => response.model().await.ok().map(|prune| prune.pruned),
            Err(e) => {
                debug!("Prune count for {guild_id} failed: {e}");
                None
            },
        }
    }

    async fn execute(&self, guild_id: Id<GuildMarker>, reason: &str) -> AnyResult<Option<u64>> {
        let response = self
            .session
            .http
            .create_guild_prune(guild_id)
            .days(PRUNE_WINDOW_DAYS)?
            .reason(reason)?
            .await?;

        Ok(response.model().await.ok().map(|prune| prune.pruned))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn uid(n: u64) -> Id<UserMarker> {
        Id::new(n)
    }

    fn rid(n: u64) -> Id<RoleMarker> {
        Id::new(n)
    }

    fn purge_config() -> PurgeConfig {
        serde_json::from_value(serde_json::json!({
            "enabled": true,
            "grace_days": 7,
            "verification_role": "100",
            "exempt_roles": ["200"],
            "max_kicks_per_run": 2,
        }))
        .unwrap()
    }

    #[test]
    fn candidates_respect_grace_verification_and_exemption() {
        let now = Utc::now();
        let old = now - chrono::Duration::days(10);
        let config = purge_config();

        let joins = HashMap::from([
            (uid(1), old),                                  // unverified, old
            (uid(2), now - chrono::Duration::days(1)),      // within grace
            (uid(3), old),                                  // verified
            (uid(4), old),                                  // exempt
        ]);
        let roles = HashMap::from([
            (uid(3), HashSet::from([rid(100)])),
            (uid(4), HashSet::from([rid(200)])),
        ]);

        let candidates = select_candidates(&joins, &roles, &config, now);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0, uid(1));
    }

    #[test]
    fn candidates_are_oldest_first_and_capped() {
        let now = Utc::now();
        let config = purge_config();

        let joins = HashMap::from([
            (uid(1), now - chrono::Duration::days(30)),
            (uid(2), now - chrono::Duration::days(20)),
            (uid(3), now - chrono::Duration::days(10)),
        ]);

        let candidates = select_candidates(&joins, &HashMap::new(), &config, now);
        // Capped at 2, oldest joins first.
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].0, uid(1));
        assert_eq!(candidates[1].0, uid(2));
    }

    #[test]
    fn kick_throttle_has_a_floor() {
        assert_eq!(kick_interval(1.0), Duration::from_secs(1));
        assert_eq!(kick_interval(0.5), Duration::from_secs(2));
        // Very fast settings clamp to the floor.
        assert_eq!(kick_interval(1_000.0), MIN_KICK_INTERVAL);
        assert_eq!(kick_interval(0.0), Duration::from_secs(1));
    }

    #[test]
    fn prune_runs_once_per_utc_month() {
        let day28 = Utc.with_ymd_and_hms(2024, 6, 28, 10, 0, 0).unwrap();
        let day28_later = Utc.with_ymd_and_hms(2024, 6, 28, 11, 0, 0).unwrap();
        let day27 = Utc.with_ymd_and_hms(2024, 6, 27, 10, 0, 0).unwrap();
        let next_month = Utc.with_ymd_and_hms(2024, 7, 28, 10, 0, 0).unwrap();

        // First run on day 28 fires.
        assert!(should_run_prune(day28, None));
        // Re-check an hour later is a no-op.
        assert!(!should_run_prune(day28_later, Some(day28)));
        // Not day 28.
        assert!(!should_run_prune(day27, None));
        // A new month fires again.
        assert!(should_run_prune(next_month, Some(day28)));
    }

    #[test]
    fn audit_reason_is_bounded() {
        let reason = truncate_bytes(&"r".repeat(600), AUDIT_REASON_MAX);
        assert!(reason.len() <= AUDIT_REASON_MAX);
    }
}

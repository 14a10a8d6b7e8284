/*!
Top-level monitoring coordinator.

Owns the sub-services, the task router schedules and the verification
logic that needs cross-cutting state: downtime detection, avatar scans,
role-diff verification against audit-log evidence, and the permission
mirror watcher for managed roles.
*/

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use twilight_http::request::AuditLogReason;
use twilight_model::gateway::event::{Event, EventType};
use twilight_model::gateway::payload::incoming::{MemberUpdate, RoleUpdate};
use twilight_model::gateway::presence::UserOrId;
use twilight_model::guild::audit_log::{AuditLogChange, AuditLogEventType};
use twilight_model::guild::{Guild, Permissions};
use twilight_model::id::marker::{GuildMarker, RoleMarker, UserMarker};
use twilight_model::id::Id;

use crate::backfill::BackfillDriver;
use crate::cache::{CachedGuildMeta, CachedMember, CachedRoleMeta, UnifiedCache};
use crate::config::ConfigManager;
use crate::enforcement::{UnverifiedPurge, UserPrune};
use crate::notify::{AvatarChangeNotification, NotificationSender, RoleChangeNotification};
use crate::services::automod::AutomodService;
use crate::services::member::MemberEventService;
use crate::services::message::{MessageCacheOptions, MessageEventService};
use crate::services::reaction::ReactionEventService;
use crate::store::Store;
use crate::tasks::{ScheduleHandle, Task, TaskContext, TaskError, TaskResult, TaskRouter};
use crate::utils::prelude::*;
use crate::utils::snowflake_timestamp;
use crate::{Session, Subscription};

pub const TASK_SCAN_AVATARS: &str = "monitor.scan_avatars";
pub const TASK_REFRESH_ROLES: &str = "monitor.refresh_roles";
pub const TASK_CLEANUP: &str = "monitor.cleanup";

/// Heartbeat write cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);
/// Roles-cache backstop cleanup cadence.
const ROLES_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
/// Avatar scan cadence.
const AVATAR_SCAN_INTERVAL: Duration = Duration::from_secs(2 * 3_600);
/// Avatar notification debounce window.
const AVATAR_DEBOUNCE: Duration = Duration::from_secs(60);
/// Avatar history retention.
const AVATAR_HISTORY_DAYS: i64 = 30;
/// Pause between the two audit-log attempts.
const AUDIT_RETRY_PAUSE: Duration = Duration::from_millis(300);
/// Heartbeat age that counts as downtime.
const DOWNTIME_MINUTES: i64 = 30;
/// Default roles-cache entry TTL.
const ROLES_CACHE_TTL: Duration = Duration::from_secs(300);
/// Member pagination page size.
const MEMBER_PAGE: u16 = 1_000;

/// Whether the recorded heartbeat indicates the process was down.
fn is_downtime(heartbeat: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    heartbeat.map_or(true, |at| now - at > chrono::Duration::minutes(DOWNTIME_MINUTES))
}

/// Restore only when the role lost bits it had in the snapshot and gained
/// none beyond it. Never touch a role that holds everything it held.
fn mirror_restore_needed(current: Permissions, snapshot: Permissions) -> bool {
    current != snapshot && snapshot.contains(current)
}

/// Previous permissions of a watched role, persisted across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct PermSnapshot {
    prev_permissions: u64,
    saved_at: i64,
    actor_user_id: Id<UserMarker>,
}

const PERM_SNAPSHOT_TYPE: &str = "perm_snapshot";

fn perm_snapshot_key(guild_id: Id<GuildMarker>, role_id: Id<RoleMarker>) -> String {
    format!("bot_role_perm_snapshot:{guild_id}:{role_id}")
}

struct RolesEntry {
    roles: HashSet<Id<RoleMarker>>,
    refreshed_at: Instant,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScanPayload {
    silent: bool,
}

/// Top-level coordinator over all monitoring sub-services.
pub struct MonitoringService {
    session: Arc<Session>,
    store: Arc<Store>,
    config: Arc<ConfigManager>,
    router: Arc<TaskRouter>,
    cache: Arc<UnifiedCache>,
    notifier: Arc<NotificationSender>,
    members: Arc<MemberEventService>,
    messages: Arc<MessageEventService>,
    reactions: Arc<ReactionEventService>,
    automod: Arc<AutomodService>,
    backfill: Arc<BackfillDriver>,
    purge: Arc<UnverifiedPurge>,
    prune: Arc<UserPrune>,
    roles_cache: RwLock<HashMap<(Id<GuildMarker>, Id<UserMarker>), RolesEntry>>,
    recent_changes: RwLock<HashMap<(Id<GuildMarker>, Id<UserMarker>), Instant>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    user_subscriptions: Mutex<Vec<Subscription>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    schedules: Mutex<Vec<ScheduleHandle>>,
}

impl MonitoringService {
    /// Wire up the coordinator and its sub-services. Dependencies are
    /// passed in already constructed; adapters are attached here.
    pub fn new(
        session: Arc<Session>,
        store: Arc<Store>,
        config: Arc<ConfigManager>,
        cache: Arc<UnifiedCache>,
        router: Arc<TaskRouter>,
    ) -> Arc<Self> {
        let notifier = Arc::new(NotificationSender::new(
            Arc::clone(&session),
            Arc::clone(&config),
            Arc::clone(&router),
        ));

        let members = MemberEventService::new(
            Arc::clone(&session),
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&notifier),
        );
        let messages = MessageEventService::new(
            Arc::clone(&session),
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&notifier),
            MessageCacheOptions::from_env(),
        );
        let reactions = ReactionEventService::new(Arc::clone(&session), Arc::clone(&store));
        let automod = AutomodService::new(Arc::clone(&session), Arc::clone(&config));
        automod.set_notifier(Arc::clone(&notifier));

        let backfill = BackfillDriver::new(Arc::clone(&session), Arc::clone(&store));
        let purge = UnverifiedPurge::new(
            Arc::clone(&session),
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&notifier),
        );
        let prune = UserPrune::new(
            Arc::clone(&session),
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&notifier),
        );

        Arc::new(Self {
            session,
            store,
            config,
            router,
            cache,
            notifier,
            members,
            messages,
            reactions,
            automod,
            backfill,
            purge,
            prune,
            roles_cache: RwLock::new(HashMap::new()),
            recent_changes: RwLock::new(HashMap::new()),
            stop_tx: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            user_subscriptions: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
            schedules: Mutex::new(Vec::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.lock().is_some()
    }

    pub async fn start(self: &Arc<Self>) -> AnyResult<()> {
        {
            let mut stop_tx = self.stop_tx.lock();
            if stop_tx.is_some() {
                return Ok(());
            }
            let (tx, _) = watch::channel(false);
            *stop_tx = Some(tx);
        }
        let stop_rx = self
            .stop_tx
            .lock()
            .as_ref()
            .map(|tx| tx.subscribe())
            .context("Stop channel missing")?;

        // Every guild the session knows gets at least a minimal config entry.
        let mut created = false;
        for guild_id in self.session.cache.iter().guilds().map(|guild| guild.id()) {
            created |= self.config.register_guild(guild_id);
        }
        if created {
            if let Err(e) = self.config.save() {
                warn!("Config save after guild listing failed: {}", e.oneliner());
            }
        }

        // Warm the unified cache from the previous run.
        if let Err(e) = self.cache.warm_up(&self.store) {
            warn!("Cache warmup failed: {}", e.oneliner());
        }

        // Task handlers before anything can dispatch them.
        self.notifier.register_handlers();
        self.backfill.register_handlers(&self.router);
        self.register_task_handlers();

        // Downtime detection: no heartbeat or a stale one means the process
        // was away, so refresh avatars without emitting notifications.
        let now = Utc::now();
        let heartbeat = self.store.get_heartbeat().ok().flatten();
        if is_downtime(heartbeat, now) {
            info!("Downtime detected, dispatching silent avatar refresh");
            self.dispatch_scan(true);
        }

        // Event handlers.
        self.register_handlers();
        if !self.config.config().global.runtime.disable_user_logs {
            self.register_user_handlers();
        }

        // Heartbeat loop, first write immediately.
        if let Err(e) = self.store.set_heartbeat(now) {
            warn!("Heartbeat write failed: {e}");
        }
        let store = Arc::clone(&self.store);
        let mut hb_stop = stop_rx.clone();
        self.loops.lock().push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.set_heartbeat(Utc::now()) {
                            warn!("Heartbeat write failed: {e}");
                        }
                    },
                    _ = hb_stop.changed() => break,
                }
            }
        }));

        // Roles-cache backstop cleanup.
        let this = Arc::clone(self);
        let mut rc_stop = stop_rx.clone();
        self.loops.lock().push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ROLES_CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.cleanup_roles_cache();
                        this.cache.cleanup();
                    },
                    _ = rc_stop.changed() => break,
                }
            }
        }));

        // Sub-services by runtime toggles, rolled back in reverse on failure.
        let runtime = self.config.config().global.runtime;
        let mut started: Vec<&'static str> = Vec::new();
        let result = (|| {
            if !runtime.disable_entry_exit_logs {
                self.members.start()?;
                started.push("members");
            }
            if !runtime.disable_message_logs {
                self.messages.start()?;
                started.push("messages");
            }
            self.reactions.start()?;
            started.push("reactions");
            if !runtime.disable_automod_logs {
                self.automod.start()?;
                started.push("automod");
            }
            Ok::<(), anyhow::Error>(())
        })();
        if let Err(e) = result {
            for name in started.iter().rev() {
                match *name {
                    "members" => self.members.stop(),
                    "messages" => self.messages.stop(),
                    "reactions" => self.reactions.stop(),
                    "automod" => self.automod.stop(),
                    _ => {},
                }
            }
            self.stop_tx.lock().take();
            return Err(e.context("Failed to start sub-services"));
        }

        // Enforcement loops.
        self.purge.start(stop_rx.clone());
        self.prune.start(stop_rx.clone());

        // Schedules.
        {
            let mut schedules = self.schedules.lock();
            schedules.push(self.router.schedule_every(
                AVATAR_SCAN_INTERVAL,
                scan_task(false).group_key("monitor:scan_avatars"),
            ));
            schedules.push(self.router.schedule_daily_at_utc(
                3,
                0,
                Task::new(TASK_REFRESH_ROLES, serde_json::Value::Null)
                    .group_key("monitor:refresh_roles"),
            ));
            schedules.push(self.router.schedule_daily_at_utc(
                4,
                0,
                Task::new(TASK_CLEANUP, serde_json::Value::Null).group_key("monitor:cleanup"),
            ));
        }

        // One-time roles refresh, then conditional backfill.
        if let Err(e) = self.router.dispatch(
            Task::new(TASK_REFRESH_ROLES, serde_json::Value::Null)
                .group_key("monitor:refresh_roles"),
        ) {
            debug!("Startup roles refresh not dispatched: {e}");
        }

        let last_event = self.store.get_last_event().ok().flatten();
        for task in self.backfill.startup_tasks(&self.config, now, last_event) {
            let kind = task.kind.clone();
            match self.router.dispatch(task) {
                Ok(()) => info!("Dispatched startup backfill ({kind})"),
                Err(e) => debug!("Startup backfill not dispatched: {e}"),
            }
        }

        info!("Monitoring service started");

        Ok(())
    }

    /// Stop everything. The stop channel is closed exactly once; a second
    /// call is a no-op. Start is re-entrant afterwards.
    pub async fn stop(&self) {
        let Some(stop_tx) = self.stop_tx.lock().take() else {
            return;
        };
        let _ = stop_tx.send(true);

        if let Err(e) = self.cache.persist(&self.store) {
            warn!("Cache persist on stop failed: {}", e.oneliner());
        }

        for handle in self.loops.lock().drain(..) {
            handle.abort();
        }
        self.subscriptions.lock().clear();
        self.user_subscriptions.lock().clear();

        // Sub-services in reverse start order, logging but not failing.
        self.automod.stop();
        self.reactions.stop();
        self.messages.stop();
        self.members.stop();
        self.purge.stop();
        self.prune.stop();

        for schedule in self.schedules.lock().drain(..) {
            schedule.cancel();
        }

        self.router.close().await;

        info!("Monitoring service stopped");
    }

    /// Hot-apply new runtime toggles: start or stop sub-services to match
    /// and re-register the user-scope handlers. Safe while running.
    pub fn apply_runtime_toggles(self: &Arc<Self>, runtime: crate::config::RuntimeConfig) {
        self.config.set_global_runtime(runtime.clone());

        let toggle = |disabled: bool, name: &str, start: &dyn Fn() -> AnyResult<()>, stop: &dyn Fn()| {
            if disabled {
                stop();
            } else if let Err(e) = start() {
                warn!("Failed to start {name} service: {}", e.oneliner());
            }
        };

        toggle(
            runtime.disable_entry_exit_logs,
            "member",
            &|| self.members.start(),
            &|| self.members.stop(),
        );
        toggle(
            runtime.disable_message_logs,
            "message",
            &|| self.messages.start(),
            &|| self.messages.stop(),
        );
        toggle(
            runtime.disable_automod_logs,
            "automod",
            &|| self.automod.start(),
            &|| self.automod.stop(),
        );

        self.user_subscriptions.lock().clear();
        if !runtime.disable_user_logs {
            self.register_user_handlers();
        }

        info!("Runtime toggles applied");
    }

    // ---- event handlers ----

    fn register_handlers(self: &Arc<Self>) {
        let mut subs = Vec::new();

        let this = Arc::clone(self);
        subs.push(self.session.events.subscribe(EventType::GuildCreate, move |event| {
            let this = Arc::clone(&this);
            async move {
                if let Event::GuildCreate(ev) = event {
                    this.handle_guild_create(ev.0).await;
                }
            }
        }));

        let this = Arc::clone(self);
        subs.push(self.session.events.subscribe(EventType::GuildUpdate, move |event| {
            let this = Arc::clone(&this);
            async move {
                if let Event::GuildUpdate(ev) = event {
                    let guild = ev.0;
                    if let Err(e) = this.store.upsert_guild_meta(
                        guild.id,
                        Utc::now(),
                        Some(guild.owner_id),
                    ) {
                        warn!("Guild meta update failed: {e}");
                    }
                }
            }
        }));

        let this = Arc::clone(self);
        subs.push(self.session.events.subscribe(EventType::RoleCreate, move |event| {
            let this = Arc::clone(&this);
            async move {
                if let Event::RoleCreate(ev) = event {
                    this.cache.insert_role(
                        ev.guild_id,
                        ev.role.id,
                        CachedRoleMeta::from(&ev.role),
                    );
                }
            }
        }));

        let this = Arc::clone(self);
        subs.push(self.session.events.subscribe(EventType::RoleUpdate, move |event| {
            let this = Arc::clone(&this);
            async move {
                if let Event::RoleUpdate(ev) = event {
                    this.handle_role_update(ev).await;
                }
            }
        }));

        *self.subscriptions.lock() = subs;
    }

    fn register_user_handlers(self: &Arc<Self>) {
        let mut subs = Vec::new();

        let this = Arc::clone(self);
        subs.push(
            self.session.events.subscribe(EventType::MemberUpdate, move |event| {
                let this = Arc::clone(&this);
                async move {
                    if let Event::MemberUpdate(ev) = event {
                        this.handle_member_update(*ev).await;
                    }
                }
            }),
        );

        let this = Arc::clone(self);
        subs.push(
            self.session.events.subscribe(EventType::PresenceUpdate, move |event| {
                let this = Arc::clone(&this);
                async move {
                    if let Event::PresenceUpdate(ev) = event {
                        let presence = ev.0;
                        if let UserOrId::User(user) = presence.user {
                            if user.bot {
                                return;
                            }
                            if let Some(hash) = user.avatar {
                                this.observe_avatar(
                                    presence.guild_id,
                                    user.id,
                                    user.name.clone(),
                                    hash.to_string(),
                                    false,
                                )
                                .await;
                            }
                        }
                    }
                }
            }),
        );

        subs.push(self.session.events.subscribe(EventType::UserUpdate, move |event| async move {
            if let Event::UserUpdate(ev) = event {
                trace!("Own user updated: {}", ev.0.name);
            }
        }));

        *self.user_subscriptions.lock() = subs;
    }

    async fn handle_guild_create(self: &Arc<Self>, guild: Guild) {
        info!("Guild available: '{}'", guild.name);

        if self.config.register_guild(guild.id) {
            if let Err(e) = self.config.save() {
                warn!("Config save for new guild failed: {}", e.oneliner());
            }
        }

        let bot_since = guild
            .joined_at
            .and_then(|at| crate::utils::timestamp_secs_to_utc(at.as_secs()))
            .unwrap_or_else(Utc::now);
        if let Err(e) = self.store.upsert_guild_meta(guild.id, bot_since, Some(guild.owner_id)) {
            warn!("Guild meta upsert failed: {e}");
        }

        self.cache.insert_guild(guild.id, CachedGuildMeta::from(&guild));
        for role in &guild.roles {
            self.cache.insert_role(guild.id, role.id, CachedRoleMeta::from(role));
        }

        // Seed role snapshots from the payload and repair auto-role states
        // without needing event history.
        let now = Utc::now();
        for member in &guild.members {
            let roles: HashSet<_> = member.roles.iter().copied().collect();
            if let Err(e) = self.store.upsert_member_roles(guild.id, member.user.id, &roles, now) {
                warn!("Role snapshot seed failed: {e}");
                break;
            }
            self.cache.insert_member(guild.id, CachedMember::from(member));
        }
        if self.members.is_running() {
            self.members.reconcile_guild(guild.id, &guild.members).await;
        }
    }

    /// Role-diff verification: audit-log evidence intersected with the
    /// stored snapshot, falling back to the pure diff.
    async fn handle_member_update(self: &Arc<Self>, ev: MemberUpdate) {
        if ev.user.bot {
            return;
        }
        let guild_id = ev.guild_id;
        let user_id = ev.user.id;

        if let Some(hash) = ev.user.avatar {
            self.observe_avatar(guild_id, user_id, ev.user.name.clone(), hash.to_string(), false)
                .await;
        }

        // Current role set from the event; an empty set is indistinguishable
        // from a partial payload, so it is confirmed with one REST read
        // before being treated as a mass removal.
        let mut current: HashSet<Id<RoleMarker>> = ev.roles.iter().copied().collect();
        if current.is_empty() {
            match self.session.member(guild_id, user_id).await {
                Ok(member) => current = member.roles.iter().copied().collect(),
                Err(e) => {
                    debug!("Role fallback fetch failed for {user_id}: {}", e.oneliner());
                },
            }
        }

        let (added, removed) = match self.store.diff_member_roles(guild_id, user_id, &current) {
            Ok(diff) => diff,
            Err(e) => {
                warn!("Role diff failed for {user_id}: {e}");
                return;
            },
        };

        if added.is_empty() && removed.is_empty() {
            self.refresh_roles_entry(guild_id, user_id, current);
            return;
        }

        let audit = self.find_role_audit(guild_id, user_id).await;
        let (shown_added, shown_removed, fallback) = match audit {
            Some((audit_added, audit_removed)) => {
                let added_hit: Vec<_> = added
                    .iter()
                    .copied()
                    .filter(|role| audit_added.contains(role))
                    .collect();
                let removed_hit: Vec<_> = removed
                    .iter()
                    .copied()
                    .filter(|role| audit_removed.contains(role))
                    .collect();
                if added_hit.is_empty() && removed_hit.is_empty() {
                    (added.clone(), removed.clone(), true)
                } else {
                    (added_hit, removed_hit, false)
                }
            },
            None => (added.clone(), removed.clone(), true),
        };

        let notification = RoleChangeNotification {
            guild_id,
            user_id,
            username: ev.user.name.clone(),
            added: shown_added,
            removed: shown_removed,
            fallback,
        };
        if let Err(e) = self.notifier.notify_role_change(notification).await {
            warn!("Role change notification failed: {}", e.oneliner());
        }

        // Snapshot and cache updated only after the send.
        if let Err(e) = self.store.upsert_member_roles(guild_id, user_id, &current, Utc::now()) {
            warn!("Role snapshot update failed: {e}");
        }
        self.refresh_roles_entry(guild_id, user_id, current);
    }

    /// Up to two audit-log reads, 300 ms apart, for a fresh role update
    /// targeting this user.
    async fn find_role_audit(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
    ) -> Option<(HashSet<Id<RoleMarker>>, HashSet<Id<RoleMarker>>)> {
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(AUDIT_RETRY_PAUSE).await;
            }

            let request = self
                .session
                .http
                .audit_log(guild_id)
                .action_type(AuditLogEventType::MemberRoleUpdate)
                .limit(10)
                .ok()?;
            let log = match request.await {
                Ok(response) => match response.model().await {
                    Ok(log) => log,
                    Err(e) => {
                        debug!("Audit log decode failed: {e}");
                        continue;
                    },
                },
                Err(e) => {
                    debug!("Audit log fetch failed: {e}");
                    continue;
                },
            };

            for entry in &log.entries {
                if entry.target_id.map(|target| target.get()) != Some(user_id.get()) {
                    continue;
                }
                // Entry recency from its snowflake timestamp.
                let at = snowflake_timestamp(entry.id.get());
                if Utc::now() - at > chrono::Duration::minutes(2) {
                    continue;
                }

                let mut added = HashSet::new();
                let mut removed = HashSet::new();
                for change in &entry.changes {
                    match change {
                        AuditLogChange::RoleAdded { new, old: _ } => {
                            added.extend(new.iter().map(|role| role.id));
                        },
                        AuditLogChange::RoleRemoved { new, old: _ } => {
                            removed.extend(new.iter().map(|role| role.id));
                        },
                        _ => {},
                    }
                }
                if !added.is_empty() || !removed.is_empty() {
                    return Some((added, removed));
                }
            }
        }

        None
    }

    /// Permission-mirror watcher for managed roles.
    async fn handle_role_update(self: &Arc<Self>, ev: RoleUpdate) {
        let guild_id = ev.guild_id;
        let role = ev.role;

        // Previous permissions before the cache entry is refreshed.
        let previous = self.cache.role(guild_id, role.id).map(|meta| meta.permissions);
        self.cache.insert_role(guild_id, role.id, CachedRoleMeta::from(&role));

        let bot_owned =
            role.managed || role.tags.as_ref().is_some_and(|tags| tags.bot_id.is_some());
        if !bot_owned {
            return;
        }
        let Some(mirror_role) = self.config.guild(guild_id).and_then(|g| g.mirror_actor_role)
        else {
            return;
        };

        let key = perm_snapshot_key(guild_id, role.id);

        if let Some(actor) = self.find_role_update_actor(guild_id, role.id).await {
            if self.actor_has_role(guild_id, actor, mirror_role).await {
                let prev_bits = previous.unwrap_or_else(|| role.permissions.bits());
                let snapshot = PermSnapshot {
                    prev_permissions: prev_bits,
                    saved_at: Utc::now().timestamp(),
                    actor_user_id: actor,
                };
                match serde_json::to_value(&snapshot) {
                    Ok(data) => {
                        if let Err(e) =
                            self.store.upsert_cache_entry(&key, PERM_SNAPSHOT_TYPE, &data, None)
                        {
                            warn!("Permission snapshot write failed: {e}");
                        } else {
                            info!(
                                "Snapshotted permissions of role {} in {guild_id} (actor {actor})",
                                role.id
                            );
                        }
                    },
                    Err(e) => warn!("Permission snapshot encode failed: {e}"),
                }
                return;
            }
        }

        // Restoration path: conservative, never upgrades downward.
        let Ok(Some(entry)) = self.store.get_cache_entry(&key) else {
            return;
        };
        let Ok(snapshot) = serde_json::from_value::<PermSnapshot>(entry.data) else {
            return;
        };
        let snapshot_perms = Permissions::from_bits_truncate(snapshot.prev_permissions);

        if mirror_restore_needed(role.permissions, snapshot_perms) {
            let request = self
                .session
                .http
                .update_role(guild_id, role.id)
                .permissions(snapshot_perms)
                .reason("Restoring mirrored role permissions");
            match request {
                Ok(request) => match request.await {
                    Ok(_) => info!("Restored permissions of role {} in {guild_id}", role.id),
                    Err(e) => warn!("Permission restore failed: {e}"),
                },
                Err(e) => warn!("Permission restore invalid: {e}"),
            }
        }
    }

    async fn find_role_update_actor(
        &self,
        guild_id: Id<GuildMarker>,
        role_id: Id<RoleMarker>,
    ) -> Option<Id<UserMarker>> {
        let request = self
            .session
            .http
            .audit_log(guild_id)
            .action_type(AuditLogEventType::RoleUpdate)
            .limit(10)
            .ok()?;
        let log = request.await.ok()?.model().await.ok()?;

        log.entries
            .iter()
            .find(|entry| {
                let target_matches =
                    entry.target_id.map_or(false, |target| target.get() == role_id.get());
                let recent = Utc::now() - snowflake_timestamp(entry.id.get())
                    <= chrono::Duration::minutes(2);
                target_matches && recent
            })
            .and_then(|entry| entry.user_id)
    }

    async fn actor_has_role(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
        role_id: Id<RoleMarker>,
    ) -> bool {
        if let Some(member) = self.session.cache.member(guild_id, user_id) {
            return member.roles().contains(&role_id);
        }
        match self.session.member(guild_id, user_id).await {
            Ok(member) => member.roles.contains(&role_id),
            Err(_) => false,
        }
    }

    // ---- avatar observation ----

    /// Record an avatar observation; notify on a real transition unless
    /// silent or within the debounce window.
    async fn observe_avatar(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
        username: String,
        new_hash: String,
        silent: bool,
    ) {
        let (changed, old_hash) =
            match self.store.upsert_avatar(guild_id, user_id, &new_hash, Utc::now()) {
                Ok(result) => result,
                Err(e) => {
                    warn!("Avatar upsert failed for {user_id}: {e}");
                    return;
                },
            };

        if !changed || silent || old_hash.is_none() {
            return;
        }

        // Debounce repeated notifications; stale entries are evicted on the
        // write path.
        {
            let mut recent = self.recent_changes.write();
            let now = Instant::now();
            recent.retain(|_, at| now.duration_since(*at) < AVATAR_DEBOUNCE);
            if recent.contains_key(&(guild_id, user_id)) {
                return;
            }
            recent.insert((guild_id, user_id), now);
        }

        let notification = AvatarChangeNotification {
            guild_id,
            user_id,
            username,
            old_hash,
            new_hash,
        };
        if let Err(e) = self.notifier.notify_avatar_change(notification).await {
            warn!("Avatar notification failed: {}", e.oneliner());
        }
    }

    // ---- routed tasks ----

    fn register_task_handlers(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.router.register(TASK_SCAN_AVATARS, move |ctx| {
            let this = Arc::clone(&this);
            async move { this.scan_avatars(ctx).await }
        });

        let this = Arc::clone(self);
        self.router.register(TASK_REFRESH_ROLES, move |ctx| {
            let this = Arc::clone(&this);
            async move { this.refresh_all_roles(ctx).await }
        });

        let this = Arc::clone(self);
        self.router.register(TASK_CLEANUP, move |ctx| {
            let this = Arc::clone(&this);
            async move {
                let _ = ctx;
                match this.store.cleanup_avatar_history(AVATAR_HISTORY_DAYS) {
                    Ok(0) => {},
                    Ok(reaped) => debug!("Reaped {reaped} avatar history rows"),
                    Err(e) => warn!("Avatar history cleanup failed: {e}"),
                }
                match this.store.cleanup_expired_cache_entries() {
                    Ok(0) => {},
                    Ok(reaped) => debug!("Reaped {reaped} expired cache entries"),
                    Err(e) => warn!("Cache entry cleanup failed: {e}"),
                }
                Ok(())
            }
        });
    }

    fn dispatch_scan(&self, silent: bool) {
        if let Err(e) = self
            .router
            .dispatch(scan_task(silent).group_key("monitor:scan_avatars"))
        {
            debug!("Avatar scan not dispatched: {e}");
        }
    }

    /// Paginate every guild's members, upserting avatars. Silent scans
    /// record state without notifications.
    async fn scan_avatars(self: &Arc<Self>, ctx: TaskContext) -> TaskResult {
        let silent = serde_json::from_value::<ScanPayload>(ctx.payload.clone())
            .map(|payload| payload.silent)
            .unwrap_or(false);

        for guild_id in self.config.guild_ids() {
            if ctx.is_cancelled() {
                return Ok(());
            }

            let mut after: Option<Id<UserMarker>> = None;
            loop {
                if ctx.is_cancelled() {
                    return Ok(());
                }

                let mut request = self
                    .session
                    .http
                    .guild_members(guild_id)
                    .limit(MEMBER_PAGE)
                    .map_err(TaskError::permanent)?;
                if let Some(cursor) = after {
                    request = request.after(cursor);
                }

                let members = request
                    .await
                    .map_err(TaskError::retryable)?
                    .models()
                    .await
                    .map_err(TaskError::permanent)?;
                if members.is_empty() {
                    break;
                }

                for member in &members {
                    if member.user.bot {
                        continue;
                    }
                    if let Some(hash) = member.user.avatar {
                        self.observe_avatar(
                            guild_id,
                            member.user.id,
                            member.user.name.clone(),
                            hash.to_string(),
                            silent,
                        )
                        .await;
                    }
                    self.cache.insert_member(guild_id, CachedMember::from(member));
                }

                after = members.last().map(|member| member.user.id);
                if members.len() < MEMBER_PAGE as usize {
                    break;
                }
            }
        }

        debug!("Avatar scan finished (silent: {silent})");

        Ok(())
    }

    /// Snapshot every member's role set into the store and roles cache.
    async fn refresh_all_roles(self: &Arc<Self>, ctx: TaskContext) -> TaskResult {
        let now = Utc::now();

        for guild_id in self.config.guild_ids() {
            if ctx.is_cancelled() {
                return Ok(());
            }

            let mut after: Option<Id<UserMarker>> = None;
            loop {
                if ctx.is_cancelled() {
                    return Ok(());
                }

                let mut request = self
                    .session
                    .http
                    .guild_members(guild_id)
                    .limit(MEMBER_PAGE)
                    .map_err(TaskError::permanent)?;
                if let Some(cursor) = after {
                    request = request.after(cursor);
                }

                let members = request
                    .await
                    .map_err(TaskError::retryable)?
                    .models()
                    .await
                    .map_err(TaskError::permanent)?;
                if members.is_empty() {
                    break;
                }

                for member in &members {
                    let roles: HashSet<_> = member.roles.iter().copied().collect();
                    if let Err(e) =
                        self.store.upsert_member_roles(guild_id, member.user.id, &roles, now)
                    {
                        warn!("Role refresh write failed: {e}");
                        continue;
                    }
                    self.refresh_roles_entry(guild_id, member.user.id, roles);
                }

                after = members.last().map(|member| member.user.id);
                if members.len() < MEMBER_PAGE as usize {
                    break;
                }
            }
        }

        debug!("Roles refresh finished");

        Ok(())
    }

    // ---- roles cache ----

    fn refresh_roles_entry(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
        roles: HashSet<Id<RoleMarker>>,
    ) {
        self.roles_cache.write().insert(
            (guild_id, user_id),
            RolesEntry { roles, refreshed_at: Instant::now() },
        );
    }

    /// Cached role set, bounded staleness per guild TTL.
    pub fn cached_roles(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
    ) -> Option<HashSet<Id<RoleMarker>>> {
        let ttl = self.roles_cache_ttl(guild_id);
        let cache = self.roles_cache.read();
        let entry = cache.get(&(guild_id, user_id))?;
        (entry.refreshed_at.elapsed() < ttl).then(|| entry.roles.clone())
    }

    fn roles_cache_ttl(&self, guild_id: Id<GuildMarker>) -> Duration {
        self.config
            .guild(guild_id)
            .and_then(|g| g.roles_cache_ttl_secs)
            .map(Duration::from_secs)
            .unwrap_or(ROLES_CACHE_TTL)
    }

    fn cleanup_roles_cache(&self) {
        let mut cache = self.roles_cache.write();
        let before = cache.len();
        cache.retain(|(guild_id, _), entry| {
            let ttl = self.roles_cache_ttl(*guild_id);
            entry.refreshed_at.elapsed() < ttl
        });
        let removed = before - cache.len();
        if removed > 0 {
            debug!("Dropped {removed} stale roles cache entries");
        }
    }
}

fn scan_task(silent: bool) -> Task {
    let payload = serde_json::to_value(ScanPayload { silent }).unwrap_or_default();
    Task::new(TASK_SCAN_AVATARS, payload)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn downtime_requires_a_stale_or_missing_heartbeat() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        assert!(is_downtime(None, now));
        assert!(is_downtime(Some(now - chrono::Duration::minutes(45)), now));
        assert!(!is_downtime(Some(now - chrono::Duration::minutes(5)), now));
        assert!(!is_downtime(Some(now - chrono::Duration::minutes(30)), now));
    }

    #[test]
    fn mirror_restore_is_conservative() {
        let snapshot = Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES;

        // Lost a bit: restore.
        assert!(mirror_restore_needed(Permissions::VIEW_CHANNEL, snapshot));
        assert!(mirror_restore_needed(Permissions::empty(), snapshot));
        // Unchanged: leave alone.
        assert!(!mirror_restore_needed(snapshot, snapshot));
        // Gained beyond the snapshot: never downgrade.
        assert!(!mirror_restore_needed(
            snapshot | Permissions::MANAGE_MESSAGES,
            snapshot
        ));
        // Disjoint gain and loss: not a pure downgrade, leave alone.
        assert!(!mirror_restore_needed(
            Permissions::VIEW_CHANNEL | Permissions::MANAGE_MESSAGES,
            snapshot
        ));
    }

    #[test]
    fn perm_snapshot_roundtrips_through_json() {
        let snapshot = PermSnapshot {
            prev_permissions: (Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES).bits(),
            saved_at: 1_700_000_000,
            actor_user_id: Id::new(42),
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        let back: PermSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn snapshot_keys_are_scoped_per_role() {
        assert_eq!(
            perm_snapshot_key(Id::new(1), Id::new(2)),
            "bot_role_perm_snapshot:1:2"
        );
        assert_ne!(
            perm_snapshot_key(Id::new(1), Id::new(2)),
            perm_snapshot_key(Id::new(1), Id::new(3))
        );
    }
}

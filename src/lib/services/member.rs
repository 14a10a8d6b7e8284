use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use twilight_http::request::AuditLogReason;
use twilight_model::gateway::event::{Event, EventType};
use twilight_model::gateway::payload::incoming::{MemberAdd, MemberRemove, MemberUpdate};
use twilight_model::id::marker::{GuildMarker, RoleMarker, UserMarker};
use twilight_model::id::Id;

use crate::config::{AutoRoleConfig, ConfigManager};
use crate::notify::{JoinNotification, LeaveNotification, NotificationSender};
use crate::store::Store;
use crate::utils::prelude::*;
use crate::utils::{snowflake_timestamp, timestamp_secs_to_utc};
use crate::{Session, Subscription};

/// Cleanup cadence for the join-times map.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

/// How long in-memory join times are kept around.
fn join_times_max_age() -> chrono::Duration {
    chrono::Duration::days(7)
}

type JoinTimes = HashMap<(Id<GuildMarker>, Id<UserMarker>), DateTime<Utc>>;

/// What the composite auto-role gate wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AutoRoleAction {
    Grant,
    Revoke,
}

/// Evaluate the two-input gate: target iff A and B.
fn auto_role_action(config: &AutoRoleConfig, roles: &[Id<RoleMarker>]) -> Option<AutoRoleAction> {
    let has_target = roles.contains(&config.target);
    let has_a = roles.contains(&config.require_a);
    let has_b = roles.contains(&config.require_b);

    if !has_a && has_target {
        Some(AutoRoleAction::Revoke)
    } else if has_a && has_b && !has_target {
        Some(AutoRoleAction::Grant)
    } else {
        None
    }
}

/// Drop entries older than `max_age`. Returns how many were removed.
fn expire_join_times(map: &mut JoinTimes, now: DateTime<Utc>, max_age: chrono::Duration) -> usize {
    let before = map.len();
    map.retain(|_, joined| now - *joined < max_age);

    before - map.len()
}

/// Member lifecycle handling: joins, leaves and the auto-role relation.
pub struct MemberEventService {
    session: Arc<Session>,
    store: Arc<Store>,
    config: Arc<ConfigManager>,
    notifier: Arc<NotificationSender>,
    join_times: Arc<RwLock<JoinTimes>>,
    subscriptions: Mutex<Vec<Subscription>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl MemberEventService {
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
            join_times: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Mutex::new(Vec::new()),
            cleanup: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn start(self: &Arc<Self>) -> AnyResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut subs = Vec::new();

        let this = Arc::clone(self);
        subs.push(self.session.events.subscribe(EventType::MemberAdd, move |event| {
            let this = Arc::clone(&this);
            async move {
                if let Event::MemberAdd(ev) = event {
                    this.handle_member_add(*ev).await;
                }
            }
        }));

        let this = Arc::clone(self);
        subs.push(
            self.session.events.subscribe(EventType::MemberRemove, move |event| {
                let this = Arc::clone(&this);
                async move {
                    if let Event::MemberRemove(ev) = event {
                        this.handle_member_remove(ev).await;
                    }
                }
            }),
        );

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

        *self.subscriptions.lock() = subs;

        // Periodically drop stale join times.
        let join_times = Arc::clone(&self.join_times);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed =
                    expire_join_times(&mut join_times.write(), Utc::now(), join_times_max_age());
                if removed > 0 {
                    debug!("Dropped {removed} stale join time entries");
                }
            }
        });
        *self.cleanup.lock() = Some(handle);

        info!("Member event service started");

        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.subscriptions.lock().clear();
        if let Some(handle) = self.cleanup.lock().take() {
            handle.abort();
        }

        info!("Member event service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Repair auto-role state for a whole guild payload, without needing
    /// event history.
    pub async fn reconcile_guild(
        &self,
        guild_id: Id<GuildMarker>,
        members: &[twilight_model::guild::Member],
    ) {
        let Some(auto_role) = self.config.guild(guild_id).and_then(|g| g.auto_role) else {
            return;
        };

        for member in members {
            if member.user.bot {
                continue;
            }
            self.apply_auto_role(guild_id, member.user.id, &auto_role, &member.roles).await;
        }
    }

    /// Join time retained for the leave handler, if still in memory.
    pub fn join_time(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
    ) -> Option<DateTime<Utc>> {
        self.join_times.read().get(&(guild_id, user_id)).copied()
    }

    async fn handle_member_add(&self, ev: MemberAdd) {
        let guild_id = ev.guild_id;
        if ev.user.bot {
            trace!("Ignoring bot join '{}'", ev.user.name);
            return;
        }

        let runtime = self.config.resolve_runtime(guild_id);
        if runtime.disable_entry_exit_logs {
            return;
        }

        let user_id = ev.user.id;
        let username = ev.user.name.clone();

        // Prefer the event's joined-at; one REST read as fallback.
        let joined_at = match timestamp_secs_to_utc(ev.joined_at.as_secs()) {
            Some(at) => at,
            None => match self.session.member(guild_id, user_id).await {
                Ok(member) => timestamp_secs_to_utc(member.joined_at.as_secs()).unwrap_or_else(Utc::now),
                Err(e) => {
                    debug!("Member fetch failed for join of {user_id}: {}", e.oneliner());
                    Utc::now()
                },
            },
        };

        if let Err(e) = self.store.upsert_member_join(guild_id, user_id, joined_at) {
            warn!("Failed to record join of {user_id} in {guild_id}: {e}");
        }
        if let Err(e) = self.store.increment_daily_join_count(guild_id, user_id, joined_at) {
            warn!("Failed to count join of {user_id} in {guild_id}: {e}");
        }

        self.join_times.write().insert((guild_id, user_id), joined_at);

        let notification = JoinNotification {
            guild_id,
            user_id,
            username,
            joined_at,
            account_created: snowflake_timestamp(user_id.get()),
        };
        if let Err(e) = self.notifier.notify_member_join(notification).await {
            warn!("Join notification failed: {}", e.oneliner());
        }

        // Composite auto-role, evaluated on the roles carried by the event.
        if let Some(auto_role) = self.config.guild(guild_id).and_then(|g| g.auto_role) {
            self.apply_auto_role(guild_id, user_id, &auto_role, &ev.roles).await;
        }
    }

    async fn handle_member_update(&self, ev: MemberUpdate) {
        if ev.user.bot {
            return;
        }

        let Some(auto_role) = self.config.guild(ev.guild_id).and_then(|g| g.auto_role) else {
            return;
        };

        self.apply_auto_role(ev.guild_id, ev.user.id, &auto_role, &ev.roles).await;
    }

    async fn handle_member_remove(&self, ev: MemberRemove) {
        let guild_id = ev.guild_id;
        if ev.user.bot {
            return;
        }

        let runtime = self.config.resolve_runtime(guild_id);
        if runtime.disable_entry_exit_logs {
            return;
        }

        let user_id = ev.user.id;
        let left_at = Utc::now();

        let joined_at = self
            .join_times
            .write()
            .remove(&(guild_id, user_id))
            .or_else(|| self.store.get_member_join(guild_id, user_id).ok().flatten());
        let tenure = joined_at.map(|at| left_at - at);

        let bot_tenure = self
            .store
            .get_guild_meta(guild_id)
            .ok()
            .flatten()
            .map(|meta| left_at - meta.bot_since);

        if let Err(e) = self.store.increment_daily_leave_count(guild_id, user_id, left_at) {
            warn!("Failed to count leave of {user_id} in {guild_id}: {e}");
        }

        let notification = LeaveNotification {
            guild_id,
            user_id,
            username: ev.user.name,
            left_at,
            tenure,
            bot_tenure,
        };
        if let Err(e) = self.notifier.notify_member_leave(notification).await {
            warn!("Leave notification failed: {}", e.oneliner());
        }
    }

    async fn apply_auto_role(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
        config: &AutoRoleConfig,
        roles: &[Id<RoleMarker>],
    ) {
        match auto_role_action(config, roles) {
            Some(AutoRoleAction::Grant) => {
                let request = self
                    .session
                    .http
                    .add_guild_member_role(guild_id, user_id, config.target)
                    .reason("Auto-role prerequisites met");
                match request {
                    Ok(request) => {
                        if let Err(e) = request.await {
                            warn!("Auto-role grant failed for {user_id}: {e}");
                        } else {
                            info!("Granted auto-role to {user_id} in {guild_id}");
                        }
                    },
                    Err(e) => warn!("Auto-role grant invalid: {e}"),
                }
            },
            Some(AutoRoleAction::Revoke) => {
                let request = self
                    .session
                    .http
                    .remove_guild_member_role(guild_id, user_id, config.target)
                    .reason("Auto-role prerequisite missing");
                match request {
                    Ok(request) => {
                        if let Err(e) = request.await {
                            warn!("Auto-role revoke failed for {user_id}: {e}");
                        } else {
                            info!("Revoked auto-role from {user_id} in {guild_id}");
                        }
                    },
                    Err(e) => warn!("Auto-role revoke invalid: {e}"),
                }
            },
            None => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(n: u64) -> Id<RoleMarker> {
        Id::new(n)
    }

    fn config() -> AutoRoleConfig {
        AutoRoleConfig {
            target: rid(1),
            require_a: rid(2),
            require_b: rid(3),
        }
    }

    #[test]
    fn auto_role_grants_when_both_prerequisites_held() {
        assert_eq!(
            auto_role_action(&config(), &[rid(2), rid(3)]),
            Some(AutoRoleAction::Grant)
        );
        // Already granted, nothing to do.
        assert_eq!(auto_role_action(&config(), &[rid(1), rid(2), rid(3)]), None);
    }

    #[test]
    fn auto_role_revokes_when_prerequisite_a_missing() {
        assert_eq!(
            auto_role_action(&config(), &[rid(1), rid(3)]),
            Some(AutoRoleAction::Revoke)
        );
        assert_eq!(auto_role_action(&config(), &[rid(1)]), Some(AutoRoleAction::Revoke));
    }

    #[test]
    fn auto_role_waits_for_second_prerequisite() {
        // Only A held: neither grant nor revoke.
        assert_eq!(auto_role_action(&config(), &[rid(2)]), None);
        assert_eq!(auto_role_action(&config(), &[]), None);
    }

    #[test]
    fn join_times_expire_by_age() {
        let mut map = JoinTimes::new();
        let now = Utc::now();
        map.insert((Id::new(1), Id::new(2)), now - chrono::Duration::days(8));
        map.insert((Id::new(1), Id::new(3)), now - chrono::Duration::days(1));

        let removed = expire_join_times(&mut map, now, join_times_max_age());
        assert_eq!(removed, 1);
        assert!(map.contains_key(&(Id::new(1), Id::new(3))));
    }
}

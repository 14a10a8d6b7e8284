use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use twilight_model::channel::Message;
use twilight_model::gateway::event::{Event, EventType};
use twilight_model::gateway::payload::incoming::{MessageDelete, MessageUpdate};
use twilight_model::guild::audit_log::AuditLogEventType;
use twilight_model::id::marker::{ChannelMarker, GuildMarker, UserMarker};
use twilight_model::id::Id;

use crate::config::ConfigManager;
use crate::notify::{MessageDeleteNotification, MessageEditNotification, NotificationSender};
use crate::store::{MessageEventType, MessageRecord, MessageVersion, Store};
use crate::utils::prelude::*;
use crate::utils::{env_bool, env_u64};
use crate::{Session, Subscription};

/// Retry ladder for update lookups, tolerates event reordering.
const UPDATE_RETRY_DELAYS: [Duration; 2] = [Duration::from_millis(200), Duration::from_millis(400)];
/// How many audit-log entries the delete actor scan inspects.
const DELETE_AUDIT_SCAN: u16 = 50;
/// Cadence of the expired-row reaper.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3_600);

/// Message cache behavior, environment-driven.
#[derive(Debug, Clone)]
pub struct MessageCacheOptions {
    pub enabled: bool,
    pub ttl: Duration,
    pub delete_on_log: bool,
    pub cleanup: bool,
    pub versioning: bool,
}

impl MessageCacheOptions {
    pub fn from_env() -> Self {
        let ttl_hours = env_u64("ALICE_MESSAGE_CACHE_TTL_HOURS").unwrap_or(72);

        Self {
            enabled: env_bool("ALICE_MESSAGE_CACHE_ENABLED").unwrap_or(true),
            ttl: Duration::from_secs(ttl_hours.saturating_mul(3_600)),
            delete_on_log: env_bool("ALICE_MESSAGE_DELETE_ON_LOG").unwrap_or(false),
            cleanup: env_bool("ALICE_MESSAGE_CACHE_CLEANUP").unwrap_or(true),
            versioning: env_bool("ALICE_MESSAGE_VERSIONING_ENABLED").unwrap_or(false),
        }
    }
}

impl Default for MessageCacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(72 * 3_600),
            delete_on_log: false,
            cleanup: true,
            versioning: false,
        }
    }
}

/// Summary line for messages that carry no text.
fn non_text_summary(attachments: usize, embeds: usize, stickers: usize) -> String {
    format!("[attachments: {attachments}] [embeds: {embeds}] [stickers: {stickers}]")
}

/// Message create/update/delete handling with write-through caching.
pub struct MessageEventService {
    session: Arc<Session>,
    store: Arc<Store>,
    config: Arc<ConfigManager>,
    notifier: Arc<NotificationSender>,
    options: MessageCacheOptions,
    subscriptions: Mutex<Vec<Subscription>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl MessageEventService {
    pub fn new(
        session: Arc<Session>,
        store: Arc<Store>,
        config: Arc<ConfigManager>,
        notifier: Arc<NotificationSender>,
        options: MessageCacheOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            store,
            config,
            notifier,
            options,
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
        subs.push(
            self.session.events.subscribe(EventType::MessageCreate, move |event| {
                let this = Arc::clone(&this);
                async move {
                    if let Event::MessageCreate(ev) = event {
                        this.handle_message_create(ev.0).await;
                    }
                }
            }),
        );

        let this = Arc::clone(self);
        subs.push(
            self.session.events.subscribe(EventType::MessageUpdate, move |event| {
                let this = Arc::clone(&this);
                async move {
                    if let Event::MessageUpdate(ev) = event {
                        this.handle_message_update(*ev).await;
                    }
                }
            }),
        );

        let this = Arc::clone(self);
        subs.push(
            self.session.events.subscribe(EventType::MessageDelete, move |event| {
                let this = Arc::clone(&this);
                async move {
                    if let Event::MessageDelete(ev) = event {
                        this.handle_message_delete(ev).await;
                    }
                }
            }),
        );

        *self.subscriptions.lock() = subs;

        if self.options.cleanup {
            let store = Arc::clone(&self.store);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match store.cleanup_expired_messages() {
                        Ok(0) => {},
                        Ok(reaped) => debug!("Reaped {reaped} expired messages"),
                        Err(e) => warn!("Message cleanup failed: {e}"),
                    }
                }
            });
            *self.cleanup.lock() = Some(handle);
        }

        info!("Message event service started");

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

        info!("Message event service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn handle_message_create(&self, message: Message) {
        // Bots and DMs are not logged.
        if message.author.bot {
            return;
        }
        let Some(guild_id) = message.guild_id else {
            return;
        };

        let now = Utc::now();

        if self.options.enabled {
            let content = self.effective_content(
                &message.content,
                message.attachments.len(),
                message.embeds.len(),
                message.sticker_items.len(),
            );

            let record = MessageRecord {
                guild_id,
                message_id: message.id,
                channel_id: message.channel_id,
                author_id: message.author.id,
                author_username: message.author.name.clone(),
                author_avatar: message.author.avatar.map(|hash| hash.to_string()),
                content: content.clone(),
                cached_at: now,
                expires_at: Some(now + chrono::Duration::seconds(self.options.ttl.as_secs() as i64)),
            };
            if let Err(e) = self.store.upsert_message(&record) {
                warn!("Failed to cache message {}: {e}", message.id);
            }

            if self.options.versioning {
                let version = MessageVersion {
                    guild_id,
                    message_id: message.id,
                    version: 0,
                    event_type: MessageEventType::Create,
                    content,
                    attachment_count: message.attachments.len() as u32,
                    embed_count: message.embeds.len() as u32,
                    sticker_count: message.sticker_items.len() as u32,
                    created_at: now,
                };
                if let Err(e) = self.store.insert_message_version(&version) {
                    warn!("Failed to version message {}: {e}", message.id);
                }
            }
        }

        if let Err(e) = self.store.increment_daily_message_count(
            guild_id,
            message.channel_id,
            message.author.id,
            now,
        ) {
            warn!("Failed to count message {}: {e}", message.id);
        }
    }

    async fn handle_message_update(&self, update: MessageUpdate) {
        let Some(guild_id) = update.guild_id else {
            return;
        };
        if update.author.as_ref().is_some_and(|author| author.bot) {
            return;
        }

        // Small retry ladder: the update may arrive before the create was
        // written through.
        let mut original = self.store.get_message(guild_id, update.id).ok().flatten();
        for delay in UPDATE_RETRY_DELAYS {
            if original.is_some() {
                break;
            }
            tokio::time::sleep(delay).await;
            original = self.store.get_message(guild_id, update.id).ok().flatten();
        }
        let Some(original) = original else {
            debug!("No cached original for updated message {}", update.id);
            return;
        };

        // Content missing from the update payload: one REST read.
        let (content, attachments, embeds, stickers) = match update.content {
            Some(content) => (
                content,
                update.attachments.as_ref().map_or(0, Vec::len),
                update.embeds.as_ref().map_or(0, Vec::len),
                0,
            ),
            None => {
                match self.session.http.message(update.channel_id, update.id).await {
                    Ok(response) => match response.model().await {
                        Ok(message) => (
                            message.content,
                            message.attachments.len(),
                            message.embeds.len(),
                            message.sticker_items.len(),
                        ),
                        Err(e) => {
                            debug!("Failed to decode updated message {}: {e}", update.id);
                            return;
                        },
                    },
                    Err(e) => {
                        debug!("Failed to fetch updated message {}: {e}", update.id);
                        return;
                    },
                }
            },
        };

        let content = self.effective_content(&content, attachments, embeds, stickers);

        // Nothing user-visible changed.
        if content == original.content {
            return;
        }

        let notification = MessageEditNotification {
            guild_id,
            channel_id: original.channel_id,
            message_id: update.id,
            author_id: original.author_id,
            author_username: original.author_username.clone(),
            before: original.content.clone(),
            after: content.clone(),
        };
        if let Err(e) = self.notifier.notify_message_edit(notification).await {
            warn!("Edit notification failed: {}", e.oneliner());
        }

        let now = Utc::now();
        let record = MessageRecord {
            content: content.clone(),
            cached_at: now,
            expires_at: Some(now + chrono::Duration::seconds(self.options.ttl.as_secs() as i64)),
            ..original
        };
        if let Err(e) = self.store.upsert_message(&record) {
            warn!("Failed to update cached message {}: {e}", update.id);
        }

        if self.options.versioning {
            let version = MessageVersion {
                guild_id,
                message_id: update.id,
                version: 0,
                event_type: MessageEventType::Edit,
                content,
                attachment_count: attachments as u32,
                embed_count: embeds as u32,
                sticker_count: stickers as u32,
                created_at: now,
            };
            if let Err(e) = self.store.insert_message_version(&version) {
                warn!("Failed to version edit of {}: {e}", update.id);
            }
        }
    }

    async fn handle_message_delete(&self, delete: MessageDelete) {
        let Some(guild_id) = delete.guild_id else {
            return;
        };

        let Some(original) = self.store.get_message(guild_id, delete.id).ok().flatten() else {
            debug!("No cached original for deleted message {}", delete.id);
            return;
        };

        let actor = self
            .resolve_delete_actor(guild_id, original.author_id, original.channel_id)
            .await;

        let notification = MessageDeleteNotification {
            guild_id,
            channel_id: original.channel_id,
            message_id: delete.id,
            author_id: original.author_id,
            author_username: original.author_username.clone(),
            content: original.content.clone(),
            actor,
        };
        if let Err(e) = self.notifier.notify_message_delete(notification).await {
            warn!("Delete notification failed: {}", e.oneliner());
        }

        if self.options.versioning {
            let version = MessageVersion {
                guild_id,
                message_id: delete.id,
                version: 0,
                event_type: MessageEventType::Delete,
                content: original.content,
                attachment_count: 0,
                embed_count: 0,
                sticker_count: 0,
                created_at: Utc::now(),
            };
            if let Err(e) = self.store.insert_message_version(&version) {
                warn!("Failed to version delete of {}: {e}", delete.id);
            }
        }

        if self.options.delete_on_log {
            if let Err(e) = self.store.delete_message(guild_id, delete.id) {
                warn!("Failed to drop cached message {}: {e}", delete.id);
            }
        }
    }

    /// Best-effort audit-log scan for who deleted the message.
    async fn resolve_delete_actor(
        &self,
        guild_id: Id<GuildMarker>,
        author_id: Id<UserMarker>,
        channel_id: Id<ChannelMarker>,
    ) -> Option<Id<UserMarker>> {
        let request = self
            .session
            .http
            .audit_log(guild_id)
            .action_type(AuditLogEventType::MessageDelete)
            .limit(DELETE_AUDIT_SCAN)
            .ok()?;

        let log = request.await.ok()?.model().await.ok()?;

        log.entries
            .iter()
            .find(|entry| {
                let target_matches =
                    entry.target_id.map_or(false, |target| target.get() == author_id.get());
                let channel_matches = entry
                    .options
                    .as_ref()
                    .and_then(|options| options.channel_id)
                    .map_or(true, |id| id == channel_id);
                target_matches && channel_matches
            })
            .and_then(|entry| entry.user_id)
    }

    /// Content, or a synthesized summary for non-text messages.
    fn effective_content(
        &self,
        content: &str,
        attachments: usize,
        embeds: usize,
        stickers: usize,
    ) -> String {
        if content.is_empty() && attachments + embeds + stickers > 0 {
            non_text_summary(attachments, embeds, stickers)
        } else {
            content.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_format_for_non_text_messages() {
        assert_eq!(
            non_text_summary(2, 1, 0),
            "[attachments: 2] [embeds: 1] [stickers: 0]"
        );
    }

    #[test]
    fn cache_options_defaults() {
        let options = MessageCacheOptions::default();
        assert!(options.enabled);
        assert_eq!(options.ttl, Duration::from_secs(72 * 3_600));
        assert!(!options.delete_on_log);
        assert!(options.cleanup);
        assert!(!options.versioning);
    }

    #[test]
    fn retry_ladder_matches_observed_reordering() {
        assert_eq!(
            UPDATE_RETRY_DELAYS,
            [Duration::from_millis(200), Duration::from_millis(400)]
        );
    }
}

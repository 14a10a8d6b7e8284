use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use twilight_model::gateway::event::{Event, EventType};
use twilight_model::gateway::payload::incoming::AutoModerationActionExecution;

use crate::config::ConfigManager;
use crate::notify::{self, AutomodNotification, NotificationSender};
use crate::policy::{self, LogEvent};
use crate::utils::prelude::*;
use crate::{Session, Subscription};

/// Native platform moderation-action logging.
pub struct AutomodService {
    session: Arc<Session>,
    config: Arc<ConfigManager>,
    /// Wired post-construction; without it, embeds are sent directly.
    notifier: Mutex<Option<Arc<NotificationSender>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    running: AtomicBool,
}

impl AutomodService {
    pub fn new(session: Arc<Session>, config: Arc<ConfigManager>) -> Arc<Self> {
        Arc::new(Self {
            session,
            config,
            notifier: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn set_notifier(&self, notifier: Arc<NotificationSender>) {
        *self.notifier.lock() = Some(notifier);
    }

    pub fn start(self: &Arc<Self>) -> AnyResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let this = Arc::clone(self);
        let sub = self.session.events.subscribe(
            EventType::AutoModerationActionExecution,
            move |event| {
                let this = Arc::clone(&this);
                async move {
                    if let Event::AutoModerationActionExecution(ev) = event {
                        this.handle_action(ev).await;
                    }
                }
            },
        );
        self.subscriptions.lock().push(sub);

        info!("Automod service started");

        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.subscriptions.lock().clear();

        info!("Automod service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn handle_action(&self, action: AutoModerationActionExecution) {
        // Prefer full content, fall back to the matched fragment.
        let source = if !action.content.is_empty() {
            action.content.as_str()
        } else {
            action.matched_content.as_deref().unwrap_or_default()
        };

        let notification = AutomodNotification {
            guild_id: action.guild_id,
            user_id: action.user_id,
            rule_id: action.rule_id,
            matched_keyword: action.matched_keyword.clone(),
            excerpt: notify::excerpt(source),
        };

        let notifier = self.notifier.lock().clone();
        match notifier {
            Some(notifier) => {
                // Adapter path: policy gate and duplicate drop live there.
                if let Err(e) = notifier.notify_automod_action(notification).await {
                    warn!("Automod notification failed: {}", e.oneliner());
                }
            },
            None => {
                if let Err(e) = self.send_directly(notification).await {
                    warn!("Automod direct send failed: {}", e.oneliner());
                }
            },
        }
    }

    /// No adapter wired: run the policy and send in place.
    async fn send_directly(&self, notification: AutomodNotification) -> AnyResult<()> {
        let decision = policy::should_emit(
            &self.session,
            &self.config,
            LogEvent::AutomodAction,
            notification.guild_id,
        )
        .await;

        let Some(channel_id) = decision.channel_id.filter(|_| decision.enabled) else {
            debug!(
                "Automod log suppressed for guild {}: {}",
                notification.guild_id, decision.reason
            );
            return Ok(());
        };

        let embed = notify::automod_action_embed(&notification);
        self.session
            .http
            .create_message(channel_id)
            .embeds(&[embed])?
            .await?;

        Ok(())
    }
}

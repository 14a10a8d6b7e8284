use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use twilight_model::gateway::event::{Event, EventType};
use twilight_model::gateway::GatewayReaction;
use twilight_model::id::marker::GuildMarker;
use twilight_model::id::Id;

use crate::store::Store;
use crate::utils::prelude::*;
use crate::{Session, Subscription};

/// Reaction metering. Counts additions per reactor per day; removals are
/// unmetered by design. Emits nothing.
pub struct ReactionEventService {
    session: Arc<Session>,
    store: Arc<Store>,
    subscriptions: Mutex<Vec<Subscription>>,
    running: AtomicBool,
}

impl ReactionEventService {
    pub fn new(session: Arc<Session>, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            session,
            store,
            subscriptions: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn start(self: &Arc<Self>) -> AnyResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let this = Arc::clone(self);
        let sub = self.session.events.subscribe(EventType::ReactionAdd, move |event| {
            let this = Arc::clone(&this);
            async move {
                if let Event::ReactionAdd(ev) = event {
                    this.handle_reaction_add(ev.0).await;
                }
            }
        });
        self.subscriptions.lock().push(sub);

        info!("Reaction event service started");

        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.subscriptions.lock().clear();

        info!("Reaction event service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn handle_reaction_add(&self, reaction: GatewayReaction) {
        // Ignore reactions from bots where the member payload says so.
        if reaction.member.as_ref().is_some_and(|member| member.user.bot) {
            return;
        }

        let Some(guild_id) = self.resolve_guild(&reaction) else {
            return;
        };

        if let Err(e) = self.store.increment_daily_reaction_count(
            guild_id,
            reaction.channel_id,
            reaction.user_id,
            Utc::now(),
        ) {
            warn!("Failed to count reaction in {guild_id}: {e}");
        }
    }

    /// Guild from the event, or from channel state as a fallback.
    fn resolve_guild(&self, reaction: &GatewayReaction) -> Option<Id<GuildMarker>> {
        reaction.guild_id.or_else(|| {
            self.session
                .cache
                .channel(reaction.channel_id)
                .and_then(|channel| channel.guild_id)
        })
    }
}

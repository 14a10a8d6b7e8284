use std::collections::HashMap;
use std::env;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use twilight_cache_inmemory::InMemoryCache;
use twilight_gateway::{stream, ConfigBuilder, EventTypeFlags, Shard};
use twilight_http::Client;
use twilight_model::channel::Channel;
use twilight_model::gateway::event::{Event, EventType};
use twilight_model::gateway::payload::incoming::ChannelUpdate;
use twilight_model::gateway::Intents;
use twilight_model::guild::Member;
use twilight_model::id::marker::{ChannelMarker, GuildMarker, UserMarker};
use twilight_model::id::Id;
use twilight_model::user::CurrentUser;

use crate::utils::prelude::*;

pub mod backfill;
pub mod cache;
pub mod config;
pub mod enforcement;
pub mod notify;
pub mod policy;
pub mod services;
pub mod store;
pub mod tasks;
pub mod utils;
pub mod webhook;

type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;
type HandlerRegistry = RwLock<HashMap<EventType, Vec<(u64, EventHandler)>>>;

/// Event subscription registry.
///
/// Handlers run on their own tasks; a slow handler never blocks the gateway
/// loop or other handlers.
#[derive(Default)]
pub struct Events {
    registry: Arc<HandlerRegistry>,
    next_id: AtomicU64,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event type. The returned handle
    /// unsubscribes when dropped or on an explicit call.
    pub fn subscribe<F, Fut>(&self, kind: EventType, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: EventHandler = Arc::new(move |event| Box::pin(handler(event)));

        self.registry.write().entry(kind).or_default().push((id, handler));

        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Spawn every handler subscribed to this event's type.
    pub fn fire(&self, event: &Event) {
        let handlers = {
            let registry = self.registry.read();
            match registry.get(&event.kind()) {
                Some(handlers) => handlers
                    .iter()
                    .map(|(_, handler)| Arc::clone(handler))
                    .collect::<Vec<_>>(),
                None => return,
            }
        };

        for handler in handlers {
            tokio::spawn(handler(event.clone()));
        }
    }

    #[cfg(test)]
    fn handler_count(&self, kind: EventType) -> usize {
        self.registry.read().get(&kind).map_or(0, Vec::len)
    }
}

/// Unsubscribe handle returned by [`Events::subscribe`].
pub struct Subscription {
    kind: EventType,
    id: u64,
    registry: Weak<HandlerRegistry>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Some(handlers) = registry.write().get_mut(&self.kind) {
                handlers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// Gateway session: REST client, state cache, bot identity and event bus.
pub struct Session {
    /// Application http client.
    pub http: Arc<Client>,
    /// Caching of twilight events.
    pub cache: Arc<InMemoryCache>,
    /// Application bot user.
    pub user: Arc<CurrentUser>,
    /// Intents negotiated at connection time.
    pub intents: Intents,
    /// Event subscriptions.
    pub events: Events,
}

impl Session {
    /// Connect to Discord and create the recommended shards.
    pub async fn connect() -> AnyResult<(Arc<Self>, Vec<Shard>)> {
        let token = env::var("DISCORD_TOKEN").context("Expected a token in the environment")?;
        let http = Arc::new(Client::new(token.clone()));
        let user = Arc::new(http.current_user().await?.model().await?);
        let cache = Arc::new(InMemoryCache::new());

        let shards = stream::create_recommended(
            &http,
            ConfigBuilder::new(token, intents())
                .event_types(event_type_flags())
                .build(),
            |_, builder| builder.build(),
        )
        .await?
        .collect::<Vec<_>>();

        let session = Arc::new(Self {
            http,
            cache,
            user,
            intents: intents(),
            events: Events::new(),
        });

        Ok((session, shards))
    }

    /// Update the state cache and fan the event out to subscribers.
    pub fn process(&self, event: &Event) {
        self.cache.update(event);
        self.events.fire(event);
    }

    /// Get the channel object from cache or fetch from client.
    pub async fn channel(&self, channel_id: Id<ChannelMarker>) -> AnyResult<Channel> {
        match self.cache.channel(channel_id) {
            Some(chan) => Ok(chan.to_owned()),
            None => {
                let chan = self.http.channel(channel_id).await?.model().await?;
                self.cache.update(&ChannelUpdate(chan.clone()));
                Ok(chan)
            },
        }
    }

    /// Fetch a guild member from the client.
    pub async fn member(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
    ) -> AnyResult<Member> {
        Ok(self.http.guild_member(guild_id, user_id).await?.model().await?)
    }
}

/// Discord permission intents.
fn intents() -> Intents {
    Intents::GUILDS
        | Intents::GUILD_MEMBERS
        | Intents::GUILD_MESSAGES
        | Intents::GUILD_MESSAGE_REACTIONS
        | Intents::GUILD_PRESENCES
        | Intents::MESSAGE_CONTENT
        | Intents::AUTO_MODERATION_EXECUTION
}

/// Subscribed events from Discord.
fn event_type_flags() -> EventTypeFlags {
    EventTypeFlags::all()
        - EventTypeFlags::TYPING_START
        - EventTypeFlags::DIRECT_MESSAGE_TYPING
        - EventTypeFlags::GUILD_MESSAGE_TYPING
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use twilight_model::gateway::payload::incoming::MessageDelete;

    use super::*;

    fn delete_event() -> Event {
        Event::MessageDelete(MessageDelete {
            channel_id: Id::new(1),
            guild_id: Some(Id::new(2)),
            id: Id::new(3),
        })
    }

    #[tokio::test]
    async fn subscription_fires_and_unsubscribes() {
        let events = Events::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&counter);
        let sub = events.subscribe(EventType::MessageDelete, move |_event| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(events.handler_count(EventType::MessageDelete), 1);

        events.fire(&delete_event());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        assert_eq!(events.handler_count(EventType::MessageDelete), 0);

        events.fire(&delete_event());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn intent_mask_covers_monitored_surfaces() {
        let intents = intents();
        assert!(intents.contains(Intents::GUILD_MEMBERS));
        assert!(intents.contains(Intents::MESSAGE_CONTENT));
        assert!(!intents.contains(Intents::DIRECT_MESSAGES));
    }
}

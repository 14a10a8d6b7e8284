/*!
Downtime backfill.

Reconstructs missed join/leave events by paginating a log channel's history
newest to oldest, parsing either our own entry/exit embeds or the plain
welcome/goodbye templates, and replaying the results into the store.
*/

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use twilight_model::channel::message::Embed;
use twilight_model::id::marker::{ChannelMarker, GuildMarker, MessageMarker, UserMarker};
use twilight_model::id::Id;

use crate::config::ConfigManager;
use crate::store::Store;
use crate::tasks::{Task, TaskContext, TaskError, TaskResult, TaskRouter};
use crate::utils::prelude::*;
use crate::utils::{first_backtick_token, first_user_mention};
use crate::Session;

pub const TASK_BACKFILL_DAY: &str = "monitor.backfill_entry_exit_day";
pub const TASK_BACKFILL_RANGE: &str = "monitor.backfill_entry_exit_range";

/// History pagination page size.
pub const PAGE_SIZE: u16 = 100;
/// Last-event age beyond which a catch-up range is dispatched.
pub const DOWNTIME_THRESHOLD_SECS: i64 = 30 * 60;

const EMBED_TITLE_JOIN: &str = "member joined";
const EMBED_TITLE_LEAVE: &str = "member left";
const WELCOME_PREFIX: &str = "welcome to alice mains!";
const LEAVE_SUFFIX: &str = "has left the server... :(";

/// A membership event reconstructed from channel history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedEvent {
    Join(Id<UserMarker>),
    Leave(Id<UserMarker>),
}

/// Parse one of our own audit embeds.
fn parse_embeds(embeds: &[Embed]) -> Option<ParsedEvent> {
    for embed in embeds {
        let Some(title) = embed.title.as_deref() else {
            continue;
        };
        let is_join = title.eq_ignore_ascii_case(EMBED_TITLE_JOIN);
        let is_leave = title.eq_ignore_ascii_case(EMBED_TITLE_LEAVE);
        if !is_join && !is_leave {
            continue;
        }

        let user = embed
            .description
            .as_deref()
            .and_then(first_backtick_token)
            .and_then(|token| token.parse::<u64>().ok())
            .and_then(Id::new_checked);

        if let Some(user) = user {
            return Some(if is_join {
                ParsedEvent::Join(user)
            } else {
                ParsedEvent::Leave(user)
            });
        }
    }

    None
}

/// Parse a plain-text welcome or leave template.
fn parse_text(content: &str) -> Option<ParsedEvent> {
    let user = first_user_mention(content).and_then(Id::new_checked)?;
    let lowered = content.to_lowercase();

    if lowered.starts_with(WELCOME_PREFIX) {
        return Some(ParsedEvent::Join(user));
    }
    if lowered.trim_end().ends_with(LEAVE_SUFFIX) {
        return Some(ParsedEvent::Leave(user));
    }

    // Permissive fallback for reworded templates.
    if lowered.contains("welcome") {
        return Some(ParsedEvent::Join(user));
    }
    if lowered.contains("goodbye") {
        return Some(ParsedEvent::Leave(user));
    }

    None
}

/// Full parse protocol: our embeds first, then the text templates.
pub fn parse_message(content: &str, embeds: &[Embed]) -> Option<ParsedEvent> {
    parse_embeds(embeds).or_else(|| parse_text(content))
}

#[derive(Debug, Serialize, Deserialize)]
struct DayPayload {
    guild_id: Id<GuildMarker>,
    channel_id: Id<ChannelMarker>,
    /// `YYYY-MM-DD`, UTC.
    day: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RangePayload {
    guild_id: Id<GuildMarker>,
    channel_id: Id<ChannelMarker>,
    from: i64,
    to: i64,
}

/// Group key shared by every backfill task for a channel.
pub fn group_key(channel_id: Id<ChannelMarker>) -> String {
    format!("backfill:{channel_id}")
}

fn progress_key(channel_id: Id<ChannelMarker>) -> String {
    format!("backfill_progress:{channel_id}")
}

/// Day-scoped backfill task.
pub fn day_task(
    guild_id: Id<GuildMarker>,
    channel_id: Id<ChannelMarker>,
    day: &str,
) -> AnyResult<Task> {
    let payload = serde_json::to_value(DayPayload {
        guild_id,
        channel_id,
        day: day.to_string(),
    })?;

    Ok(Task::new(TASK_BACKFILL_DAY, payload).group_key(group_key(channel_id)))
}

/// Range-scoped backfill task.
pub fn range_task(
    guild_id: Id<GuildMarker>,
    channel_id: Id<ChannelMarker>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> AnyResult<Task> {
    let payload = serde_json::to_value(RangePayload {
        guild_id,
        channel_id,
        from: from.timestamp(),
        to: to.timestamp(),
    })?;

    Ok(Task::new(TASK_BACKFILL_RANGE, payload).group_key(group_key(channel_id)))
}

/// Paginates channel history to replay missed membership events.
pub struct BackfillDriver {
    session: Arc<Session>,
    store: Arc<Store>,
}

impl BackfillDriver {
    pub fn new(session: Arc<Session>, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { session, store })
    }

    /// Register the day- and range-scoped task handlers.
    pub fn register_handlers(self: &Arc<Self>, router: &TaskRouter) {
        let this = Arc::clone(self);
        router.register(TASK_BACKFILL_DAY, move |ctx| {
            let this = Arc::clone(&this);
            async move { this.run_day(ctx).await }
        });

        let this = Arc::clone(self);
        router.register(TASK_BACKFILL_RANGE, move |ctx| {
            let this = Arc::clone(&this);
            async move { this.run_range(ctx).await }
        });
    }

    /// Startup dispatch rules: an explicit start day per channel wins, then
    /// a configured initial date (only while no progress exists), then a
    /// catch-up range when the last event is stale.
    pub fn startup_tasks(
        &self,
        config: &ConfigManager,
        now: DateTime<Utc>,
        last_event: Option<DateTime<Utc>>,
    ) -> Vec<Task> {
        let mut tasks = Vec::new();

        for guild_id in config.guild_ids() {
            let Some(settings) = config.guild(guild_id) else {
                continue;
            };
            let Some(channel_id) = settings.channels.entry_leave else {
                continue;
            };

            if let Some(day) = settings.backfill.start_day.get(&channel_id) {
                match day_task(guild_id, channel_id, day) {
                    Ok(task) => tasks.push(task),
                    Err(e) => warn!("Invalid backfill day task: {}", e.oneliner()),
                }
                continue;
            }

            let has_progress = self
                .store
                .get_metadata(&progress_key(channel_id))
                .ok()
                .flatten()
                .is_some();
            if let Some(initial) = config.backfill_initial_date(guild_id) {
                if !has_progress {
                    match range_task(guild_id, channel_id, initial, now) {
                        Ok(task) => tasks.push(task),
                        Err(e) => warn!("Invalid backfill range task: {}", e.oneliner()),
                    }
                    continue;
                }
            }

            if let Some(last) = last_event {
                if (now - last).num_seconds() > DOWNTIME_THRESHOLD_SECS {
                    match range_task(guild_id, channel_id, last, now) {
                        Ok(task) => tasks.push(task),
                        Err(e) => warn!("Invalid backfill range task: {}", e.oneliner()),
                    }
                }
            }
        }

        tasks
    }

    async fn run_day(&self, ctx: TaskContext) -> TaskResult {
        let payload: DayPayload =
            serde_json::from_value(ctx.payload.clone()).map_err(TaskError::permanent)?;

        let date = NaiveDate::parse_from_str(&payload.day, "%Y-%m-%d")
            .map_err(TaskError::permanent)?;
        let from = Utc
            .from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default());
        let to = from + chrono::Duration::days(1);

        self.run_window(&ctx, payload.guild_id, payload.channel_id, from, to).await
    }

    async fn run_range(&self, ctx: TaskContext) -> TaskResult {
        let payload: RangePayload =
            serde_json::from_value(ctx.payload.clone()).map_err(TaskError::permanent)?;

        let from = Utc.timestamp_opt(payload.from, 0).single().unwrap_or_default();
        let to = Utc.timestamp_opt(payload.to, 0).single().unwrap_or_else(Utc::now);

        self.run_window(&ctx, payload.guild_id, payload.channel_id, from, to).await
    }

    /// Newest-to-oldest pagination over `[from, to]`.
    async fn run_window(
        &self,
        ctx: &TaskContext,
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TaskResult {
        info!("Backfilling {channel_id} from {from} to {to}");

        let mut before: Option<Id<MessageMarker>> = None;
        let mut replayed = 0usize;

        'pages: loop {
            // Cancellation is checked between pages.
            if ctx.is_cancelled() {
                info!("Backfill of {channel_id} cancelled");
                break;
            }

            let request = self
                .session
                .http
                .channel_messages(channel_id)
                .limit(PAGE_SIZE)
                .map_err(TaskError::permanent)?;

            let page = if let Some(cursor) = before {
                request
                    .before(cursor)
                    .await
                    .map_err(TaskError::retryable)?
                    .models()
                    .await
                    .map_err(TaskError::permanent)?
            } else {
                request
                    .await
                    .map_err(TaskError::retryable)?
                    .models()
                    .await
                    .map_err(TaskError::permanent)?
            };

            if page.is_empty() {
                break;
            }

            for message in &page {
                let at = Utc
                    .timestamp_opt(message.timestamp.as_secs(), 0)
                    .single()
                    .unwrap_or_default();

                // History is descending, the window start ends the walk.
                if at < from {
                    break 'pages;
                }
                if at > to {
                    continue;
                }

                match parse_message(&message.content, &message.embeds) {
                    Some(ParsedEvent::Join(user_id)) => {
                        if let Err(e) = self.store.upsert_member_join(guild_id, user_id, at) {
                            warn!("Backfill join upsert failed: {e}");
                        }
                        if let Err(e) =
                            self.store.increment_daily_join_count(guild_id, user_id, at)
                        {
                            warn!("Backfill join count failed: {e}");
                        }
                        replayed += 1;
                    },
                    Some(ParsedEvent::Leave(user_id)) => {
                        // Still a member: the leave was undone, skip the counter.
                        if !self.member_present(guild_id, user_id).await {
                            if let Err(e) =
                                self.store.increment_daily_leave_count(guild_id, user_id, at)
                            {
                                warn!("Backfill leave count failed: {e}");
                            }
                            replayed += 1;
                        }
                    },
                    None => {},
                }
            }

            // page.last() is the oldest processed message.
            if let Some(oldest) = page.last() {
                before = Some(oldest.id);
                let oldest_at = Utc
                    .timestamp_opt(oldest.timestamp.as_secs(), 0)
                    .single()
                    .unwrap_or_default();
                if let Err(e) = self.store.set_metadata(&progress_key(channel_id), oldest_at) {
                    warn!("Backfill progress write failed: {e}");
                }
            }

            if page.len() < PAGE_SIZE as usize {
                break;
            }
        }

        info!("Backfill of {channel_id} replayed {replayed} events");

        Ok(())
    }

    /// Whether the user is still in the guild. Transient lookup failures
    /// count as present, so the leave counter is not double-fed.
    async fn member_present(&self, guild_id: Id<GuildMarker>, user_id: Id<UserMarker>) -> bool {
        use twilight_http::error::ErrorType;

        match self.session.http.guild_member(guild_id, user_id).await {
            Ok(_) => true,
            Err(e) => !matches!(
                e.kind(),
                ErrorType::Response { status, .. } if status.get() == 404
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use twilight_util::builder::embed::EmbedBuilder;

    use super::*;

    fn embed(title: &str, description: &str) -> Embed {
        EmbedBuilder::new().title(title).description(description).build()
    }

    #[test]
    fn own_embeds_parse_case_insensitively() {
        let embeds = [embed("Member Joined", "User `123` joined the server.")];
        assert_eq!(
            parse_message("", &embeds),
            Some(ParsedEvent::Join(Id::new(123)))
        );

        let embeds = [embed("MEMBER LEFT", "`456` left after 3 days")];
        assert_eq!(
            parse_message("", &embeds),
            Some(ParsedEvent::Leave(Id::new(456)))
        );

        // Unrelated embed titles are skipped.
        let embeds = [embed("Roles updated", "`456`")];
        assert_eq!(parse_message("", &embeds), None);
    }

    #[test]
    fn embed_without_id_token_is_skipped() {
        let embeds = [embed("Member Joined", "no token here")];
        assert_eq!(parse_message("", &embeds), None);

        let embeds = [embed("Member Joined", "user `not-a-number`")];
        assert_eq!(parse_message("", &embeds), None);
    }

    #[test]
    fn welcome_template_parses_as_join() {
        assert_eq!(
            parse_message("Welcome to Alice Mains! <@123>", &[]),
            Some(ParsedEvent::Join(Id::new(123)))
        );
        assert_eq!(
            parse_message("welcome to alice mains! say hi to <@!77>", &[]),
            Some(ParsedEvent::Join(Id::new(77)))
        );
    }

    #[test]
    fn leave_template_parses_as_leave() {
        assert_eq!(
            parse_message("<@9> has left the server... :(", &[]),
            Some(ParsedEvent::Leave(Id::new(9)))
        );
    }

    #[test]
    fn permissive_fallbacks_need_a_mention() {
        assert_eq!(
            parse_message("a warm welcome to <@5>", &[]),
            Some(ParsedEvent::Join(Id::new(5)))
        );
        assert_eq!(
            parse_message("goodbye <@6>, see you", &[]),
            Some(ParsedEvent::Leave(Id::new(6)))
        );
        assert_eq!(parse_message("welcome everybody", &[]), None);
        assert_eq!(parse_message("<@7> said something", &[]), None);
    }

    #[test]
    fn group_keys_share_per_channel() {
        let a = day_task(Id::new(1), Id::new(2), "2024-01-01").unwrap();
        let b = range_task(Id::new(1), Id::new(2), Utc::now() - chrono::Duration::hours(1), Utc::now())
            .unwrap();
        assert_eq!(a.options.group_key, b.options.group_key);
        assert_eq!(a.options.group_key.as_deref(), Some("backfill:2"));
    }
}

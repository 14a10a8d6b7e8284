/*!
Notification adapters.

The only place where internal events turn into embeds. Each adapter runs
the emit policy, renders the payload and enqueues a send task whose group
key encodes the event identity, so re-emission from retries or backfill is
suppressed by the router.
*/

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use twilight_mention::Mention;
use twilight_model::channel::message::Embed;
use twilight_model::id::marker::{
    AutoModerationRuleMarker, ChannelMarker, GuildMarker, MessageMarker, RoleMarker, UserMarker,
};
use twilight_model::id::Id;
use twilight_util::builder::embed::{EmbedBuilder, EmbedFieldBuilder, EmbedFooterBuilder};
use twilight_validate::embed::FIELD_VALUE_LENGTH;

use crate::config::ConfigManager;
use crate::policy::{self, LogEvent};
use crate::tasks::{DispatchError, Task, TaskContext, TaskError, TaskResult, TaskRouter};
use crate::utils::prelude::*;
use crate::utils::{humanize_duration, truncate_bytes, truncate_chars};
use crate::Session;

/// Task kinds owned by the notification adapters.
pub mod kinds {
    pub const MEMBER_JOIN: &str = "notify.member_join";
    pub const MEMBER_LEAVE: &str = "notify.member_leave";
    pub const MESSAGE_EDIT: &str = "notify.message_edit";
    pub const MESSAGE_DELETE: &str = "notify.message_delete";
    pub const AVATAR_CHANGE: &str = "notify.avatar_change";
    pub const ROLE_CHANGE: &str = "notify.role_change";
    pub const AUTOMOD_ACTION: &str = "notify.automod_action";
    pub const MODERATION_CASE: &str = "notify.moderation_case";

    pub const ALL: [&str; 8] = [
        MEMBER_JOIN,
        MEMBER_LEAVE,
        MESSAGE_EDIT,
        MESSAGE_DELETE,
        AVATAR_CHANGE,
        ROLE_CHANGE,
        AUTOMOD_ACTION,
        MODERATION_CASE,
    ];
}

const COLOR_JOIN: u32 = 0x57F287;
const COLOR_LEAVE: u32 = 0xED4245;
const COLOR_EDIT: u32 = 0xFEE75C;
const COLOR_DELETE: u32 = 0xED4245;
const COLOR_USER: u32 = 0x5865F2;
const COLOR_AUTOMOD: u32 = 0xEB459E;
const COLOR_MODERATION: u32 = 0x992D22;

/// Maximum automod excerpt length, in characters.
pub const EXCERPT_MAX: usize = 200;

/// What the send handler transmits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEmbedPayload {
    pub channel_id: Id<ChannelMarker>,
    pub embed: Embed,
}

#[derive(Debug, Clone)]
pub struct JoinNotification {
    pub guild_id: Id<GuildMarker>,
    pub user_id: Id<UserMarker>,
    pub username: String,
    pub joined_at: DateTime<Utc>,
    pub account_created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LeaveNotification {
    pub guild_id: Id<GuildMarker>,
    pub user_id: Id<UserMarker>,
    pub username: String,
    pub left_at: DateTime<Utc>,
    pub tenure: Option<chrono::Duration>,
    pub bot_tenure: Option<chrono::Duration>,
}

#[derive(Debug, Clone)]
pub struct MessageEditNotification {
    pub guild_id: Id<GuildMarker>,
    pub channel_id: Id<ChannelMarker>,
    pub message_id: Id<MessageMarker>,
    pub author_id: Id<UserMarker>,
    pub author_username: String,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone)]
pub struct MessageDeleteNotification {
    pub guild_id: Id<GuildMarker>,
    pub channel_id: Id<ChannelMarker>,
    pub message_id: Id<MessageMarker>,
    pub author_id: Id<UserMarker>,
    pub author_username: String,
    pub content: String,
    /// Audit-log actor, when one could be resolved.
    pub actor: Option<Id<UserMarker>>,
}

#[derive(Debug, Clone)]
pub struct AvatarChangeNotification {
    pub guild_id: Id<GuildMarker>,
    pub user_id: Id<UserMarker>,
    pub username: String,
    pub old_hash: Option<String>,
    pub new_hash: String,
}

#[derive(Debug, Clone)]
pub struct RoleChangeNotification {
    pub guild_id: Id<GuildMarker>,
    pub user_id: Id<UserMarker>,
    pub username: String,
    pub added: Vec<Id<RoleMarker>>,
    pub removed: Vec<Id<RoleMarker>>,
    /// Pure-diff path, audit log had no matching evidence.
    pub fallback: bool,
}

#[derive(Debug, Clone)]
pub struct AutomodNotification {
    pub guild_id: Id<GuildMarker>,
    pub user_id: Id<UserMarker>,
    pub rule_id: Id<AutoModerationRuleMarker>,
    pub matched_keyword: Option<String>,
    pub excerpt: String,
}

/// Moderation case, rendered as `<actionTag> | case <N>`.
#[derive(Debug, Clone)]
pub struct ModerationCaseLog {
    pub guild_id: Id<GuildMarker>,
    pub action_tag: String,
    pub case_number: i64,
    /// Labelled description lines, in order.
    pub lines: Vec<(String, String)>,
}

/// Translates internal events into routed send tasks.
pub struct NotificationSender {
    session: Arc<Session>,
    config: Arc<ConfigManager>,
    router: Arc<TaskRouter>,
}

impl NotificationSender {
    pub fn new(
        session: Arc<Session>,
        config: Arc<ConfigManager>,
        router: Arc<TaskRouter>,
    ) -> Self {
        Self { session, config, router }
    }

    /// Register the send handler for every notify kind.
    pub fn register_handlers(&self) {
        for kind in kinds::ALL {
            let session = Arc::clone(&self.session);
            self.router
                .register(kind, move |ctx| send_embed_task(Arc::clone(&session), ctx));
        }
    }

    pub async fn notify_member_join(&self, n: JoinNotification) -> AnyResult<()> {
        let Some(channel_id) = self.gate(LogEvent::MemberJoin, n.guild_id).await else {
            return Ok(());
        };
        let group = format!(
            "member_join:{}:{}:{}",
            n.guild_id,
            n.user_id,
            n.joined_at.timestamp()
        );

        self.dispatch_embed(kinds::MEMBER_JOIN, channel_id, member_join_embed(&n), group)
    }

    pub async fn notify_member_leave(&self, n: LeaveNotification) -> AnyResult<()> {
        let Some(channel_id) = self.gate(LogEvent::MemberLeave, n.guild_id).await else {
            return Ok(());
        };
        let group = format!(
            "member_leave:{}:{}:{}",
            n.guild_id,
            n.user_id,
            crate::utils::day_key(n.left_at)
        );

        self.dispatch_embed(kinds::MEMBER_LEAVE, channel_id, member_leave_embed(&n), group)
    }

    pub async fn notify_message_edit(&self, n: MessageEditNotification) -> AnyResult<()> {
        let Some(channel_id) = self.gate(LogEvent::MessageEdit, n.guild_id).await else {
            return Ok(());
        };
        let group = format!(
            "message_edit:{}:{}:{}",
            n.guild_id,
            n.message_id,
            revision_hash(&[&n.before, &n.after])
        );

        self.dispatch_embed(kinds::MESSAGE_EDIT, channel_id, message_edit_embed(&n), group)
    }

    pub async fn notify_message_delete(&self, n: MessageDeleteNotification) -> AnyResult<()> {
        let Some(channel_id) = self.gate(LogEvent::MessageDelete, n.guild_id).await else {
            return Ok(());
        };
        let group = format!(
            "message_delete:{}:{}:{}",
            n.guild_id,
            n.message_id,
            revision_hash(&[&n.content])
        );

        self.dispatch_embed(
            kinds::MESSAGE_DELETE,
            channel_id,
            message_delete_embed(&n),
            group,
        )
    }

    pub async fn notify_avatar_change(&self, n: AvatarChangeNotification) -> AnyResult<()> {
        let Some(channel_id) = self.gate(LogEvent::AvatarChange, n.guild_id).await else {
            return Ok(());
        };
        let group = format!(
            "avatar_change:{}:{}:{}",
            n.guild_id,
            n.user_id,
            revision_hash(&[n.old_hash.as_deref().unwrap_or(""), &n.new_hash])
        );

        self.dispatch_embed(
            kinds::AVATAR_CHANGE,
            channel_id,
            avatar_change_embed(&n),
            group,
        )
    }

    pub async fn notify_role_change(&self, n: RoleChangeNotification) -> AnyResult<()> {
        let Some(channel_id) = self.gate(LogEvent::RoleChange, n.guild_id).await else {
            return Ok(());
        };
        let added = render_roles(&n.added);
        let removed = render_roles(&n.removed);
        let group = format!(
            "role_change:{}:{}:{}",
            n.guild_id,
            n.user_id,
            revision_hash(&[&added, &removed])
        );

        self.dispatch_embed(kinds::ROLE_CHANGE, channel_id, role_change_embed(&n), group)
    }

    pub async fn notify_automod_action(&self, n: AutomodNotification) -> AnyResult<()> {
        let Some(channel_id) = self.gate(LogEvent::AutomodAction, n.guild_id).await else {
            return Ok(());
        };
        let group = format!(
            "automod:{}:{}:{}:{}",
            n.guild_id,
            n.rule_id,
            n.user_id,
            revision_hash(&[&n.excerpt])
        );

        self.dispatch_embed(
            kinds::AUTOMOD_ACTION,
            channel_id,
            automod_action_embed(&n),
            group,
        )
    }

    pub async fn notify_moderation_case(&self, n: ModerationCaseLog) -> AnyResult<()> {
        let Some(channel_id) = self.gate(LogEvent::ModerationCase, n.guild_id).await else {
            return Ok(());
        };
        let group = format!("moderation_case:{}:{}", n.guild_id, n.case_number);

        self.dispatch_embed(
            kinds::MODERATION_CASE,
            channel_id,
            moderation_case_embed(&n),
            group,
        )
    }

    /// Policy gate shared by all adapters.
    async fn gate(&self, event: LogEvent, guild_id: Id<GuildMarker>) -> Option<Id<ChannelMarker>> {
        let decision = policy::should_emit(&self.session, &self.config, event, guild_id).await;
        if decision.enabled {
            decision.channel_id
        } else {
            debug!("Suppressed {event} for guild {guild_id}: {}", decision.reason);
            None
        }
    }

    fn dispatch_embed(
        &self,
        kind: &'static str,
        channel_id: Id<ChannelMarker>,
        embed: Embed,
        group_key: String,
    ) -> AnyResult<()> {
        let payload = serde_json::to_value(SendEmbedPayload { channel_id, embed })?;

        match self.router.dispatch(Task::new(kind, payload).group_key(group_key)) {
            Ok(()) => Ok(()),
            // A duplicate is a normal drop.
            Err(DispatchError::Duplicate) => {
                debug!("Duplicate {kind} notification dropped");
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }
}

/// Send handler behind every notify kind.
async fn send_embed_task(session: Arc<Session>, ctx: TaskContext) -> TaskResult {
    let payload: SendEmbedPayload =
        serde_json::from_value(ctx.payload).map_err(TaskError::permanent)?;

    let channel_id = payload.channel_id;
    let embeds = [payload.embed];
    let request = session
        .http
        .create_message(channel_id)
        .embeds(&embeds)
        .map_err(TaskError::permanent)?;

    match request.await {
        Ok(_) => Ok(()),
        Err(e) => Err(classify_send_error(e)),
    }
}

/// 429 and 5xx are worth retrying, anything else is not.
fn classify_send_error(error: twilight_http::Error) -> TaskError {
    use twilight_http::error::ErrorType;

    let retryable = match error.kind() {
        ErrorType::Response { status, .. } => {
            let code = status.get();
            code == 429 || code >= 500
        },
        ErrorType::RequestTimedOut => true,
        _ => false,
    };

    if retryable {
        TaskError::retryable(error)
    } else {
        TaskError::permanent(error)
    }
}

fn revision_hash(parts: &[&str]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
    }
    hasher.finish()
}

/// Truncate an embed field value, appending `...` when cut.
fn field_value(text: &str) -> String {
    if text.is_empty() {
        return "(none)".to_string();
    }
    truncate_bytes(text, FIELD_VALUE_LENGTH)
}

/// Sanitize and bound an automod content excerpt.
pub fn excerpt(content: &str) -> String {
    truncate_chars(&content.replace('`', "'"), EXCERPT_MAX)
}

fn render_roles(roles: &[Id<RoleMarker>]) -> String {
    if roles.is_empty() {
        return "(none)".to_string();
    }
    roles
        .iter()
        .map(|role| role.mention().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn footer(id: impl std::fmt::Display) -> EmbedFooterBuilder {
    EmbedFooterBuilder::new(format!("ID: {id}"))
}

pub fn member_join_embed(n: &JoinNotification) -> Embed {
    let age = humanize_duration(n.joined_at - n.account_created);

    EmbedBuilder::new()
        .title("Member Joined")
        .color(COLOR_JOIN)
        .description(format!("{} `{}` joined the server.", n.user_id.mention(), n.user_id))
        .field(EmbedFieldBuilder::new("User", field_value(&n.username)).inline())
        .field(EmbedFieldBuilder::new("Account age", age).inline())
        .field(EmbedFieldBuilder::new(
            "Joined",
            format!("<t:{}:R>", n.joined_at.timestamp()),
        ))
        .footer(footer(n.user_id))
        .build()
}

pub fn member_leave_embed(n: &LeaveNotification) -> Embed {
    let tenure = n
        .tenure
        .map_or_else(|| "unknown".to_string(), humanize_duration);

    let mut builder = EmbedBuilder::new()
        .title("Member Left")
        .color(COLOR_LEAVE)
        .description(format!("{} `{}` left the server.", n.user_id.mention(), n.user_id))
        .field(EmbedFieldBuilder::new("User", field_value(&n.username)).inline())
        .field(EmbedFieldBuilder::new("Time in server", tenure).inline());

    if let Some(bot_tenure) = n.bot_tenure {
        builder = builder.field(
            EmbedFieldBuilder::new("Bot in server for", humanize_duration(bot_tenure)).inline(),
        );
    }

    builder.footer(footer(n.user_id)).build()
}

pub fn message_edit_embed(n: &MessageEditNotification) -> Embed {
    EmbedBuilder::new()
        .title("Message Edited")
        .color(COLOR_EDIT)
        .description(format!(
            "Message by {} in {} was edited.",
            n.author_id.mention(),
            n.channel_id.mention()
        ))
        .field(EmbedFieldBuilder::new("Before", field_value(&n.before)))
        .field(EmbedFieldBuilder::new("After", field_value(&n.after)))
        .footer(footer(n.message_id))
        .build()
}

pub fn message_delete_embed(n: &MessageDeleteNotification) -> Embed {
    let actor = n
        .actor
        .map_or_else(|| "Author or unknown".to_string(), |id| id.mention().to_string());

    EmbedBuilder::new()
        .title("Message Deleted")
        .color(COLOR_DELETE)
        .description(format!(
            "Message by {} in {} was deleted.",
            n.author_id.mention(),
            n.channel_id.mention()
        ))
        .field(EmbedFieldBuilder::new("Content", field_value(&n.content)))
        .field(EmbedFieldBuilder::new("Deleted by", actor).inline())
        .footer(footer(n.message_id))
        .build()
}

pub fn avatar_change_embed(n: &AvatarChangeNotification) -> Embed {
    let old = n.old_hash.as_deref().unwrap_or("(none)");

    EmbedBuilder::new()
        .title("Avatar Updated")
        .color(COLOR_USER)
        .description(format!("{} changed their avatar.", n.user_id.mention()))
        .field(EmbedFieldBuilder::new("Old", field_value(old)).inline())
        .field(EmbedFieldBuilder::new("New", field_value(&n.new_hash)).inline())
        .footer(footer(n.user_id))
        .build()
}

pub fn role_change_embed(n: &RoleChangeNotification) -> Embed {
    let title = if n.fallback {
        "Roles updated (fallback)"
    } else {
        "Roles updated"
    };

    EmbedBuilder::new()
        .title(title)
        .color(COLOR_USER)
        .description(format!("Roles of {} changed.", n.user_id.mention()))
        .field(EmbedFieldBuilder::new("Added", field_value(&render_roles(&n.added))).inline())
        .field(EmbedFieldBuilder::new("Removed", field_value(&render_roles(&n.removed))).inline())
        .footer(footer(n.user_id))
        .build()
}

pub fn automod_action_embed(n: &AutomodNotification) -> Embed {
    let keyword = n.matched_keyword.as_deref().unwrap_or("(none)");

    EmbedBuilder::new()
        .title("AutoMod Action")
        .color(COLOR_AUTOMOD)
        .description(format!("Rule `{}` matched a message by {}.", n.rule_id, n.user_id.mention()))
        .field(EmbedFieldBuilder::new("Keyword", field_value(keyword)).inline())
        .field(EmbedFieldBuilder::new("Excerpt", field_value(&n.excerpt)))
        .footer(footer(n.user_id))
        .build()
}

pub fn moderation_case_embed(n: &ModerationCaseLog) -> Embed {
    let description = n
        .lines
        .iter()
        .map(|(label, value)| format!("**{label}:** {value}"))
        .collect::<Vec<_>>()
        .join("\n");

    EmbedBuilder::new()
        .title(format!("{} | case {}", n.action_tag, n.case_number))
        .color(COLOR_MODERATION)
        .description(truncate_bytes(&description, 4000))
        .footer(footer(n.guild_id))
        .build()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn join_embed_has_account_age() {
        let embed = member_join_embed(&JoinNotification {
            guild_id: Id::new(1),
            user_id: Id::new(2),
            username: "alice".to_string(),
            joined_at: at(1_000_000 + 86_400 * 3),
            account_created: at(1_000_000),
        });

        assert_eq!(embed.title.as_deref(), Some("Member Joined"));
        let age = embed.fields.iter().find(|f| f.name == "Account age").unwrap();
        assert_eq!(age.value, "3d 0h");
    }

    #[test]
    fn leave_embed_reports_unknown_tenure() {
        let embed = member_leave_embed(&LeaveNotification {
            guild_id: Id::new(1),
            user_id: Id::new(2),
            username: "alice".to_string(),
            left_at: at(2_000_000),
            tenure: None,
            bot_tenure: None,
        });

        assert_eq!(embed.title.as_deref(), Some("Member Left"));
        let tenure = embed.fields.iter().find(|f| f.name == "Time in server").unwrap();
        assert_eq!(tenure.value, "unknown");
        assert!(embed.fields.iter().all(|f| f.name != "Bot in server for"));
    }

    #[test]
    fn edit_embed_truncates_long_fields() {
        let embed = message_edit_embed(&MessageEditNotification {
            guild_id: Id::new(1),
            channel_id: Id::new(2),
            message_id: Id::new(3),
            author_id: Id::new(4),
            author_username: "alice".to_string(),
            before: "x".repeat(2_000),
            after: "b".to_string(),
        });

        let before = embed.fields.iter().find(|f| f.name == "Before").unwrap();
        assert_eq!(before.value.len(), FIELD_VALUE_LENGTH);
        assert!(before.value.ends_with("..."));
        let after = embed.fields.iter().find(|f| f.name == "After").unwrap();
        assert_eq!(after.value, "b");
    }

    #[test]
    fn delete_embed_labels_unresolved_actor() {
        let base = MessageDeleteNotification {
            guild_id: Id::new(1),
            channel_id: Id::new(2),
            message_id: Id::new(3),
            author_id: Id::new(4),
            author_username: "alice".to_string(),
            content: String::new(),
            actor: None,
        };

        let embed = message_delete_embed(&base);
        let actor = embed.fields.iter().find(|f| f.name == "Deleted by").unwrap();
        assert_eq!(actor.value, "Author or unknown");
        let content = embed.fields.iter().find(|f| f.name == "Content").unwrap();
        assert_eq!(content.value, "(none)");

        let embed = message_delete_embed(&MessageDeleteNotification {
            actor: Some(Id::new(9)),
            ..base
        });
        let actor = embed.fields.iter().find(|f| f.name == "Deleted by").unwrap();
        assert_eq!(actor.value, "<@9>");
    }

    #[test]
    fn role_change_fallback_is_labelled() {
        let n = RoleChangeNotification {
            guild_id: Id::new(1),
            user_id: Id::new(2),
            username: "alice".to_string(),
            added: vec![Id::new(3)],
            removed: Vec::new(),
            fallback: true,
        };

        let embed = role_change_embed(&n);
        assert_eq!(embed.title.as_deref(), Some("Roles updated (fallback)"));
        let added = embed.fields.iter().find(|f| f.name == "Added").unwrap();
        assert_eq!(added.value, "<@&3>");
        let removed = embed.fields.iter().find(|f| f.name == "Removed").unwrap();
        assert_eq!(removed.value, "(none)");
    }

    #[test]
    fn excerpt_sanitizes_backticks_and_truncates() {
        assert_eq!(excerpt("hello `world`"), "hello 'world'");

        let long = "a".repeat(300);
        let cut = excerpt(&long);
        assert_eq!(cut.chars().count(), EXCERPT_MAX);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn moderation_case_title_format() {
        let embed = moderation_case_embed(&ModerationCaseLog {
            guild_id: Id::new(1),
            action_tag: "prune".to_string(),
            case_number: 7,
            lines: vec![
                ("Pruned".to_string(), "3".to_string()),
                ("Window".to_string(), "30d".to_string()),
            ],
        });

        assert_eq!(embed.title.as_deref(), Some("prune | case 7"));
        let description = embed.description.unwrap();
        assert!(description.contains("**Pruned:** 3"));
        assert!(description.contains("**Window:** 30d"));
    }

    #[test]
    fn revision_hashes_differ_per_content() {
        let a = revision_hash(&["a", "b"]);
        let b = revision_hash(&["a", "c"]);
        let a2 = revision_hash(&["a", "b"]);
        assert_ne!(a, b);
        assert_eq!(a, a2);
    }
}

/*!
Emit-decision policy.

Every log event passes through [`should_emit`] before anything is sent. The
precedence is strict: runtime kill switch, feature toggle, channel
resolution with fallbacks, channel/permission validation, intent check.
Reasons are a closed set of strings so diagnostics and tests can match
decisions exactly.
*/

use derive_more::Display;
use twilight_model::channel::{Channel, ChannelType};
use twilight_model::gateway::Intents;
use twilight_model::guild::Permissions;
use twilight_model::id::marker::{ChannelMarker, GuildMarker, RoleMarker};
use twilight_model::id::Id;
use twilight_util::permission_calculator::PermissionCalculator;

use crate::config::{ConfigManager, Features, GuildSettings, LogChannels, RuntimeConfig};
use crate::utils::prelude::*;
use crate::Session;

/// Loggable event kinds. Closed set, one capability row each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum LogEvent {
    #[display("message_edit")]
    MessageEdit,
    #[display("message_delete")]
    MessageDelete,
    #[display("member_join")]
    MemberJoin,
    #[display("member_leave")]
    MemberLeave,
    #[display("avatar_change")]
    AvatarChange,
    #[display("role_change")]
    RoleChange,
    #[display("automod_action")]
    AutomodAction,
    #[display("moderation_case")]
    ModerationCase,
}

impl LogEvent {
    pub const ALL: [LogEvent; 8] = [
        Self::MessageEdit,
        Self::MessageDelete,
        Self::MemberJoin,
        Self::MemberLeave,
        Self::AvatarChange,
        Self::RoleChange,
        Self::AutomodAction,
        Self::ModerationCase,
    ];
}

/// Configured channel slot an event can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSlot {
    EntryLeave,
    UserActivity,
    MessageAudit,
    Moderation,
}

impl ChannelSlot {
    fn resolve(self, channels: &LogChannels) -> Option<Id<ChannelMarker>> {
        match self {
            Self::EntryLeave => channels.entry_leave,
            Self::UserActivity => channels.user_activity,
            Self::MessageAudit => channels.message_audit,
            Self::Moderation => channels.moderation,
        }
    }
}

/// One capability row: what an event needs before it may be emitted.
#[derive(Debug, Clone)]
pub struct Capability {
    pub event: LogEvent,
    pub category: &'static str,
    pub required_intents: Intents,
    pub required_permissions: Permissions,
    pub requires_channel: bool,
    pub preferred: ChannelSlot,
    pub fallbacks: &'static [ChannelSlot],
    pub validate_channel_perms: bool,
    pub require_exclusive_moderation: bool,
}

fn send_permissions() -> Permissions {
    Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES | Permissions::EMBED_LINKS
}

/// The capability row for an event.
pub fn capability(event: LogEvent) -> Capability {
    let base = Capability {
        event,
        category: "",
        required_intents: Intents::empty(),
        required_permissions: send_permissions(),
        requires_channel: true,
        preferred: ChannelSlot::UserActivity,
        fallbacks: &[],
        validate_channel_perms: true,
        require_exclusive_moderation: false,
    };

    match event {
        LogEvent::MessageEdit | LogEvent::MessageDelete => Capability {
            category: "message",
            required_intents: Intents::GUILD_MESSAGES | Intents::MESSAGE_CONTENT,
            preferred: ChannelSlot::MessageAudit,
            fallbacks: &[ChannelSlot::UserActivity],
            ..base
        },
        LogEvent::MemberJoin | LogEvent::MemberLeave => Capability {
            category: "member",
            required_intents: Intents::GUILD_MEMBERS,
            preferred: ChannelSlot::EntryLeave,
            fallbacks: &[ChannelSlot::UserActivity],
            ..base
        },
        LogEvent::AvatarChange => Capability {
            category: "user",
            required_intents: Intents::GUILD_MEMBERS | Intents::GUILD_PRESENCES,
            preferred: ChannelSlot::UserActivity,
            ..base
        },
        LogEvent::RoleChange => Capability {
            category: "user",
            required_intents: Intents::GUILD_MEMBERS,
            preferred: ChannelSlot::UserActivity,
            ..base
        },
        LogEvent::AutomodAction => Capability {
            category: "automod",
            required_intents: Intents::AUTO_MODERATION_EXECUTION,
            preferred: ChannelSlot::Moderation,
            fallbacks: &[ChannelSlot::MessageAudit],
            ..base
        },
        LogEvent::ModerationCase => Capability {
            category: "moderation",
            preferred: ChannelSlot::Moderation,
            require_exclusive_moderation: true,
            ..base
        },
    }
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DecisionReason {
    #[display("ok")]
    Ok,
    #[display("runtime_disabled")]
    RuntimeDisabled,
    #[display("feature_disabled")]
    FeatureDisabled,
    #[display("no_channel_configured")]
    NoChannelConfigured,
    #[display("channel_invalid")]
    ChannelInvalid,
    #[display("missing_permissions")]
    MissingPermissions,
    #[display("missing_intents")]
    MissingIntents,
}

/// The outcome of an emit-policy check.
#[derive(Debug, Clone)]
pub struct Decision {
    pub enabled: bool,
    pub reason: DecisionReason,
    pub channel_id: Option<Id<ChannelMarker>>,
    pub missing_intents: Intents,
    pub capability: Capability,
}

impl Decision {
    fn allowed(channel_id: Option<Id<ChannelMarker>>, capability: Capability) -> Self {
        Self {
            enabled: true,
            reason: DecisionReason::Ok,
            channel_id,
            missing_intents: Intents::empty(),
            capability,
        }
    }

    fn denied(reason: DecisionReason, capability: Capability) -> Self {
        Self {
            enabled: false,
            reason,
            channel_id: None,
            missing_intents: Intents::empty(),
            capability,
        }
    }

    fn with_channel(mut self, channel_id: Id<ChannelMarker>) -> Self {
        self.channel_id = Some(channel_id);
        self
    }
}

fn runtime_disabled(event: LogEvent, runtime: &RuntimeConfig) -> bool {
    match event {
        LogEvent::MessageEdit | LogEvent::MessageDelete => runtime.disable_message_logs,
        LogEvent::MemberJoin | LogEvent::MemberLeave => runtime.disable_entry_exit_logs,
        LogEvent::AvatarChange | LogEvent::RoleChange => runtime.disable_user_logs,
        LogEvent::AutomodAction => runtime.disable_automod_logs,
        LogEvent::ModerationCase => !runtime.moderation_logging,
    }
}

fn feature_enabled(event: LogEvent, features: &Features) -> bool {
    let logging = &features.logging;
    match event {
        LogEvent::MessageEdit => logging.message_edit,
        LogEvent::MessageDelete => logging.message_delete,
        LogEvent::MemberJoin => logging.member_join,
        LogEvent::MemberLeave => logging.member_leave,
        LogEvent::AvatarChange => logging.avatar_change,
        LogEvent::RoleChange => logging.role_change,
        LogEvent::AutomodAction => logging.automod_action,
        LogEvent::ModerationCase => logging.moderation_case,
    }
}

/// Pure part of the decision: kill switch, feature toggle, channel
/// resolution and moderation exclusivity. No I/O.
pub fn resolve_emit(
    settings: &GuildSettings,
    runtime: &RuntimeConfig,
    features: &Features,
    event: LogEvent,
) -> Result<(Option<Id<ChannelMarker>>, Capability), Decision> {
    let cap = capability(event);

    // 1. Runtime kill switch always wins.
    if runtime_disabled(event, runtime) {
        return Err(Decision::denied(DecisionReason::RuntimeDisabled, cap));
    }

    // 2. Feature toggle.
    if !feature_enabled(event, features) {
        return Err(Decision::denied(DecisionReason::FeatureDisabled, cap));
    }

    // 3. Channel resolution: preferred slot, then fallbacks in order.
    // Capabilities without a channel requirement skip resolution entirely.
    if !cap.requires_channel {
        return Ok((None, cap));
    }

    let channel_id = cap
        .preferred
        .resolve(&settings.channels)
        .or_else(|| {
            cap.fallbacks
                .iter()
                .find_map(|slot| slot.resolve(&settings.channels))
        });

    let Some(channel_id) = channel_id else {
        return Err(Decision::denied(DecisionReason::NoChannelConfigured, cap));
    };

    // 4a. A moderation channel shared with another log slot is rejected.
    if cap.require_exclusive_moderation {
        let shared = settings
            .channels
            .configured()
            .iter()
            .filter(|id| **id == channel_id)
            .count()
            > 1;
        if shared {
            return Err(
                Decision::denied(DecisionReason::ChannelInvalid, cap).with_channel(channel_id)
            );
        }
    }

    Ok((Some(channel_id), cap))
}

/// Intent bits required by `event` that the session does not hold.
pub fn missing_intents(event: LogEvent, held: Intents) -> Intents {
    capability(event).required_intents - held
}

/// Full decision for one event in one guild.
pub async fn should_emit(
    session: &Session,
    config: &ConfigManager,
    event: LogEvent,
    guild_id: Id<GuildMarker>,
) -> Decision {
    let settings = config.guild(guild_id).unwrap_or_default();
    let runtime = config.resolve_runtime(guild_id);
    let features = config.resolve_features(guild_id);

    let (channel_id, cap) = match resolve_emit(&settings, &runtime, &features, event) {
        Ok(resolved) => resolved,
        Err(decision) => return decision,
    };

    // 4b. Channel and permission validation.
    if let Some(channel_id) = channel_id {
        if cap.validate_channel_perms {
            if let Err(reason) = validate_channel(session, guild_id, channel_id, &cap).await {
                error!(
                    "Log channel validation failed for {event} in guild {guild_id}, \
                     channel {channel_id}: {reason}"
                );
                return Decision::denied(reason, cap).with_channel(channel_id);
            }
        }
    }

    // 5. Intent mask check, missing bits reported for operator feedback.
    let missing = cap.required_intents - session.intents;
    if !missing.is_empty() {
        let mut decision = Decision::denied(DecisionReason::MissingIntents, cap);
        decision.channel_id = channel_id;
        decision.missing_intents = missing;
        return decision;
    }

    Decision::allowed(channel_id, cap)
}

async fn validate_channel(
    session: &Session,
    guild_id: Id<GuildMarker>,
    channel_id: Id<ChannelMarker>,
    cap: &Capability,
) -> Result<(), DecisionReason> {
    let channel = session
        .channel(channel_id)
        .await
        .map_err(|_| DecisionReason::ChannelInvalid)?;

    if channel.guild_id != Some(guild_id) {
        return Err(DecisionReason::ChannelInvalid);
    }
    if !matches!(
        channel.kind,
        ChannelType::GuildText | ChannelType::GuildAnnouncement
    ) {
        return Err(DecisionReason::ChannelInvalid);
    }

    let permissions = bot_permissions_in_channel(session, guild_id, &channel)
        .await
        .map_err(|_| DecisionReason::MissingPermissions)?;
    if !permissions.contains(cap.required_permissions) {
        return Err(DecisionReason::MissingPermissions);
    }

    Ok(())
}

/// Bot permissions in a channel, from cached state when possible.
async fn bot_permissions_in_channel(
    session: &Session,
    guild_id: Id<GuildMarker>,
    channel: &Channel,
) -> AnyResult<Permissions> {
    if let Ok(permissions) = session.cache.permissions().in_channel(session.user.id, channel.id) {
        return Ok(permissions);
    }

    // State cache miss, compute from a REST lookup instead.
    let roles = session.http.roles(guild_id).await?.models().await?;
    let member = session.member(guild_id, session.user.id).await?;

    let everyone = roles
        .iter()
        .find(|role| role.id.get() == guild_id.get())
        .map(|role| role.permissions)
        .unwrap_or_else(Permissions::empty);
    let member_roles = roles
        .iter()
        .filter(|role| member.roles.contains(&role.id))
        .map(|role| (role.id, role.permissions))
        .collect::<Vec<(Id<RoleMarker>, Permissions)>>();

    let calculator =
        PermissionCalculator::new(guild_id, session.user.id, everyone, &member_roles);
    let overwrites = channel.permission_overwrites.clone().unwrap_or_default();

    Ok(calculator.in_channel(channel.kind, &overwrites))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with(channels: LogChannels) -> GuildSettings {
        GuildSettings { channels, ..GuildSettings::default() }
    }

    fn all_on() -> (RuntimeConfig, Features) {
        (RuntimeConfig::default(), Features::default())
    }

    #[test]
    fn kill_switch_beats_feature_toggle() {
        let settings = settings_with(LogChannels {
            message_audit: Some(Id::new(1)),
            ..LogChannels::default()
        });
        let mut runtime = RuntimeConfig::default();
        runtime.disable_message_logs = true;
        let mut features = Features::default();
        features.logging.message_edit = false;

        let decision =
            resolve_emit(&settings, &runtime, &features, LogEvent::MessageEdit).unwrap_err();
        assert_eq!(decision.reason, DecisionReason::RuntimeDisabled);
        assert!(!decision.enabled);
    }

    #[test]
    fn feature_toggle_denies() {
        let settings = settings_with(LogChannels {
            message_audit: Some(Id::new(1)),
            ..LogChannels::default()
        });
        let (runtime, mut features) = all_on();
        features.logging.message_edit = false;

        let decision =
            resolve_emit(&settings, &runtime, &features, LogEvent::MessageEdit).unwrap_err();
        assert_eq!(decision.reason, DecisionReason::FeatureDisabled);
    }

    #[test]
    fn moderation_logging_false_is_a_kill_switch() {
        let settings = settings_with(LogChannels {
            moderation: Some(Id::new(1)),
            ..LogChannels::default()
        });
        let (mut runtime, features) = all_on();
        runtime.moderation_logging = false;

        let decision =
            resolve_emit(&settings, &runtime, &features, LogEvent::ModerationCase).unwrap_err();
        assert_eq!(decision.reason, DecisionReason::RuntimeDisabled);
    }

    #[test]
    fn unconfigured_channel_denies() {
        let settings = settings_with(LogChannels::default());
        let (runtime, features) = all_on();

        let decision =
            resolve_emit(&settings, &runtime, &features, LogEvent::MemberJoin).unwrap_err();
        assert_eq!(decision.reason, DecisionReason::NoChannelConfigured);
        assert_eq!(decision.channel_id, None);
    }

    #[test]
    fn fallback_channel_is_used_in_order() {
        let settings = settings_with(LogChannels {
            user_activity: Some(Id::new(7)),
            ..LogChannels::default()
        });
        let (runtime, features) = all_on();

        let (channel, _) =
            resolve_emit(&settings, &runtime, &features, LogEvent::MessageEdit).unwrap();
        assert_eq!(channel, Some(Id::new(7)));

        // Preferred slot wins once configured.
        let settings = settings_with(LogChannels {
            user_activity: Some(Id::new(7)),
            message_audit: Some(Id::new(8)),
            ..LogChannels::default()
        });
        let (channel, _) =
            resolve_emit(&settings, &runtime, &features, LogEvent::MessageEdit).unwrap();
        assert_eq!(channel, Some(Id::new(8)));
    }

    #[test]
    fn shared_moderation_channel_is_invalid() {
        let settings = settings_with(LogChannels {
            message_audit: Some(Id::new(1)),
            moderation: Some(Id::new(1)),
            ..LogChannels::default()
        });
        let (runtime, features) = all_on();

        let decision =
            resolve_emit(&settings, &runtime, &features, LogEvent::ModerationCase).unwrap_err();
        assert_eq!(decision.reason, DecisionReason::ChannelInvalid);
        assert_eq!(decision.channel_id, Some(Id::new(1)));

        // An exclusive moderation channel is fine.
        let settings = settings_with(LogChannels {
            message_audit: Some(Id::new(1)),
            moderation: Some(Id::new(2)),
            ..LogChannels::default()
        });
        assert!(resolve_emit(&settings, &runtime, &features, LogEvent::ModerationCase).is_ok());
    }

    #[test]
    fn missing_intent_bits_are_reported() {
        let held = Intents::GUILDS | Intents::GUILD_MESSAGES;
        let missing = missing_intents(LogEvent::MessageEdit, held);
        assert_eq!(missing, Intents::MESSAGE_CONTENT);

        let missing = missing_intents(LogEvent::ModerationCase, Intents::empty());
        assert!(missing.is_empty());
    }

    #[test]
    fn reasons_render_as_enumerated_strings() {
        assert_eq!(DecisionReason::Ok.to_string(), "ok");
        assert_eq!(DecisionReason::RuntimeDisabled.to_string(), "runtime_disabled");
        assert_eq!(DecisionReason::FeatureDisabled.to_string(), "feature_disabled");
        assert_eq!(
            DecisionReason::NoChannelConfigured.to_string(),
            "no_channel_configured"
        );
        assert_eq!(DecisionReason::ChannelInvalid.to_string(), "channel_invalid");
        assert_eq!(
            DecisionReason::MissingPermissions.to_string(),
            "missing_permissions"
        );
        assert_eq!(DecisionReason::MissingIntents.to_string(), "missing_intents");
    }

    #[test]
    fn every_event_has_a_capability_row() {
        for event in LogEvent::ALL {
            let cap = capability(event);
            assert_eq!(cap.event, event);
            assert!(!cap.category.is_empty());
        }
    }

    #[test]
    fn channel_requirement_gates_resolution() {
        let settings = settings_with(LogChannels::default());
        let (runtime, features) = all_on();

        for event in LogEvent::ALL {
            let cap = capability(event);
            let result = resolve_emit(&settings, &runtime, &features, event);
            if cap.requires_channel {
                // No slots configured: resolution must refuse.
                assert_eq!(
                    result.unwrap_err().reason,
                    DecisionReason::NoChannelConfigured
                );
            } else {
                // Channel-less capabilities pass straight through.
                assert_eq!(result.unwrap().0, None);
            }
        }
    }
}

/*!
Remote webhook target operations.

Validation and embed-patching of messages owned by a webhook, with
classified errors so callers can distinguish a dead target from a
temporarily unavailable one.
*/

use std::sync::Arc;
use std::time::Duration;

use derive_more::Display;
use twilight_http::Client;
use twilight_model::channel::message::Embed;
use twilight_model::id::marker::{MessageMarker, WebhookMarker};
use twilight_model::id::Id;

use crate::utils::prelude::*;

/// Default validation timeout.
pub const DEFAULT_VALIDATE_TIMEOUT: Duration = Duration::from_secs(3);

/// Classified webhook-target failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TargetErrorKind {
    #[display("auth_denied")]
    AuthDenied,
    #[display("not_found")]
    NotFound,
    #[display("rate_limited")]
    RateLimited,
    #[display("discord_unavailable")]
    DiscordUnavailable,
    #[display("unknown")]
    Unknown,
}

#[derive(Debug, thiserror::Error)]
#[error("webhook target error: {kind} (temporary: {temporary})")]
pub struct TargetError {
    pub kind: TargetErrorKind,
    /// Worth retrying later (429 and 5xx and timeouts).
    pub temporary: bool,
}

impl TargetError {
    fn permanent(kind: TargetErrorKind) -> Self {
        Self { kind, temporary: false }
    }

    fn temporary(kind: TargetErrorKind) -> Self {
        Self { kind, temporary: true }
    }
}

/// Parsed `{webhooks, id, token}` triple from a webhook URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookTarget {
    pub webhook_id: Id<WebhookMarker>,
    pub token: String,
}

/// Extract id and token from a webhook URL of any API version.
pub fn parse_webhook_url(url: &str) -> Result<WebhookTarget, TargetError> {
    let rest = url
        .split_once("webhooks/")
        .map(|(_, rest)| rest)
        .ok_or_else(|| TargetError::permanent(TargetErrorKind::Unknown))?;

    let mut parts = rest.split('/');
    let id = parts
        .next()
        .and_then(|part| part.parse::<u64>().ok())
        .and_then(Id::new_checked)
        .ok_or_else(|| TargetError::permanent(TargetErrorKind::Unknown))?;
    let token = parts
        .next()
        .map(|part| part.split(['?', '#']).next().unwrap_or(part))
        .filter(|token| !token.is_empty())
        .ok_or_else(|| TargetError::permanent(TargetErrorKind::Unknown))?;

    Ok(WebhookTarget {
        webhook_id: id,
        token: token.to_string(),
    })
}

/// Normalize a JSON payload into an embed list. Accepts a bare embed
/// object, an embeds array, or an object with an `embeds` field.
pub fn normalize_embeds(payload: serde_json::Value) -> AnyResult<Vec<Embed>> {
    let value = match payload {
        serde_json::Value::Object(ref object) if object.contains_key("embeds") => {
            object.get("embeds").cloned().unwrap_or_default()
        },
        other => other,
    };

    match value {
        serde_json::Value::Array(_) => {
            serde_json::from_value(value).context("Invalid embeds array")
        },
        serde_json::Value::Object(_) => {
            let embed: Embed = serde_json::from_value(value).context("Invalid embed object")?;
            Ok(vec![embed])
        },
        other => anyhow::bail!("Unsupported embed payload: {other}"),
    }
}

fn classify_http_error(error: &twilight_http::Error) -> TargetError {
    use twilight_http::error::ErrorType;

    match error.kind() {
        ErrorType::Response { status, .. } => {
            let code = status.get();
            match code {
                401 | 403 => TargetError::permanent(TargetErrorKind::AuthDenied),
                404 => TargetError::permanent(TargetErrorKind::NotFound),
                429 => TargetError::temporary(TargetErrorKind::RateLimited),
                code if code >= 500 => {
                    TargetError::temporary(TargetErrorKind::DiscordUnavailable)
                },
                _ => TargetError::permanent(TargetErrorKind::Unknown),
            }
        },
        ErrorType::RequestTimedOut => TargetError::temporary(TargetErrorKind::DiscordUnavailable),
        _ => TargetError::permanent(TargetErrorKind::Unknown),
    }
}

/// Validation and patching of webhook-owned messages.
pub struct WebhookTargetOps {
    /// Tokenless client with the ratelimiter disabled; validation must
    /// answer quickly rather than queue behind other traffic.
    http: Arc<Client>,
}

impl WebhookTargetOps {
    pub fn new() -> Self {
        Self {
            http: Arc::new(Client::builder().ratelimiter(None).build()),
        }
    }

    /// Check that the webhook exists and owns `message_id`.
    pub async fn validate_message_target(
        &self,
        message_id: Id<MessageMarker>,
        webhook_url: &str,
        timeout: Option<Duration>,
    ) -> Result<(), TargetError> {
        let target = parse_webhook_url(webhook_url)?;
        let timeout = timeout.unwrap_or(DEFAULT_VALIDATE_TIMEOUT);

        // Webhook lookup.
        let request = self.http.webhook(target.webhook_id).token(&target.token);
        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| TargetError::temporary(TargetErrorKind::DiscordUnavailable))?
            .map_err(|e| classify_http_error(&e))?;

        // Message lookup.
        let request = self
            .http
            .webhook_message(target.webhook_id, &target.token, message_id);
        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| TargetError::temporary(TargetErrorKind::DiscordUnavailable))?
            .map_err(|e| classify_http_error(&e))?;

        Ok(())
    }

    /// Replace the embeds of a webhook-owned message.
    pub async fn patch_message_embed(
        &self,
        webhook_url: &str,
        message_id: Id<MessageMarker>,
        payload: serde_json::Value,
    ) -> AnyResult<()> {
        let target = parse_webhook_url(webhook_url).map_err(|e| anyhow::anyhow!("{e}"))?;
        let embeds = normalize_embeds(payload)?;

        self.http
            .update_webhook_message(target.webhook_id, &target.token, message_id)
            .embeds(Some(&embeds))
            .context("Invalid embed payload")?
            .await
            .context("Webhook message edit failed")?;

        debug!("Patched webhook message {message_id}");

        Ok(())
    }
}

impl Default for WebhookTargetOps {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_urls_parse_across_api_versions() {
        let expected = WebhookTarget {
            webhook_id: Id::new(123),
            token: "abc-DEF_ghi".to_string(),
        };

        assert_eq!(
            parse_webhook_url("https://discord.com/api/webhooks/123/abc-DEF_ghi").unwrap(),
            expected
        );
        assert_eq!(
            parse_webhook_url("https://discord.com/api/v10/webhooks/123/abc-DEF_ghi").unwrap(),
            expected
        );
        // Query strings are not part of the token.
        assert_eq!(
            parse_webhook_url("https://discord.com/api/webhooks/123/abc-DEF_ghi?wait=true")
                .unwrap(),
            expected
        );
    }

    #[test]
    fn invalid_webhook_urls_are_rejected() {
        assert!(parse_webhook_url("https://discord.com/api/channels/1/2").is_err());
        assert!(parse_webhook_url("https://discord.com/api/webhooks/notanid/tok").is_err());
        assert!(parse_webhook_url("https://discord.com/api/webhooks/123").is_err());
        assert!(parse_webhook_url("https://discord.com/api/webhooks/123/").is_err());
    }

    #[test]
    fn embed_payload_shapes_normalize() {
        let embed = serde_json::json!({"title": "t", "type": "rich"});

        // Bare object.
        let embeds = normalize_embeds(embed.clone()).unwrap();
        assert_eq!(embeds.len(), 1);
        assert_eq!(embeds[0].title.as_deref(), Some("t"));

        // Array.
        let embeds = normalize_embeds(serde_json::json!([embed, embed])).unwrap();
        assert_eq!(embeds.len(), 2);

        // Wrapped in an `embeds` field.
        let embeds = normalize_embeds(serde_json::json!({ "embeds": [embed] })).unwrap();
        assert_eq!(embeds.len(), 1);

        // Scalars are refused.
        assert!(normalize_embeds(serde_json::json!("nope")).is_err());
    }

    #[test]
    fn error_kinds_render_as_snake_case() {
        assert_eq!(TargetErrorKind::AuthDenied.to_string(), "auth_denied");
        assert_eq!(TargetErrorKind::NotFound.to_string(), "not_found");
        assert_eq!(TargetErrorKind::RateLimited.to_string(), "rate_limited");
        assert_eq!(
            TargetErrorKind::DiscordUnavailable.to_string(),
            "discord_unavailable"
        );
        assert_eq!(TargetErrorKind::Unknown.to_string(), "unknown");
    }
}

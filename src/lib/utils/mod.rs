use std::env;

use chrono::{DateTime, TimeZone, Utc};

pub mod prelude;

/// Discord snowflake epoch in milliseconds (2015-01-01T00:00:00Z).
pub const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

/// Read a boolean environment variable.
///
/// Accepts `1`, `true`, `yes` and `on` (case-insensitive) as `true`,
/// `0`, `false`, `no` and `off` as `false`. Anything else is `None`.
pub fn env_bool(key: &str) -> Option<bool> {
    let value = env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read a decimal integer environment variable.
pub fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok()?.trim().parse().ok()
}

/// Creation time embedded in a snowflake id.
pub fn snowflake_timestamp(id: u64) -> DateTime<Utc> {
    let ms = (id >> 22) as i64 + DISCORD_EPOCH_MS;
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// A positive unix-seconds timestamp as an instant.
pub fn timestamp_secs_to_utc(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}

/// Per-day counter key, `YYYY-MM-DD` in UTC.
pub fn day_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Truncate to at most `max` characters, appending `...` when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut = max.saturating_sub(3);
    let mut out = text.chars().take(cut).collect::<String>();
    out.push_str("...");
    out
}

/// Truncate to at most `max` bytes on a char boundary, appending `...` when cut.
pub fn truncate_bytes(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max.saturating_sub(3);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Rough human-readable duration, largest two units.
pub fn humanize_duration(duration: chrono::Duration) -> String {
    let total = duration.num_seconds().max(0);
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

/// First `<@id>` or `<@!id>` mention in `text`, as a raw id.
pub fn first_user_mention(text: &str) -> Option<u64> {
    let mut rest = text;
    while let Some(start) = rest.find("<@") {
        let tail = &rest[start + 2..];
        let tail = tail.strip_prefix('!').unwrap_or(tail);
        if let Some(end) = tail.find('>') {
            let digits = &tail[..end];
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                return digits.parse().ok();
            }
        }
        rest = &rest[start + 2..];
    }
    None
}

/// First backtick-quoted token in `text`.
pub fn first_backtick_token(text: &str) -> Option<&str> {
    let start = text.find('`')?;
    let rest = &text[start + 1..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn snowflake_creation_time() {
        // First second of 2015 is id 0.
        assert_eq!(
            snowflake_timestamp(0),
            Utc.timestamp_millis_opt(DISCORD_EPOCH_MS).single().unwrap()
        );
        // One hour worth of milliseconds shifted into the timestamp bits.
        let id = (3_600_000u64) << 22;
        assert_eq!(
            snowflake_timestamp(id),
            Utc.timestamp_millis_opt(DISCORD_EPOCH_MS + 3_600_000)
                .single()
                .unwrap()
        );
    }

    #[test]
    fn env_bool_parses_common_forms() {
        env::set_var("ALICE_TEST_BOOL", "Yes");
        assert_eq!(env_bool("ALICE_TEST_BOOL"), Some(true));
        env::set_var("ALICE_TEST_BOOL", "0");
        assert_eq!(env_bool("ALICE_TEST_BOOL"), Some(false));
        env::set_var("ALICE_TEST_BOOL", "maybe");
        assert_eq!(env_bool("ALICE_TEST_BOOL"), None);
        env::remove_var("ALICE_TEST_BOOL");
        assert_eq!(env_bool("ALICE_TEST_BOOL"), None);
    }

    #[test]
    fn truncation_at_boundaries() {
        assert_eq!(truncate_chars("short", 200), "short");
        let long = "x".repeat(250);
        let cut = truncate_chars(&long, 200);
        assert_eq!(cut.chars().count(), 200);
        assert!(cut.ends_with("..."));

        let reason = "y".repeat(600);
        let cut = truncate_bytes(&reason, 512);
        assert_eq!(cut.len(), 512);
        assert!(cut.ends_with("..."));

        // Multibyte input must not split a char.
        let emoji = "ä".repeat(300);
        let cut = truncate_bytes(&emoji, 101);
        assert!(cut.len() <= 101);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn day_key_is_utc() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 23, 59, 59).unwrap();
        assert_eq!(day_key(at), "2024-03-07");
    }

    #[test]
    fn mention_extraction() {
        assert_eq!(first_user_mention("welcome <@123456>!"), Some(123_456));
        assert_eq!(first_user_mention("hi <@!42> bye"), Some(42));
        assert_eq!(first_user_mention("no mention <@abc>"), None);
        assert_eq!(first_user_mention("plain text"), None);
    }

    #[test]
    fn backtick_extraction() {
        assert_eq!(first_backtick_token("user `123` joined"), Some("123"));
        assert_eq!(first_backtick_token("no token"), None);
        assert_eq!(first_backtick_token("dangling `tick"), None);
    }

    #[test]
    fn humanized_durations() {
        assert_eq!(humanize_duration(Duration::days(3) + Duration::hours(4)), "3d 4h");
        assert_eq!(humanize_duration(Duration::minutes(90)), "1h 30m");
        assert_eq!(humanize_duration(Duration::seconds(59)), "0m");
    }
}

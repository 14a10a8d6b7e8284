use indoc::indoc;

/// Idempotent schema, applied on every open.
pub(crate) const SCHEMA: &str = indoc! {r#"
    CREATE TABLE IF NOT EXISTS messages (
        guild_id        TEXT NOT NULL,
        message_id      TEXT NOT NULL,
        channel_id      TEXT NOT NULL,
        author_id       TEXT NOT NULL,
        author_username TEXT NOT NULL,
        author_avatar   TEXT,
        content         TEXT NOT NULL,
        cached_at       INTEGER NOT NULL,
        expires_at      INTEGER,
        PRIMARY KEY (guild_id, message_id)
    );

    CREATE INDEX IF NOT EXISTS idx_messages_expires
        ON messages (expires_at) WHERE expires_at IS NOT NULL;

    CREATE TABLE IF NOT EXISTS message_versions (
        guild_id         TEXT NOT NULL,
        message_id       TEXT NOT NULL,
        version          INTEGER NOT NULL,
        event_type       TEXT NOT NULL CHECK (event_type IN ('create', 'edit', 'delete')),
        content          TEXT NOT NULL,
        attachment_count INTEGER NOT NULL DEFAULT 0,
        embed_count      INTEGER NOT NULL DEFAULT 0,
        sticker_count    INTEGER NOT NULL DEFAULT 0,
        created_at       INTEGER NOT NULL,
        PRIMARY KEY (guild_id, message_id, version)
    );

    CREATE TABLE IF NOT EXISTS member_joins (
        guild_id  TEXT NOT NULL,
        user_id   TEXT NOT NULL,
        joined_at INTEGER NOT NULL,
        PRIMARY KEY (guild_id, user_id)
    );

    CREATE TABLE IF NOT EXISTS avatars (
        guild_id    TEXT NOT NULL,
        user_id     TEXT NOT NULL,
        avatar_hash TEXT NOT NULL,
        updated_at  INTEGER NOT NULL,
        PRIMARY KEY (guild_id, user_id)
    );

    CREATE TABLE IF NOT EXISTS avatar_history (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        guild_id   TEXT NOT NULL,
        user_id    TEXT NOT NULL,
        old_hash   TEXT NOT NULL,
        new_hash   TEXT NOT NULL,
        changed_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_avatar_history_user
        ON avatar_history (guild_id, user_id, changed_at);

    CREATE TABLE IF NOT EXISTS member_roles (
        guild_id   TEXT NOT NULL,
        user_id    TEXT NOT NULL,
        role_id    TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (guild_id, user_id, role_id)
    );

    CREATE TABLE IF NOT EXISTS guild_meta (
        guild_id  TEXT PRIMARY KEY,
        bot_since INTEGER NOT NULL,
        owner_id  TEXT
    );

    CREATE TABLE IF NOT EXISTS runtime_meta (
        key TEXT PRIMARY KEY,
        at  INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS moderation_cases (
        guild_id  TEXT PRIMARY KEY,
        last_case INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS cache_entries (
        key        TEXT PRIMARY KEY,
        entry_type TEXT NOT NULL,
        data       TEXT NOT NULL,
        cached_at  INTEGER NOT NULL,
        expires_at INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_cache_entries_type
        ON cache_entries (entry_type);

    CREATE TABLE IF NOT EXISTS daily_message_counts (
        guild_id   TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        user_id    TEXT NOT NULL,
        day        TEXT NOT NULL,
        count      INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (guild_id, channel_id, user_id, day)
    );

    CREATE TABLE IF NOT EXISTS daily_reaction_counts (
        guild_id   TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        user_id    TEXT NOT NULL,
        day        TEXT NOT NULL,
        count      INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (guild_id, channel_id, user_id, day)
    );

    CREATE TABLE IF NOT EXISTS daily_join_counts (
        guild_id TEXT NOT NULL,
        user_id  TEXT NOT NULL,
        day      TEXT NOT NULL,
        count    INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (guild_id, user_id, day)
    );

    CREATE TABLE IF NOT EXISTS daily_leave_counts (
        guild_id TEXT NOT NULL,
        user_id  TEXT NOT NULL,
        day      TEXT NOT NULL,
        count    INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (guild_id, user_id, day)
    );
"#};

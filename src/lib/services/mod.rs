/// Top-level coordinator.
pub mod monitor;

/// Join/leave handling and auto-role maintenance.
pub mod member;

/// Message create/update/delete handling.
pub mod message;

/// Per-day reaction counters.
pub mod reaction;

/// Native moderation-action logging.
pub mod automod;

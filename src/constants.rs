//! Protocol constants and configuration defaults

/// Commonly configured TCP port for Yate's extmodule listener.
///
/// The engine has no fixed default; deployments conventionally pick 5040.
pub const DEFAULT_ENGINE_PORT: u16 = 5040;

/// Role announced in the initial `%%>connect` command.
pub const CONNECT_ROLE: &str = "global";

/// Messages the session installs handlers for (the engine expects a reply),
/// with their priorities.
pub const INSTALLED_MESSAGES: &[(&str, u32)] = &[
    ("call.route", 10),
    ("user.auth", 10),
    ("user.register", 10),
];

/// Messages the session watches (observe-only notifications).
pub const WATCHED_MESSAGES: &[&str] = &[
    "call.execute",
    "user.login",
    "user.unregister",
    "user.notify",
    "chan.connected",
    "chan.hangup",
    "chan.notify",
    "chan.dtmf",
];

/// TCP connect timeout in milliseconds.
pub const DIAL_TIMEOUT_MS: u64 = 2000;

/// Default delay before re-dialing after the socket drops.
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5000;

/// Default deadline for the host's authenticator.
pub const DEFAULT_AUTHENTICATE_TIMEOUT_MS: u64 = 5000;

/// Default per-call duration cap (2 hours).
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 7_200_000;

/// Default call setup (pre-answer) cap.
pub const DEFAULT_CALL_SETUP_TIMEOUT_MS: u64 = 70_000;

/// How long `make_call` waits for the engine's matching `call.route`.
pub const OUTGOING_CALL_INIT_TIMEOUT_MS: u64 = 5000;

/// Delay between attaching an IVR and announcing the peer relationship,
/// so the first queued sound is not truncated.
pub const IVR_PEER_DELAY_MS: u64 = 1200;

/// Pre-ring grace added to a route's `forward_timeout` in fork `drop=` groups.
pub const FORK_DROP_GRACE_MS: u64 = 3000;

/// Registration lifetime assumed when `user.register` carries no `expires`.
pub const DEFAULT_REGISTER_EXPIRES_SECS: u64 = 3600;

/// Capacity of the channel delivering [`PbxEvent`](crate::PbxEvent)s.
pub const EVENT_QUEUE_SIZE: usize = 1024;

/// Capacity of each per-channel event stream.
pub const CHANNEL_EVENT_QUEUE_SIZE: usize = 64;

/// Longest line accepted from the engine before the frame is dropped.
pub const MAX_LINE_LENGTH: usize = 512 * 1024;

/// How many terminated channels keep their disconnect cause queryable.
pub const FINISHED_CHANNEL_BACKLOG: usize = 1024;

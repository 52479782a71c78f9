/// Process-wide constants
/// Intervals, endpoints and defaults shared across modules

use std::time::Duration;

// ============================================================================
// Platform API Constants
// ============================================================================

pub const API_BASE: &str = "https://api.bilibili.com";
pub const LIVE_API_BASE: &str = "https://api.live.bilibili.com";
pub const PASSPORT_BASE: &str = "https://passport.bilibili.com";

/// Browser UA expected by the platform web API.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Chat messages are capped at 20 code points for regular viewers; longer
/// reports are split into chunks of this size.
pub const MAX_CHAT_MSG_RUNES: usize = 20;

/// WBI key halves rotate on the server side; re-fetch past this age.
pub const WBI_KEY_MAX_AGE: Duration = Duration::from_secs(60 * 60);

// ============================================================================
// Live Stream Constants
// ============================================================================

/// The server drops the connection after ~30s of silence; 20s gives headroom.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Wait before retrying the next endpoint after a connection failure.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Pause between socket reads so cancellation is observed promptly.
pub const READ_YIELD: Duration = Duration::from_millis(10);

/// Bounded capacity of the decoded-event channel feeding the aggregator.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

// ============================================================================
// Aggregation Constants
// ============================================================================

/// A batch entry is flushed once it has been quiet for this long.
pub const BATCH_QUIESCENCE: Duration = Duration::from_secs(1);

/// Fallback wakeup of the main loop when no events arrive.
pub const LOOP_TIMEOUT: Duration = Duration::from_secs(2);

/// How often the OBS leaderboard text is refreshed.
pub const OBS_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// The chat rate limit is stringent and not very predictable;
/// ((0.8, 1.2) * 2) seconds between sends stays under it in practice.
pub const CHAT_THROTTLE_MIN: Duration = Duration::from_millis(1600);
pub const CHAT_THROTTLE_MAX: Duration = Duration::from_millis(2400);

/// Non-blind gift counted per viewer alongside the box statistics.
pub const TICKET_GIFT_NAME: &str = "电影票";

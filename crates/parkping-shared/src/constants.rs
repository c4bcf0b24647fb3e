/// Application name
pub const APP_NAME: &str = "parkping";

/// Maximum number of messages kept in a channel's history ring buffer
pub const HISTORY_CAPACITY: usize = 50;

/// Number of escalation pulses before an unanswered alarm gives up
pub const ALARM_PULSE_BUDGET: u32 = 15;

/// Default seconds between two escalation pulses
pub const DEFAULT_PULSE_INTERVAL_SECS: u64 = 5;

/// Maximum characters of chat text included in a push preview
pub const PUSH_PREVIEW_CHARS: usize = 100;

/// Placeholder stored in history in place of audio content
pub const AUDIO_PLACEHOLDER: &str = "[voice note]";

/// Default HTTP / WebSocket port
pub const DEFAULT_HTTP_PORT: u16 = 3001;

/// Reserved administrator identity
pub const DEFAULT_ADMIN_ID: &str = "admin";

/// WebSocket close code sent to force-disconnected connections
pub const CLOSE_CODE_KICKED: u16 = 4001;

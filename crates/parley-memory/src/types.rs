use chrono::{DateTime, Duration, Utc};

pub const DEFAULT_CHAT_LOG_MINUTES: u32 = 30;
pub const MAX_CHAT_LOG_MINUTES: u32 = 1440;

/// Look-back window for transcript reads, in whole minutes.
///
/// Always between one minute and one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatLogWindow {
    minutes: u32,
}

impl ChatLogWindow {
    pub fn minutes(minutes: Option<u32>) -> Self {
        let minutes = minutes
            .unwrap_or(DEFAULT_CHAT_LOG_MINUTES)
            .clamp(1, MAX_CHAT_LOG_MINUTES);
        Self { minutes }
    }

    pub fn as_minutes(self) -> u32 {
        self.minutes
    }

    /// `(start, end)` ending at `now`.
    pub fn bounds(self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now - Duration::minutes(i64::from(self.minutes)), now)
    }
}

impl Default for ChatLogWindow {
    fn default() -> Self {
        Self::minutes(None)
    }
}

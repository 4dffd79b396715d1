use serde::{Deserialize, Serialize};

/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// External actor a session is kept for (user, or chat when no user is known).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub i64);

/// Position in the platform's ordered update stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UpdateId(pub i64);

/// Highest update id fully handed off to the processor.
///
/// `Cursor::ZERO` is the first-run sentinel.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Cursor(pub i64);

impl Cursor {
    pub const ZERO: Cursor = Cursor(0);

    /// Offset to request from the stream: one past the cursor.
    pub fn next_offset(self) -> i64 {
        self.0.saturating_add(1)
    }

    pub fn covers(self, id: UpdateId) -> bool {
        id.0 <= self.0
    }
}

impl From<UpdateId> for Cursor {
    fn from(id: UpdateId) -> Self {
        Cursor(id.0)
    }
}

/// Logical service names used as rate-limit keys.
pub mod services {
    /// Long-poll calls to the platform's update endpoint.
    pub const PLATFORM_INGEST: &str = "platform-ingest";
    /// Replies and other outbound platform calls.
    pub const PLATFORM_OUTBOUND: &str = "platform-outbound";
    pub const MARKET_DATA: &str = "market-data";
}

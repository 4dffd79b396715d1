//! Cross-messenger abstractions (Telegram today).

pub mod dispatched;
pub mod port;
pub mod types;

//! Telegram adapter (teloxide).
//!
//! This crate implements the `relay-core` ports over the Telegram Bot API:
//! [`TelegramMessenger`] (outbound `MessagingPort`) and [`TelegramUpdates`]
//! (`getUpdates` long-poll `UpdateSource`). Neither retries; throttling and
//! retry policy live in the engine.

use std::time::Duration;

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode},
    ApiError, RequestError,
};

pub mod convert;
pub mod format;
pub mod handlers;
pub mod router;

use relay_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::{Error, TransportFailure},
    ingest::UpdateSource,
    messaging::{
        port::MessagingPort,
        types::{ChatAction, InlineKeyboard, MessagingCapabilities, Update},
    },
    Result,
};

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }
}

/// Classify a teloxide failure for the dispatcher.
pub fn map_request_error(e: RequestError) -> Error {
    let failure = match e {
        RequestError::RetryAfter(d) => TransportFailure::RateLimited {
            retry_after: Some(d),
        },
        RequestError::Network(err) if err.is_timeout() => TransportFailure::Timeout,
        RequestError::Network(err) => TransportFailure::Connection(err.to_string()),
        RequestError::Io(err) => TransportFailure::Connection(err.to_string()),
        RequestError::InvalidJson { source, .. } => TransportFailure::Malformed(source.to_string()),
        // teloxide's name for a rejected bot token.
        RequestError::Api(ApiError::NotFound) => {
            TransportFailure::Unauthorized("invalid bot token".to_string())
        }
        RequestError::Api(api) => TransportFailure::Rejected(api.to_string()),
        other => TransportFailure::Rejected(other.to_string()),
    };
    failure.into()
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_html: true,
            supports_inline_keyboards: true,
            max_message_len: 4096,
        }
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let msg = self
            .bot
            .send_message(Self::tg_chat(chat_id), html.to_string())
            .parse_mode(ParseMode::Html)
            .await
            .map_err(map_request_error)?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        let tg_action = match action {
            ChatAction::Typing => teloxide::types::ChatAction::Typing,
        };
        self.bot
            .send_chat_action(Self::tg_chat(chat_id), tg_action)
            .await
            .map_err(map_request_error)?;
        Ok(())
    }

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        let rows: Vec<Vec<InlineKeyboardButton>> = keyboard
            .buttons
            .into_iter()
            .map(|b| vec![InlineKeyboardButton::callback(b.label, b.callback_data)])
            .collect();
        let markup = InlineKeyboardMarkup::new(rows);

        let msg = self
            .bot
            .send_message(Self::tg_chat(chat_id), text.to_string())
            .parse_mode(ParseMode::Html)
            .reply_markup(markup)
            .await
            .map_err(map_request_error)?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        let mut req = self.bot.answer_callback_query(callback_id.to_string());
        if let Some(t) = text {
            req = req.text(t.to_string());
        }
        req.await.map_err(map_request_error)?;
        Ok(())
    }
}

/// `getUpdates` long-poll source.
#[derive(Clone)]
pub struct TelegramUpdates {
    bot: Bot,
}

impl TelegramUpdates {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl UpdateSource for TelegramUpdates {
    async fn poll(&self, offset: i64, timeout: Duration, limit: u8) -> Result<Vec<Update>> {
        let offset = i32::try_from(offset).map_err(|_| {
            Error::from(TransportFailure::Rejected(format!(
                "offset {offset} out of range for getUpdates"
            )))
        })?;
        let timeout_secs = u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX);

        let updates = self
            .bot
            .get_updates()
            .offset(offset)
            .timeout(timeout_secs)
            .limit(limit)
            .await
            .map_err(map_request_error)?;

        Ok(updates.into_iter().map(convert::convert_update).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::errors::FailureKind;

    #[test]
    fn retry_after_becomes_transient_with_hint() {
        let err = map_request_error(RequestError::RetryAfter(Duration::from_secs(9)));
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(9)));
    }

    #[test]
    fn api_errors_are_permanent() {
        let err = map_request_error(RequestError::Api(ApiError::NotFound));
        assert_eq!(err.kind(), FailureKind::Permanent);
        assert!(matches!(
            err,
            Error::Transport(TransportFailure::Unauthorized(_))
        ));

        let err = map_request_error(RequestError::Api(ApiError::ChatNotFound));
        assert_eq!(err.kind(), FailureKind::Permanent);
    }

    #[test]
    fn io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = map_request_error(RequestError::Io(io));
        assert!(err.is_transient());
    }
}

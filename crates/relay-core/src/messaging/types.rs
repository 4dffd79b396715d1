use crate::domain::{ActorId, ChatId, MessageRef, UpdateId, UserId};

/// One entry of the platform's ordered update stream.
#[derive(Clone, Debug)]
pub struct Update {
    pub id: UpdateId,
    pub kind: IncomingUpdate,
}

impl Update {
    /// Actor whose session this update counts towards: the user, falling back
    /// to the chat.
    pub fn actor(&self) -> Option<ActorId> {
        let (user, chat) = match &self.kind {
            IncomingUpdate::Command(c) => (c.user_id, Some(c.chat_id)),
            IncomingUpdate::Text(t) => (t.user_id, Some(t.chat_id)),
            IncomingUpdate::Callback(q) => (Some(q.user_id), q.chat_id),
            IncomingUpdate::Other { chat_id, user_id } => (*user_id, *chat_id),
        };
        user.map(|u| ActorId(u.0)).or(chat.map(|c| ActorId(c.0)))
    }
}

/// Cross-messenger incoming update model.
///
/// Telegram-specific fields should live in the Telegram adapter.
#[derive(Clone, Debug)]
pub enum IncomingUpdate {
    Command(Command),
    Text(TextMessage),
    Callback(CallbackQuery),
    /// Anything the bot does not handle (edits, joins, media...).
    Other {
        chat_id: Option<ChatId>,
        user_id: Option<UserId>,
    },
}

#[derive(Clone, Debug)]
pub struct Command {
    pub chat_id: ChatId,
    pub user_id: Option<UserId>,
    pub username: Option<String>,
    pub name: String,
    pub args: String,
}

impl Command {
    /// Split `/cmd@botname arg1 ...` into a lowercase name and its arguments.
    pub fn parse(text: &str) -> Option<(String, String)> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }
        let mut parts = text.splitn(2, char::is_whitespace);
        let first = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").trim().to_string();

        let name = first
            .trim_start_matches('/')
            .split('@')
            .next()
            .unwrap_or("")
            .to_lowercase();
        if name.is_empty() {
            return None;
        }
        Some((name, rest))
    }
}

#[derive(Clone, Debug)]
pub struct TextMessage {
    pub chat_id: ChatId,
    pub user_id: Option<UserId>,
    pub username: Option<String>,
    pub text: String,
}

#[derive(Clone, Debug)]
pub struct CallbackQuery {
    pub chat_id: Option<ChatId>,
    pub user_id: UserId,
    pub username: Option<String>,
    pub callback_id: String,
    pub data: String,
    pub message: Option<MessageRef>,
}

/// Outgoing "chat action" (typing indicator, etc).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatAction {
    Typing,
}

/// Inline keyboard (buttons), one button per row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub buttons: Vec<InlineButton>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

impl InlineKeyboard {
    pub fn single(label: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            buttons: vec![InlineButton {
                label: label.into(),
                callback_data: callback_data.into(),
            }],
        }
    }
}

/// Capabilities / feature flags of a messenger implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    pub supports_html: bool,
    pub supports_inline_keyboards: bool,
    pub max_message_len: usize,
}

//! teloxide update -> cross-messenger `Update`.

use teloxide::types::{Message, UpdateKind};

use relay_core::{
    domain::{ChatId, MessageId, MessageRef, UpdateId, UserId},
    messaging::types::{CallbackQuery, Command, IncomingUpdate, TextMessage, Update},
};

pub fn convert_update(upd: teloxide::types::Update) -> Update {
    let id = UpdateId(i64::from(upd.id));
    let kind = match &upd.kind {
        UpdateKind::Message(msg) => from_message(msg),
        UpdateKind::CallbackQuery(q) => {
            let message = q.message.as_ref().map(|m| MessageRef {
                chat_id: ChatId(m.chat.id.0),
                message_id: MessageId(m.id.0),
            });
            IncomingUpdate::Callback(CallbackQuery {
                chat_id: message.map(|m| m.chat_id),
                user_id: UserId(q.from.id.0 as i64),
                username: q.from.username.clone(),
                callback_id: q.id.clone(),
                data: q.data.clone().unwrap_or_default(),
                message,
            })
        }
        _ => IncomingUpdate::Other {
            chat_id: upd.chat().map(|c| ChatId(c.id.0)),
            user_id: upd.user().map(|u| UserId(u.id.0 as i64)),
        },
    };
    Update { id, kind }
}

fn from_message(msg: &Message) -> IncomingUpdate {
    let chat_id = ChatId(msg.chat.id.0);
    let user = msg.from();
    let user_id = user.map(|u| UserId(u.id.0 as i64));
    let username = user.and_then(|u| u.username.clone());

    let Some(text) = msg.text() else {
        return IncomingUpdate::Other {
            chat_id: Some(chat_id),
            user_id,
        };
    };

    match Command::parse(text) {
        Some((name, args)) => IncomingUpdate::Command(Command {
            chat_id,
            user_id,
            username,
            name,
            args,
        }),
        None => IncomingUpdate::Text(TextMessage {
            chat_id,
            user_id,
            username,
            text: text.to_string(),
        }),
    }
}

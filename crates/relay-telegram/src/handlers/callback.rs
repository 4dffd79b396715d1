use relay_core::{domain::ChatId, messaging::types::CallbackQuery, store::WriteSet, Result};

use super::{trending, BotProcessor};

pub(super) async fn handle_callback(
    p: &BotProcessor,
    q: &CallbackQuery,
    writes: &mut WriteSet,
) -> Result<()> {
    match q.data.as_str() {
        trending::REFRESH_DATA => {
            p.messenger
                .answer_callback_query(&q.callback_id, Some("Refreshing…"))
                .await?;
            // Private chats share the user's id when the message is gone.
            let chat_id = q.chat_id.unwrap_or(ChatId(q.user_id.0));
            trending::send_trending(p, writes, chat_id, true).await
        }
        other => {
            tracing::debug!(data = other, "unknown callback data");
            p.messenger
                .answer_callback_query(&q.callback_id, Some("Unknown action"))
                .await?;
            Ok(())
        }
    }
}

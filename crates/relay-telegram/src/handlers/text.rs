use relay_core::{messaging::types::TextMessage, Result};

use super::BotProcessor;

const HINT: &str = "I only understand commands. Send /help to see them.";

pub(super) async fn handle_text(p: &BotProcessor, msg: &TextMessage) -> Result<()> {
    if msg.text.trim().is_empty() {
        return Ok(());
    }
    p.reply(msg.chat_id, HINT).await
}

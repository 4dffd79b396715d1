use relay_core::messaging::types::Command;
use relay_core::store::WriteSet;
use relay_core::Result;

use super::watchlist::{self, Change};
use super::{actor_of, trending, BotProcessor};
use crate::format::escape_html;

const HELP: &str = "🤖 <b>Relay Bot</b>\n\n\
<b>📋 Commands:</b>\n\
/start - Show this help message\n\
/help - Show this help message\n\
/status - Session, cursor and rate-limit status\n\
/trending - Trending coins (cached, with refresh)\n\
/watch &lt;symbol&gt; - Add a symbol to your watchlist\n\
/unwatch &lt;symbol&gt; - Remove a symbol from your watchlist\n\
/watchlist - Show your watchlist";

pub(super) async fn handle_command(
    p: &BotProcessor,
    cmd: &Command,
    writes: &mut WriteSet,
) -> Result<()> {
    let chat_id = cmd.chat_id;
    let actor = actor_of(cmd.user_id, chat_id);

    match cmd.name.as_str() {
        "start" | "help" => p.reply(chat_id, HELP).await,

        "status" => {
            let (session, known) = p
                .store
                .transact(move |tx| Ok((tx.session(actor)?, tx.session_count()?)))
                .await?;
            let cursor = p.cursors.load().await?;

            let mut lines: Vec<String> = vec!["📊 <b>Bot Status</b>\n".to_string()];
            lines.push(format!("Cursor: <code>{}</code>", cursor.0));
            lines.push(format!("Known actors: {known}"));
            match session {
                Some(s) => lines.push(format!(
                    "Your interactions: {} (since {})",
                    s.interaction_count,
                    s.first_seen.format("%Y-%m-%d")
                )),
                None => lines.push("Your interactions: first contact".to_string()),
            }

            lines.push("\n<b>Rate windows:</b>".to_string());
            for service in p.dispatcher.services() {
                let st = p.dispatcher.status(&service).await?;
                lines.push(format!(
                    "• <code>{}</code>: {}/{} in {}s, {} free, {} queued",
                    escape_html(&service),
                    st.window_count,
                    st.limit.max_requests,
                    st.limit.window.as_secs_f64(),
                    st.available,
                    st.queue_length
                ));
            }
            p.reply(chat_id, &lines.join("\n")).await
        }

        "trending" => trending::send_trending(p, writes, chat_id, false).await,

        "watch" | "unwatch" => {
            let Some(symbol) = watchlist::normalize_symbol(&cmd.args) else {
                let usage = format!("Usage: /{} &lt;symbol&gt; (e.g. <code>/{} btc</code>)", cmd.name, cmd.name);
                return p.reply(chat_id, &usage).await;
            };
            let shown = escape_html(&symbol);
            let (change, symbols) = if cmd.name == "watch" {
                watchlist::add(&p.store, writes, actor, symbol).await?
            } else {
                watchlist::remove(&p.store, writes, actor, symbol).await?
            };
            let msg = match change {
                Change::Added => format!("👀 Watching <b>{shown}</b> ({} total)", symbols.len()),
                Change::AlreadyPresent => format!("Already watching <b>{shown}</b>"),
                Change::Full => format!(
                    "Watchlist is full ({} symbols). /unwatch one first.",
                    symbols.len()
                ),
                Change::Removed => format!("🗑 Stopped watching <b>{shown}</b>"),
                Change::NotPresent => format!("<b>{shown}</b> is not on your watchlist"),
            };
            p.reply(chat_id, &msg).await
        }

        "watchlist" => {
            let symbols = watchlist::list(&p.store, actor).await?;
            let msg = if symbols.is_empty() {
                "Your watchlist is empty. Add one with <code>/watch btc</code>.".to_string()
            } else {
                let items: Vec<String> = symbols
                    .iter()
                    .map(|s| format!("• <b>{}</b>", escape_html(s)))
                    .collect();
                format!("👀 <b>Watchlist</b>\n\n{}", items.join("\n"))
            };
            p.reply(chat_id, &msg).await
        }

        _ => {
            let msg = format!(
                "Unknown command <code>/{}</code>. Send /help for the list.",
                escape_html(&cmd.name)
            );
            p.reply(chat_id, &msg).await
        }
    }
}

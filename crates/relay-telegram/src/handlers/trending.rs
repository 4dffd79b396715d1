use async_trait::async_trait;
use chrono::{DateTime, Utc};

use relay_core::{
    domain::{services, ChatId},
    messaging::types::{ChatAction, InlineKeyboard},
    report::FailureReport,
    store::{CacheEntry, WriteSet},
    Result,
};
use relay_market::{MarketDataClient, TrendingCoin};

use super::BotProcessor;
use crate::format::{clip_lines, escape_html};

const NAMESPACE: &str = "market";
const KEY: &str = "trending";
pub(super) const REFRESH_DATA: &str = "trending:refresh";

/// Source of trending coins; implemented by the market-data client.
#[async_trait]
pub trait TrendingFeed: Send + Sync {
    async fn trending(&self) -> Result<Vec<TrendingCoin>>;
}

#[async_trait]
impl TrendingFeed for MarketDataClient {
    async fn trending(&self) -> Result<Vec<TrendingCoin>> {
        MarketDataClient::trending(self).await
    }
}

/// Reply with the trending list, served from cache while it is fresh.
///
/// `force` skips the cache (refresh button). When the API fails the last
/// cached list is shown, marked stale. A fresh list is staged into `writes`.
pub(super) async fn send_trending(
    p: &BotProcessor,
    writes: &mut WriteSet,
    chat_id: ChatId,
    force: bool,
) -> Result<()> {
    let now = Utc::now();
    let cached: Option<CacheEntry<Vec<TrendingCoin>>> = p
        .store
        .transact(|tx| tx.cache_get(NAMESPACE, KEY))
        .await?;

    if !force {
        if let Some(entry) = &cached {
            if entry.is_fresh(now, p.cfg.market_cache_ttl) {
                let html = render(&entry.value, Some(entry.updated_at), false);
                return send_with_refresh(p, chat_id, &html).await;
            }
        }
    }

    // Best effort: failures are reported by the messenger.
    let _ = p
        .messenger
        .send_chat_action(chat_id, ChatAction::Typing)
        .await;

    let feed = p.feed.clone();
    match p
        .dispatcher
        .call(services::MARKET_DATA, || feed.trending())
        .await
    {
        Ok(coins) => {
            let to_cache = coins.clone();
            writes.push(move |tx| tx.cache_put(NAMESPACE, KEY, &to_cache, now));
            send_with_refresh(p, chat_id, &render(&coins, None, false)).await
        }
        Err(err) => {
            p.reporter
                .report(FailureReport::outbound(&err, chat_id, "market.trending", ""));
            match cached {
                Some(entry) => {
                    let html = render(&entry.value, Some(entry.updated_at), true);
                    send_with_refresh(p, chat_id, &html).await
                }
                None => {
                    p.reply(
                        chat_id,
                        "⚠️ Market data is unavailable right now. Try again in a minute.",
                    )
                    .await
                }
            }
        }
    }
}

async fn send_with_refresh(p: &BotProcessor, chat_id: ChatId, html: &str) -> Result<()> {
    let html = clip_lines(html, p.cfg.telegram_safe_limit.max(200));
    p.messenger
        .send_inline_keyboard(chat_id, &html, InlineKeyboard::single("🔄 Refresh", REFRESH_DATA))
        .await?;
    Ok(())
}

fn render(coins: &[TrendingCoin], cached_at: Option<DateTime<Utc>>, stale: bool) -> String {
    let mut lines = vec!["🔥 <b>Trending coins</b>".to_string(), String::new()];
    if coins.is_empty() {
        lines.push("Nothing is trending right now.".to_string());
    }
    for (i, c) in coins.iter().enumerate() {
        let rank = c
            .market_cap_rank
            .map(|r| format!(" · rank #{r}"))
            .unwrap_or_default();
        lines.push(format!(
            "{}. <b>{}</b> ({}){rank}",
            i + 1,
            escape_html(&c.name),
            escape_html(&c.symbol)
        ));
    }
    if let Some(at) = cached_at {
        let label = if stale { "⚠️ Stale data from" } else { "Cached at" };
        lines.push(String::new());
        lines.push(format!("<i>{label} {}</i>", at.format("%H:%M UTC")));
    }
    lines.join("\n")
}

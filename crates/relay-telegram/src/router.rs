use std::sync::Arc;

use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;

use relay_core::{
    config::Config, domain::services, engine::DispatchEngine, messaging::port::MessagingPort,
};
use relay_market::MarketDataClient;

use crate::handlers::BotProcessor;
use crate::{map_request_error, TelegramMessenger, TelegramUpdates};

/// Wire the engine to Telegram and ingest until Ctrl-C.
pub async fn run_polling(cfg: Arc<Config>) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());
    let engine = DispatchEngine::from_config(&cfg)?;

    // Startup check goes through the outbound budget like any other call.
    let me = engine
        .dispatcher()
        .call(services::PLATFORM_OUTBOUND, || async {
            bot.get_me().await.map_err(map_request_error)
        })
        .await;
    match me {
        Ok(me) => tracing::info!(username = %me.username(), "relay bot started"),
        Err(e) => tracing::warn!(error = %e, "get_me failed; polling anyway"),
    }
    tracing::info!(
        allowed_users = cfg.telegram_allowed_users.len(),
        services = ?engine.dispatcher().services(),
        "configuration loaded"
    );

    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(engine.messenger(raw_messenger));
    let market = MarketDataClient::new(cfg.market_data_url.clone(), cfg.market_request_timeout)?;
    let processor = Arc::new(BotProcessor::new(
        cfg.clone(),
        &engine,
        messenger,
        Arc::new(market),
    ));
    let source = Arc::new(TelegramUpdates::new(bot));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutdown requested"),
                Err(e) => tracing::error!(error = %e, "ctrl-c handler failed; shutting down"),
            }
            cancel.cancel();
        });
    }

    let summary = engine.run(source, processor, cancel).await?;
    tracing::info!(
        cursor = summary.cursor.0,
        polls = summary.polls,
        updates = summary.updates_handled,
        processor_failures = summary.processor_failures,
        poll_failures = summary.poll_failures,
        "relay bot stopped"
    );
    Ok(())
}

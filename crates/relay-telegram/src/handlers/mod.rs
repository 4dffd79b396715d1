//! Telegram update handlers.
//!
//! [`BotProcessor`] is the engine's `Processor`: it authorizes the actor, routes
//! the update to a command / callback / text handler, and replies through the
//! dispatched messenger. State changes are staged in a `WriteSet` and
//! committed by the ingestion loop with the update's session and cursor.
//! Reply failures are reported by the messenger itself, so they are not raised
//! again to the ingestion loop.

use std::sync::Arc;

use async_trait::async_trait;

use relay_core::{
    config::Config,
    cursor::CursorStore,
    dispatch::Dispatcher,
    domain::{services, ChatId, UserId},
    engine::DispatchEngine,
    errors::Error,
    ingest::Processor,
    messaging::{port::MessagingPort, types::IncomingUpdate, types::Update},
    report::Reporter,
    store::{StateStore, WriteSet},
    Result,
};

use crate::format::clip_lines;

mod callback;
mod commands;
mod text;
mod trending;
mod watchlist;

pub use trending::TrendingFeed;

const UNAUTHORIZED: &str = "Unauthorized. Contact the bot owner for access.";

pub struct BotProcessor {
    cfg: Arc<Config>,
    messenger: Arc<dyn MessagingPort>,
    dispatcher: Arc<Dispatcher>,
    store: StateStore,
    cursors: CursorStore,
    reporter: Reporter,
    feed: Arc<dyn TrendingFeed>,
}

impl BotProcessor {
    /// `messenger` should already be dispatched (see `DispatchEngine::messenger`).
    pub fn new(
        cfg: Arc<Config>,
        engine: &DispatchEngine,
        messenger: Arc<dyn MessagingPort>,
        feed: Arc<dyn TrendingFeed>,
    ) -> Self {
        Self {
            cfg,
            messenger,
            dispatcher: engine.dispatcher(),
            store: engine.store().clone(),
            cursors: engine.cursors().clone(),
            reporter: engine.reporter().clone(),
            feed,
        }
    }

    async fn reply(&self, chat_id: ChatId, html: &str) -> Result<()> {
        let html = clip_lines(html, self.cfg.telegram_safe_limit.max(200));
        self.messenger.send_html(chat_id, &html).await?;
        Ok(())
    }

    async fn handle(&self, update: &Update, writes: &mut WriteSet) -> Result<()> {
        match &update.kind {
            IncomingUpdate::Command(cmd) => {
                if !self.cfg.is_allowed(cmd.user_id) {
                    return self.reply(cmd.chat_id, UNAUTHORIZED).await;
                }
                commands::handle_command(self, cmd, writes).await
            }
            IncomingUpdate::Callback(q) => {
                if !self.cfg.is_allowed(Some(q.user_id)) {
                    self.messenger
                        .answer_callback_query(&q.callback_id, Some("Unauthorized"))
                        .await?;
                    return Ok(());
                }
                callback::handle_callback(self, q, writes).await
            }
            IncomingUpdate::Text(msg) => {
                if !self.cfg.is_allowed(msg.user_id) {
                    return self.reply(msg.chat_id, UNAUTHORIZED).await;
                }
                text::handle_text(self, msg).await
            }
            IncomingUpdate::Other { .. } => Ok(()),
        }
    }
}

#[async_trait]
impl Processor for BotProcessor {
    async fn process(&self, update: &Update) -> Result<WriteSet> {
        let mut writes = WriteSet::new();
        match self.handle(update, &mut writes).await {
            Ok(()) => Ok(writes),
            Err(Error::Dispatch(e)) if e.service == services::PLATFORM_OUTBOUND => {
                tracing::debug!(update_id = update.id.0, error = %e, "reply failed (already reported)");
                Ok(writes)
            }
            Err(e) => Err(e),
        }
    }
}

fn actor_of(user: Option<UserId>, chat: ChatId) -> relay_core::domain::ActorId {
    relay_core::domain::ActorId(user.map(|u| u.0).unwrap_or(chat.0))
}

#[cfg(test)]
pub(crate) mod testkit {
    //! Fakes shared by the handler tests.

    use super::*;
    use relay_core::{
        domain::{MessageId, MessageRef},
        errors::TransportFailure,
        ingest::{commit_update, IngestConfig},
        messaging::types::{
            CallbackQuery, ChatAction, Command, InlineKeyboard, MessagingCapabilities, TextMessage,
        },
        ratelimit::RateLimit,
        report::MemorySink,
    };
    use relay_market::TrendingCoin;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Sent {
        Html(i64, String),
        Keyboard(i64, String, Vec<String>),
        Action(i64),
        CallbackAnswer(String, Option<String>),
    }

    #[derive(Default)]
    pub struct FakeMessenger {
        pub sent: Mutex<Vec<Sent>>,
        pub fail_chat: Option<i64>,
    }

    impl FakeMessenger {
        pub fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }

        pub fn last_text(&self) -> String {
            self.sent()
                .into_iter()
                .rev()
                .find_map(|s| match s {
                    Sent::Html(_, t) | Sent::Keyboard(_, t, _) => Some(t),
                    _ => None,
                })
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl MessagingPort for FakeMessenger {
        fn capabilities(&self) -> MessagingCapabilities {
            MessagingCapabilities {
                supports_html: true,
                supports_inline_keyboards: true,
                max_message_len: 4096,
            }
        }

        async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
            if self.fail_chat == Some(chat_id.0) {
                return Err(TransportFailure::Status {
                    code: 403,
                    body: "Forbidden: bot was blocked by the user".to_string(),
                }
                .into());
            }
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Html(chat_id.0, html.to_string()));
            Ok(MessageRef {
                chat_id,
                message_id: MessageId(1),
            })
        }

        async fn send_chat_action(&self, chat_id: ChatId, _action: ChatAction) -> Result<()> {
            self.sent.lock().unwrap().push(Sent::Action(chat_id.0));
            Ok(())
        }

        async fn send_inline_keyboard(
            &self,
            chat_id: ChatId,
            text: &str,
            keyboard: InlineKeyboard,
        ) -> Result<MessageRef> {
            let data = keyboard
                .buttons
                .into_iter()
                .map(|b| b.callback_data)
                .collect();
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Keyboard(chat_id.0, text.to_string(), data));
            Ok(MessageRef {
                chat_id,
                message_id: MessageId(2),
            })
        }

        async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
            self.sent.lock().unwrap().push(Sent::CallbackAnswer(
                callback_id.to_string(),
                text.map(|t| t.to_string()),
            ));
            Ok(())
        }
    }

    /// Two coins per call (the second one changes with every call) unless `fail` is set.
    #[derive(Default)]
    pub struct FakeFeed {
        pub calls: Mutex<u32>,
        pub fail: Mutex<bool>,
    }

    #[async_trait]
    impl TrendingFeed for FakeFeed {
        async fn trending(&self) -> Result<Vec<TrendingCoin>> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if *self.fail.lock().unwrap() {
                return Err(TransportFailure::Status {
                    code: 502,
                    body: "bad gateway".to_string(),
                }
                .into());
            }
            Ok(vec![
                TrendingCoin {
                    id: "bitcoin".to_string(),
                    name: "Bitcoin".to_string(),
                    symbol: "BTC".to_string(),
                    market_cap_rank: Some(1),
                },
                TrendingCoin {
                    id: format!("coin-{n}"),
                    name: format!("Coin <{n}>"),
                    symbol: format!("C{n}"),
                    market_cap_rank: None,
                },
            ])
        }
    }

    pub struct Harness {
        pub processor: BotProcessor,
        pub engine: DispatchEngine,
        pub messenger: Arc<FakeMessenger>,
        pub feed: Arc<FakeFeed>,
        pub sink: Arc<MemorySink>,
    }

    impl Harness {
        /// Process `update` and commit its writes the way the ingestion loop does.
        pub async fn deliver(&self, update: &Update) {
            let writes = self.processor.process(update).await.unwrap();
            let cursors = self.engine.cursors().clone();
            let update = update.clone();
            self.engine
                .store()
                .transact(move |tx| commit_update(tx, &cursors, &update, writes, chrono::Utc::now()))
                .await
                .unwrap();
        }
    }

    pub fn harness(env: &[(&str, &str)], fail_chat: Option<i64>) -> Harness {
        let mut map: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.entry("TELEGRAM_BOT_TOKEN".to_string())
            .or_insert_with(|| "123:test".to_string());
        let cfg = Arc::new(Config::from_lookup(|k| map.get(k).cloned()).unwrap());

        let sink = Arc::new(MemorySink::default());
        let limiter = cfg
            .rate_limiter()
            .with_service(services::MARKET_DATA, RateLimit::new(100, Duration::from_secs(1)));
        let engine = DispatchEngine::new(
            limiter,
            StateStore::open_in_memory().unwrap(),
            Reporter::new().with_sink(sink.clone()),
            IngestConfig::default(),
        );

        let messenger = Arc::new(FakeMessenger {
            fail_chat,
            ..Default::default()
        });
        let feed = Arc::new(FakeFeed::default());
        let processor = BotProcessor::new(
            cfg,
            &engine,
            Arc::new(engine.messenger(messenger.clone())),
            feed.clone(),
        );
        Harness {
            processor,
            engine,
            messenger,
            feed,
            sink,
        }
    }

    pub fn command(id: i64, user: i64, text: &str) -> Update {
        let (name, args) = Command::parse(text).unwrap();
        Update {
            id: relay_core::domain::UpdateId(id),
            kind: IncomingUpdate::Command(Command {
                chat_id: ChatId(user),
                user_id: Some(UserId(user)),
                username: Some("tester".to_string()),
                name,
                args,
            }),
        }
    }

    pub fn text(id: i64, user: i64, body: &str) -> Update {
        Update {
            id: relay_core::domain::UpdateId(id),
            kind: IncomingUpdate::Text(TextMessage {
                chat_id: ChatId(user),
                user_id: Some(UserId(user)),
                username: None,
                text: body.to_string(),
            }),
        }
    }

    pub fn callback(id: i64, user: i64, data: &str) -> Update {
        Update {
            id: relay_core::domain::UpdateId(id),
            kind: IncomingUpdate::Callback(CallbackQuery {
                chat_id: Some(ChatId(user)),
                user_id: UserId(user),
                username: None,
                callback_id: format!("cb-{id}"),
                data: data.to_string(),
                message: None,
            }),
        }
    }
}

use std::sync::Arc;

use crate::{
    dispatch::Dispatcher,
    domain::{services, ChatId, MessageRef},
    errors::DispatchError,
    messaging::{
        port::MessagingPort,
        types::{ChatAction, InlineKeyboard, MessagingCapabilities},
    },
    report::{FailureReport, Reporter},
    Result,
};

/// MessagingPort decorator that routes every outbound call through the
/// dispatcher under its own service name.
///
/// Failed calls are reported (service, target, payload, kind) before the error
/// is returned, so no reply failure goes unrecorded.
pub struct DispatchedMessenger {
    inner: Arc<dyn MessagingPort>,
    dispatcher: Arc<Dispatcher>,
    reporter: Reporter,
    service: String,
}

impl DispatchedMessenger {
    pub fn new(
        inner: Arc<dyn MessagingPort>,
        dispatcher: Arc<Dispatcher>,
        reporter: Reporter,
    ) -> Self {
        Self {
            inner,
            dispatcher,
            reporter,
            service: services::PLATFORM_OUTBOUND.to_string(),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    fn reported(&self, err: DispatchError, target: ChatId, operation: &str, payload: &str) -> crate::Error {
        self.reporter
            .report(FailureReport::outbound(&err, target, operation, payload));
        err.into()
    }
}

#[async_trait::async_trait]
impl MessagingPort for DispatchedMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.dispatcher
            .call(&self.service, || self.inner.send_html(chat_id, html))
            .await
            .map_err(|e| self.reported(e, chat_id, "send_html", html))
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        self.dispatcher
            .call(&self.service, || self.inner.send_chat_action(chat_id, action))
            .await
            .map_err(|e| self.reported(e, chat_id, "send_chat_action", &format!("{action:?}")))
    }

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        let payload = {
            let buttons: Vec<&str> = keyboard
                .buttons
                .iter()
                .map(|b| b.callback_data.as_str())
                .collect();
            format!("{text}\n[buttons: {}]", buttons.join(", "))
        };
        self.dispatcher
            .call(&self.service, || {
                self.inner.send_inline_keyboard(chat_id, text, keyboard)
            })
            .await
            .map_err(|e| self.reported(e, chat_id, "send_inline_keyboard", &payload))
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.dispatcher
            .call(&self.service, || {
                self.inner.answer_callback_query(callback_id, text)
            })
            .await
            .map_err(|e| {
                // No chat is known for callback answers; the id is the target.
                self.reported(e, ChatId(0), "answer_callback_query", callback_id)
            })
    }
}

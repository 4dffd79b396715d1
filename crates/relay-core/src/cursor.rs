use crate::{
    domain::Cursor,
    store::{StateStore, StoreTx},
    Result,
};

/// Stream name used for the platform update cursor.
pub const UPDATES_STREAM: &str = "platform-updates";

/// Durable, monotonic cursor for one update stream.
///
/// The cursor is only ever written after the updates it covers were handed to
/// the processor; a crash in between re-delivers the update (at-least-once).
#[derive(Clone, Debug)]
pub struct CursorStore {
    store: StateStore,
    stream: String,
}

impl CursorStore {
    pub fn new(store: StateStore, stream: impl Into<String>) -> Self {
        Self {
            store,
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Last persisted cursor, or [`Cursor::ZERO`] on first run.
    pub async fn load(&self) -> Result<Cursor> {
        let stream = self.stream.clone();
        let cursor = self
            .store
            .transact(move |tx| tx.cursor(&stream))
            .await?;
        Ok(cursor.unwrap_or(Cursor::ZERO))
    }

    /// Persist `cursor` in its own transaction.
    pub async fn advance(&self, cursor: Cursor) -> Result<()> {
        let stream = self.stream.clone();
        self.store
            .transact(move |tx| tx.set_cursor(&stream, cursor))
            .await
    }

    /// Persist `cursor` as part of a caller's transaction.
    pub fn advance_in(&self, tx: &StoreTx<'_>, cursor: Cursor) -> Result<()> {
        tx.set_cursor(&self.stream, cursor)
    }
}

//! Per-actor watchlists, kept in the store's domain cache.
//!
//! A change is previewed against the committed list for the reply, then staged
//! as a write that re-applies it inside the update's commit transaction, where
//! the cache row and its transaction-log entry land together with the session
//! touch.

use chrono::Utc;
use serde_json::json;

use relay_core::{
    domain::ActorId,
    store::{NewLogEntry, StateStore, StoreTx, WriteSet},
    Result,
};

const NAMESPACE: &str = "watchlist";
const MAX_SYMBOLS: usize = 20;
const MAX_SYMBOL_LEN: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Change {
    Added,
    AlreadyPresent,
    Full,
    Removed,
    NotPresent,
}

impl Change {
    fn is_write(self) -> bool {
        matches!(self, Change::Added | Change::Removed)
    }
}

/// `$btc ` -> `BTC`. Rejects anything that is not a short alphanumeric ticker.
pub(super) fn normalize_symbol(raw: &str) -> Option<String> {
    let s = raw.trim().trim_start_matches('$').to_uppercase();
    let ok = !s.is_empty()
        && s.chars().count() <= MAX_SYMBOL_LEN
        && s.chars().all(|c| c.is_ascii_alphanumeric());
    ok.then_some(s)
}

fn load(tx: &StoreTx<'_>, actor: ActorId) -> Result<Vec<String>> {
    Ok(tx
        .cache_get::<Vec<String>>(NAMESPACE, &actor.0.to_string())?
        .map(|e| e.value)
        .unwrap_or_default())
}

fn edit(symbols: &mut Vec<String>, symbol: &str, adding: bool) -> Change {
    let pos = symbols.iter().position(|s| s == symbol);
    match (adding, pos) {
        (true, Some(_)) => Change::AlreadyPresent,
        (true, None) if symbols.len() >= MAX_SYMBOLS => Change::Full,
        (true, None) => {
            symbols.push(symbol.to_string());
            symbols.sort();
            Change::Added
        }
        (false, Some(i)) => {
            symbols.remove(i);
            Change::Removed
        }
        (false, None) => Change::NotPresent,
    }
}

pub(super) async fn list(store: &StateStore, actor: ActorId) -> Result<Vec<String>> {
    store.transact(move |tx| load(tx, actor)).await
}

pub(super) async fn add(
    store: &StateStore,
    writes: &mut WriteSet,
    actor: ActorId,
    symbol: String,
) -> Result<(Change, Vec<String>)> {
    stage(store, writes, actor, symbol, true).await
}

pub(super) async fn remove(
    store: &StateStore,
    writes: &mut WriteSet,
    actor: ActorId,
    symbol: String,
) -> Result<(Change, Vec<String>)> {
    stage(store, writes, actor, symbol, false).await
}

/// Returns the outcome as it will be once `writes` is committed.
async fn stage(
    store: &StateStore,
    writes: &mut WriteSet,
    actor: ActorId,
    symbol: String,
    adding: bool,
) -> Result<(Change, Vec<String>)> {
    let mut symbols = list(store, actor).await?;
    let change = edit(&mut symbols, &symbol, adding);
    if change.is_write() {
        writes.push(move |tx| write_change(tx, actor, &symbol, adding));
    }
    Ok((change, symbols))
}

fn write_change(tx: &StoreTx<'_>, actor: ActorId, symbol: &str, adding: bool) -> Result<()> {
    let mut symbols = load(tx, actor)?;
    if !edit(&mut symbols, symbol, adding).is_write() {
        return Ok(());
    }
    let now = Utc::now();
    tx.cache_put(NAMESPACE, &actor.0.to_string(), &symbols, now)?;
    let action = if adding { "watchlist.add" } else { "watchlist.remove" };
    tx.append_log(
        &NewLogEntry {
            actor: Some(actor),
            action: action.to_string(),
            detail: json!({ "symbol": symbol, "size": symbols.len() }),
        },
        now,
    )?;
    Ok(())
}

//! Per-service sliding-window admission control.
//!
//! Each service owns a [`RateWindow`] behind a fair async mutex. An admission
//! reserves its start instant under the lock and then sleeps until that instant
//! outside of it. Several reservations can share an instant when the budget
//! allows a burst, so each also takes a ticket from a `StartOrder` gate that
//! releases operations strictly in reservation order.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    future::Future,
    sync::{Arc, PoisonError},
    time::Duration,
};

use tokio::sync::{watch, Mutex};
use tokio::time::{sleep_until, Instant};

use crate::{errors::Error, Result};

/// Budget for one logical service: at most `max_requests` starts per `window`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

/// Instantaneous view of a service's window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateStatus {
    /// Slots that an admission arriving now could take without waiting.
    pub available: u32,
    /// Admissions reserved for a future instant and still waiting.
    pub queue_length: usize,
    /// Admissions that started within the trailing window.
    pub window_count: usize,
    pub limit: RateLimit,
}

/// Start instants of admitted operations, oldest first.
///
/// Entries may lie in the future: those are reservations still waiting for
/// their slot.
#[derive(Debug, Default)]
struct RateWindow {
    admitted: VecDeque<Instant>,
}

impl RateWindow {
    /// Drop entries that have left the trailing window `(now - window, now]`.
    fn purge(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.admitted.front() {
            if oldest + window <= now {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Reserve the next start instant.
    ///
    /// The slot is never earlier than the previous reservation (FIFO), and never
    /// earlier than `window` after the `max`-th most recent admission (so no
    /// trailing window ever holds more than `max` starts).
    fn reserve(&mut self, now: Instant, limit: RateLimit) -> Instant {
        self.purge(now, limit.window);

        let max = limit.max_requests.max(1) as usize;
        let mut start = now;
        if let Some(&last) = self.admitted.back() {
            start = start.max(last);
        }
        if self.admitted.len() >= max {
            let gate = self.admitted[self.admitted.len() - max] + limit.window;
            start = start.max(gate);
        }

        self.admitted.push_back(start);
        start
    }

    fn status(&mut self, now: Instant, limit: RateLimit) -> RateStatus {
        self.purge(now, limit.window);

        let queue_length = self.admitted.iter().filter(|t| **t > now).count();
        let window_count = self.admitted.len() - queue_length;
        let available = (limit.max_requests as usize).saturating_sub(self.admitted.len()) as u32;

        RateStatus {
            available,
            queue_length,
            window_count,
            limit,
        }
    }
}

#[derive(Debug, Default)]
struct TicketBook {
    issued: u64,
    /// Tickets done or abandoned ahead of the current turn.
    released: BTreeSet<u64>,
}

/// Start gate: ticket `n` may start once every ticket before it has started
/// or been dropped.
#[derive(Debug)]
struct StartOrder {
    book: std::sync::Mutex<TicketBook>,
    turn: watch::Sender<u64>,
}

impl Default for StartOrder {
    fn default() -> Self {
        Self {
            book: std::sync::Mutex::new(TicketBook::default()),
            turn: watch::channel(0).0,
        }
    }
}

impl StartOrder {
    fn issue(self: &Arc<Self>) -> StartTicket {
        let mut book = self.book.lock().unwrap_or_else(PoisonError::into_inner);
        let n = book.issued;
        book.issued += 1;
        StartTicket {
            order: self.clone(),
            n,
        }
    }

    fn release(&self, n: u64) {
        let mut book = self.book.lock().unwrap_or_else(PoisonError::into_inner);
        book.released.insert(n);
        self.turn.send_modify(|turn| {
            while book.released.remove(turn) {
                *turn += 1;
            }
        });
    }
}

/// Place in a service's start order. Dropping it, started or not, lets the
/// next ticket go.
#[derive(Debug)]
struct StartTicket {
    order: Arc<StartOrder>,
    n: u64,
}

impl StartTicket {
    async fn wait_turn(&self) {
        let mut turn = self.order.turn.subscribe();
        // The sender lives in `order`, which this ticket keeps alive.
        let _ = turn.wait_for(|t| *t >= self.n).await;
    }
}

impl Drop for StartTicket {
    fn drop(&mut self) {
        self.order.release(self.n);
    }
}

#[derive(Debug)]
struct ServiceWindow {
    limit: RateLimit,
    window: Mutex<RateWindow>,
    order: Arc<StartOrder>,
}

/// Sliding-window rate limiter keyed by service name.
///
/// The service table is fixed at construction; admitting on an unknown service
/// is a configuration error rather than a silent pass-through.
#[derive(Debug, Default)]
pub struct RateLimiter {
    services: HashMap<String, Arc<ServiceWindow>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, name: impl Into<String>, limit: RateLimit) -> Self {
        self.services.insert(
            name.into(),
            Arc::new(ServiceWindow {
                limit,
                window: Mutex::new(RateWindow::default()),
                order: Arc::new(StartOrder::default()),
            }),
        );
        self
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(|s| s.as_str())
    }

    fn service(&self, name: &str) -> Result<&Arc<ServiceWindow>> {
        self.services
            .get(name)
            .ok_or_else(|| Error::Config(format!("no rate limit configured for `{name}`")))
    }

    /// Wait for a slot on `service`, then run `op`.
    ///
    /// Never fails because of throttling. The slot counts as consumed whatever
    /// `op` returns. Operations start in the order their slots were reserved,
    /// including reservations that share an instant.
    pub async fn admit<T, F, Fut>(&self, service: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let svc = self.service(service)?;

        let (start, ticket) = {
            let mut window = svc.window.lock().await;
            let start = window.reserve(Instant::now(), svc.limit);
            (start, svc.order.issue())
        };

        let wait = start.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            tracing::debug!(service, wait_ms = wait.as_millis() as u64, "rate window full, waiting");
            sleep_until(start).await;
        }
        ticket.wait_turn().await;
        drop(ticket);

        op().await
    }

    pub async fn status(&self, service: &str) -> Result<RateStatus> {
        let svc = self.service(service)?;
        let mut window = svc.window.lock().await;
        Ok(window.status(Instant::now(), svc.limit))
    }
}

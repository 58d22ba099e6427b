//! Detail fill: enrich listing stubs with their room page.
//!
//! Workers draw random unfilled listings from the store. A transient failure
//! keeps the listing in the worker's [`FillCursor`] so the next call retries
//! that same listing, until `max_connection_attempts` is spent and it is
//! abandoned for the rest of the run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::retry::{attempt, retry};
use crate::error::{CrawlError, CrawlResult};
use crate::models::{Listing, ListingDetail, ListingKey};
use crate::session::CrawlSession;
use crate::store::FillScope;

#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    Filled(ListingKey),
    /// The marketplace no longer has the listing
    Deleted(ListingKey),
    NoMoreWork,
    /// The session was cancelled before the listing could be fetched; it is
    /// left unfilled and released
    Interrupted,
    TransientFailure {
        key: ListingKey,
        attempts: u32,
        /// The budget is spent and the listing is skipped for this run
        abandoned: bool,
    },
}

/// A worker's retry bookkeeping: the listing it owes another attempt, if any.
#[derive(Debug, Default)]
pub struct FillCursor {
    pending: Option<(Listing, u32)>,
}

impl FillCursor {
    pub fn is_clear(&self) -> bool {
        self.pending.is_none()
    }

    /// Failed attempts on the pending listing
    pub fn attempts(&self) -> u32 {
        self.pending.as_ref().map_or(0, |(_, attempts)| *attempts)
    }

    fn clear(&mut self) {
        self.pending = None;
    }
}

/// Room ids no other worker may pick up
#[derive(Default)]
struct Ledger {
    in_flight: HashSet<i64>,
    abandoned: HashSet<i64>,
}

impl Ledger {
    fn excluded(&self) -> Vec<i64> {
        self.in_flight.union(&self.abandoned).copied().collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillReport {
    pub filled: usize,
    pub deleted: usize,
    pub transient_failures: usize,
    pub abandoned: usize,
}

impl FillReport {
    fn record(&mut self, outcome: &FillOutcome) {
        match outcome {
            FillOutcome::Filled(_) => self.filled += 1,
            FillOutcome::Deleted(_) => self.deleted += 1,
            FillOutcome::NoMoreWork | FillOutcome::Interrupted => {}
            FillOutcome::TransientFailure { abandoned, .. } => {
                self.transient_failures += 1;
                if *abandoned {
                    self.abandoned += 1;
                }
            }
        }
    }

    fn merge(&mut self, other: FillReport) {
        self.filled += other.filled;
        self.deleted += other.deleted;
        self.transient_failures += other.transient_failures;
        self.abandoned += other.abandoned;
    }
}

pub struct FillQueue {
    session: Arc<CrawlSession>,
    scope: FillScope,
    ledger: Mutex<Ledger>,
    attempts_made: AtomicUsize,
}

impl FillQueue {
    pub fn new(session: Arc<CrawlSession>, scope: FillScope) -> Self {
        Self {
            session,
            scope,
            ledger: Mutex::new(Ledger::default()),
            attempts_made: AtomicUsize::new(0),
        }
    }

    /// Total detail fetches attempted so far
    pub fn attempts_made(&self) -> usize {
        self.attempts_made.load(Ordering::SeqCst)
    }

    /// Rooms currently claimed by a worker
    pub async fn rooms_in_flight(&self) -> usize {
        self.ledger.lock().await.in_flight.len()
    }

    /// One fill step: retry the cursor's listing, or pick a fresh one.
    pub async fn fill_next(&self, cursor: &mut FillCursor) -> CrawlResult<FillOutcome> {
        let session = &self.session;
        let budget = session.config.fill_max_room_count;
        if self.attempts_made.fetch_add(1, Ordering::SeqCst) >= budget {
            self.attempts_made.fetch_sub(1, Ordering::SeqCst);
            debug!(budget, "Fill budget spent");
            self.release(cursor).await;
            return Ok(FillOutcome::NoMoreWork);
        }

        let (listing, failures) = match cursor.pending.take() {
            Some(pending) => pending,
            None => match self.claim().await {
                Ok(Some(listing)) => (listing, 0),
                Ok(None) => {
                    self.attempts_made.fetch_sub(1, Ordering::SeqCst);
                    return Ok(FillOutcome::NoMoreWork);
                }
                Err(err) => {
                    self.attempts_made.fetch_sub(1, Ordering::SeqCst);
                    return Err(err);
                }
            },
        };
        let key = listing.key();

        let fetched = attempt(&session.proxies, session.config.request_timeout, |egress| async move {
            session.scraper.fetch_detail(key.room_id, &egress).await
        })
        .await;

        match fetched {
            Ok(detail) => {
                session.store.save_detail(key, &detail).await?;
                self.finish(key.room_id, false).await;
                debug!(room_id = key.room_id, survey_id = key.survey_id, "Listing filled");
                Ok(FillOutcome::Filled(key))
            }
            Err(CrawlError::NotFound(what)) => {
                let rows = session.store.mark_deleted(key.room_id).await?;
                self.finish(key.room_id, false).await;
                info!(room_id = key.room_id, rows, %what, "Listing gone, marked deleted");
                Ok(FillOutcome::Deleted(key))
            }
            Err(CrawlError::Cancelled) => {
                self.attempts_made.fetch_sub(1, Ordering::SeqCst);
                self.finish(key.room_id, false).await;
                debug!(room_id = key.room_id, "Fill cancelled, listing released");
                Ok(FillOutcome::Interrupted)
            }
            Err(err) if err.is_transient() => {
                let attempts = failures + 1;
                let abandoned = attempts >= session.config.max_connection_attempts;
                if abandoned {
                    warn!(room_id = key.room_id, attempts, error = %err, "Giving up on listing for this run");
                    self.finish(key.room_id, true).await;
                } else {
                    debug!(room_id = key.room_id, attempts, error = %err, "Detail fetch failed, will retry");
                    cursor.pending = Some((listing, attempts));
                }
                Ok(FillOutcome::TransientFailure {
                    key,
                    attempts,
                    abandoned,
                })
            }
            Err(err) => {
                self.finish(key.room_id, false).await;
                Err(err)
            }
        }
    }

    /// Pick a listing and mark its room in flight, under one ledger lock so
    /// two workers never claim the same room.
    async fn claim(&self) -> CrawlResult<Option<Listing>> {
        let mut ledger = self.ledger.lock().await;
        let exclude = ledger.excluded();
        let listing = self
            .session
            .store
            .next_listing_to_fill(self.scope, &exclude)
            .await?;
        if let Some(listing) = &listing {
            ledger.in_flight.insert(listing.room_id);
        }
        Ok(listing)
    }

    async fn finish(&self, room_id: i64, abandoned: bool) {
        let mut ledger = self.ledger.lock().await;
        ledger.in_flight.remove(&room_id);
        if abandoned {
            ledger.abandoned.insert(room_id);
        }
    }

    /// Run `fill_workers` workers over this queue until it is empty, the
    /// budget is spent, or the session is cancelled. Cancellation is a clean
    /// stop: every claimed room is released and the partial report returned.
    pub async fn drain(self: Arc<Self>) -> CrawlResult<FillReport> {
        let session = &self.session;
        let workers = session.config.fill_workers;
        let stop = session.cancel.child_token();
        info!(workers, scope = ?self.scope, source = session.scraper.source_name(), "Fill started");

        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let queue = self.clone();
            let stop = stop.clone();
            tasks.spawn(async move {
                let mut cursor = FillCursor::default();
                let mut report = FillReport::default();
                loop {
                    if stop.is_cancelled() {
                        queue.release(&mut cursor).await;
                        break;
                    }
                    match queue.fill_next(&mut cursor).await {
                        Ok(FillOutcome::NoMoreWork | FillOutcome::Interrupted) => break,
                        Ok(outcome) => report.record(&outcome),
                        Err(err) => {
                            error!(worker, error = %err, "Fill worker stopped");
                            queue.release(&mut cursor).await;
                            stop.cancel();
                            return Err(err);
                        }
                    }
                }
                Ok(report)
            });
        }

        let mut total = FillReport::default();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(report)) => total.merge(report),
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    first_error
                        .get_or_insert(CrawlError::fatal(format!("fill worker panicked: {join_err}")));
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        info!(
            filled = total.filled,
            deleted = total.deleted,
            abandoned = total.abandoned,
            attempts = self.attempts_made(),
            interrupted = session.is_cancelled(),
            "Fill finished"
        );
        Ok(total)
    }

    /// Hand a cursor's pending listing back without retrying it.
    async fn release(&self, cursor: &mut FillCursor) {
        if let Some((listing, _)) = cursor.pending.take() {
            self.finish(listing.room_id, false).await;
        }
        cursor.clear();
    }
}

/// Drain the queue with `fill_workers` concurrent workers.
pub async fn run_fill(session: Arc<CrawlSession>, scope: FillScope) -> CrawlResult<FillReport> {
    Arc::new(FillQueue::new(session, scope)).drain().await
}

/// Fetch a room's detail with the normal retry budget, without storing it.
pub async fn preview_detail(session: &CrawlSession, room_id: i64) -> CrawlResult<ListingDetail> {
    retry(
        session.retry_policy(),
        &session.proxies,
        &session.cancel,
        move |egress| async move { session.scraper.fetch_detail(room_id, &egress).await },
    )
    .await
}

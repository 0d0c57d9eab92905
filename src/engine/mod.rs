mod cascade;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;
#[cfg(test)]
mod tests;
mod validation;

pub use error::EngineError;
pub use queries::RoomFilter;
pub use store::{SharedRoomState, Store};

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;
use store::RoomGuards;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            // Flush what we have before the non-append command sees the WAL
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        discard_unflushed(wal);
    }
    result
}

/// Callers of a failed flush were told it failed; none of their bytes may stay in the log.
fn discard_unflushed(wal: &mut Wal) {
    if let Err(e) = wal.rollback() {
        tracing::error!(error = %e, path = %wal.path().display(), "WAL rollback failed");
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            if result.is_err() {
                discard_unflushed(wal);
            }
            let _ = response.send(result);
        }
    }
}

/// Send one event to the writer task and wait until it is on disk.
async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::WalError(e.to_string()))
}

// ── Transactions ─────────────────────────────────────────

enum GraphGuard {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Locks held by one mutation from validation through commit.
///
/// Lock order: the graph lock first, then room write locks in ascending id order.
pub(super) struct Transaction {
    _graph: GraphGuard,
    rooms: RoomGuards,
}

impl Transaction {
    pub(super) fn room(&self, id: &Ulid) -> Option<&RoomState> {
        self.rooms.get(id).map(|guard| &**guard)
    }
}

pub struct Engine {
    pub(super) store: Arc<Store>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Shared for room-scoped work and reads; exclusive for time-slot and user
    /// writes, whose cascades reach into every room.
    graph: Arc<RwLock<()>>,
    lock_timeout: Duration,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        Self::with_lock_timeout(wal_path, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(wal_path: PathBuf, lock_timeout: Duration) -> io::Result<Self> {
        let (events, intact_len) = Wal::recover(&wal_path)?;
        let wal = Wal::open_at(&wal_path, intact_len)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Store::new();
        // We're the sole owner of every room Arc here, so try_write_owned always
        // succeeds. Never block: this may run inside an async context.
        for event in &events {
            let mut guards = RoomGuards::new();
            for room_id in store.rooms_touched(event) {
                if let Some(rs) = store.get_room(&room_id) {
                    let guard = rs
                        .try_write_owned()
                        .map_err(|_| io::Error::other("replay: room lock contended"))?;
                    guards.insert(room_id, guard);
                }
            }
            store.apply(&mut guards, event);
        }
        if !events.is_empty() {
            tracing::info!(
                events = events.len(),
                rooms = store.room_count(),
                time_slots = store.time_slot_count(),
                users = store.user_count(),
                bookings = store.booking_count(),
                "replayed WAL"
            );
        }

        Ok(Self {
            store: Arc::new(store),
            wal_tx,
            graph: Arc::new(RwLock::new(())),
            lock_timeout,
        })
    }

    async fn bounded<F: Future>(&self, fut: F) -> Result<F::Output, EngineError> {
        tokio::time::timeout(self.lock_timeout, fut)
            .await
            .map_err(|_| EngineError::Timeout)
    }

    /// Start a room-scoped transaction.
    pub(super) async fn begin(&self) -> Result<Transaction, EngineError> {
        let graph = self.bounded(self.graph.clone().read_owned()).await?;
        Ok(Transaction {
            _graph: GraphGuard::Shared(graph),
            rooms: RoomGuards::new(),
        })
    }

    /// Start a transaction that excludes every other writer and reader.
    pub(super) async fn begin_exclusive(&self) -> Result<Transaction, EngineError> {
        let graph = self.bounded(self.graph.clone().write_owned()).await?;
        Ok(Transaction {
            _graph: GraphGuard::Exclusive(graph),
            rooms: RoomGuards::new(),
        })
    }

    pub(super) async fn read_graph(&self) -> Result<OwnedRwLockReadGuard<()>, EngineError> {
        self.bounded(self.graph.clone().read_owned()).await
    }

    /// Write-lock `ids` in ascending order. Call once per transaction with every
    /// room it needs; a room that is gone or retired is reported as not found.
    pub(super) async fn lock_rooms(&self, txn: &mut Transaction, ids: &[Ulid]) -> Result<(), EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        for id in ids {
            if txn.rooms.contains_key(&id) {
                continue;
            }
            let rs = self
                .store
                .get_room(&id)
                .ok_or_else(|| EngineError::not_found("room", id))?;
            let guard = self.bounded(rs.write_owned()).await?;
            if guard.retired {
                return Err(EngineError::not_found("room", id));
            }
            txn.rooms.insert(id, guard);
        }
        Ok(())
    }

    /// Make `event` durable, apply it, then release the transaction's locks.
    ///
    /// Runs on its own task so a caller dropped mid-commit cannot leave an event
    /// written to the WAL but missing from memory.
    pub(super) async fn commit(&self, txn: Transaction, event: Event) -> Result<(), EngineError> {
        let store = self.store.clone();
        let wal_tx = self.wal_tx.clone();
        tokio::spawn(async move {
            let mut txn = txn;
            wal_append(&wal_tx, &event).await?;
            store.apply(&mut txn.rooms, &event);
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Internal(format!("commit task failed: {e}")))?
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive so no commit lands between the snapshot and the file swap.
        let _graph = self.bounded(self.graph.clone().write_owned()).await?;

        let mut events: Vec<Event> = Vec::new();
        events.extend(self.store.time_slots().into_iter().map(Event::TimeSlotCreated));
        events.extend(self.store.users().into_iter().map(Event::UserCreated));
        for (_, rs) in self.store.rooms_sorted() {
            let guard = rs.read().await;
            events.push(Event::RoomCreated(guard.room.clone()));
            events.extend(guard.bookings.iter().cloned().map(Event::BookingCreated));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!(events = count, "compacted WAL");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

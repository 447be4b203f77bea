//! Live stream consumer.
//!
//! Two tasks cooperate over a bounded channel:
//!
//! ```text
//! ┌──────────────────────┐   WorkItem (bounded)   ┌──────────────────────────┐
//! │ reader               │ ─────────────────────▶ │ worker                   │
//! │ owns the connection, │                        │ decodes bodies, appends  │
//! │ envelope decode,     │ ◀── Flush reply ────── │ to day partitions, syncs │
//! │ sequence validation  │                        │ and commits checkpoints  │
//! └──────────────────────┘                        └──────────────────────────┘
//! ```
//!
//! The reader is the only place that looks at sequence numbers, in arrival
//! order. When the channel is full the reader waits; frames are never dropped.
//!
//! # Sequence rules
//!
//! - The first frame after a fresh start (no checkpoint), or after an
//!   `OutdatedCursor` notice, sets the baseline.
//! - A frame at or below the last accepted sequence is a replay and is skipped.
//! - A frame above `last + 1` is a gap: the worker flushes and commits, and the
//!   session is re-opened from the committed checkpoint. After
//!   `max_gap_reconnects` consecutive gaps at the same position the gap is
//!   accepted, since the upstream evidently no longer has those sequences.
//! - A frame whose envelope cannot be decoded is skipped without consuming a
//!   sequence number. Since it may have carried one, the next frame is also
//!   accepted at `last + 2`.
//!
//! # Checkpoints
//!
//! The worker commits after `checkpoint_every` events or `checkpoint_interval`,
//! whichever comes first, and always syncs the partition before committing.
//! A crash replays at most one batch.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use atarchive_core::{Frame, RawEvent, decode_frame};

use super::source::{FrameSource, FrameStream};
use crate::backoff::RetryPolicy;
use crate::checkpoint::{CheckpointStore, Position, firehose_key};
use crate::partition::DayPartitionWriter;
use crate::{Error, Result};

/// Configuration for the firehose consumer.
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    /// Relay base URL (`wss://...`). Also names the checkpoint key.
    pub relay_url: String,

    /// Capacity of the reader → worker queue.
    /// Default: 1024
    pub channel_capacity: usize,

    /// Longest time events may sit appended but uncommitted.
    /// Default: 1 second
    pub checkpoint_interval: Duration,

    /// Commit after this many events even if the interval has not elapsed.
    /// Default: 500
    pub checkpoint_every: usize,

    /// Backoff between failed connection attempts. Unbounded.
    /// Default: 1s doubling to 60s, with jitter
    pub reconnect_backoff: RetryPolicy,

    /// Consecutive gap reconnects at one position before the gap is accepted.
    /// Default: 5
    pub max_gap_reconnects: u32,

    /// Reconnect if no frame arrives for this long.
    /// Default: 60 seconds
    pub idle_timeout: Duration,

    /// Timeout for opening the subscription.
    /// Default: 30 seconds
    pub connect_timeout: Duration,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            relay_url: "wss://bsky.network".to_string(),
            channel_capacity: 1024,
            checkpoint_interval: Duration::from_secs(1),
            checkpoint_every: 500,
            reconnect_backoff: RetryPolicy::unbounded(
                Duration::from_secs(1),
                Duration::from_secs(60),
            ),
            max_gap_reconnects: 5,
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Lifecycle of the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Streaming,
    /// Shutdown requested; the worker is flushing and committing.
    Draining,
    Stopped,
}

/// Snapshot of consumer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub frames: u64,
    pub events_written: u64,
    pub decode_errors: u64,
    pub stale_skipped: u64,
    pub gaps: u64,
    pub reconnects: u64,
    pub error_frames: u64,
    pub last_committed: Option<u64>,
}

#[derive(Default)]
struct StatsInner {
    frames: AtomicU64,
    events_written: AtomicU64,
    decode_errors: AtomicU64,
    stale_skipped: AtomicU64,
    gaps: AtomicU64,
    reconnects: AtomicU64,
    error_frames: AtomicU64,
    /// Last committed sequence plus one; zero means nothing committed yet.
    last_committed: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> ConsumerStats {
        let committed = self.last_committed.load(Ordering::Relaxed);
        ConsumerStats {
            frames: self.frames.load(Ordering::Relaxed),
            events_written: self.events_written.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            stale_skipped: self.stale_skipped.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            error_frames: self.error_frames.load(Ordering::Relaxed),
            last_committed: committed.checked_sub(1),
        }
    }
}

/// What the reader hands to the worker.
enum WorkItem {
    /// An archived-kind event to decode and append.
    Event(RawEvent),
    /// A sequence that produces no output but still moves the checkpoint.
    Advance(u64),
    /// Sync and commit now, then report the committed sequence.
    Flush(oneshot::Sender<Result<Option<u64>>>),
}

/// Outcome of validating one sequence number.
#[derive(Debug, PartialEq, Eq)]
enum SequenceCheck {
    Accept,
    Stale,
    Gap { expected: u64 },
}

fn check_sequence(last: Option<u64>, seq: u64) -> SequenceCheck {
    match last {
        None => SequenceCheck::Accept,
        Some(last) if seq <= last => SequenceCheck::Stale,
        Some(last) if seq == last + 1 => SequenceCheck::Accept,
        Some(last) => SequenceCheck::Gap { expected: last + 1 },
    }
}

/// Why a session ended.
enum SessionEnd {
    Shutdown,
    Gap,
    Broken,
    /// The worker stopped; its join result carries the error.
    WorkerGone,
    Fatal(Error),
}

/// Firehose consumer writing day partitions and committing checkpoints.
pub struct FirehoseConsumer<S> {
    config: FirehoseConfig,
    source: S,
    checkpoints: Arc<dyn CheckpointStore>,
    writer: Arc<DayPartitionWriter>,
    stream_key: String,
    state: watch::Sender<ConsumerState>,
    stats: Arc<StatsInner>,
}

/// Reader-side sequence tracking.
struct Cursor {
    last: Option<u64>,
    /// Next frame sets a new baseline instead of being checked.
    rebase: bool,
    /// An undecodable frame arrived since the last accepted sequence, so the
    /// next frame may skip exactly one sequence number.
    skipped_frame: bool,
    gap_at: Option<u64>,
    gap_repeats: u32,
}

impl<S: FrameSource> FirehoseConsumer<S> {
    pub fn new(
        config: FirehoseConfig,
        source: S,
        checkpoints: Arc<dyn CheckpointStore>,
        writer: Arc<DayPartitionWriter>,
    ) -> Self {
        let stream_key = firehose_key(&config.relay_url);
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self {
            config,
            source,
            checkpoints,
            writer,
            stream_key,
            state,
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Checkpoint key this consumer commits under.
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.snapshot()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
        atarchive_core::metrics::set_gauge(
            "firehose_connected",
            if state == ConsumerState::Streaming { 1.0 } else { 0.0 },
        );
    }

    /// Consume until `shutdown` is cancelled or a durable write fails.
    ///
    /// On shutdown the worker drains the queue and commits before this returns.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<ConsumerStats> {
        let start = self.load_checkpoint()?;
        info!(
            "Firehose consumer starting: relay={}, checkpoint={:?}",
            self.config.relay_url, start
        );

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let worker = Worker {
            writer: self.writer.clone(),
            checkpoints: self.checkpoints.clone(),
            stream_key: self.stream_key.clone(),
            stats: self.stats.clone(),
            interval: self.config.checkpoint_interval,
            every: self.config.checkpoint_every.max(1),
            pending: start,
            committed: start,
            uncommitted: 0,
            last_commit: Instant::now(),
            last_date: None,
        };
        let mut worker_handle = tokio::spawn(worker.run(rx));

        let mut cursor = Cursor {
            last: start,
            rebase: false,
            skipped_frame: false,
            gap_at: None,
            gap_repeats: 0,
        };
        let mut attempt: u32 = 0;

        let end = loop {
            if shutdown.is_cancelled() {
                break SessionEnd::Shutdown;
            }

            self.set_state(ConsumerState::Connecting);
            let from = cursor.last.map(|last| last + 1);
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,
                result = self.source.connect(from) => result,
            };

            let end = match connected {
                Ok(stream) => {
                    info!("Subscribed from sequence {:?}", from);
                    self.set_state(ConsumerState::Streaming);
                    self.stream(stream, &tx, &mut cursor, &mut attempt, &shutdown)
                        .await
                }
                Err(e) => {
                    warn!("Connection failed: {}", e);
                    SessionEnd::Broken
                }
            };
            self.set_state(ConsumerState::Disconnected);

            match end {
                SessionEnd::Shutdown => break SessionEnd::Shutdown,
                SessionEnd::WorkerGone => break SessionEnd::WorkerGone,
                SessionEnd::Fatal(e) => break SessionEnd::Fatal(e),
                SessionEnd::Gap => {
                    // Resume from what is durably committed.
                    let (reply_tx, reply_rx) = oneshot::channel();
                    if tx.send(WorkItem::Flush(reply_tx)).await.is_err() {
                        break SessionEnd::WorkerGone;
                    }
                    match reply_rx.await {
                        Ok(Ok(_)) => {}
                        Ok(Err(_)) | Err(_) => break SessionEnd::WorkerGone,
                    }
                    match self.load_checkpoint() {
                        Ok(last) => cursor.last = last,
                        Err(e) => break SessionEnd::Fatal(e),
                    }
                }
                SessionEnd::Broken => {
                    let delay = self.config.reconnect_backoff.delay_for(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!("Reconnecting in {:?} (attempt {})", delay, attempt);
                    tokio::select! {
                        _ = shutdown.cancelled() => break SessionEnd::Shutdown,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }

            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("firehose_reconnects_total").increment(1);
        };

        let fatal = match end {
            SessionEnd::Shutdown => {
                info!("Shutdown requested, draining");
                self.set_state(ConsumerState::Draining);
                None
            }
            SessionEnd::Fatal(e) => Some(e),
            _ => None,
        };
        drop(tx);

        let joined = join_worker(&mut worker_handle).await;
        self.set_state(ConsumerState::Stopped);

        let result = match fatal {
            Some(e) => Err(e),
            None => joined,
        };

        let stats = self.stats.snapshot();
        match result {
            Ok(()) => {
                info!(
                    "Firehose consumer stopped: {} events written, last committed {:?}",
                    stats.events_written, stats.last_committed
                );
                Ok(stats)
            }
            Err(e) => {
                error!("Firehose consumer stopped on error: {}", e);
                Err(e)
            }
        }
    }

    fn load_checkpoint(&self) -> Result<Option<u64>> {
        Ok(self
            .checkpoints
            .load(&self.stream_key)?
            .and_then(|p| p.as_sequence()))
    }

    /// Read one session until it ends.
    async fn stream(
        &self,
        mut stream: FrameStream,
        tx: &mpsc::Sender<WorkItem>,
        cursor: &mut Cursor,
        attempt: &mut u32,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                next = tokio::time::timeout(self.config.idle_timeout, stream.next()) => next,
            };

            let bytes = match next {
                Err(_) => {
                    warn!("No frame for {:?}, treating session as stalled", self.config.idle_timeout);
                    return SessionEnd::Broken;
                }
                Ok(None) => {
                    info!("Subscription closed by upstream");
                    return SessionEnd::Broken;
                }
                Ok(Some(Err(e))) => {
                    warn!("Subscription error: {}", e);
                    return SessionEnd::Broken;
                }
                Ok(Some(Ok(bytes))) => bytes,
            };

            *attempt = 0;
            self.stats.frames.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("firehose_frames_total").increment(1);

            let frame = match decode_frame(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("firehose_decode_errors_total").increment(1);
                    warn!("Skipping undecodable frame after {:?}: {}", cursor.last, e);
                    cursor.skipped_frame = true;
                    continue;
                }
            };

            let seq = match &frame {
                Frame::Error { error, message } => {
                    self.stats.error_frames.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("firehose_error_frames_total").increment(1);
                    error!("Relay error frame: {} ({:?})", error, message);
                    return SessionEnd::Broken;
                }
                Frame::Info { name, message } => {
                    info!("Relay info: {} ({:?})", name, message);
                    if name == "OutdatedCursor" {
                        cursor.rebase = true;
                    }
                    continue;
                }
                Frame::Other { kind, sequence: None } => {
                    debug!("Ignoring unsequenced {} frame", kind);
                    continue;
                }
                Frame::Other {
                    sequence: Some(seq),
                    ..
                } => *seq,
                Frame::Event(raw) => raw.sequence,
            };

            let check = match check_sequence(cursor.last, seq) {
                _ if cursor.rebase => SequenceCheck::Accept,
                SequenceCheck::Gap { expected } if cursor.skipped_frame && seq == expected + 1 => {
                    warn!("Sequence {} taken by the undecodable frame", expected);
                    SequenceCheck::Accept
                }
                check => check,
            };

            match check {
                SequenceCheck::Stale => {
                    self.stats.stale_skipped.fetch_add(1, Ordering::Relaxed);
                    debug!("Skipping replayed sequence {} (last {:?})", seq, cursor.last);
                    continue;
                }
                SequenceCheck::Gap { expected } => {
                    self.stats.gaps.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("firehose_gaps_total").increment(1);

                    if cursor.gap_at == Some(expected) {
                        cursor.gap_repeats += 1;
                    } else {
                        cursor.gap_at = Some(expected);
                        cursor.gap_repeats = 1;
                    }

                    if cursor.gap_repeats <= self.config.max_gap_reconnects {
                        warn!(
                            "{} (attempt {} of {})",
                            Error::SequenceGap {
                                expected,
                                actual: seq
                            },
                            cursor.gap_repeats,
                            self.config.max_gap_reconnects
                        );
                        cursor.skipped_frame = false;
                        return SessionEnd::Gap;
                    }
                    error!(
                        "Accepting unrecoverable gap: sequences {}..{} are missing upstream",
                        expected, seq
                    );
                }
                SequenceCheck::Accept => {}
            }

            if cursor.rebase {
                info!("New sequence baseline {} (previous {:?})", seq, cursor.last);
                cursor.rebase = false;
            }
            if cursor.gap_at.is_some_and(|at| seq >= at) {
                cursor.gap_at = None;
                cursor.gap_repeats = 0;
            }
            cursor.last = Some(seq);
            cursor.skipped_frame = false;

            let item = match frame {
                Frame::Event(raw) => WorkItem::Event(raw),
                _ => WorkItem::Advance(seq),
            };
            metrics::gauge!("firehose_queue_depth")
                .set((tx.max_capacity() - tx.capacity()) as f64);
            if tx.send(item).await.is_err() {
                return SessionEnd::WorkerGone;
            }
        }
    }
}

async fn join_worker(handle: &mut JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(Error::Persistence(format!("worker task failed: {}", e))),
    }
}

/// Decode/append/commit side of the consumer.
struct Worker {
    writer: Arc<DayPartitionWriter>,
    checkpoints: Arc<dyn CheckpointStore>,
    stream_key: String,
    stats: Arc<StatsInner>,
    interval: Duration,
    every: usize,
    /// Highest sequence handled, committed or not.
    pending: Option<u64>,
    committed: Option<u64>,
    uncommitted: usize,
    last_commit: Instant,
    /// Partition of the previous event, used for events without a timestamp.
    last_date: Option<NaiveDate>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<WorkItem>) -> Result<()> {
        loop {
            let deadline = self.last_commit + self.interval;
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => self.commit()?,
                Ok(None) => {
                    self.commit()?;
                    self.writer.close()?;
                    return Ok(());
                }
                Ok(Some(item)) => {
                    self.handle(item)?;
                    if self.uncommitted >= self.every {
                        self.commit()?;
                    }
                }
            }
        }
    }

    fn handle(&mut self, item: WorkItem) -> Result<()> {
        match item {
            WorkItem::Event(raw) => {
                match raw.decode() {
                    Ok(event) => {
                        let date = match event.date().or(self.last_date) {
                            Some(date) => date,
                            None => {
                                warn!(
                                    "Event {} has no usable timestamp, using today's partition",
                                    event.sequence
                                );
                                Utc::now().date_naive()
                            }
                        };
                        self.writer.append(date, &event)?;
                        self.last_date = Some(date);
                        self.stats.events_written.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("firehose_events_total", "kind" => event.kind().as_str())
                            .increment(1);
                    }
                    Err(e) => {
                        self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("firehose_decode_errors_total").increment(1);
                        warn!("Skipping {} event {}: {}", raw.kind, raw.sequence, e);
                    }
                }
                self.advance(raw.sequence);
            }
            WorkItem::Advance(seq) => self.advance(seq),
            WorkItem::Flush(reply) => match self.commit() {
                Ok(()) => {
                    let _ = reply.send(Ok(self.committed));
                }
                Err(e) => {
                    let _ = reply.send(Err(Error::Persistence(e.to_string())));
                    return Err(e);
                }
            },
        }
        Ok(())
    }

    fn advance(&mut self, seq: u64) {
        self.pending = Some(self.pending.map_or(seq, |p| p.max(seq)));
        self.uncommitted += 1;
    }

    fn commit(&mut self) -> Result<()> {
        self.last_commit = Instant::now();
        self.uncommitted = 0;

        let Some(pending) = self.pending else {
            return Ok(());
        };
        if self.committed.is_some_and(|c| c >= pending) {
            return Ok(());
        }

        self.writer.sync()?;
        self.checkpoints
            .commit(&self.stream_key, &Position::Sequence(pending))?;
        self.committed = Some(pending);

        self.stats
            .last_committed
            .store(pending + 1, Ordering::Relaxed);
        atarchive_core::metrics::set_gauge("firehose_last_sequence", pending as f64);
        debug!("Committed sequence {}", pending);
        Ok(())
    }
}

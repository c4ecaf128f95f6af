//! Partition control loop shared by export and import.
//!
//! A [`PartitionWorker`] pairs a [`Source`] (produces batches and advances
//! the cursor) with a [`Sink`] (buffers, persists and uploads). Both keep
//! their durable position in the worker's [`CheckpointState`]; the worker
//! decides checkpoint boundaries through the [`CheckpointPolicy`] and hands
//! immutable snapshots to a [`CheckpointHook`].

pub mod export;
pub mod import;

use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointSnapshot, CheckpointState};
use crate::error::{BulkError, BulkResult};
use crate::policy::CheckpointPolicy;
use crate::telemetry::{self, Direction};

/// Result of one fetch.
#[derive(Debug)]
pub enum Fetch<B> {
    Batch(B),
    /// Nothing left to read for this partition.
    EndOfData,
}

/// Produces batches for one partition.
#[async_trait]
pub trait Source: Send {
    type Batch: Send;

    /// Prepare a fresh or restored state. Called once before the first fetch.
    async fn open(&mut self, _state: &mut CheckpointState) -> BulkResult<()> {
        Ok(())
    }

    /// Read the batch at the state's cursor and advance the cursor past it.
    async fn fetch(&mut self, state: &mut CheckpointState) -> BulkResult<Fetch<Self::Batch>>;
}

/// Consumes batches for one partition.
#[async_trait]
pub trait Sink: Send {
    type Batch: Send;

    /// Create or restore upload sessions and buffers.
    async fn open(&mut self, state: &mut CheckpointState) -> BulkResult<()>;

    /// Process one batch into the sink's buffers and update the counts.
    async fn consume(&mut self, batch: Self::Batch, state: &mut CheckpointState) -> BulkResult<()>;

    /// Bytes currently buffered, as seen by the checkpoint policy.
    fn buffered_bytes(&self) -> usize;

    /// Upload what the boundary allows. Called only at policy-approved
    /// boundaries.
    async fn flush(&mut self, state: &mut CheckpointState, end_of_data: bool) -> BulkResult<()>;

    /// Complete the upload sessions after the final flush.
    async fn finish(&mut self, state: &mut CheckpointState) -> BulkResult<()>;
}

/// Receives every checkpoint a worker takes.
#[async_trait]
pub trait CheckpointHook: Send + Sync {
    async fn checkpoint(&self, snapshot: &CheckpointSnapshot) -> BulkResult<()>;
}

/// Cooperative stop request shared by every partition of a job.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop was requested.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionExit {
    /// The source is exhausted and every session is completed.
    Completed(CheckpointSnapshot),
    /// A stop was observed between batches. Progress since the last
    /// checkpoint is discarded.
    Stopped,
}

/// Owned control loop of one partition. Not `Clone`: exactly one worker
/// drives a partition's buffers and sessions.
pub struct PartitionWorker<S, K> {
    source: S,
    sink: K,
    policy: CheckpointPolicy,
    direction: Direction,
    state: CheckpointState,
    last_checkpoint: Option<CheckpointSnapshot>,
    opened: bool,
}

impl<S, K> PartitionWorker<S, K>
where
    S: Source,
    K: Sink<Batch = S::Batch>,
{
    pub fn new(
        partition: impl Into<String>,
        source: S,
        sink: K,
        policy: CheckpointPolicy,
        direction: Direction,
    ) -> Self {
        Self {
            source,
            sink,
            policy,
            direction,
            state: CheckpointState::new(partition, 0),
            last_checkpoint: None,
            opened: false,
        }
    }

    pub fn partition(&self) -> &str {
        &self.state.partition
    }

    /// Live in-flight state. Not durable; see [`Self::checkpoint_info`].
    pub fn state(&self) -> &CheckpointState {
        &self.state
    }

    /// Last snapshot taken at a policy-approved boundary.
    pub fn checkpoint_info(&self) -> Option<&CheckpointSnapshot> {
        self.last_checkpoint.as_ref()
    }

    /// Start fresh (`None`) or resume from a persisted checkpoint.
    pub async fn open(&mut self, checkpoint: Option<&CheckpointSnapshot>) -> BulkResult<()> {
        if let Some(snapshot) = checkpoint {
            let restored = snapshot.state()?;
            if restored.partition != self.state.partition {
                return Err(BulkError::configuration(format!(
                    "checkpoint of partition '{}' cannot resume partition '{}'",
                    restored.partition, self.state.partition
                )));
            }
            tracing::info!(
                partition = %restored.partition,
                cursor = restored.cursor,
                resource_type = ?restored.resource_type,
                processed = restored.counts.processed,
                exhausted = restored.exhausted,
                "Resuming partition from checkpoint"
            );
            self.state = restored;
            self.last_checkpoint = Some(snapshot.clone());
        }
        if !self.state.exhausted {
            self.source.open(&mut self.state).await?;
            self.sink.open(&mut self.state).await?;
        }
        self.opened = true;
        Ok(())
    }

    /// Drive the partition until its source is exhausted or a stop is
    /// observed.
    pub async fn run<H>(&mut self, stop: &StopSignal, hook: &H) -> BulkResult<PartitionExit>
    where
        H: CheckpointHook + ?Sized,
    {
        if !self.opened {
            self.open(None).await?;
        }
        if self.state.exhausted {
            tracing::info!(partition = %self.state.partition, "Partition already completed");
            let snapshot = match &self.last_checkpoint {
                Some(snapshot) => snapshot.clone(),
                None => self.state.snapshot()?,
            };
            return Ok(PartitionExit::Completed(snapshot));
        }

        let started = Instant::now();
        let elapsed_before = self.state.timings.elapsed_ms;
        tracing::info!(
            partition = %self.state.partition,
            direction = self.direction.as_str(),
            "Partition started"
        );

        loop {
            if stop.is_stopped() {
                tracing::info!(
                    partition = %self.state.partition,
                    processed = self.state.counts.processed,
                    "Stop requested, leaving partition"
                );
                return Ok(PartitionExit::Stopped);
            }

            let read_started = Instant::now();
            let fetched = self.source.fetch(&mut self.state).await?;
            self.state.timings.read_ms += read_started.elapsed().as_millis() as u64;

            match fetched {
                Fetch::Batch(batch) => {
                    self.sink.consume(batch, &mut self.state).await?;
                    if self
                        .policy
                        .should_checkpoint_now(self.sink.buffered_bytes(), false)
                    {
                        self.sink.flush(&mut self.state, false).await?;
                        self.checkpoint(hook, started, elapsed_before).await?;
                    }
                }
                Fetch::EndOfData => {
                    self.sink.flush(&mut self.state, true).await?;
                    self.sink.finish(&mut self.state).await?;
                    self.state.exhausted = true;
                    let snapshot = self.checkpoint(hook, started, elapsed_before).await?;
                    tracing::info!(
                        partition = %self.state.partition,
                        processed = self.state.counts.processed,
                        imported = self.state.counts.imported,
                        failed = self.state.counts.failed,
                        skipped = self.state.counts.skipped,
                        parse_failures = self.state.counts.parse_failures,
                        summary = %self.state.resource_type_summary,
                        "Partition completed"
                    );
                    return Ok(PartitionExit::Completed(snapshot));
                }
            }
        }
    }

    async fn checkpoint<H>(
        &mut self,
        hook: &H,
        started: Instant,
        elapsed_before: u64,
    ) -> BulkResult<CheckpointSnapshot>
    where
        H: CheckpointHook + ?Sized,
    {
        self.state.timings.elapsed_ms = elapsed_before + started.elapsed().as_millis() as u64;
        let snapshot = self.state.snapshot()?;
        hook.checkpoint(&snapshot).await?;
        telemetry::record_checkpoint(self.direction);
        tracing::debug!(
            partition = %self.state.partition,
            cursor = self.state.cursor,
            processed = self.state.counts.processed,
            bytes = snapshot.as_bytes().len(),
            "Checkpoint taken"
        );
        self.last_checkpoint = Some(snapshot.clone());
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;
    use crate::buffer::ChunkBuffer;

    /// Emits `batches` byte strings, cursor = batches consumed.
    struct VecSource {
        batches: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl Source for VecSource {
        type Batch = Vec<u8>;

        async fn fetch(&mut self, state: &mut CheckpointState) -> BulkResult<Fetch<Vec<u8>>> {
            match self.batches.get(state.cursor as usize) {
                Some(batch) => {
                    state.cursor += 1;
                    Ok(Fetch::Batch(batch.clone()))
                }
                None => Ok(Fetch::EndOfData),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        buffer: ChunkBuffer,
        flushed: Vec<Vec<u8>>,
        finished: usize,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        type Batch = Vec<u8>;

        async fn open(&mut self, _state: &mut CheckpointState) -> BulkResult<()> {
            Ok(())
        }

        async fn consume(&mut self, batch: Vec<u8>, state: &mut CheckpointState) -> BulkResult<()> {
            self.buffer.append(&batch);
            state.counts.processed += 1;
            Ok(())
        }

        fn buffered_bytes(&self) -> usize {
            self.buffer.size()
        }

        async fn flush(&mut self, _state: &mut CheckpointState, _eod: bool) -> BulkResult<()> {
            if !self.buffer.is_empty() {
                self.flushed.push(self.buffer.drain().bytes.to_vec());
            }
            Ok(())
        }

        async fn finish(&mut self, _state: &mut CheckpointState) -> BulkResult<()> {
            self.finished += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Snapshots(Mutex<VecDeque<CheckpointSnapshot>>);

    #[async_trait]
    impl CheckpointHook for Snapshots {
        async fn checkpoint(&self, snapshot: &CheckpointSnapshot) -> BulkResult<()> {
            self.0.lock().push_back(snapshot.clone());
            Ok(())
        }
    }

    fn worker(batches: &[&str], threshold: usize) -> PartitionWorker<VecSource, RecordingSink> {
        PartitionWorker::new(
            "job-0",
            VecSource {
                batches: batches.iter().map(|b| b.as_bytes().to_vec()).collect(),
            },
            RecordingSink::default(),
            CheckpointPolicy::new(threshold),
            Direction::Export,
        )
    }

    #[tokio::test]
    async fn test_checkpoints_at_threshold_and_end() {
        let hook = Snapshots::default();
        let mut worker = worker(&["aaaa", "bb", "cccc"], 5);
        let exit = worker.run(&StopSignal::new(), &hook).await.unwrap();

        assert!(matches!(exit, PartitionExit::Completed(_)));
        // The trailing sub-threshold bytes go out only because the source ended.
        assert_eq!(
            worker.sink.flushed,
            vec![b"aaaabb".to_vec(), b"cccc".to_vec()]
        );
        assert_eq!(worker.sink.finished, 1);

        let snapshots = hook.0.lock();
        assert_eq!(snapshots.len(), 2);
        let first = snapshots.front().unwrap().state().unwrap();
        assert!(!first.exhausted);
        assert_eq!(first.cursor, 2);
        let last = snapshots.back().unwrap().state().unwrap();
        assert!(last.exhausted);
        assert_eq!(last.counts.processed, 3);
        assert_eq!(worker.checkpoint_info(), snapshots.back());
    }

    #[tokio::test]
    async fn test_stop_exits_without_checkpoint() {
        let hook = Snapshots::default();
        let stop = StopSignal::new();
        stop.request_stop();
        let mut worker = worker(&["a"], 5);
        let exit = worker.run(&stop, &hook).await.unwrap();
        assert_eq!(exit, PartitionExit::Stopped);
        assert!(hook.0.lock().is_empty());
        assert!(worker.checkpoint_info().is_none());
    }

    #[tokio::test]
    async fn test_resume_of_terminal_checkpoint_is_noop() {
        let hook = Snapshots::default();
        let mut first = worker(&["abc"], 5);
        let PartitionExit::Completed(terminal) =
            first.run(&StopSignal::new(), &hook).await.unwrap()
        else {
            panic!("expected completion");
        };

        let mut resumed = worker(&["abc"], 5);
        resumed.open(Some(&terminal)).await.unwrap();
        let exit = resumed.run(&StopSignal::new(), &hook).await.unwrap();
        assert_eq!(exit, PartitionExit::Completed(terminal));
        assert_eq!(resumed.sink.finished, 0);
        assert_eq!(hook.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_open_rejects_foreign_checkpoint() {
        let foreign = CheckpointState::new("other-0", 0).snapshot().unwrap();
        let mut worker = worker(&["a"], 5);
        let err = worker.open(Some(&foreign)).await.unwrap_err();
        assert!(matches!(err, BulkError::Configuration { .. }));
    }
}

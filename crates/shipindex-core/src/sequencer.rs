//! Block sequencer: feeds the state-history stream through the pipeline.
//!
//! For each message, in arrival order:
//!
//! ```text
//! Block        → classify against tracker → (implicit fork: rollback_to)
//!              → dispatch deltas → execute jobs → commit → notify
//! Fork         → rollback_to(n) → clear registry → notify reverts
//! Irreversible → prune_irreversible(n)
//! ```
//!
//! A block failing with a transient storage error is retried from scratch.
//! Any other failure stops the sequencer at that block; nothing of the block
//! is persisted, so restarting resumes at the same place.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::dispatcher::DeltaDispatcher;
use crate::error::IndexerError;
use crate::indexer::{IndexerConfig, IndexerState};
use crate::schema::SchemaRegistry;
use crate::tracker::{BlockInfo, BlockPosition, BlockTracker};
use crate::types::{BlockMessage, StreamMessage};
use crate::writer::{BlockStore, ChangeNotification, CommitSummary};

// ─── Streams ─────────────────────────────────────────────────────────────────

/// Source of state-history messages.
#[async_trait]
pub trait ShipStream: Send {
    /// The next message, or `None` when the stream has ended.
    async fn next(&mut self) -> Result<Option<StreamMessage>, IndexerError>;
}

/// Replays a fixed sequence of messages.
#[derive(Debug, Default)]
pub struct ReplayStream {
    messages: VecDeque<StreamMessage>,
}

impl ReplayStream {
    pub fn new(messages: impl IntoIterator<Item = StreamMessage>) -> Self {
        Self {
            messages: messages.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.messages.len()
    }
}

#[async_trait]
impl ShipStream for ReplayStream {
    async fn next(&mut self) -> Result<Option<StreamMessage>, IndexerError> {
        Ok(self.messages.pop_front())
    }
}

/// Receives messages from a reader task over a tokio channel.
pub struct ChannelStream {
    rx: mpsc::Receiver<StreamMessage>,
}

impl ChannelStream {
    pub fn new(rx: mpsc::Receiver<StreamMessage>) -> Self {
        Self { rx }
    }

    /// A bounded channel whose sender side is handed to the reader task.
    pub fn channel(capacity: usize) -> (mpsc::Sender<StreamMessage>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl ShipStream for ChannelStream {
    async fn next(&mut self) -> Result<Option<StreamMessage>, IndexerError> {
        Ok(self.rx.recv().await)
    }
}

// ─── Sequencer ───────────────────────────────────────────────────────────────

/// Counters exposed for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequencerStats {
    pub blocks_applied: u64,
    pub duplicates_skipped: u64,
    pub rollbacks: u64,
    pub retries: u64,
    pub notifications: u64,
}

/// Applies a state-history stream block by block.
pub struct BlockSequencer {
    config: IndexerConfig,
    store: Arc<dyn BlockStore>,
    dispatcher: DeltaDispatcher,
    registry: Arc<SchemaRegistry>,
    tracker: BlockTracker,
    notifier: broadcast::Sender<ChangeNotification>,
    state: IndexerState,
    irreversible: u64,
    stats: SequencerStats,
}

impl BlockSequencer {
    pub fn new(
        config: IndexerConfig,
        store: Arc<dyn BlockStore>,
        dispatcher: DeltaDispatcher,
        registry: Arc<SchemaRegistry>,
    ) -> Self {
        let (notifier, _) = broadcast::channel(config.notification_capacity.max(1));
        Self {
            tracker: BlockTracker::new(config.tracker_window),
            config,
            store,
            dispatcher,
            registry,
            notifier,
            state: IndexerState::Idle,
            irreversible: 0,
            stats: SequencerStats::default(),
        }
    }

    /// Receive change notifications of every commit and rollback from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.notifier.subscribe()
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    /// Last applied block.
    pub fn head(&self) -> Option<u64> {
        self.tracker.head()
    }

    pub fn irreversible(&self) -> u64 {
        self.irreversible
    }

    pub fn stats(&self) -> &SequencerStats {
        &self.stats
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Load the store's checkpoint and continue from it.
    ///
    /// Returns the next block that will be applied.
    pub async fn resume(&mut self) -> Result<u64, IndexerError> {
        let next = match self.store.load_checkpoint().await? {
            Some(cp) => {
                self.tracker.resume(cp.head_block, cp.head_id.as_deref());
                self.irreversible = cp.irreversible_block;
                tracing::info!(
                    reader = %cp.reader,
                    head = ?cp.head_block,
                    irreversible = cp.irreversible_block,
                    "Resuming from checkpoint"
                );
                cp.next_block().unwrap_or(self.config.start_block)
            }
            None => {
                tracing::info!(
                    reader = %self.config.reader,
                    start = self.config.start_block,
                    "No checkpoint, starting fresh"
                );
                self.config.start_block
            }
        };
        self.registry.clear();
        Ok(next)
    }

    /// Run until the stream ends, the stop block is applied or an error occurs.
    pub async fn run<S: ShipStream + ?Sized>(
        &mut self,
        stream: &mut S,
    ) -> Result<SequencerStats, IndexerError> {
        self.state = IndexerState::Syncing;
        tracing::info!(reader = %self.config.reader, head = ?self.head(), "Sequencer started");

        while !self.stop_reached() {
            let msg = match stream.next().await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => return Err(self.fail(e)),
            };
            if let Err(e) = self.handle(msg).await {
                return Err(self.fail(e));
            }
        }

        self.state = IndexerState::Stopped;
        tracing::info!(
            head = ?self.head(),
            applied = self.stats.blocks_applied,
            rollbacks = self.stats.rollbacks,
            "Sequencer stopped"
        );
        Ok(self.stats.clone())
    }

    /// Apply a single stream message.
    pub async fn handle(&mut self, msg: StreamMessage) -> Result<(), IndexerError> {
        match msg {
            StreamMessage::Block(block) => self.apply_block(block).await,
            StreamMessage::Fork { block_number } => self.rollback(block_number).await,
            StreamMessage::Irreversible { block_number } => self.advance_irreversible(block_number).await,
        }
    }

    fn stop_reached(&self) -> bool {
        matches!((self.config.stop_block, self.head()), (Some(stop), Some(head)) if head >= stop)
    }

    fn fail(&mut self, err: IndexerError) -> IndexerError {
        self.state = IndexerState::Error;
        tracing::error!(
            head = ?self.head(),
            protocol_violation = err.is_protocol_violation(),
            error = %err,
            "Sequencer halted"
        );
        err
    }

    async fn apply_block(&mut self, msg: BlockMessage) -> Result<(), IndexerError> {
        let block = &msg.block;
        if self.head().is_none() && block.number < self.config.start_block {
            tracing::trace!(block = block.number, "before start block, skipped");
            return Ok(());
        }

        match self.tracker.position(block) {
            BlockPosition::Extends => {}
            BlockPosition::Duplicate => {
                tracing::debug!(block = block.number, id = %block.id, "duplicate block skipped");
                self.stats.duplicates_skipped += 1;
                return Ok(());
            }
            BlockPosition::Fork => {
                tracing::warn!(
                    block = block.number,
                    id = %block.id,
                    head = ?self.head(),
                    "Fork detected from block id"
                );
                self.rollback(block.number).await?;
            }
            BlockPosition::Gap { expected } => {
                return Err(IndexerError::OutOfOrder {
                    expected,
                    got: block.number,
                });
            }
        }

        let mut attempt = 0u32;
        let summary = loop {
            match self.try_apply(&msg).await {
                Ok(summary) => break summary,
                Err(e) => {
                    // Anything a failed attempt registered may not match storage.
                    self.registry.clear();
                    if !e.is_transient() || attempt >= self.config.max_block_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    self.stats.retries += 1;
                    tracing::warn!(
                        block = msg.block.number,
                        attempt,
                        max = self.config.max_block_retries,
                        error = %e,
                        "Transient failure, retrying block"
                    );
                    let backoff = self.config.retry_backoff_ms.saturating_mul(u64::from(attempt));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        };

        self.tracker.push(BlockInfo::from(&msg.block));
        self.stats.blocks_applied += 1;
        tracing::debug!(
            block = msg.block.number,
            reversible = msg.block.is_reversible,
            deltas = msg.deltas.len(),
            traces = msg.traces.len(),
            undo = summary.undo_entries,
            "block committed"
        );
        self.publish(summary.notifications);
        Ok(())
    }

    async fn try_apply(&self, msg: &BlockMessage) -> Result<CommitSummary, IndexerError> {
        let queue = self.dispatcher.dispatch(&msg.block, &msg.deltas)?;
        let mut uow = self.store.begin(&msg.block).await?;
        match queue.execute(uow.as_mut()).await {
            Ok(_) => uow.commit().await,
            Err(e) => {
                if let Err(abort_err) = uow.abort().await {
                    tracing::warn!(block = msg.block.number, error = %abort_err, "abort failed");
                }
                Err(e)
            }
        }
    }

    async fn rollback(&mut self, block_number: u64) -> Result<(), IndexerError> {
        self.state = IndexerState::RollingBack;
        let report = self.store.rollback_to(block_number).await?;
        self.registry.clear();
        self.tracker.rewind_to(block_number);
        self.state = IndexerState::Syncing;

        if report.reverted > 0 {
            self.stats.rollbacks += 1;
            tracing::warn!(
                to = block_number,
                reverted = report.reverted,
                head = ?report.head_block,
                "Rolled back"
            );
        } else {
            tracing::debug!(to = block_number, "rollback found nothing to undo");
        }
        self.publish(report.notifications);
        Ok(())
    }

    async fn advance_irreversible(&mut self, block_number: u64) -> Result<(), IndexerError> {
        if block_number <= self.irreversible {
            return Ok(());
        }
        let pruned = self.store.prune_irreversible(block_number).await?;
        self.tracker.prune_below(block_number);
        self.irreversible = block_number;
        tracing::debug!(irreversible = block_number, pruned, "irreversible block advanced");
        Ok(())
    }

    fn publish(&mut self, notifications: Vec<ChangeNotification>) {
        for n in notifications {
            self.stats.notifications += 1;
            // No subscribers is fine.
            let _ = self.notifier.send(n);
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::dispatcher::DeltaHandler;
    use crate::job::{DeltaKind, JobTask, PriorityClass};
    use crate::types::{ShipBlock, TableDelta};
    use crate::writer::{ChangeOperation, Filter, RollbackReport, Row, UnitOfWork};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Records what the sequencer asks of the store.
    #[derive(Default)]
    struct Journal {
        events: Mutex<Vec<String>>,
        transient_failures: AtomicU32,
    }

    impl Journal {
        fn log(&self, e: String) {
            self.events.lock().unwrap().push(e);
        }
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    struct JournalStore(Arc<Journal>);

    struct JournalUnit {
        journal: Arc<Journal>,
        block: ShipBlock,
        writes: usize,
    }

    #[async_trait]
    impl UnitOfWork for JournalUnit {
        fn block(&self) -> &ShipBlock {
            &self.block
        }
        async fn insert(&mut self, _: &str, rows: Vec<Row>, _: &[&str]) -> Result<(), IndexerError> {
            self.writes += rows.len();
            Ok(())
        }
        async fn replace(&mut self, _: &str, _: Row, _: &[&str], _: &[&str]) -> Result<(), IndexerError> {
            self.writes += 1;
            Ok(())
        }
        async fn update(&mut self, _: &str, _: Row, _: &Filter, _: &[&str]) -> Result<u64, IndexerError> {
            Ok(0)
        }
        async fn delete(&mut self, _: &str, _: &Filter, _: &[&str]) -> Result<u64, IndexerError> {
            Ok(0)
        }
        async fn select(&mut self, _: &str, _: &Filter) -> Result<Vec<Row>, IndexerError> {
            Ok(vec![])
        }
        async fn commit(self: Box<Self>) -> Result<CommitSummary, IndexerError> {
            if self.journal.transient_failures.load(Ordering::SeqCst) > 0 {
                self.journal.transient_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(IndexerError::TransientStorage("database is locked".into()));
            }
            self.journal.log(format!("commit {}", self.block.number));
            let notifications = (0..self.writes)
                .map(|_| {
                    ChangeNotification::new(self.block.number, "items", ChangeOperation::Insert, Row::new())
                })
                .collect();
            Ok(CommitSummary {
                block_number: self.block.number,
                undo_entries: 0,
                notifications,
            })
        }
        async fn abort(self: Box<Self>) -> Result<(), IndexerError> {
            self.journal.log(format!("abort {}", self.block.number));
            Ok(())
        }
    }

    #[async_trait]
    impl BlockStore for JournalStore {
        async fn begin(&self, block: &ShipBlock) -> Result<Box<dyn UnitOfWork>, IndexerError> {
            Ok(Box::new(JournalUnit {
                journal: self.0.clone(),
                block: block.clone(),
                writes: 0,
            }))
        }
        async fn rollback_to(&self, block_number: u64) -> Result<RollbackReport, IndexerError> {
            self.0.log(format!("rollback {block_number}"));
            Ok(RollbackReport {
                target: block_number,
                reverted: 1,
                head_block: block_number.checked_sub(1),
                notifications: vec![],
            })
        }
        async fn prune_irreversible(&self, block_number: u64) -> Result<u64, IndexerError> {
            self.0.log(format!("prune {block_number}"));
            Ok(0)
        }
        async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, IndexerError> {
            Ok(None)
        }
    }

    struct Insert;

    #[async_trait]
    impl JobTask for Insert {
        async fn run(self: Box<Self>, uow: &mut dyn UnitOfWork) -> Result<(), IndexerError> {
            uow.insert("items", vec![Row::new()], &[]).await
        }
    }

    struct Items;

    impl DeltaHandler for Items {
        fn contract(&self) -> &str {
            "toy"
        }
        fn priorities(&self) -> Vec<(DeltaKind, PriorityClass)> {
            vec![(DeltaKind("toy/items"), PriorityClass(1))]
        }
        fn classify(&self, _delta: &TableDelta) -> Option<DeltaKind> {
            Some(DeltaKind("toy/items"))
        }
        fn build_job(
            &self,
            _kind: DeltaKind,
            _delta: &TableDelta,
            _block: &ShipBlock,
        ) -> Result<Box<dyn JobTask>, IndexerError> {
            Ok(Box::new(Insert))
        }
    }

    fn sequencer(journal: &Arc<Journal>, config: IndexerConfig) -> BlockSequencer {
        let dispatcher = DeltaDispatcher::new(vec![Arc::new(Items) as Arc<dyn DeltaHandler>]).unwrap();
        BlockSequencer::new(
            config,
            Arc::new(JournalStore(journal.clone())),
            dispatcher,
            Arc::new(SchemaRegistry::new()),
        )
    }

    fn block(number: u64, id: &str) -> StreamMessage {
        StreamMessage::Block(BlockMessage {
            block: ShipBlock::new(number, id, 0, true),
            deltas: vec![TableDelta {
                contract: "toy".into(),
                table: "items".into(),
                scope: "toy".into(),
                primary_key: number,
                payload: None,
                present: true,
            }],
            traces: vec![],
        })
    }

    #[tokio::test]
    async fn duplicates_skipped_and_forks_rolled_back() {
        let journal = Arc::new(Journal::default());
        let mut seq = sequencer(&journal, IndexerConfig::default());
        let mut rx = seq.subscribe();

        let mut stream = ReplayStream::new(vec![
            block(1, "a1"),
            block(2, "a2"),
            block(2, "a2"),
            block(2, "b2"),
            StreamMessage::Irreversible { block_number: 1 },
            StreamMessage::Irreversible { block_number: 1 },
        ]);
        let stats = seq.run(&mut stream).await.unwrap();

        assert_eq!(
            journal.events(),
            vec!["commit 1", "commit 2", "rollback 2", "commit 2", "prune 1"]
        );
        assert_eq!(stats.blocks_applied, 3);
        assert_eq!(stats.duplicates_skipped, 1);
        assert_eq!(seq.head(), Some(2));
        assert_eq!(seq.state(), IndexerState::Stopped);
        assert_eq!(rx.recv().await.unwrap().block_number, 1);
    }

    #[tokio::test]
    async fn gap_is_out_of_order() {
        let journal = Arc::new(Journal::default());
        let mut seq = sequencer(&journal, IndexerConfig::default());
        let mut stream = ReplayStream::new(vec![block(1, "a1"), block(3, "a3")]);

        let err = seq.run(&mut stream).await.unwrap_err();
        assert!(matches!(err, IndexerError::OutOfOrder { expected: 2, got: 3 }));
        assert_eq!(seq.state(), IndexerState::Error);
    }

    #[tokio::test]
    async fn transient_commit_failure_is_retried() {
        let journal = Arc::new(Journal::default());
        journal.transient_failures.store(2, Ordering::SeqCst);
        let config = IndexerConfig {
            retry_backoff_ms: 1,
            ..Default::default()
        };
        let mut seq = sequencer(&journal, config);
        let stats = seq.run(&mut ReplayStream::new(vec![block(1, "a1")])).await.unwrap();

        assert_eq!(stats.retries, 2);
        assert_eq!(journal.events(), vec!["commit 1"]);
    }

    #[tokio::test]
    async fn retries_exhausted_surface_error() {
        let journal = Arc::new(Journal::default());
        journal.transient_failures.store(5, Ordering::SeqCst);
        let config = IndexerConfig {
            max_block_retries: 1,
            retry_backoff_ms: 1,
            ..Default::default()
        };
        let mut seq = sequencer(&journal, config);
        let err = seq.run(&mut ReplayStream::new(vec![block(1, "a1")])).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(seq.head(), None);
    }

    #[tokio::test]
    async fn start_and_stop_blocks() {
        let journal = Arc::new(Journal::default());
        let config = IndexerConfig {
            start_block: 2,
            stop_block: Some(3),
            ..Default::default()
        };
        let mut seq = sequencer(&journal, config);
        let mut stream = ReplayStream::new(vec![
            block(1, "a1"),
            block(2, "a2"),
            block(3, "a3"),
            block(4, "a4"),
        ]);
        seq.run(&mut stream).await.unwrap();

        assert_eq!(journal.events(), vec!["commit 2", "commit 3"]);
        assert_eq!(stream.remaining(), 1);
    }

    #[tokio::test]
    async fn channel_stream_ends_when_sender_dropped() {
        let journal = Arc::new(Journal::default());
        let mut seq = sequencer(&journal, IndexerConfig::default());
        let (tx, mut stream) = ChannelStream::channel(4);

        tokio::spawn(async move {
            for (n, id) in [(1, "a1"), (2, "a2")] {
                tx.send(block(n, id)).await.unwrap();
            }
        });
        let stats = seq.run(&mut stream).await.unwrap();
        assert_eq!(stats.blocks_applied, 2);
    }
}

//! Delta handler trait + dispatcher.
//!
//! A [`DeltaHandler`] owns the tables of one contract. The dispatcher asks the
//! handler registered for a delta's contract to classify it, looks the kind
//! up in the [`PriorityTable`] and schedules the job the handler builds.
//!
//! Building a job never decodes the payload. Decoding happens when the job
//! runs, so a schema registered by an earlier job of the same block is seen.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::IndexerError;
use crate::job::{DeltaKind, JobQueue, JobTask, PriorityClass, PriorityTable};
use crate::types::{ShipBlock, TableDelta};

/// Trait for contract modules that turn table deltas into jobs.
pub trait DeltaHandler: Send + Sync {
    /// Contract account whose deltas this handler receives.
    fn contract(&self) -> &str;

    /// Every kind this handler can produce, with its priority class.
    fn priorities(&self) -> Vec<(DeltaKind, PriorityClass)>;

    /// Determine the entity family of `delta`, or `None` to ignore it.
    fn classify(&self, delta: &TableDelta) -> Option<DeltaKind>;

    /// Build the job that applies `delta`.
    fn build_job(
        &self,
        kind: DeltaKind,
        delta: &TableDelta,
        block: &ShipBlock,
    ) -> Result<Box<dyn JobTask>, IndexerError>;
}

/// Where a classified delta goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaRoute {
    pub kind: DeltaKind,
    pub priority: PriorityClass,
    handler: usize,
}

/// Routes raw deltas to handlers and builds the job queue of a block.
pub struct DeltaDispatcher {
    handlers: Vec<Arc<dyn DeltaHandler>>,
    by_contract: HashMap<String, usize>,
    priorities: PriorityTable,
}

impl DeltaDispatcher {
    /// Build the dispatcher and its priority table.
    ///
    /// Fails if two handlers claim the same contract or if a kind is declared
    /// with conflicting priority classes.
    pub fn new(handlers: Vec<Arc<dyn DeltaHandler>>) -> Result<Self, IndexerError> {
        let mut by_contract = HashMap::new();
        let mut priorities = PriorityTable::new();

        for (index, handler) in handlers.iter().enumerate() {
            if by_contract.insert(handler.contract().to_string(), index).is_some() {
                return Err(IndexerError::Config(format!(
                    "more than one handler registered for contract '{}'",
                    handler.contract()
                )));
            }
            for (kind, class) in handler.priorities() {
                priorities.register(kind, class)?;
            }
        }

        tracing::debug!(
            handlers = handlers.len(),
            kinds = priorities.len(),
            "delta dispatcher ready"
        );

        Ok(Self {
            handlers,
            by_contract,
            priorities,
        })
    }

    pub fn priorities(&self) -> &PriorityTable {
        &self.priorities
    }

    /// Classify a single delta. Unknown deltas are logged and yield `None`.
    pub fn classify(&self, delta: &TableDelta) -> Option<DeltaRoute> {
        let Some(&handler) = self.by_contract.get(&delta.contract) else {
            tracing::trace!(contract = %delta.contract, table = %delta.table, "delta for unwatched contract");
            return None;
        };
        let Some(kind) = self.handlers[handler].classify(delta) else {
            tracing::debug!(
                contract = %delta.contract,
                table = %delta.table,
                scope = %delta.scope,
                "unknown delta ignored"
            );
            return None;
        };
        match self.priorities.get(kind) {
            Some(priority) => Some(DeltaRoute {
                kind,
                priority,
                handler,
            }),
            None => {
                tracing::warn!(kind = %kind, "delta kind has no priority class, ignored");
                None
            }
        }
    }

    /// Build the job queue for the deltas of `block`, in arrival order.
    pub fn dispatch(&self, block: &ShipBlock, deltas: &[TableDelta]) -> Result<JobQueue, IndexerError> {
        let mut queue = JobQueue::new();
        let mut ignored = 0usize;

        for delta in deltas {
            let Some(route) = self.classify(delta) else {
                ignored += 1;
                continue;
            };
            let task = self.handlers[route.handler].build_job(route.kind, delta, block)?;
            queue.push(route.priority, route.kind.as_str(), task);
        }

        tracing::debug!(
            block = block.number,
            deltas = deltas.len(),
            jobs = queue.len(),
            ignored,
            "block dispatched"
        );
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::NullUnit;
    use crate::writer::UnitOfWork;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Noted(Arc<Mutex<Vec<String>>>, String);

    #[async_trait]
    impl JobTask for Noted {
        async fn run(self: Box<Self>, _uow: &mut dyn UnitOfWork) -> Result<(), IndexerError> {
            self.0.lock().unwrap().push(self.1);
            Ok(())
        }
    }

    struct Toy(Arc<Mutex<Vec<String>>>);

    impl DeltaHandler for Toy {
        fn contract(&self) -> &str {
            "toy"
        }
        fn priorities(&self) -> Vec<(DeltaKind, PriorityClass)> {
            vec![
                (DeltaKind("toy/defs"), PriorityClass(1)),
                (DeltaKind("toy/items"), PriorityClass(2)),
            ]
        }
        fn classify(&self, delta: &TableDelta) -> Option<DeltaKind> {
            match delta.table.as_str() {
                "defs" => Some(DeltaKind("toy/defs")),
                "items" => Some(DeltaKind("toy/items")),
                _ => None,
            }
        }
        fn build_job(
            &self,
            _kind: DeltaKind,
            delta: &TableDelta,
            _block: &ShipBlock,
        ) -> Result<Box<dyn JobTask>, IndexerError> {
            Ok(Box::new(Noted(
                self.0.clone(),
                format!("{}#{}", delta.table, delta.primary_key),
            )))
        }
    }

    fn delta(contract: &str, table: &str, pk: u64) -> TableDelta {
        TableDelta {
            contract: contract.into(),
            table: table.into(),
            scope: contract.into(),
            primary_key: pk,
            payload: None,
            present: true,
        }
    }

    #[tokio::test]
    async fn dispatch_orders_by_priority_and_drops_unknown() {
        let log = Arc::new(Mutex::new(vec![]));
        let dispatcher = DeltaDispatcher::new(vec![Arc::new(Toy(log.clone())) as Arc<dyn DeltaHandler>]).unwrap();
        let block = ShipBlock::new(3, "03", 0, false);

        let deltas = vec![
            delta("toy", "items", 1),
            delta("toy", "unknown", 2),
            delta("other", "items", 3),
            delta("toy", "defs", 4),
            delta("toy", "items", 5),
        ];
        let queue = dispatcher.dispatch(&block, &deltas).unwrap();
        assert_eq!(queue.len(), 3);

        let mut uow = NullUnit(block);
        queue.execute(&mut uow).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["defs#4", "items#1", "items#5"]);
    }

    #[test]
    fn duplicate_contract_rejected() {
        let log = Arc::new(Mutex::new(vec![]));
        let result = DeltaDispatcher::new(vec![
            Arc::new(Toy(log.clone())) as Arc<dyn DeltaHandler>,
            Arc::new(Toy(log)),
        ]);
        assert!(matches!(result, Err(IndexerError::Config(_))));
    }
}

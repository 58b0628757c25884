//! Priority job scheduler.
//!
//! Every delta of a block becomes one [`Job`]. Jobs carry a priority class
//! taken from a static [`PriorityTable`] and a sequence number assigned in
//! arrival order; [`JobQueue::execute`] runs them by ascending
//! `(priority, sequence)`, one at a time, against the block's unit of work.
//!
//! Lower classes run first. Control tables (configs, schemas) therefore get
//! the lowest classes so that rows referencing them see the new definition.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::writer::UnitOfWork;

/// Ordering class of a job. Lower runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriorityClass(pub u16);

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Logical entity family of a delta, qualified by contract module
/// (e.g. `"atomicassets/templates"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeltaKind(pub &'static str);

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Static mapping from delta kind to priority class, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct PriorityTable {
    classes: HashMap<DeltaKind, PriorityClass>,
}

impl PriorityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kind`. Registering the same kind twice with a different class
    /// is a configuration error.
    pub fn register(&mut self, kind: DeltaKind, class: PriorityClass) -> Result<(), IndexerError> {
        match self.classes.insert(kind, class) {
            Some(existing) if existing != class => Err(IndexerError::Config(format!(
                "delta kind '{kind}' registered with conflicting priorities {existing} and {class}"
            ))),
            _ => Ok(()),
        }
    }

    pub fn get(&self, kind: DeltaKind) -> Option<PriorityClass> {
        self.classes.get(&kind).copied()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// The action of a job. Runs exactly once, against the block's unit of work.
#[async_trait]
pub trait JobTask: Send {
    async fn run(self: Box<Self>, uow: &mut dyn UnitOfWork) -> Result<(), IndexerError>;
}

/// A scheduled task.
pub struct Job {
    pub priority: PriorityClass,
    pub sequence: u64,
    /// Used in logs and errors (e.g. `"atomicassets/assets"`).
    pub label: String,
    task: Box<dyn JobTask>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("priority", &self.priority)
            .field("sequence", &self.sequence)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// The jobs of one block.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Vec<Job>,
    next_sequence: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task`. Returns the sequence number it was assigned.
    pub fn push(
        &mut self,
        priority: PriorityClass,
        label: impl Into<String>,
        task: Box<dyn JobTask>,
    ) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.jobs.push(Job {
            priority,
            sequence,
            label: label.into(),
            task,
        });
        sequence
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Labels in execution order.
    pub fn planned(&self) -> Vec<(PriorityClass, u64, String)> {
        let mut plan: Vec<_> = self
            .jobs
            .iter()
            .map(|j| (j.priority, j.sequence, j.label.clone()))
            .collect();
        plan.sort_by_key(|(p, s, _)| (*p, *s));
        plan
    }

    /// Run every job by ascending `(priority, sequence)`, awaiting each before
    /// starting the next. The first failure stops the block.
    pub async fn execute(self, uow: &mut dyn UnitOfWork) -> Result<usize, IndexerError> {
        let block_number = uow.block().number;
        let mut jobs = self.jobs;
        jobs.sort_by_key(|j| (j.priority, j.sequence));

        let total = jobs.len();
        for job in jobs {
            tracing::trace!(
                block = block_number,
                job = %job.label,
                priority = %job.priority,
                sequence = job.sequence,
                "running job"
            );
            job.task.run(uow).await.map_err(|source| IndexerError::JobFailed {
                job: job.label.clone(),
                block_number,
                source: Box::new(source),
            })?;
        }
        Ok(total)
    }
}

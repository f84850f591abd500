use crate::jobs::{Job, JobId, JobPriority};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use tokio::sync::RwLock;

/// Snapshot of the fields assignment matching needs, so the dispatch sweep
/// can filter without a store read per entry.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub priority: JobPriority,
    pub seq: u64,
    pub requires_gpu: bool,
    pub gpu_memory_required: u64,
    // Distinguishes the live heap entry from stale ones after a re-push.
    gen: u64,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id && self.gen == other.gen
    }
}

impl Eq for QueuedJob {}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then older admission first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<QueuedJob>,
    // Live membership by latest push generation; heap entries are removed
    // lazily on pop.
    live: HashMap<JobId, u64>,
    next_gen: u64,
}

/// Priority-ordered queue of QUEUED jobs. FIFO within a priority class by
/// admission order; a requeued job keeps its original order key so promotion
/// never costs it its place.
pub struct JobQueue {
    inner: RwLock<Inner>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                heap: BinaryHeap::new(),
                live: HashMap::new(),
                next_gen: 0,
            }),
        }
    }

    pub async fn push(&self, job: &Job) {
        let mut inner = self.inner.write().await;
        inner.next_gen += 1;
        let gen = inner.next_gen;
        inner.live.insert(job.id, gen);
        inner.heap.push(QueuedJob {
            job_id: job.id,
            priority: job.priority,
            seq: job.seq,
            requires_gpu: job.requires_gpu,
            gpu_memory_required: job.gpu_memory_required,
            gen,
        });
    }

    /// Put a popped entry back, e.g. when the assignment commit could not
    /// reach the store. The entry keeps its order key.
    pub async fn restore(&self, entry: QueuedJob) {
        let mut inner = self.inner.write().await;
        inner.next_gen += 1;
        let gen = inner.next_gen;
        inner.live.insert(entry.job_id, gen);
        inner.heap.push(QueuedJob { gen, ..entry });
    }

    pub async fn remove(&self, job_id: JobId) -> bool {
        self.inner.write().await.live.remove(&job_id).is_some()
    }

    pub async fn contains(&self, job_id: JobId) -> bool {
        self.inner.read().await.live.contains_key(&job_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.live.is_empty()
    }

    /// Pop the best-ordered job accepted by `matches`. Jobs the predicate
    /// rejects keep their position: matching is a filter over the queue, not
    /// a head-of-line constraint, so an unplaceable head never blocks a
    /// placeable job behind it.
    pub async fn pop_best_match<F>(&self, matches: F) -> Option<QueuedJob>
    where
        F: Fn(&QueuedJob) -> bool,
    {
        let mut inner = self.inner.write().await;
        let mut skipped = Vec::new();
        let mut found = None;

        while let Some(entry) = inner.heap.pop() {
            // Drop stale heap entries (removed or re-pushed jobs).
            match inner.live.get(&entry.job_id) {
                Some(&gen) if gen == entry.gen => {}
                _ => continue,
            }
            if matches(&entry) {
                inner.live.remove(&entry.job_id);
                found = Some(entry);
                break;
            }
            skipped.push(entry);
        }

        for entry in skipped {
            inner.heap.push(entry);
        }
        found
    }

    /// Live entries in assignment order.
    pub async fn peek_all(&self) -> Vec<QueuedJob> {
        let inner = self.inner.read().await;
        let mut entries: Vec<QueuedJob> = inner
            .heap
            .iter()
            .filter(|e| matches!(inner.live.get(&e.job_id), Some(&gen) if gen == e.gen))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
    }

    /// Queue depth per priority class, for the admin surface.
    pub async fn depth_by_priority(&self) -> HashMap<JobPriority, usize> {
        let mut depths = HashMap::new();
        for entry in self.peek_all().await {
            *depths.entry(entry.priority).or_insert(0) += 1;
        }
        depths
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

//! Concurrent map stage: a worker pool over bounded queues
//!
//! The driver feeds samples to an in-queue, workers apply the mapper and
//! push results to an out-queue, and the driver yields them to the
//! consumer. End-of-stream and faults travel as control sentinels: a
//! worker that observes one re-enqueues it for its siblings, echoes it on
//! the out-queue and exits, so the driver knows all workers stopped once
//! it has collected `worker_count` sentinels.
//!
//! A mapper fault never kills the hosting process; the diagnostic is
//! packaged into the sentinel and raised to the consumer only after every
//! worker has stopped. The first observed fault wins.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::memory::SharedMemoryArena;
use crate::pipeline::stage::{ReaderFactory, RecordMapper, WorkerMode, XmapConfig};
use crate::pipeline::transform::panic_message;
use crate::queue::{Element, Payload, SharedQueue};
use crate::types::error::{PipelineError, QueueError};
use crate::types::{Item, Result, Sample, Tag};

use crate::pipeline::stage::Reader;

/// End-or-fault sentinel exchanged between driver and workers.
#[derive(Clone, Debug)]
struct EndSignal {
    errno: i32,
    errmsg: String,
}

impl EndSignal {
    fn ok() -> Self {
        Self {
            errno: 0,
            errmsg: "ok".into(),
        }
    }

    fn fault(errmsg: String) -> Self {
        Self { errno: -1, errmsg }
    }
}

enum Work {
    Data { sample: Sample, seq: Option<u64> },
    End(EndSignal),
}

/// Sideband representation of a work element in shared-memory mode.
#[derive(Serialize, Deserialize)]
enum WireMeta {
    Data { tags: Vec<Tag>, seq: Option<u64> },
    End { errno: i32, errmsg: String },
}

/// The two queue substrates a worker pool can run over.
#[derive(Clone)]
enum WorkQueue {
    Channel {
        tx: flume::Sender<Work>,
        rx: flume::Receiver<Work>,
    },
    Shared(SharedQueue),
}

impl WorkQueue {
    fn channel(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        WorkQueue::Channel { tx, rx }
    }

    fn shared(capacity: usize, arena: SharedMemoryArena) -> Self {
        WorkQueue::Shared(SharedQueue::new(capacity, arena))
    }

    fn put(&self, work: Work) -> Result<()> {
        match self {
            WorkQueue::Channel { tx, .. } => tx
                .send(work)
                .map_err(|_| QueueError::Disconnected.into()),
            WorkQueue::Shared(q) => match work {
                Work::Data { sample, seq } => q.put(
                    Some(&sample.payload),
                    &WireMeta::Data {
                        tags: sample.tags,
                        seq,
                    },
                    None,
                ),
                Work::End(sig) => q.put_control(&WireMeta::End {
                    errno: sig.errno,
                    errmsg: sig.errmsg,
                }),
            },
        }
    }

    /// Non-blocking sentinel enqueue; `false` when the queue is full.
    fn try_put_end(&self, sig: EndSignal) -> bool {
        match self {
            WorkQueue::Channel { tx, .. } => tx.try_send(Work::End(sig)).is_ok(),
            WorkQueue::Shared(q) => q
                .try_put_control(&WireMeta::End {
                    errno: sig.errno,
                    errmsg: sig.errmsg,
                })
                .unwrap_or(false),
        }
    }

    fn get(&self) -> Result<Work> {
        match self {
            WorkQueue::Channel { rx, .. } => {
                rx.recv().map_err(|_| QueueError::Disconnected.into())
            }
            WorkQueue::Shared(q) => Self::open(q.get::<WireMeta>(false)?),
        }
    }

    /// Non-blocking dequeue used while draining on teardown.
    fn try_get(&self) -> Option<Work> {
        match self {
            WorkQueue::Channel { rx, .. } => rx.try_recv().ok(),
            WorkQueue::Shared(q) => match q.try_get::<WireMeta>(false) {
                Ok(Some(element)) => Self::open(element).ok(),
                _ => None,
            },
        }
    }

    fn open(element: Element<WireMeta>) -> Result<Work> {
        match element {
            Element::Control(WireMeta::End { errno, errmsg }) => {
                Ok(Work::End(EndSignal { errno, errmsg }))
            }
            Element::Data {
                payload,
                meta: WireMeta::Data { tags, seq },
            } => Ok(Work::Data {
                sample: Sample::new(payload.into_bytes()?, tags),
                seq,
            }),
            Element::Control(WireMeta::Data { .. }) => Err(QueueError::Protocol(
                "control element carried data metadata".into(),
            )
            .into()),
            Element::Data {
                payload,
                meta: WireMeta::End { .. },
            } => {
                if let Payload::Buffer(mut buf) = payload {
                    let _ = buf.free();
                }
                Err(QueueError::Protocol("data element carried an end sentinel".into()).into())
            }
        }
    }
}

fn worker_loop(worker: usize, inq: WorkQueue, outq: WorkQueue, mapper: RecordMapper) {
    loop {
        let work = match inq.get() {
            Ok(work) => work,
            Err(e) => {
                tracing::warn!("xmap worker {} lost its in-queue: {}", worker, e);
                return;
            }
        };
        match work {
            Work::End(sig) => {
                // pass the sentinel on so siblings observe it too; the
                // driver fans out one per worker anyway, so a full queue
                // is safe to skip
                if !inq.try_put_end(sig.clone()) {
                    tracing::debug!("xmap worker {} skipped sentinel re-enqueue", worker);
                }
                let _ = outq.put(Work::End(sig));
                return;
            }
            Work::Data { sample, seq } => {
                let outcome = match catch_unwind(AssertUnwindSafe(|| (mapper)(sample))) {
                    Ok(Ok(mapped)) => Ok(mapped),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(panic) => Err(panic_message(&panic)),
                };
                match outcome {
                    Ok(mapped) => {
                        if outq
                            .put(Work::Data {
                                sample: mapped,
                                seq,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(errmsg) => {
                        tracing::warn!("xmap worker {} mapper failed: {}", worker, errmsg);
                        let sig = EndSignal::fault(errmsg);
                        if !inq.try_put_end(sig.clone()) {
                            tracing::debug!("xmap worker {} skipped sentinel re-enqueue", worker);
                        }
                        let _ = outq.put(Work::End(sig));
                        return;
                    }
                }
            }
        }
    }
}

/// Lift a reader factory into one whose samples are mapped by a pool of
/// workers with bounded in-flight.
pub(crate) fn xmap_reader(upstream: ReaderFactory, config: XmapConfig) -> ReaderFactory {
    Arc::new(move || match XmapIter::start(upstream.clone(), config.clone()) {
        Ok(iter) => Box::new(iter) as Reader,
        Err(e) => Box::new(std::iter::once(Err(e))),
    })
}

struct XmapIter {
    source: Reader,
    inq: WorkQueue,
    outq: WorkQueue,
    workers: Vec<JoinHandle<()>>,
    worker_count: usize,
    buffer_size: usize,
    preserve_order: bool,
    pre_feed: usize,
    join_timeout: Duration,
    started: bool,
    feeding: bool,
    sentinels_owed: usize,
    sentinel_sig: EndSignal,
    finished: usize,
    feed_seq: u64,
    next_seq: u64,
    pending: BTreeMap<u64, Sample>,
    tail: VecDeque<Sample>,
    first_error: Option<String>,
    done: bool,
}

impl XmapIter {
    fn start(upstream: ReaderFactory, config: XmapConfig) -> Result<Self> {
        config.validate()?;
        // In-flight data is capped at buffer_size by the feed protocol
        // (pre-feed, then one feed per result pulled). The channels get
        // headroom for one sentinel per worker on top of that, so sentinel
        // fan-out never contends with data for slots.
        let slots = config.buffer_size + config.worker_count + 1;
        let (inq, outq) = match config.mode {
            WorkerMode::InProcess => (WorkQueue::channel(slots), WorkQueue::channel(slots)),
            WorkerMode::SharedMem => {
                // one arena serves both directions, owned by this stage
                let arena =
                    SharedMemoryArena::with_capacity(config.shared_mem_bytes, config.page_bytes)?;
                (
                    WorkQueue::shared(slots, arena.clone()),
                    WorkQueue::shared(slots, arena),
                )
            }
        };

        let mut workers = Vec::with_capacity(config.worker_count);
        for i in 0..config.worker_count {
            let inq = inq.clone();
            let outq = outq.clone();
            let mapper = config.mapper.clone();
            let handle = std::thread::Builder::new()
                .name(format!("visfeed-xmap-{i}"))
                .spawn(move || worker_loop(i, inq, outq, mapper))?;
            workers.push(handle);
        }

        Ok(Self {
            source: upstream(),
            inq,
            outq,
            workers,
            worker_count: config.worker_count,
            buffer_size: config.buffer_size,
            preserve_order: config.preserve_order,
            pre_feed: config.effective_pre_feed(),
            join_timeout: config.join_timeout,
            started: false,
            feeding: true,
            sentinels_owed: 0,
            sentinel_sig: EndSignal::ok(),
            finished: 0,
            feed_seq: 0,
            next_seq: 0,
            pending: BTreeMap::new(),
            tail: VecDeque::new(),
            first_error: None,
            done: false,
        })
    }

    /// Feed one sample from the source; a returned signal means feeding is
    /// over, normally or because pulling the sample failed.
    fn feed_one(&mut self) -> Option<EndSignal> {
        match self.source.next() {
            None => Some(EndSignal::ok()),
            Some(Err(e)) => {
                tracing::warn!("failed to pull a sample into xmap: {}", e);
                Some(EndSignal::fault(e.to_string()))
            }
            Some(Ok(Item::Batch(_))) => Some(EndSignal::fault(
                "batched items cannot enter a concurrent map stage".into(),
            )),
            Some(Ok(Item::Sample(sample))) => {
                let seq = self.preserve_order.then_some(self.feed_seq);
                if self.inq.put(Work::Data { sample, seq }).is_err() {
                    return Some(EndSignal::fault("xmap in-queue disconnected".into()));
                }
                self.feed_seq += 1;
                None
            }
        }
    }

    fn stop_feeding(&mut self, sig: EndSignal) {
        if !self.feeding {
            return;
        }
        self.feeding = false;
        if sig.errno != 0 && self.first_error.is_none() {
            self.first_error = Some(sig.errmsg.clone());
        }
        self.sentinel_sig = sig;
        self.sentinels_owed = self.worker_count - self.finished;
        self.flush_sentinels();
    }

    // Sentinels are delivered without blocking so the driver can keep
    // draining the out-queue; a full in-queue drains as workers pull.
    fn flush_sentinels(&mut self) {
        while self.sentinels_owed > 0 {
            if self.inq.try_put_end(self.sentinel_sig.clone()) {
                self.sentinels_owed -= 1;
            } else {
                break;
            }
        }
    }

    fn record_end(&mut self, sig: EndSignal) {
        self.finished += 1;
        if sig.errno != 0 && self.first_error.is_none() {
            self.first_error = Some(sig.errmsg);
        }
        self.stop_feeding(EndSignal::ok());
    }

    fn finalize(&mut self) -> Option<Result<Item>> {
        self.done = true;
        if let Some(msg) = self.first_error.take() {
            self.pending.clear();
            return Some(Err(PipelineError::WorkerFailure(msg).into()));
        }
        while let Some(sample) = self.pending.remove(&self.next_seq) {
            self.next_seq += 1;
            self.tail.push_back(sample);
        }
        if !self.pending.is_empty() {
            tracing::warn!(
                "{} ordered xmap results missing at end of stream",
                self.pending.len()
            );
            self.pending.clear();
        }
        self.tail.pop_front().map(|s| Ok(Item::Sample(s)))
    }
}

impl Iterator for XmapIter {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(sample) = self.tail.pop_front() {
            return Some(Ok(Item::Sample(sample)));
        }
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            for _ in 0..self.pre_feed {
                if let Some(sig) = self.feed_one() {
                    self.stop_feeding(sig);
                    break;
                }
            }
        }
        loop {
            if self.preserve_order {
                if let Some(sample) = self.pending.remove(&self.next_seq) {
                    self.next_seq += 1;
                    return Some(Ok(Item::Sample(sample)));
                }
            }
            self.flush_sentinels();
            let work = match self.outq.get() {
                Ok(work) => work,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            match work {
                Work::End(sig) => {
                    self.record_end(sig);
                    if self.finished == self.worker_count {
                        return self.finalize();
                    }
                }
                Work::Data { sample, seq } => {
                    let ready = if self.preserve_order {
                        match seq {
                            Some(seq) if seq == self.next_seq => {
                                self.next_seq += 1;
                                Some(sample)
                            }
                            Some(seq) => {
                                self.pending.insert(seq, sample);
                                if self.pending.len() > self.buffer_size {
                                    self.done = true;
                                    self.first_error = None;
                                    return Some(Err(PipelineError::OrderingFailure {
                                        bound: self.buffer_size,
                                    }
                                    .into()));
                                }
                                None
                            }
                            None => {
                                self.done = true;
                                return Some(Err(QueueError::Protocol(
                                    "unsequenced result in ordered xmap".into(),
                                )
                                .into()));
                            }
                        }
                    } else {
                        Some(sample)
                    };
                    if self.feeding {
                        if let Some(sig) = self.feed_one() {
                            self.stop_feeding(sig);
                        }
                    }
                    if let Some(sample) = ready {
                        return Some(Ok(Item::Sample(sample)));
                    }
                }
            }
        }
    }
}

impl Drop for XmapIter {
    fn drop(&mut self) {
        if self.finished >= self.worker_count {
            // all workers echoed their sentinel; they are exiting now
            for handle in self.workers.drain(..) {
                let _ = handle.join();
            }
            return;
        }

        // canceled mid-stream: fan out sentinels and drain the out-queue
        // so workers blocked on a full queue can run into them
        self.feeding = false;
        if self.sentinels_owed == 0 {
            self.sentinels_owed = self.worker_count - self.finished;
        }
        let deadline = Instant::now() + self.join_timeout;
        loop {
            self.flush_sentinels();
            while let Some(work) = self.outq.try_get() {
                if let Work::End(_) = work {
                    self.finished += 1;
                }
            }
            if self.finished >= self.worker_count || self.workers.iter().all(|w| w.is_finished()) {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        for (i, handle) in self.workers.drain(..).enumerate() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!("xmap worker {} still alive after cancel timeout", i);
            }
        }
    }
}

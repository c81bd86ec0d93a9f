//! Interpreters for the simple pipeline stages
//!
//! Each function lifts a restartable reader factory into a new factory
//! with one transformation applied. Anything stateful lives inside the
//! iterator returned per pass, so every pass starts clean.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::pipeline::stage::{Reader, ReaderFactory, RecordMapper, RecordPredicate};
use crate::types::error::{Error, PipelineError};
use crate::types::{Item, Result};

/// Group samples into batches of `size`; a partial batch at end-of-stream
/// is dropped when `drop_partial` is set.
pub(crate) fn batch_reader(
    upstream: ReaderFactory,
    size: usize,
    drop_partial: bool,
) -> ReaderFactory {
    Arc::new(move || {
        Box::new(BatchIter {
            inner: upstream(),
            size,
            drop_partial,
            done: false,
        })
    })
}

struct BatchIter {
    inner: Reader,
    size: usize,
    drop_partial: bool,
    done: bool,
}

impl Iterator for BatchIter {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut batch = Vec::with_capacity(self.size);
        loop {
            match self.inner.next() {
                Some(Ok(Item::Sample(s))) => {
                    batch.push(s);
                    if batch.len() == self.size {
                        return Some(Ok(Item::Batch(batch)));
                    }
                }
                Some(Ok(Item::Batch(_))) => {
                    self.done = true;
                    return Some(Err(PipelineError::InvalidArgument(
                        "batch stage fed with already-batched items".into(),
                    )
                    .into()));
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    if batch.is_empty() || self.drop_partial {
                        return None;
                    }
                    return Some(Ok(Item::Batch(batch)));
                }
            }
        }
    }
}

/// Apply `mapper` to every sample; batches are mapped element-wise.
pub(crate) fn map_record_reader(upstream: ReaderFactory, mapper: RecordMapper) -> ReaderFactory {
    Arc::new(move || {
        let mapper = mapper.clone();
        let mut inner = upstream();
        Box::new(std::iter::from_fn(move || {
            let item = match inner.next()? {
                Ok(item) => item,
                Err(e) => return Some(Err(e)),
            };
            let mapped = match item {
                Item::Sample(s) => mapper(s).map(Item::Sample),
                Item::Batch(batch) => batch
                    .into_iter()
                    .map(|s| mapper(s))
                    .collect::<Result<Vec<_>>>()
                    .map(Item::Batch),
            };
            Some(mapped)
        }))
    })
}

/// Keep only samples for which `pred` holds; batches retain matching
/// members and vanish when emptied.
pub(crate) fn filter_reader(upstream: ReaderFactory, pred: RecordPredicate) -> ReaderFactory {
    Arc::new(move || {
        let pred = pred.clone();
        let mut inner = upstream();
        Box::new(std::iter::from_fn(move || loop {
            match inner.next()? {
                Ok(Item::Sample(s)) => {
                    if pred(&s) {
                        return Some(Ok(Item::Sample(s)));
                    }
                }
                Ok(Item::Batch(batch)) => {
                    let kept: Vec<_> = batch.into_iter().filter(|s| pred(s)).collect();
                    if !kept.is_empty() {
                        return Some(Ok(Item::Batch(kept)));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }))
    })
}

struct CacheState {
    cached: bool,
    items: Vec<Item>,
}

/// Record the first complete pass in memory; later passes replay it
/// without re-executing upstream stages.
pub(crate) fn cache_reader(upstream: ReaderFactory) -> ReaderFactory {
    let state = Arc::new(Mutex::new(CacheState {
        cached: false,
        items: Vec::new(),
    }));
    Arc::new(move || {
        {
            let guard = state.lock();
            if guard.cached {
                tracing::debug!("replaying {} cached items", guard.items.len());
                return Box::new(guard.items.clone().into_iter().map(Ok)) as Reader;
            }
        }
        Box::new(CacheIter {
            inner: upstream(),
            state: state.clone(),
            recorded: Vec::new(),
        })
    })
}

struct CacheIter {
    inner: Reader,
    state: Arc<Mutex<CacheState>>,
    recorded: Vec<Item>,
}

impl Iterator for CacheIter {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next() {
            Some(Ok(item)) => {
                self.recorded.push(item.clone());
                Some(Ok(item))
            }
            Some(Err(e)) => Some(Err(e)),
            None => {
                let mut guard = self.state.lock();
                if !guard.cached {
                    guard.items = std::mem::take(&mut self.recorded);
                    guard.cached = true;
                    tracing::debug!("cached {} items in memory", guard.items.len());
                }
                None
            }
        }
    }
}

/// Keep up to `size` items prefetched by a background thread.
pub(crate) fn buffered_reader(upstream: ReaderFactory, size: usize) -> ReaderFactory {
    Arc::new(move || {
        let (tx, rx) = flume::bounded::<Result<Item>>(size);
        let inner_factory = upstream.clone();
        let spawned = std::thread::Builder::new()
            .name("visfeed-buffered".into())
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    for item in inner_factory() {
                        if tx.send(item).is_err() {
                            // consumer dropped the reader
                            return;
                        }
                    }
                }));
                if let Err(panic) = outcome {
                    let msg = panic_message(&panic);
                    tracing::warn!("buffered prefetch thread panicked: {}", msg);
                    let _ = tx.send(Err(PipelineError::WorkerFailure(msg).into()));
                }
            });
        match spawned {
            Ok(_) => Box::new(rx.into_iter()) as Reader,
            Err(e) => Box::new(std::iter::once(Err(Error::Io(e)))),
        }
    })
}

/// Concatenate several readers into one (outputs of the first, then the
/// second, and so on).
pub fn chain_readers(readers: Vec<ReaderFactory>) -> ReaderFactory {
    Arc::new(move || {
        let factories = readers.clone();
        Box::new(factories.into_iter().flat_map(|f| f()))
    })
}

/// Thread-safe reader: serializes `next` behind a mutex so one transformed
/// reader can be polled from several threads.
#[derive(Clone)]
pub struct SyncReader {
    inner: Arc<Mutex<Reader>>,
}

impl SyncReader {
    /// Wrap a reader for shared polling.
    pub fn new(reader: Reader) -> Self {
        Self {
            inner: Arc::new(Mutex::new(reader)),
        }
    }
}

impl Iterator for SyncReader {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.lock().next()
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sample;

    fn int_sample(i: i64) -> Sample {
        Sample::new(i.to_le_bytes().to_vec(), vec![])
    }

    fn sample_value(s: &Sample) -> i64 {
        i64::from_le_bytes(s.payload[..].try_into().unwrap())
    }

    fn ints(n: i64) -> ReaderFactory {
        Arc::new(move || Box::new((0..n).map(|i| Ok(Item::Sample(int_sample(i))))))
    }

    fn collect_values(reader: Reader) -> Vec<i64> {
        reader
            .map(|r| r.unwrap())
            .map(|item| match item {
                Item::Sample(s) => sample_value(&s),
                Item::Batch(_) => panic!("unexpected batch"),
            })
            .collect()
    }

    #[test]
    fn batch_groups_and_keeps_partial_tail() {
        let rd = batch_reader(ints(7), 3, false);
        let batches: Vec<Vec<i64>> = rd()
            .map(|r| match r.unwrap() {
                Item::Batch(b) => b.iter().map(sample_value).collect(),
                Item::Sample(_) => panic!("expected batch"),
            })
            .collect();
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    }

    #[test]
    fn batch_drop_discards_partial_tail() {
        let rd = batch_reader(ints(7), 3, true);
        assert_eq!(rd().count(), 2);
        // fewer upstream samples than one batch yields nothing
        let rd = batch_reader(ints(2), 3, true);
        assert_eq!(rd().count(), 0);
    }

    #[test]
    fn batch_total_matches_upstream_count() {
        for n in [0i64, 1, 5, 9, 10] {
            let rd = batch_reader(ints(n), 4, false);
            let total: usize = rd()
                .map(|r| match r.unwrap() {
                    Item::Batch(b) => b.len(),
                    Item::Sample(_) => 1,
                })
                .sum();
            assert_eq!(total, n as usize);
        }
    }

    #[test]
    fn map_applies_per_record() {
        let mapper: RecordMapper = Arc::new(|s| {
            let v = sample_value(&s);
            Ok(int_sample(v * 2))
        });
        let rd = map_record_reader(ints(5), mapper);
        assert_eq!(collect_values(rd()), vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn filter_drops_failing_samples() {
        let pred: RecordPredicate = Arc::new(|s| sample_value(s) % 2 == 0);
        let rd = filter_reader(ints(10), pred);
        assert_eq!(collect_values(rd()), vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn cache_replays_without_reexecuting_upstream() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let pulls = Arc::new(AtomicUsize::new(0));
        let upstream: ReaderFactory = {
            let pulls = pulls.clone();
            Arc::new(move || {
                let pulls = pulls.clone();
                Box::new((0..4).map(move |i| {
                    pulls.fetch_add(1, Ordering::Relaxed);
                    Ok(Item::Sample(int_sample(i)))
                }))
            })
        };
        let rd = cache_reader(upstream);
        assert_eq!(collect_values(rd()), vec![0, 1, 2, 3]);
        assert_eq!(pulls.load(Ordering::Relaxed), 4);
        assert_eq!(collect_values(rd()), vec![0, 1, 2, 3]);
        assert_eq!(pulls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn abandoned_pass_does_not_poison_the_cache() {
        let rd = cache_reader(ints(4));
        let mut first = rd();
        let _ = first.next();
        drop(first);
        assert_eq!(collect_values(rd()), vec![0, 1, 2, 3]);
        assert_eq!(collect_values(rd()), vec![0, 1, 2, 3]);
    }

    #[test]
    fn buffered_preserves_order() {
        let rd = buffered_reader(ints(100), 8);
        assert_eq!(collect_values(rd()), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn chain_concatenates() {
        let rd = chain_readers(vec![ints(3), ints(2)]);
        assert_eq!(collect_values(rd()), vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn sync_reader_is_shareable() {
        let rd = ints(100);
        let shared = SyncReader::new(rd());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mut r = shared.clone();
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                while let Some(item) = r.next() {
                    if let Item::Sample(s) = item.unwrap() {
                        got.push(sample_value(&s));
                    }
                }
                got
            }));
        }
        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }
}

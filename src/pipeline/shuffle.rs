//! Windowed shuffle with prefetch and token backpressure
//!
//! A prefetch thread fills a bounded data queue; past the first window it
//! must receive one token per additional item, sent by the consumer after
//! every yield. The prefetcher therefore never runs more than `window`
//! items ahead, which also pins down which input items can land in which
//! output positions: the first `window` outputs are a permutation of the
//! first `window` inputs.

use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::pipeline::stage::{Reader, ReaderFactory};
use crate::types::{Item, Result};

/// Shuffle within a sliding window of `window` items; negative windows
/// shuffle the whole stream, zero is handled upstream as a no-op.
pub(crate) fn shuffle_reader(upstream: ReaderFactory, window: i64) -> ReaderFactory {
    if window < 0 {
        return whole_stream_shuffle(upstream);
    }
    if window == 0 {
        return upstream;
    }
    let window = window as usize;
    Arc::new(move || {
        let (data_tx, data_rx) = flume::bounded::<Result<Item>>(window);
        let (token_tx, token_rx) = flume::bounded::<()>(window);
        let inner_factory = upstream.clone();
        let spawned = std::thread::Builder::new()
            .name("visfeed-shuffle".into())
            .spawn(move || {
                for (i, item) in inner_factory().enumerate() {
                    if i >= window && token_rx.recv().is_err() {
                        // consumer went away
                        return;
                    }
                    if data_tx.send(item).is_err() {
                        return;
                    }
                }
            });
        if let Err(e) = spawned {
            return Box::new(std::iter::once(Err(crate::types::Error::Io(e)))) as Reader;
        }
        Box::new(ShuffleIter {
            data_rx,
            token_tx,
            window,
            fill: Vec::with_capacity(window),
            ready: std::collections::VecDeque::new(),
            stopped: false,
        })
    })
}

struct ShuffleIter {
    data_rx: flume::Receiver<Result<Item>>,
    token_tx: flume::Sender<()>,
    window: usize,
    fill: Vec<Item>,
    ready: std::collections::VecDeque<Item>,
    stopped: bool,
}

impl Iterator for ShuffleIter {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if !self.stopped {
                match self.data_rx.recv() {
                    Ok(Ok(item)) => {
                        self.fill.push(item);
                        if self.fill.len() >= self.window {
                            self.fill.shuffle(&mut rand::rng());
                            self.ready.extend(self.fill.drain(..));
                        }
                    }
                    Ok(Err(e)) => {
                        self.stopped = true;
                        self.ready.clear();
                        self.fill.clear();
                        return Some(Err(e));
                    }
                    Err(_) => {
                        // prefetcher finished; the tail shorter than one
                        // window passes through unshuffled
                        self.stopped = true;
                        self.ready.extend(self.fill.drain(..));
                    }
                }
            }
            if let Some(item) = self.ready.pop_front() {
                let _ = self.token_tx.send(());
                return Some(Ok(item));
            }
            if self.stopped {
                return None;
            }
        }
    }
}

fn whole_stream_shuffle(upstream: ReaderFactory) -> ReaderFactory {
    Arc::new(move || {
        let inner = upstream();
        Box::new(WholeShuffleIter {
            inner: Some(inner),
            ready: Vec::new(),
        })
    })
}

struct WholeShuffleIter {
    inner: Option<Reader>,
    ready: Vec<Item>,
}

impl Iterator for WholeShuffleIter {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(mut inner) = self.inner.take() {
            let mut all = Vec::new();
            for item in inner.by_ref() {
                match item {
                    Ok(item) => all.push(item),
                    Err(e) => return Some(Err(e)),
                }
            }
            all.shuffle(&mut rand::rng());
            all.reverse();
            self.ready = all;
        }
        self.ready.pop().map(Ok)
    }
}

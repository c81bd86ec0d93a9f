//! End-to-end pipeline behavior over literal inputs

use std::collections::HashSet;
use std::sync::Arc;

use visfeed::pipeline::{Reader, ReaderFactory, RecordMapper};
use visfeed::{Item, Pipeline, Sample, Tag, WorkerMode, XmapConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn int_sample(i: i64) -> Sample {
    Sample::new(i.to_le_bytes().to_vec(), vec![])
}

fn sample_value(s: &Sample) -> i64 {
    i64::from_le_bytes(s.payload[..8].try_into().unwrap())
}

fn ints(n: i64) -> ReaderFactory {
    Arc::new(move || Box::new((0..n).map(|i| Ok(Item::Sample(int_sample(i))))) as Reader)
}

fn doubler() -> RecordMapper {
    Arc::new(|s| {
        let v = sample_value(&s);
        Ok(int_sample(v * 2))
    })
}

fn values(reader: Reader) -> Vec<i64> {
    reader
        .map(|r| match r.unwrap() {
            Item::Sample(s) => sample_value(&s),
            Item::Batch(_) => panic!("unexpected batch"),
        })
        .collect()
}

// Scenario: map then batch over [0..9] yields [[0,2,4],[6,8,10],[12,14,16],[18]].
#[test]
fn map_then_batch_identity() {
    init_tracing();
    let mut pl = Pipeline::new();
    pl.map(doubler()).batch(3, false);
    let rd = pl.transform(ints(10), false).unwrap();
    let batches: Vec<Vec<i64>> = rd()
        .map(|r| match r.unwrap() {
            Item::Batch(b) => b.iter().map(sample_value).collect(),
            Item::Sample(_) => panic!("expected batches"),
        })
        .collect();
    assert_eq!(
        batches,
        vec![vec![0, 2, 4], vec![6, 8, 10], vec![12, 14, 16], vec![18]]
    );
}

// Scenario: ordered xmap doubles [0..9] in order, with work spread over
// more than one worker.
#[test]
fn ordered_xmap_parallelism() {
    let mapper: RecordMapper = Arc::new(|s| {
        // give the sibling worker time to claim samples too
        std::thread::sleep(std::time::Duration::from_millis(5));
        let v = sample_value(&s);
        let worker = std::thread::current().name().unwrap_or("?").to_string();
        Ok(Sample::new(
            (2 * v).to_le_bytes().to_vec(),
            vec![Tag::Text(worker)],
        ))
    });
    let mut pl = Pipeline::new();
    pl.xmap(XmapConfig::new(mapper).workers(2).buffer(8).ordered(true))
        .unwrap();
    let rd = pl.transform(ints(10), false).unwrap();

    let mut got = Vec::new();
    let mut workers = HashSet::new();
    for item in rd() {
        match item.unwrap() {
            Item::Sample(s) => {
                got.push(sample_value(&s));
                if let Some(Tag::Text(name)) = s.tags.first() {
                    workers.insert(name.clone());
                }
            }
            Item::Batch(_) => panic!("unexpected batch"),
        }
    }
    assert_eq!(got, (0..10).map(|i| 2 * i).collect::<Vec<_>>());
    assert!(
        workers.len() >= 2,
        "expected at least two distinct workers, saw {workers:?}"
    );
}

// Scenario: unordered xmap over [0..999] is a permutation of the doubles.
#[test]
fn unordered_xmap_completeness() {
    let mut pl = Pipeline::new();
    pl.xmap(XmapConfig::new(doubler()).workers(8).buffer(64))
        .unwrap();
    let rd = pl.transform(ints(1000), false).unwrap();
    let mut got = values(rd());
    assert_eq!(got.len(), 1000);
    got.sort_unstable();
    assert_eq!(got, (0..1000).map(|i| 2 * i).collect::<Vec<_>>());
}

// Scenario: with window 5 over [0..9], the first five outputs all come
// from the first five inputs.
#[test]
fn shuffle_window_constraint() {
    for _ in 0..25 {
        let mut pl = Pipeline::new();
        pl.shuffle(5);
        let rd = pl.transform(ints(10), false).unwrap();
        let got = values(rd());
        let mut sorted = got.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
        for &v in &got[..5] {
            assert!(v < 5, "second-window value {v} surfaced in the first window");
        }
    }
}

#[test]
fn shuffle_zero_is_a_noop() {
    let mut pl = Pipeline::new();
    pl.shuffle(0);
    let rd = pl.transform(ints(10), false).unwrap();
    assert_eq!(values(rd()), (0..10).collect::<Vec<_>>());
}

#[test]
fn shuffle_negative_permutes_the_whole_stream() {
    let mut pl = Pipeline::new();
    pl.shuffle(-1);
    let rd = pl.transform(ints(100), false).unwrap();
    let mut got = values(rd());
    got.sort_unstable();
    assert_eq!(got, (0..100).collect::<Vec<_>>());
}

// Property: batch without drop conserves the upstream sample count.
#[test]
fn batch_conserves_sample_count() {
    for (n, k) in [(10, 3), (9, 3), (1, 4), (0, 2), (100, 7)] {
        let mut pl = Pipeline::new();
        pl.batch(k, false);
        let rd = pl.transform(ints(n), false).unwrap();
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
fn short_input_with_drop_yields_no_batches() {
    let mut pl = Pipeline::new();
    pl.batch(5, true);
    let rd = pl.transform(ints(3), false).unwrap();
    assert_eq!(rd().count(), 0);
}

// Property: ordered xmap output position i equals mapper(input[i]).
#[test]
fn ordered_xmap_positions_match() {
    for workers in [1, 3, 7] {
        let mut pl = Pipeline::new();
        pl.xmap(
            XmapConfig::new(doubler())
                .workers(workers)
                .buffer(16)
                .ordered(true),
        )
        .unwrap();
        let rd = pl.transform(ints(200), false).unwrap();
        let got = values(rd());
        for (i, v) in got.iter().enumerate() {
            assert_eq!(*v, 2 * i as i64);
        }
    }
}

#[test]
fn xmap_rejects_zero_workers_at_construction() {
    let mut pl = Pipeline::new();
    assert!(pl.xmap(XmapConfig::new(doubler()).workers(0)).is_err());
}

// Shared-memory mode pushes payloads through the arena-backed queues and
// still behaves like a plain xmap.
#[test]
fn shared_memory_xmap_end_to_end() {
    let mut pl = Pipeline::new();
    pl.xmap(
        XmapConfig::new(doubler())
            .workers(4)
            .buffer(16)
            .mode(WorkerMode::SharedMem)
            .shared_mem(8192 * 64, 64)
            .ordered(true),
    )
    .unwrap()
    .batch(100, false);
    let rd = pl.transform(ints(500), false).unwrap();
    let mut all = Vec::new();
    for item in rd() {
        match item.unwrap() {
            Item::Batch(b) => all.extend(b.iter().map(sample_value)),
            Item::Sample(_) => panic!("expected batches"),
        }
    }
    assert_eq!(all, (0..500).map(|i| 2 * i).collect::<Vec<_>>());
}

// A chain mixing most stage kinds still conserves and orders correctly.
#[test]
fn composite_pipeline() {
    let mut pl = Pipeline::new();
    pl.filter(Arc::new(|s| sample_value(s) % 2 == 0))
        .map(doubler())
        .buffered(8)
        .batch(4, false);
    let rd = pl.transform(ints(20), false).unwrap();
    let batches: Vec<Vec<i64>> = rd()
        .map(|r| match r.unwrap() {
            Item::Batch(b) => b.iter().map(sample_value).collect(),
            Item::Sample(_) => panic!("expected batches"),
        })
        .collect();
    assert_eq!(
        batches,
        vec![vec![0, 4, 8, 12], vec![16, 20, 24, 28], vec![32, 36]]
    );
}

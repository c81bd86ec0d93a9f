//! Shared memory arena, queue, and fault propagation scenarios

use std::sync::Arc;

use visfeed::pipeline::{Reader, ReaderFactory, RecordMapper};
use visfeed::queue::Element;
use visfeed::types::error::{MemoryError, PipelineError};
use visfeed::{Error, Item, Pipeline, Sample, SharedMemoryArena, SharedQueue, XmapConfig};

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

// Scenario: a 4-page arena of 32-byte pages keeps one page for its header,
// serves three buffers, refuses a fourth, and reuses a freed slot.
#[test]
fn tiny_arena_alloc_write_reuse() {
    init_tracing();
    let arena = SharedMemoryArena::with_capacity(4 * 32, 32).unwrap();
    let mut bufs = Vec::new();
    for i in 0..3 {
        let mut b = arena.malloc(8).unwrap();
        b.put(format!("hello_{i}").as_bytes(), false).unwrap();
        bufs.push(b);
    }
    assert!(matches!(
        arena.malloc(8).unwrap_err(),
        Error::Memory(MemoryError::OutOfMemory { .. })
    ));

    bufs[1].free().unwrap();
    let mut reused = arena.malloc(8).unwrap();
    reused.put(b"hello_1", false).unwrap();
    bufs[1] = reused;

    for (i, b) in bufs.iter().enumerate() {
        assert_eq!(
            &b.get(0, None).unwrap().unwrap()[..],
            format!("hello_{i}").as_bytes()
        );
    }
    for mut b in bufs {
        b.free().unwrap();
    }
    assert!(arena.is_empty());
}

// Invariant: pages_in_use returns to its prior value after malloc/free,
// and is_empty holds exactly when nothing is outstanding.
#[test]
fn pages_in_use_is_balanced() {
    let arena = SharedMemoryArena::with_capacity(128 * 64, 64).unwrap();
    let baseline = arena.pages_in_use();
    let mut a = arena.malloc(100).unwrap();
    let mut b = arena.malloc(5000).unwrap();
    assert!(!arena.is_empty());
    a.free().unwrap();
    assert!(!arena.is_empty());
    b.free().unwrap();
    assert_eq!(arena.pages_in_use(), baseline);
    assert!(arena.is_empty());
}

// Invariant: the multiset of payloads coming out of a shared queue equals
// the multiset put in, and single-consumer order equals put order.
#[test]
fn queue_put_get_multiset_and_order() {
    let q = SharedQueue::with_arena(8, 4096 * 64, 64).unwrap();
    let producer = {
        let q = q.clone();
        std::thread::spawn(move || {
            for i in 0..100u32 {
                q.put(Some(&i.to_le_bytes()), &i, None).unwrap();
            }
        })
    };
    let mut got = Vec::new();
    for _ in 0..100 {
        match q.get::<u32>(false).unwrap() {
            Element::Data { payload, meta } => {
                let bytes = payload.into_bytes().unwrap();
                assert_eq!(u32::from_le_bytes(bytes[..].try_into().unwrap()), meta);
                got.push(meta);
            }
            Element::Control(_) => panic!("unexpected control element"),
        }
    }
    producer.join().unwrap();
    assert_eq!(got, (0..100).collect::<Vec<_>>());
    assert!(q.arena().is_empty());
}

// Scenario: a mapper fault on sample 50 lets [0..49] through, surfaces one
// WorkerFailure carrying the diagnostic, and closes the pipeline.
#[test]
fn worker_failure_propagation() {
    let mapper: RecordMapper = Arc::new(|s| {
        let v = sample_value(&s);
        if v == 50 {
            return Err(PipelineError::WorkerFailure("sample 50 is poison".into()).into());
        }
        Ok(int_sample(v))
    });
    let mut pl = Pipeline::new();
    pl.xmap(XmapConfig::new(mapper).workers(4).buffer(64).ordered(true))
        .unwrap();
    let rd = pl.transform(ints(100), false).unwrap();

    let mut iter = rd();
    let mut yielded = Vec::new();
    let mut failure = None;
    for item in iter.by_ref() {
        match item {
            Ok(Item::Sample(s)) => yielded.push(sample_value(&s)),
            Ok(Item::Batch(_)) => panic!("unexpected batch"),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    assert_eq!(yielded, (0..50).collect::<Vec<_>>());
    match failure {
        Some(Error::Pipeline(PipelineError::WorkerFailure(msg))) => {
            assert!(msg.contains("sample 50 is poison"), "diagnostic lost: {msg}");
        }
        other => panic!("expected WorkerFailure, got {other:?}"),
    }
    // closed after the raise
    assert!(iter.next().is_none());
}

// Reset then transform behaves like a fresh pipeline.
#[test]
fn reset_then_transform_is_fresh() {
    let mut pl = Pipeline::new();
    pl.batch(2, false);
    let rd = pl.transform(ints(4), false).unwrap();
    assert_eq!(rd().count(), 2);

    pl.reset(None);
    pl.map(Arc::new(|s: Sample| {
        let v = sample_value(&s);
        Ok(int_sample(v + 1))
    }));
    let rd = pl.transform(ints(4), false).unwrap();
    let got: Vec<i64> = rd()
        .map(|r| match r.unwrap() {
            Item::Sample(s) => sample_value(&s),
            Item::Batch(_) => panic!("unexpected batch"),
        })
        .collect();
    assert_eq!(got, vec![1, 2, 3, 4]);
}

// Payloads larger than one page span contiguous pages and survive the
// queue round trip intact.
#[test]
fn multi_page_payload_roundtrip() {
    let q = SharedQueue::with_arena(2, 4096 * 64, 64).unwrap();
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    q.put(Some(&payload), &"big", None).unwrap();
    match q.get::<String>(false).unwrap() {
        Element::Data { payload: got, meta } => {
            assert_eq!(meta, "big");
            assert_eq!(&got.into_bytes().unwrap()[..], &payload[..]);
        }
        Element::Control(_) => panic!("expected data"),
    }
    assert!(q.arena().is_empty());
}

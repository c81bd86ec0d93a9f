//! Bounded FIFO over shared memory for large payloads
//!
//! An element is a payload written into an arena buffer plus a serialized
//! metadata blob packed directly after it; only `(meta_len, handle)`
//! travels through the bounded channel. Elements without a payload are
//! control messages whose metadata travels inline, which is how end-of-
//! stream and fault sentinels flow without touching the arena.
//!
//! Ownership protocol: the producer owns a buffer until `put`, the queue
//! owns it in flight, and the consumer owns it after `get`. Consumers that
//! ask for the raw buffer must free it themselves; otherwise the queue
//! copies the payload out and frees it on their behalf. Producers never
//! pass their own buffers in; the queue allocates every one.

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::constants::META_BLOB_MAX;
use crate::memory::{SharedBuffer, SharedMemoryArena};
use crate::types::error::{Error, MemoryError, QueueError};
use crate::types::Result;

enum Slot {
    Control(Vec<u8>),
    Data { meta_len: usize, buffer: SharedBuffer },
}

/// Payload of a dequeued data element.
pub enum Payload {
    /// Payload copied out of the arena; the backing buffer is already freed.
    Bytes(Bytes),
    /// The arena buffer itself, resized to the payload; the receiver frees it.
    Buffer(SharedBuffer),
}

impl Payload {
    /// Materialize the payload bytes, freeing the buffer if one is held.
    pub fn into_bytes(self) -> Result<Bytes> {
        match self {
            Payload::Bytes(b) => Ok(b),
            Payload::Buffer(mut buf) => {
                let data = buf.get(0, None)?.unwrap_or_default();
                buf.free()?;
                Ok(data)
            }
        }
    }
}

/// A dequeued element: either a control message or payload plus metadata.
pub enum Element<M> {
    /// Control message (end-of-stream, fault); carries only metadata.
    Control(M),
    /// Data element.
    Data {
        /// The large payload.
        payload: Payload,
        /// Decoded sideband metadata.
        meta: M,
    },
}

/// Bounded FIFO whose data elements live in a shared memory arena.
///
/// Clones share the same channel and arena, giving single-producer/
/// multi-consumer or multi-producer/single-consumer semantics as needed.
#[derive(Clone)]
pub struct SharedQueue {
    tx: flume::Sender<Slot>,
    rx: flume::Receiver<Slot>,
    arena: SharedMemoryArena,
}

impl SharedQueue {
    /// Create a queue bounded to `capacity` in-flight elements on an
    /// existing arena.
    pub fn new(capacity: usize, arena: SharedMemoryArena) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx, arena }
    }

    /// Create a queue together with a private arena of `mem_bytes` split
    /// into `page_bytes` pages.
    pub fn with_arena(capacity: usize, mem_bytes: usize, page_bytes: usize) -> Result<Self> {
        let arena = SharedMemoryArena::with_capacity(mem_bytes, page_bytes)?;
        Ok(Self::new(capacity, arena))
    }

    /// The arena backing this queue's data elements.
    pub fn arena(&self) -> &SharedMemoryArena {
        &self.arena
    }

    /// Enqueue an element, blocking while the queue is full.
    ///
    /// With a payload, the metadata is serialized and packed after the
    /// payload into a freshly allocated buffer of at least
    /// `max(lower_bound, payload + meta) + meta headroom` bytes. Without
    /// one, the element is a control message. Serialized metadata beyond
    /// the compile-time cap fails with `MetadataTooLarge`.
    pub fn put<M: Serialize>(
        &self,
        payload: Option<&[u8]>,
        meta: &M,
        lower_bound: Option<usize>,
    ) -> Result<()> {
        let blob = rmp_serde::to_vec(meta).map_err(QueueError::from)?;
        if blob.len() > META_BLOB_MAX {
            return Err(QueueError::MetadataTooLarge {
                size: blob.len(),
                cap: META_BLOB_MAX,
            }
            .into());
        }

        let Some(data) = payload else {
            return self
                .tx
                .send(Slot::Control(blob))
                .map_err(|_| QueueError::Disconnected.into());
        };

        let mut size = data.len() + blob.len();
        if let Some(lower) = lower_bound {
            size = size.max(lower);
        }

        let mut buffer = self.alloc_blocking(size + META_BLOB_MAX)?;
        buffer.put_pair(data, &blob, false)?;
        let slot = Slot::Data {
            meta_len: blob.len(),
            buffer,
        };
        if let Err(flume::SendError(slot)) = self.tx.send(slot) {
            if let Slot::Data { mut buffer, .. } = slot {
                let _ = buffer.free();
            }
            return Err(QueueError::Disconnected.into());
        }
        Ok(())
    }

    /// Enqueue a control element carrying only metadata.
    pub fn put_control<M: Serialize>(&self, meta: &M) -> Result<()> {
        self.put(None, meta, None)
    }

    /// Non-blocking control enqueue; `false` when the queue is full.
    pub fn try_put_control<M: Serialize>(&self, meta: &M) -> Result<bool> {
        let blob = rmp_serde::to_vec(meta).map_err(QueueError::from)?;
        if blob.len() > META_BLOB_MAX {
            return Err(QueueError::MetadataTooLarge {
                size: blob.len(),
                cap: META_BLOB_MAX,
            }
            .into());
        }
        match self.tx.try_send(Slot::Control(blob)) {
            Ok(()) => Ok(true),
            Err(flume::TrySendError::Full(_)) => Ok(false),
            Err(flume::TrySendError::Disconnected(_)) => Err(QueueError::Disconnected.into()),
        }
    }

    // Out-of-memory here means the consumers have not freed their buffers
    // yet; the bounded channel caps in-flight elements, so waiting for a
    // free is back-pressure, not failure. Requests that can never fit are
    // rejected immediately.
    fn alloc_blocking(&self, size: usize) -> Result<SharedBuffer> {
        if size > self.arena.allocatable_bytes() {
            return self.arena.malloc(size);
        }
        let mut warned = false;
        loop {
            match self.arena.malloc(size) {
                Ok(buf) => return Ok(buf),
                Err(Error::Memory(MemoryError::OutOfMemory { .. })) => {
                    if !warned {
                        tracing::warn!(
                            "arena {} full, queue producer waiting for frees",
                            self.arena.id()
                        );
                        warned = true;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Dequeue the next element, blocking while the queue is empty.
    ///
    /// Data elements have their trailing metadata section extracted and
    /// the buffer resized down to the payload. With `return_buffer` the
    /// caller receives the buffer itself and must free it; otherwise the
    /// payload is copied out and the buffer freed here.
    pub fn get<M: DeserializeOwned>(&self, return_buffer: bool) -> Result<Element<M>> {
        let slot = self.rx.recv().map_err(|_| QueueError::Disconnected)?;
        self.open(slot, return_buffer)
    }

    /// Non-blocking variant of [`get`](Self::get); `None` when empty.
    pub fn try_get<M: DeserializeOwned>(&self, return_buffer: bool) -> Result<Option<Element<M>>> {
        match self.rx.try_recv() {
            Ok(slot) => Ok(Some(self.open(slot, return_buffer)?)),
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => Err(QueueError::Disconnected.into()),
        }
    }

    fn open<M: DeserializeOwned>(&self, slot: Slot, return_buffer: bool) -> Result<Element<M>> {
        match slot {
            Slot::Control(blob) => {
                let meta = rmp_serde::from_slice(&blob).map_err(QueueError::from)?;
                Ok(Element::Control(meta))
            }
            Slot::Data {
                meta_len,
                mut buffer,
            } => {
                let blob = buffer
                    .get(-(meta_len as isize), Some(meta_len))?
                    .ok_or(QueueError::EmptyBuffer)?;
                let meta = rmp_serde::from_slice(&blob).map_err(QueueError::from)?;
                buffer.resize(buffer.size() - meta_len)?;

                let payload = if return_buffer {
                    Payload::Buffer(buffer)
                } else {
                    let data = buffer.get(0, None)?.unwrap_or_default();
                    buffer.free()?;
                    Payload::Bytes(data)
                };
                Ok(Element::Data { payload, meta })
            }
        }
    }

    /// Release the backing arena; outstanding buffers become leaks that
    /// are reported quietly when the arena unmaps.
    pub fn release(&self) {
        self.arena.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tag;

    fn queue(capacity: usize) -> SharedQueue {
        SharedQueue::with_arena(capacity, 2048 * 64, 64).unwrap()
    }

    #[test]
    fn payload_and_meta_roundtrip() {
        let q = queue(4);
        q.put(Some(b"img-bytes"), &vec![Tag::Int(3)], None).unwrap();
        match q.get::<Vec<Tag>>(false).unwrap() {
            Element::Data { payload, meta } => {
                assert_eq!(&payload.into_bytes().unwrap()[..], b"img-bytes");
                assert_eq!(meta, vec![Tag::Int(3)]);
            }
            Element::Control(_) => panic!("expected data element"),
        }
        assert!(q.arena().is_empty());
    }

    #[test]
    fn fifo_order_is_preserved() {
        let q = queue(16);
        for i in 0..10u8 {
            q.put(Some(&[i]), &(i as i64), None).unwrap();
        }
        for i in 0..10u8 {
            match q.get::<i64>(false).unwrap() {
                Element::Data { payload, meta } => {
                    assert_eq!(meta, i as i64);
                    assert_eq!(&payload.into_bytes().unwrap()[..], &[i]);
                }
                Element::Control(_) => panic!("unexpected control element"),
            }
        }
    }

    #[test]
    fn control_elements_skip_the_arena() {
        let q = queue(2);
        q.put_control(&"done".to_string()).unwrap();
        assert!(q.arena().is_empty());
        match q.get::<String>(false).unwrap() {
            Element::Control(msg) => assert_eq!(msg, "done"),
            Element::Data { .. } => panic!("expected control element"),
        }
    }

    #[test]
    fn oversized_metadata_is_rejected() {
        let q = queue(2);
        let blob = vec![0u8; META_BLOB_MAX + 1];
        let err = q.put(Some(b"x"), &blob, None).unwrap_err();
        assert!(matches!(
            err,
            Error::Queue(QueueError::MetadataTooLarge { .. })
        ));
        assert!(q.arena().is_empty());
    }

    #[test]
    fn lower_bound_grows_the_allocation() {
        let q = queue(2);
        q.put(Some(b"tiny"), &(), Some(4 * 64)).unwrap();
        match q.get::<()>(true).unwrap() {
            Element::Data { payload, .. } => match payload {
                Payload::Buffer(mut buf) => {
                    assert!(buf.capacity() >= 4 * 64);
                    assert_eq!(buf.size(), 4);
                    buf.free().unwrap();
                }
                Payload::Bytes(_) => panic!("asked for the buffer"),
            },
            Element::Control(_) => panic!("expected data element"),
        }
        assert!(q.arena().is_empty());
    }

    #[test]
    fn returned_buffer_carries_only_the_payload() {
        let q = queue(2);
        q.put(Some(b"payload"), &vec![Tag::Text("k".into())], None)
            .unwrap();
        match q.get::<Vec<Tag>>(true).unwrap() {
            Element::Data { payload, meta } => {
                assert_eq!(meta, vec![Tag::Text("k".into())]);
                match payload {
                    Payload::Buffer(mut buf) => {
                        assert_eq!(&buf.get(0, None).unwrap().unwrap()[..], b"payload");
                        buf.free().unwrap();
                    }
                    Payload::Bytes(_) => panic!("asked for the buffer"),
                }
            }
            Element::Control(_) => panic!("expected data element"),
        }
    }

    #[test]
    fn try_get_on_empty_queue_is_none() {
        let q = queue(2);
        assert!(q.try_get::<()>(false).unwrap().is_none());
    }

    // Multiset equality across producers and consumers (spec invariant):
    // everything put is returned exactly once.
    #[test]
    fn concurrent_put_get_is_lossless() {
        let q = SharedQueue::with_arena(8, 1024 * 64, 64).unwrap();
        let total = 200u64;
        let producers: Vec<_> = (0..2)
            .map(|p| {
                let q = q.clone();
                std::thread::spawn(move || {
                    for i in 0..total / 2 {
                        let v = p * 1000 + i;
                        q.put(Some(&v.to_le_bytes()), &v, None).unwrap();
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        for _ in 0..total {
            match q.get::<u64>(false).unwrap() {
                Element::Data { payload, meta } => {
                    let bytes = payload.into_bytes().unwrap();
                    assert_eq!(u64::from_le_bytes(bytes[..].try_into().unwrap()), meta);
                    seen.push(meta);
                }
                Element::Control(_) => panic!("unexpected control element"),
            }
        }
        for p in producers {
            p.join().unwrap();
        }
        seen.sort_unstable();
        let mut expected: Vec<u64> = (0..total / 2).flat_map(|i| [i, 1000 + i]).collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
        assert!(q.arena().is_empty());
    }
}

//! Lazy producer/consumer stream primitives.
//!
//! Every agent in this crate communicates through [`StreamReader`]s: bounded,
//! single-reader sequences of `Result` chunks produced by a cooperative task.
//! On top of the basic pipe this module provides [`StreamReader::copy`]
//! (splitting one stream into independent readers over a shared upstream),
//! [`convert`] (map/filter with panic capture), and [`merge`] /
//! [`merge_named`] fan-in.
//!
//! Dropping a reader closes it, so an abandoned consumer always releases its
//! producer; explicit [`StreamReader::close`] is idempotent and composes with
//! drop.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::stream::Stream;
use tokio::sync::{Mutex, OnceCell, mpsc};

use crate::error::Error;

/// One chunk flowing through a stream: a value or an in-band error.
pub type StreamItem<T> = Result<T, Error>;

/// Create a bounded pipe.
///
/// The writer side never blocks until `capacity` chunks are in flight. A
/// capacity of zero is rounded up to one.
#[must_use]
pub fn pipe<T: Send + 'static>(capacity: usize) -> (StreamWriter<T>, StreamReader<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        StreamWriter { tx },
        StreamReader {
            inner: Box::new(ChannelRecv { rx }),
        },
    )
}

/// The producing half of a pipe.
pub struct StreamWriter<T> {
    tx: mpsc::Sender<StreamItem<T>>,
}

impl<T> Clone for StreamWriter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> fmt::Debug for StreamWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriter")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<T: Send + 'static> StreamWriter<T> {
    /// Send one chunk downstream.
    ///
    /// Returns `true` when the reader has closed; the producer should stop.
    pub async fn send(&self, item: StreamItem<T>) -> bool {
        self.tx.send(item).await.is_err()
    }

    /// Whether the reader has closed the pipe.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Close the writer side. Buffered chunks remain readable.
    pub fn close(self) {}
}

/// The consuming half of a stream.
///
/// Exactly one reader owns each underlying sequence; use
/// [`StreamReader::copy`] to fan a stream out to several readers.
pub struct StreamReader<T> {
    inner: Box<dyn Recv<T>>,
}

impl<T> fmt::Debug for StreamReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> StreamReader<T> {
    /// Build a reader over an in-memory sequence.
    #[must_use]
    pub fn from_iter<I: IntoIterator<Item = T>>(items: I) -> Self {
        let items: Vec<StreamItem<T>> = items.into_iter().map(Ok).collect();
        Self {
            inner: Box::new(IterRecv {
                items: items.into_iter(),
                closed: false,
            }),
        }
    }

    /// A reader that yields nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_iter(std::iter::empty())
    }

    /// Receive the next chunk; `None` after the producer closes.
    pub async fn recv(&mut self) -> Option<StreamItem<T>> {
        self.inner.recv().await
    }

    /// Close the reader, releasing the producer. Idempotent.
    pub fn close(&mut self) {
        self.inner.close();
    }

    /// Drain the remaining chunks into a vector, stopping at the first
    /// in-band error.
    pub async fn collect(mut self) -> Result<Vec<T>, Error> {
        let mut out = Vec::new();
        while let Some(item) = self.recv().await {
            out.push(item?);
        }
        Ok(out)
    }

    /// Adapt the reader into a [`futures::Stream`].
    pub fn into_stream(mut self) -> impl Stream<Item = StreamItem<T>> + Send {
        async_stream::stream! {
            while let Some(item) = self.recv().await {
                yield item;
            }
        }
    }
}

impl<T: Clone + Send + 'static> StreamReader<T> {
    /// Split this stream into `n` independent readers.
    ///
    /// Each child observes the full remaining sequence in order. The
    /// upstream is consumed lazily into a forward-linked cell chain; each
    /// cell materializes exactly once under a per-cell one-shot latch, and
    /// the upstream closes only after every child has closed.
    #[must_use]
    pub fn copy(self, n: usize) -> Vec<Self> {
        if n <= 1 {
            return vec![self];
        }
        let shared = Arc::new(CopyShared {
            upstream: Mutex::new(Some(self)),
            active: AtomicUsize::new(n),
            done: AtomicBool::new(false),
        });
        let head = Arc::new(CopyCell::new());
        (0..n)
            .map(|_| Self {
                inner: Box::new(CopyRecv {
                    shared: Arc::clone(&shared),
                    cursor: Arc::clone(&head),
                    closed: false,
                }),
            })
            .collect()
    }
}

/// Map a stream through `f`, dropping elements for which `f` returns `None`.
///
/// A panic inside `f` is captured and surfaces as an in-band error chunk
/// before the output closes.
#[must_use]
pub fn convert<S, T, F>(reader: StreamReader<S>, f: F) -> StreamReader<T>
where
    S: Send + 'static,
    T: Send + 'static,
    F: FnMut(S) -> Option<T> + Send + 'static,
{
    StreamReader {
        inner: Box::new(ConvertRecv {
            inner: reader,
            f: Box::new(f),
        }),
    }
}

/// Combine many streams into one, interleaved in arrival order.
#[must_use]
pub fn merge<T: Send + 'static>(readers: Vec<StreamReader<T>>) -> StreamReader<T> {
    let (writer, out) = pipe(readers.len().max(1));
    for mut reader in readers {
        let tx = writer.tx.clone();
        tokio::spawn(async move {
            while let Some(item) = reader.recv().await {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });
    }
    out
}

/// One chunk from a [`merge_named`] stream.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Merged<T> {
    /// A value from the named source.
    Item {
        /// Which source produced the value.
        source: String,
        /// The value itself.
        item: T,
    },
    /// The named source reached end-of-stream; the merged stream continues
    /// until every source has ended.
    SourceEnd {
        /// Which source ended.
        source: String,
    },
}

/// Combine named streams into one, tagging each chunk with its source and
/// surfacing per-source completion as a typed sentinel.
#[must_use]
pub fn merge_named<T: Send + 'static>(
    sources: HashMap<String, StreamReader<T>>,
) -> StreamReader<Merged<T>> {
    let (writer, out) = pipe(sources.len().max(1));
    for (source, mut reader) in sources {
        let tx = writer.tx.clone();
        tokio::spawn(async move {
            while let Some(item) = reader.recv().await {
                let tagged = item.map(|item| Merged::Item {
                    source: source.clone(),
                    item,
                });
                if tx.send(tagged).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(Merged::SourceEnd { source })).await;
        });
    }
    out
}

#[async_trait]
trait Recv<T>: Send {
    async fn recv(&mut self) -> Option<StreamItem<T>>;
    fn close(&mut self);
}

struct ChannelRecv<T> {
    rx: mpsc::Receiver<StreamItem<T>>,
}

#[async_trait]
impl<T: Send> Recv<T> for ChannelRecv<T> {
    async fn recv(&mut self) -> Option<StreamItem<T>> {
        self.rx.recv().await
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

struct IterRecv<T> {
    items: std::vec::IntoIter<StreamItem<T>>,
    closed: bool,
}

#[async_trait]
impl<T: Send> Recv<T> for IterRecv<T> {
    async fn recv(&mut self) -> Option<StreamItem<T>> {
        if self.closed {
            return None;
        }
        self.items.next()
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

struct ConvertRecv<S, T> {
    inner: StreamReader<S>,
    f: Box<dyn FnMut(S) -> Option<T> + Send>,
}

#[async_trait]
impl<S: Send + 'static, T: Send> Recv<T> for ConvertRecv<S, T> {
    async fn recv(&mut self) -> Option<StreamItem<T>> {
        loop {
            let item = self.inner.recv().await?;
            match item {
                Ok(value) => {
                    match std::panic::catch_unwind(AssertUnwindSafe(|| (self.f)(value))) {
                        Ok(Some(mapped)) => return Some(Ok(mapped)),
                        Ok(None) => {}
                        Err(payload) => {
                            self.inner.close();
                            return Some(Err(Error::from_panic("stream convert", &*payload)));
                        }
                    }
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

struct CopyShared<T> {
    upstream: Mutex<Option<StreamReader<T>>>,
    active: AtomicUsize,
    done: AtomicBool,
}

struct CopyCell<T> {
    slot: OnceCell<CellValue<T>>,
}

impl<T> CopyCell<T> {
    fn new() -> Self {
        Self {
            slot: OnceCell::new(),
        }
    }
}

struct CellValue<T> {
    item: Option<StreamItem<T>>,
    next: Option<Arc<CopyCell<T>>>,
}

impl<T> CellValue<T> {
    const fn end() -> Self {
        Self {
            item: None,
            next: None,
        }
    }
}

struct CopyRecv<T> {
    shared: Arc<CopyShared<T>>,
    cursor: Arc<CopyCell<T>>,
    closed: bool,
}

#[async_trait]
impl<T: Clone + Send + 'static> Recv<T> for CopyRecv<T> {
    async fn recv(&mut self) -> Option<StreamItem<T>> {
        if self.closed {
            return None;
        }
        let shared = Arc::clone(&self.shared);
        let cell = Arc::clone(&self.cursor);
        let value = cell
            .slot
            .get_or_init(|| async move {
                if shared.done.load(Ordering::Acquire) {
                    return CellValue::end();
                }
                let mut guard = shared.upstream.lock().await;
                let Some(upstream) = guard.as_mut() else {
                    return CellValue::end();
                };
                match upstream.recv().await {
                    Some(item) => CellValue {
                        item: Some(item),
                        next: Some(Arc::new(CopyCell::new())),
                    },
                    None => {
                        *guard = None;
                        CellValue::end()
                    }
                }
            })
            .await;

        match (&value.item, &value.next) {
            (Some(item), Some(next)) => {
                let item = item.clone();
                self.cursor = Arc::clone(next);
                Some(item)
            }
            _ => {
                self.release();
                None
            }
        }
    }

    fn close(&mut self) {
        self.release();
    }
}

impl<T> CopyRecv<T> {
    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.shared.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.done.store(true, Ordering::Release);
            // Last reader out drops the upstream so a blocked producer is
            // released. If a sibling is mid-materialization the lock is
            // contended and the upstream is dropped at that cell instead.
            if let Ok(mut guard) = self.shared.upstream.try_lock() {
                *guard = None;
            }
        }
    }
}

impl<T> Drop for CopyRecv<T> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_roundtrip() {
        let (writer, mut reader) = pipe::<u32>(4);
        assert!(!writer.send(Ok(1)).await);
        assert!(!writer.send(Ok(2)).await);
        writer.close();

        assert_eq!(reader.recv().await, Some(Ok(1)));
        assert_eq!(reader.recv().await, Some(Ok(2)));
        assert_eq!(reader.recv().await, None);
        assert_eq!(reader.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_after_reader_close_reports_closed() {
        let (writer, mut reader) = pipe::<u32>(1);
        reader.close();
        reader.close();
        assert!(writer.send(Ok(1)).await);
    }

    #[tokio::test]
    async fn test_drop_releases_producer() {
        let (writer, reader) = pipe::<u32>(1);
        drop(reader);
        assert!(writer.send(Ok(1)).await);
    }

    #[tokio::test]
    async fn test_error_chunks_flow_in_band() {
        let (writer, mut reader) = pipe::<u32>(2);
        writer.send(Ok(1)).await;
        writer.send(Err(Error::internal("boom"))).await;
        writer.close();

        assert_eq!(reader.recv().await, Some(Ok(1)));
        assert!(matches!(reader.recv().await, Some(Err(Error::Internal { .. }))));
    }

    #[tokio::test]
    async fn test_copy_children_observe_full_sequence() {
        let reader = StreamReader::from_iter(vec![1, 2, 3]);
        let mut children = reader.copy(3);

        for child in &mut children {
            let mut seen = Vec::new();
            while let Some(item) = child.recv().await {
                seen.push(item.expect("value"));
            }
            assert_eq!(seen, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_copy_children_interleave() {
        let reader = StreamReader::from_iter(vec![1, 2, 3, 4]);
        let mut children = reader.copy(2);
        let mut b = children.pop().expect("second child");
        let mut a = children.pop().expect("first child");

        assert_eq!(a.recv().await, Some(Ok(1)));
        assert_eq!(b.recv().await, Some(Ok(1)));
        assert_eq!(b.recv().await, Some(Ok(2)));
        assert_eq!(a.recv().await, Some(Ok(2)));
        assert_eq!(a.recv().await, Some(Ok(3)));
        assert_eq!(a.recv().await, Some(Ok(4)));
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, Some(Ok(3)));
        assert_eq!(b.recv().await, Some(Ok(4)));
        assert_eq!(b.recv().await, None);
    }

    #[tokio::test]
    async fn test_copy_concurrent_readers() {
        let (writer, reader) = pipe::<u32>(2);
        let children = reader.copy(2);

        let producers = tokio::spawn(async move {
            for i in 0..100 {
                if writer.send(Ok(i)).await {
                    break;
                }
            }
        });

        let mut handles = Vec::new();
        for mut child in children {
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = child.recv().await {
                    seen.push(item.expect("value"));
                }
                seen
            }));
        }

        producers.await.expect("producer");
        let expected: Vec<u32> = (0..100).collect();
        for handle in handles {
            assert_eq!(handle.await.expect("reader"), expected);
        }
    }

    #[tokio::test]
    async fn test_copy_close_releases_upstream() {
        let (writer, reader) = pipe::<u32>(1);
        let mut children = reader.copy(2);
        for child in &mut children {
            child.close();
        }
        assert!(writer.send(Ok(1)).await);
    }

    #[tokio::test]
    async fn test_convert_maps_and_drops() {
        let reader = StreamReader::from_iter(vec![1, 2, 3, 4]);
        let mut mapped = convert(reader, |n| (n % 2 == 0).then(|| n * 10));
        assert_eq!(mapped.recv().await, Some(Ok(20)));
        assert_eq!(mapped.recv().await, Some(Ok(40)));
        assert_eq!(mapped.recv().await, None);
    }

    #[tokio::test]
    async fn test_convert_captures_panic() {
        let reader = StreamReader::from_iter(vec![1, 2]);
        let mut mapped = convert(reader, |n: u32| {
            assert!(n < 2, "conversion blew up");
            Some(n)
        });
        assert_eq!(mapped.recv().await, Some(Ok(1)));
        assert!(matches!(mapped.recv().await, Some(Err(Error::Panic { .. }))));
    }

    #[tokio::test]
    async fn test_merge_yields_everything() {
        let a = StreamReader::from_iter(vec![1, 2]);
        let b = StreamReader::from_iter(vec![3, 4]);
        let merged = merge(vec![a, b]);
        let mut all = merged.collect().await.expect("collect");
        all.sort_unstable();
        assert_eq!(all, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_merge_named_tags_and_signals_source_end() {
        let mut sources = HashMap::new();
        sources.insert("a".to_owned(), StreamReader::from_iter(vec![1]));
        let mut merged = merge_named(sources);

        assert_eq!(
            merged.recv().await,
            Some(Ok(Merged::Item {
                source: "a".to_owned(),
                item: 1
            }))
        );
        assert_eq!(
            merged.recv().await,
            Some(Ok(Merged::SourceEnd {
                source: "a".to_owned()
            }))
        );
        assert_eq!(merged.recv().await, None);
    }

    #[test]
    fn test_recv_is_pending_until_a_chunk_arrives() {
        let (writer, mut reader) = pipe::<u32>(1);
        let mut recv = tokio_test::task::spawn(reader.recv());
        tokio_test::assert_pending!(recv.poll());

        tokio_test::block_on(writer.send(Ok(7)));
        assert!(recv.is_woken());
        tokio_test::assert_ready_eq!(recv.poll(), Some(Ok(7)));
    }

    #[tokio::test]
    async fn test_into_stream_interop() {
        use futures::StreamExt;
        let reader = StreamReader::from_iter(vec![1, 2, 3]);
        let collected: Vec<u32> = reader
            .into_stream()
            .map(|item| item.expect("value"))
            .collect()
            .await;
        assert_eq!(collected, vec![1, 2, 3]);
    }
}

//! Replayable token streams: `StreamedPromise` and `StreamAppender`.
//!
//! A [`StreamedPromise`] is a promise whose whole value is assembled from a
//! stream of pieces — and whose stream can be **replayed**. Pieces are kept
//! in an append-only buffer; every [`StreamCursor`] starts at index zero and
//! advances independently. When a cursor runs past the buffer it takes the
//! shared producer lock and advances the underlying streamer by exactly one
//! piece, so the producer is driven **at most once per distinct piece** no
//! matter how many consumers there are.
//!
//! Errors thrown by the streamer are captured *into* the buffer at their
//! position and replayed just like pieces; the end-of-stream marker always
//! terminates the buffer. With `start_soon` in effect, a background drainer
//! moves the streamer into an internal queue so production begins before the
//! first consumer shows up.
//!
//! A [`StreamAppender`] is the producer-side handle: a streamer you can hold
//! on to and `append` pieces through, with a strict unopened → open → closed
//! lifecycle.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{Error, Result};
use crate::promise::{Promise, Resolvable};
use crate::runtime::PromisingContext;

/// Stream of pieces feeding a [`StreamedPromise`].
pub type PieceStream<P> = BoxStream<'static, Result<P>>;

enum PieceEntry<P> {
    Piece(P),
    Failed(Error),
    End,
}

impl<P: Clone> Clone for PieceEntry<P> {
    fn clone(&self) -> Self {
        match self {
            PieceEntry::Piece(p) => PieceEntry::Piece(p.clone()),
            PieceEntry::Failed(e) => PieceEntry::Failed(e.clone()),
            PieceEntry::End => PieceEntry::End,
        }
    }
}

pub(crate) enum QueueItem<P> {
    Item(Result<P>),
    End,
}

enum Producer<P> {
    /// Lazy mode: the streamer itself, advanced on demand
    Direct(PieceStream<P>),
    /// Eager mode: a background drainer feeds this queue
    Queue(UnboundedReceiver<QueueItem<P>>),
    Exhausted,
}

struct StreamInner<P> {
    pieces: StdMutex<Vec<PieceEntry<P>>>,
    done: AtomicBool,
    producer: tokio::sync::Mutex<Producer<P>>,
}

/// A promise of a whole value streamed piece by piece, replayably.
///
/// Cloning shares the buffer, the producer and the whole-value promise.
pub struct StreamedPromise<P, W: Resolvable> {
    stream: Arc<StreamInner<P>>,
    promise: Promise<W>,
}

impl<P, W: Resolvable> Clone for StreamedPromise<P, W> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            promise: self.promise.clone(),
        }
    }
}

impl<P, W> StreamedPromise<P, W>
where
    P: Clone + Send + 'static,
    W: Resolvable,
{
    /// Wire a streamer and a whole-value resolver together.
    ///
    /// The resolver receives a fresh cursor over the (replayable) pieces and
    /// runs at most once, under the promise's single-entry lock.
    pub fn new<S, F, Fut>(streamer: S, resolver: F, start_soon: Option<bool>) -> Result<Self>
    where
        S: Stream<Item = Result<P>> + Send + 'static,
        F: FnOnce(StreamCursor<P>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<W>> + Send + 'static,
    {
        let context = PromisingContext::current()?;
        let start_soon = start_soon.unwrap_or_else(|| context.start_everything_soon_by_default());

        let producer = if start_soon {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut streamer = streamer.boxed();
            context.start_soon(async move {
                while let Some(item) = streamer.next().await {
                    if tx.send(QueueItem::Item(item)).is_err() {
                        return Ok(());
                    }
                }
                let _ = tx.send(QueueItem::End);
                Ok(())
            });
            Producer::Queue(rx)
        } else {
            Producer::Direct(streamer.boxed())
        };

        let stream = Arc::new(StreamInner {
            pieces: StdMutex::new(Vec::new()),
            done: AtomicBool::new(false),
            producer: tokio::sync::Mutex::new(producer),
        });

        let cursor_source = stream.clone();
        let promise = Promise::with_options(
            move || resolver(StreamCursor::new(cursor_source)),
            Some(start_soon),
        )?;

        Ok(Self { stream, promise })
    }

    /// A streamed promise whose pieces and whole value are already known.
    pub fn prefilled(pieces: Vec<P>, whole: W) -> Result<Self> {
        let mut entries: Vec<PieceEntry<P>> = pieces.into_iter().map(PieceEntry::Piece).collect();
        entries.push(PieceEntry::End);

        Ok(Self {
            stream: Arc::new(StreamInner {
                pieces: StdMutex::new(entries),
                done: AtomicBool::new(true),
                producer: tokio::sync::Mutex::new(Producer::Exhausted),
            }),
            promise: Promise::prefilled(whole)?,
        })
    }

    /// Build from the consuming side of an appender.
    pub fn from_appender<F, Fut>(
        appender: &StreamAppender<P>,
        resolver: F,
        start_soon: Option<bool>,
    ) -> Result<Self>
    where
        F: FnOnce(StreamCursor<P>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<W>> + Send + 'static,
    {
        Self::new(appender.take_stream()?, resolver, start_soon)
    }

    /// Fresh replay cursor starting at the first piece.
    pub fn cursor(&self) -> StreamCursor<P> {
        StreamCursor::new(self.stream.clone())
    }

    /// Fresh replay cursor exposed as a `Stream`. The stream owns its
    /// cursor, so it does not borrow from `self`.
    pub fn piece_stream(&self) -> impl Stream<Item = Result<P>> + Send + use<P, W> {
        self.cursor().into_stream()
    }

    /// Whether the end-of-stream marker has been buffered.
    pub fn all_pieces_consumed(&self) -> bool {
        self.stream.done.load(Ordering::SeqCst)
    }

    /// Await the whole value (runs the resolver on first call).
    pub async fn resolve(&self) -> Result<W> {
        self.promise.resolve().await
    }

    /// The underlying whole-value promise.
    pub fn whole(&self) -> &Promise<W> {
        &self.promise
    }
}

impl<P, W: Resolvable> std::fmt::Debug for StreamedPromise<P, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buffered = self
            .stream
            .pieces
            .lock()
            .map(|p| p.len())
            .unwrap_or_default();
        f.debug_struct("StreamedPromise")
            .field("buffered_pieces", &buffered)
            .field("all_pieces_consumed", &self.stream.done.load(Ordering::SeqCst))
            .finish()
    }
}

/// Independent replay cursor over a streamed promise.
///
/// Cursors never see gaps or reordering: each one observes the pieces in
/// append order from the beginning. One cursor may lead another, and the
/// leader is the one that drives the producer.
pub struct StreamCursor<P> {
    inner: Arc<StreamInner<P>>,
    index: usize,
}

impl<P: Clone + Send + 'static> StreamCursor<P> {
    fn new(inner: Arc<StreamInner<P>>) -> Self {
        Self { inner, index: 0 }
    }

    /// Next piece: `Some(Ok(piece))`, a captured `Some(Err(..))` replayed at
    /// its original position, or `None` at end of stream (idempotent).
    pub async fn next(&mut self) -> Option<Result<P>> {
        if let Some(step) = self.buffered_step() {
            return step;
        }

        let inner = self.inner.clone();
        let mut producer = inner.producer.lock().await;

        // Another cursor may have produced this piece while we waited.
        if let Some(step) = self.buffered_step() {
            return step;
        }

        let item: Option<Result<P>> = match &mut *producer {
            Producer::Direct(streamer) => streamer.next().await,
            Producer::Queue(queue) => match queue.recv().await {
                Some(QueueItem::Item(item)) => Some(item),
                Some(QueueItem::End) | None => None,
            },
            Producer::Exhausted => None,
        };

        let entry = match item {
            Some(Ok(piece)) => PieceEntry::Piece(piece),
            Some(Err(error)) => PieceEntry::Failed(error),
            None => PieceEntry::End,
        };
        let ended = matches!(entry, PieceEntry::End);

        self.inner
            .pieces
            .lock()
            .expect("piece buffer poisoned")
            .push(entry);

        if ended {
            self.inner.done.store(true, Ordering::SeqCst);
            *producer = Producer::Exhausted;
        }
        drop(producer);

        self.buffered_step()
            .expect("the freshly produced piece must be buffered")
    }

    /// Step over the buffer if the cursor's position is already covered.
    /// Outer `Some` means "answer available without producing".
    #[allow(clippy::option_option)]
    fn buffered_step(&mut self) -> Option<Option<Result<P>>> {
        let pieces = self.inner.pieces.lock().expect("piece buffer poisoned");
        if self.index >= pieces.len() {
            return None;
        }
        match &pieces[self.index] {
            PieceEntry::Piece(piece) => {
                self.index += 1;
                Some(Some(Ok(piece.clone())))
            }
            PieceEntry::Failed(error) => {
                self.index += 1;
                Some(Some(Err(error.clone())))
            }
            PieceEntry::End => Some(None),
        }
    }

    /// Adapt the cursor into a `futures` stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<P>> + Send {
        futures::stream::unfold(self, |mut cursor| async move {
            cursor.next().await.map(|item| (item, cursor))
        })
    }
}

const APPENDER_UNOPENED: u8 = 0;
const APPENDER_OPEN: u8 = 1;
const APPENDER_CLOSED: u8 = 2;

struct AppenderInner<P> {
    tx: UnboundedSender<QueueItem<P>>,
    rx: StdMutex<Option<UnboundedReceiver<QueueItem<P>>>>,
    state: AtomicU8,
    ever_opened: AtomicBool,
    capture_errors: bool,
}

impl<P> Drop for AppenderInner<P> {
    fn drop(&mut self) {
        // End sentinel even on panic or a forgotten close().
        if self.state.swap(APPENDER_CLOSED, Ordering::SeqCst) == APPENDER_OPEN {
            let _ = self.tx.send(QueueItem::End);
        }
    }
}

/// Producer-side write handle for a streamed promise.
///
/// Clones share the same channel and lifecycle state. The consuming stream
/// can be taken exactly once (usually by [`StreamedPromise::from_appender`]).
///
/// Prefer [`StreamAppender::scope`] over manual `open`/`close`: forgetting to
/// close leaves consumers waiting forever, and `scope` also implements the
/// capture-errors contract.
pub struct StreamAppender<P> {
    inner: Arc<AppenderInner<P>>,
}

impl<P> Clone for StreamAppender<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Send + 'static> StreamAppender<P> {
    /// New appender; `capture_errors` falls back to the context default.
    pub fn new(capture_errors: Option<bool>) -> Result<Self> {
        let context = PromisingContext::current()?;
        let capture_errors =
            capture_errors.unwrap_or_else(|| context.appenders_capture_errors_by_default());
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(AppenderInner {
                tx,
                rx: StdMutex::new(Some(rx)),
                state: AtomicU8::new(APPENDER_UNOPENED),
                ever_opened: AtomicBool::new(false),
                capture_errors,
            }),
        })
    }

    /// Open for appending. Reopening after close fails.
    pub fn open(&self) -> Result<()> {
        match self.inner.state.compare_exchange(
            APPENDER_UNOPENED,
            APPENDER_OPEN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.inner.ever_opened.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(APPENDER_OPEN) => Ok(()),
            Err(_) => Err(Error::appender_closed(
                "once closed, an appender cannot be opened again",
            )),
        }
    }

    /// True if `open` ever succeeded, even if the appender has closed since.
    pub fn was_open(&self) -> bool {
        self.inner.ever_opened.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == APPENDER_OPEN
    }

    /// Append one piece. Fails outside the open state.
    pub fn append(&self, piece: P) -> Result<()> {
        self.check_open()?;
        let _ = self.inner.tx.send(QueueItem::Item(Ok(piece)));
        Ok(())
    }

    /// Append an error as an in-band piece of the stream.
    pub fn append_error(&self, error: Error) -> Result<()> {
        self.check_open()?;
        let _ = self.inner.tx.send(QueueItem::Item(Err(error)));
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        match self.inner.state.load(Ordering::SeqCst) {
            APPENDER_OPEN => Ok(()),
            APPENDER_UNOPENED => Err(Error::appender_not_open(
                "wrap the producing code in `appender.scope(..)` or call open() first",
            )),
            _ => Err(Error::appender_closed(
                "the appender has already been closed for appending",
            )),
        }
    }

    /// Close for appending and enqueue the end-of-stream marker. Idempotent.
    pub fn close(&self) {
        if self.inner.state.swap(APPENDER_CLOSED, Ordering::SeqCst) != APPENDER_CLOSED {
            let _ = self.inner.tx.send(QueueItem::End);
        }
    }

    /// Scoped acquisition: open, run `body`, close — always.
    ///
    /// With `capture_errors` on, a failure of `body` (other than
    /// `AppenderClosed`) is appended as an in-band error piece instead of
    /// propagating; in strict mode it propagates after the close.
    pub async fn scope<F, Fut>(&self, body: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.open()?;
        let outcome = body().await;
        match outcome {
            Err(error)
                if self.inner.capture_errors && !matches!(error, Error::AppenderClosed(_)) =>
            {
                tracing::debug!(error = %error, "capturing a producer error into the stream");
                if self.append_error(error).is_err() {
                    tracing::error!(
                        "an appender could not capture an error because it was already closed"
                    );
                }
                self.close();
                Ok(())
            }
            outcome => {
                self.close();
                outcome
            }
        }
    }

    /// Take the consuming side. Can only be taken once.
    pub fn take_stream(&self) -> Result<PieceStream<P>> {
        let receiver = self
            .inner
            .rx
            .lock()
            .expect("appender receiver slot poisoned")
            .take()
            .ok_or_else(|| {
                Error::invalid_input("the consuming side of this appender was already taken")
            })?;

        Ok(UnboundedReceiverStream::new(receiver)
            .scan((), |_, item| {
                futures::future::ready(match item {
                    QueueItem::Item(result) => Some(result),
                    QueueItem::End => None,
                })
            })
            .boxed())
    }
}

impl<P> std::fmt::Debug for StreamAppender<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.inner.state.load(Ordering::SeqCst) {
            APPENDER_UNOPENED => "unopened",
            APPENDER_OPEN => "open",
            _ => "closed",
        };
        f.debug_struct("StreamAppender").field("state", &state).finish()
    }
}

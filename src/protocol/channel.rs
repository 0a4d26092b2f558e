//! Two-way message channel bound to one connection.
//!
//! A [`Channel`] turns a framed byte stream into four ways of talking to the peer:
//!
//! - [`send_one_way_message`](Channel::send_one_way_message): fire and forget, with a
//!   callback reporting whether the frame was written.
//! - [`send_reply_message`](Channel::send_reply_message): answer a message received
//!   from the peer.
//! - [`send_message_with_async_reply`](Channel::send_message_with_async_reply): send a
//!   request and get its reply through a callback.
//! - [`send_message_with_reply`](Channel::send_message_with_reply): send a request and
//!   block until the reply arrives or the timeout elapses.
//!
//! Requests awaiting a reply are kept in a pending table keyed by message id. Every
//! inbound message either resolves exactly one pending entry (when its
//! `reply_message_id` matches) or is handed to the [`ChannelEventListener`]. When the
//! channel closes or fails, every pending entry is failed, so no caller waits forever.
//!
//! # Threads
//!
//! Sends only encode and enqueue; a single writer thread per channel owns the socket's
//! write half. The connection's read loop delivers inbound messages to the listener in
//! wire order. Reply and write-completion callbacks run on the callback pool, so a
//! callback may freely send on the same channel.
use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use log::{debug, info, trace, warn};

use crate::message::Message;

use super::{
    ChannelError,
    codec::FrameCodec,
    thread::ThreadPool,
    transport::{FrameSink, WireControl},
};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Receives what the peer sends that is not a reply, plus the channel's end of life.
///
/// `message_received` runs on the connection's read loop: messages arrive in the order
/// the peer wrote them, and no further message is read until it returns. Blocking in
/// it on [`Channel::send_message_with_reply`] for the same channel stalls that channel
/// until the timeout elapses; use the async variant instead.
///
/// At most one of `channel_closed` and `exception_caught` is invoked per channel.
pub trait ChannelEventListener: Send + Sync {
    fn message_received(&self, channel: &Channel, message: Message);

    fn channel_closed(&self, _channel: &Channel) {}

    fn exception_caught(&self, _channel: &Channel, _error: &ChannelError) {}
}

impl<F> ChannelEventListener for F
where
    F: Fn(&Channel, Message) + Send + Sync,
{
    fn message_received(&self, channel: &Channel, message: Message) {
        self(channel, message)
    }
}

type ReplyCallback = Box<dyn FnOnce(Message, Result<Message, ChannelError>) + Send + 'static>;

type WriteCompletion = Box<dyn FnOnce(Result<(), ChannelError>) + Send + 'static>;

enum ReplyHandler {
    Callback(ReplyCallback),
    Waiter(mpsc::SyncSender<Result<Message, ChannelError>>),
}

struct PendingReply {
    original: Message,
    handler: ReplyHandler,
}

struct Outbound {
    frame: Vec<u8>,
    done: WriteCompletion,
}

struct Inner {
    id: u64,
    peer: String,
    codec: FrameCodec,
    listener: Arc<dyn ChannelEventListener>,
    pool: Arc<ThreadPool>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    pending: Mutex<HashMap<String, PendingReply>>,
    next_message_id: AtomicU64,
    closed: AtomicBool,
    control: Option<WireControl>,
}

#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel#{}({})", self.inner.id, self.inner.peer)
    }
}

impl Channel {
    pub(crate) fn open(
        peer: impl Into<String>,
        codec: FrameCodec,
        listener: Arc<dyn ChannelEventListener>,
        pool: Arc<ThreadPool>,
        sink: impl FrameSink,
        control: Option<WireControl>,
    ) -> io::Result<Self> {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel();

        let inner = Arc::new(Inner {
            id,
            peer: peer.into(),
            codec,
            listener,
            pool,
            outbound: Mutex::new(Some(sender)),
            pending: Mutex::new(HashMap::new()),
            next_message_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            control,
        });

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name(format!("cachewire-writer-{id}"))
            .spawn(move || write_loop(weak, receiver, sink))?;

        Ok(Self { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn is_valid(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn pending_replies(&self) -> usize {
        self.pending().len()
    }

    pub fn send_one_way_message<F>(&self, mut message: Message, callback: F)
    where
        F: FnOnce(Result<(), ChannelError>) + Send + 'static,
    {
        self.assign_message_id(&mut message);
        trace!("{self} sending one-way {message}");

        let pool = Arc::clone(&self.inner.pool);
        let done: WriteCompletion = Box::new(move |res| pool.execute(move || callback(res)));
        match self.inner.codec.encode(&message) {
            Ok(frame) => self.enqueue(frame, done),
            Err(e) => done(Err(ChannelError::Encode(Arc::new(e)))),
        }
    }

    pub fn send_reply_message(
        &self,
        in_answer_to: &Message,
        mut message: Message,
    ) -> Result<(), ChannelError> {
        match in_answer_to.message_id() {
            Some(id) => {
                message.set_reply_message_id(id);
            }
            None => warn!("{self} answering a message without id: {in_answer_to}"),
        }
        self.assign_message_id(&mut message);
        trace!("{self} sending reply {message}");

        let frame = self
            .inner
            .codec
            .encode(&message)
            .map_err(|e| ChannelError::Encode(Arc::new(e)))?;

        let (sender, receiver) = mpsc::sync_channel(1);
        let peer = self.to_string();
        self.enqueue(
            frame,
            Box::new(move |res| {
                if let Err(e) = &res {
                    debug!("{peer} failed to write reply: {e}");
                }
                let _ = sender.try_send(res);
            }),
        );

        // Only an immediate rejection is reported; the write itself stays asynchronous.
        match receiver.try_recv() {
            Ok(Err(ChannelError::Closed)) => Err(ChannelError::Closed),
            _ => Ok(()),
        }
    }

    /// Sends a request and returns at once. `callback` receives the original message
    /// and either the peer's reply or the error that ended the wait; it runs exactly
    /// once, on the callback pool.
    pub fn send_message_with_async_reply<F>(&self, message: Message, callback: F)
    where
        F: FnOnce(Message, Result<Message, ChannelError>) + Send + 'static,
    {
        self.send_with_pending(message, ReplyHandler::Callback(Box::new(callback)));
    }

    /// Sends a request and blocks until its reply arrives.
    ///
    /// Returns [`ChannelError::Timeout`] when nothing arrives within `timeout`; a reply
    /// showing up afterwards is discarded. If the channel closes or fails while
    /// waiting, the error that ended it is returned.
    pub fn send_message_with_reply(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, ChannelError> {
        let (sender, receiver) = mpsc::sync_channel(1);
        let id = self.send_with_pending(message, ReplyHandler::Waiter(sender));

        match receiver.recv_timeout(timeout) {
            Ok(res) => res,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if self.take_pending(&id).is_some() {
                    debug!("{self} gave up waiting for reply to {id} after {timeout:?}");
                    return Err(ChannelError::Timeout(timeout));
                }
                // Resolved concurrently with the timeout; the result is on its way.
                receiver.recv().unwrap_or(Err(ChannelError::Closed))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ChannelError::Closed),
        }
    }

    /// Closes the channel. Pending requests fail with [`ChannelError::Closed`] and later
    /// sends fail fast. Calling it again has no effect.
    pub fn close(&self) {
        self.teardown(None);
    }

    pub(crate) fn message_received(&self, message: Message) {
        if let Some(reply_to) = message.reply_message_id() {
            match self.take_pending(reply_to) {
                Some(pending) => {
                    trace!("{self} received reply {message}");
                    self.resolve(pending, Ok(message));
                }
                None => warn!("{self} dropping reply to unknown or expired message: {message}"),
            }
            return;
        }

        trace!("{self} received {message}");
        if !message.conforms_to_schema() {
            warn!("{self} received {} missing expected parameters", message.kind());
        }
        self.inner.listener.message_received(self, message);
    }

    pub(crate) fn exception_caught(&self, error: ChannelError) {
        self.teardown(Some(error));
    }

    pub(crate) fn channel_closed(&self) {
        self.teardown(None);
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingReply>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_pending(&self, id: &str) -> Option<PendingReply> {
        self.pending().remove(id)
    }

    fn assign_message_id(&self, message: &mut Message) -> String {
        let seq = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{seq}", self.inner.id);
        message.set_message_id(id.clone());
        id
    }

    fn send_with_pending(&self, mut message: Message, handler: ReplyHandler) -> String {
        let id = self.assign_message_id(&mut message);
        trace!("{self} sending request {message}");

        let frame = match self.inner.codec.encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                let pending = PendingReply {
                    original: message,
                    handler,
                };
                self.resolve(pending, Err(ChannelError::Encode(Arc::new(e))));
                return id;
            }
        };

        {
            let mut table = self.pending();
            // Checked under the table lock: teardown flips the flag before draining.
            if !self.is_valid() {
                drop(table);
                let pending = PendingReply {
                    original: message,
                    handler,
                };
                self.resolve(pending, Err(ChannelError::Closed));
                return id;
            }
            table.insert(
                id.clone(),
                PendingReply {
                    original: message,
                    handler,
                },
            );
        }

        let channel = Arc::downgrade(&self.inner);
        let pending_id = id.clone();
        self.enqueue(
            frame,
            Box::new(move |res| {
                let (Err(e), Some(inner)) = (res, channel.upgrade()) else {
                    return;
                };
                let channel = Channel { inner };
                if let Some(pending) = channel.take_pending(&pending_id) {
                    channel.resolve(pending, Err(e));
                }
            }),
        );
        id
    }

    fn resolve(&self, pending: PendingReply, result: Result<Message, ChannelError>) {
        match pending.handler {
            ReplyHandler::Waiter(sender) => {
                let _ = sender.try_send(result);
            }
            ReplyHandler::Callback(callback) => {
                let original = pending.original;
                self.inner.pool.execute(move || callback(original, result));
            }
        }
    }

    fn enqueue(&self, frame: Vec<u8>, done: WriteCompletion) {
        let outbound = self
            .inner
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(sender) = outbound.as_ref() else {
            drop(outbound);
            done(Err(ChannelError::Closed));
            return;
        };
        if let Err(mpsc::SendError(rejected)) = sender.send(Outbound { frame, done }) {
            drop(outbound);
            (rejected.done)(Err(ChannelError::Closed));
        }
    }

    fn teardown(&self, cause: Option<ChannelError>) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<PendingReply> = self.pending().drain().map(|(_, p)| p).collect();

        // Queued frames still get their completion, with `Closed`, from the writer.
        self.inner
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(control) = &self.inner.control {
            if let Err(e) = control.shutdown() {
                debug!("{self} socket shutdown failed: {e}");
            }
        }

        let failure = cause.clone().unwrap_or(ChannelError::Closed);
        if !drained.is_empty() {
            debug!("{self} failing {} pending replies: {failure}", drained.len());
        }
        for pending in drained {
            self.resolve(pending, Err(failure.clone()));
        }

        match cause {
            Some(error) => {
                warn!("{self} failed: {error}");
                self.inner.listener.exception_caught(self, &error);
            }
            None => {
                info!("{self} closed");
                self.inner.listener.channel_closed(self);
            }
        }
    }
}

fn write_loop(channel: Weak<Inner>, receiver: mpsc::Receiver<Outbound>, mut sink: impl FrameSink) {
    while let Ok(Outbound { frame, done }) = receiver.recv() {
        let Some(inner) = channel.upgrade() else {
            done(Err(ChannelError::Closed));
            continue;
        };
        let channel = Channel { inner };
        if !channel.is_valid() {
            done(Err(ChannelError::Closed));
            continue;
        }

        match sink.write_frame(&frame) {
            Ok(()) => done(Ok(())),
            Err(e) => {
                let error = ChannelError::from(e);
                channel.exception_caught(error.clone());
                done(Err(error));
            }
        }
    }
}

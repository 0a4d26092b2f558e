//! Byte streams underneath a channel.
//!
//! A [`Wire`] is either a plain TCP stream or TLS over TCP. Once connected it is split
//! into a read half, owned by the connection's read loop, and a write half, owned by
//! the connection's writer thread.
//!
//! For TLS both halves share the rustls session. The session lock is only held while
//! records are encrypted or decrypted; outgoing records are queued in an outbox under
//! that lock and written to the socket afterwards, by whichever half holds the socket's
//! write lock. The read half never waits for that lock, so a writer blocked on a full
//! socket cannot keep the read loop from draining the peer.
use std::{
    io::{self, Read, Write},
    mem,
    net::{Shutdown, TcpStream},
    sync::{Arc, Mutex, MutexGuard, TryLockError},
};

use log::trace;

use crate::message::Message;

use super::{
    ChannelError,
    codec::{FrameCodec, FrameDecoder},
};

const READ_CHUNK: usize = 16 * 1024;

pub(crate) struct TlsState {
    session: rustls::Connection,
    outbox: Vec<u8>,
}

impl TlsState {
    fn queue_records(&mut self) -> io::Result<usize> {
        let mut queued = 0;
        while self.session.wants_write() {
            queued += self.session.write_tls(&mut self.outbox)?;
        }
        Ok(queued)
    }
}

pub(crate) struct TlsShared {
    state: Mutex<TlsState>,
    tcp: Mutex<TcpStream>,
}

impl TlsShared {
    fn state(&self) -> io::Result<MutexGuard<'_, TlsState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::other("TLS session state poisoned"))
    }

    /// Writes queued records to the socket. With `wait` unset this gives up when
    /// another thread holds the socket; that thread picks the records up before it
    /// lets go.
    fn flush(&self, wait: bool) -> io::Result<()> {
        loop {
            {
                let mut tcp = match self.tcp.try_lock() {
                    Ok(tcp) => tcp,
                    Err(TryLockError::WouldBlock) if !wait => return Ok(()),
                    Err(TryLockError::WouldBlock) => self
                        .tcp
                        .lock()
                        .map_err(|_| io::Error::other("TLS socket poisoned"))?,
                    Err(TryLockError::Poisoned(_)) => {
                        return Err(io::Error::other("TLS socket poisoned"));
                    }
                };
                let pending = mem::take(&mut self.state()?.outbox);
                if !pending.is_empty() {
                    tcp.write_all(&pending)?;
                    tcp.flush()?;
                    continue;
                }
            }

            // Records queued while the socket was held by us.
            if self.state()?.outbox.is_empty() {
                return Ok(());
            }
        }
    }
}

pub(crate) enum Wire {
    Plain(TcpStream),
    Tls {
        session: rustls::Connection,
        tcp: TcpStream,
    },
}

impl Wire {
    pub fn tls(mut session: rustls::Connection, mut tcp: TcpStream) -> io::Result<Self> {
        while session.is_handshaking() {
            session.complete_io(&mut tcp)?;
        }
        while session.wants_write() {
            session.write_tls(&mut tcp)?;
        }
        Ok(Wire::Tls { session, tcp })
    }

    pub fn tcp(&self) -> &TcpStream {
        match self {
            Wire::Plain(tcp) | Wire::Tls { tcp, .. } => tcp,
        }
    }

    pub fn split(self) -> io::Result<(WireReader, WireWriter, WireControl)> {
        match self {
            Wire::Plain(tcp) => {
                let writer = tcp.try_clone()?;
                let control = tcp.try_clone()?;
                Ok((
                    WireReader::Plain(tcp),
                    WireWriter::Plain(writer),
                    WireControl { tcp: control, tls: None },
                ))
            }
            Wire::Tls { session, tcp } => {
                let shared = Arc::new(TlsShared {
                    state: Mutex::new(TlsState {
                        session,
                        outbox: Vec::new(),
                    }),
                    tcp: Mutex::new(tcp.try_clone()?),
                });
                let reader = TlsReader {
                    shared: Arc::clone(&shared),
                    tcp: tcp.try_clone()?,
                    raw: vec![0; READ_CHUNK].into_boxed_slice(),
                    start: 0,
                    end: 0,
                };
                Ok((
                    WireReader::Tls(reader),
                    WireWriter::Tls(Arc::clone(&shared)),
                    WireControl { tcp, tls: Some(shared) },
                ))
            }
        }
    }
}

pub(crate) enum WireReader {
    Plain(TcpStream),
    Tls(TlsReader),
}

impl Read for WireReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            WireReader::Plain(tcp) => tcp.read(buf),
            WireReader::Tls(reader) => reader.read(buf),
        }
    }
}

pub(crate) struct TlsReader {
    shared: Arc<TlsShared>,
    tcp: TcpStream,
    raw: Box<[u8]>,
    start: usize,
    end: usize,
}

impl Read for TlsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut state = self.shared.state()?;
                match state.session.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }

            if self.start < self.end {
                let queued = {
                    let mut state = self.shared.state()?;
                    let mut pending = &self.raw[self.start..self.end];
                    let consumed = state.session.read_tls(&mut pending)?;
                    self.start += consumed;
                    state
                        .session
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    state.queue_records()?
                };
                if queued > 0 {
                    self.shared.flush(false)?;
                }
                continue;
            }

            let n = self.tcp.read(&mut self.raw)?;
            if n == 0 {
                return Ok(0);
            }
            trace!("read {n} TLS bytes");
            self.start = 0;
            self.end = n;
        }
    }
}

pub(crate) enum WireWriter {
    Plain(TcpStream),
    Tls(Arc<TlsShared>),
}

/// Destination of encoded frames, driven by a single writer thread per channel so
/// frames never interleave.
pub(crate) trait FrameSink: Send + 'static {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

impl FrameSink for WireWriter {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        match self {
            WireWriter::Plain(tcp) => {
                tcp.write_all(frame)?;
                tcp.flush()
            }
            WireWriter::Tls(shared) => {
                // rustls takes a bounded amount of plaintext at a time.
                let mut remaining = frame;
                while !remaining.is_empty() {
                    {
                        let mut state = shared.state()?;
                        let n = state.session.writer().write(remaining)?;
                        remaining = &remaining[n..];
                        if state.queue_records()? == 0 && n == 0 {
                            return Err(io::ErrorKind::WriteZero.into());
                        }
                    }
                    shared.flush(true)?;
                }
                Ok(())
            }
        }
    }
}

pub(crate) struct WireControl {
    tcp: TcpStream,
    tls: Option<Arc<TlsShared>>,
}

impl WireControl {
    /// Queues a TLS close_notify when the session is idle, then shuts the socket down,
    /// which unblocks the read loop. Never waits on the socket.
    pub fn shutdown(&self) -> io::Result<()> {
        if let Some(shared) = &self.tls {
            let queued = match shared.state.try_lock() {
                Ok(mut state) => {
                    state.session.send_close_notify();
                    state.queue_records().unwrap_or_default()
                }
                Err(_) => 0,
            };
            if queued > 0 {
                let _ = shared.flush(false);
            }
        }

        match self.tcp.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

pub struct FramedReader<R: Read> {
    stream: R,
    decoder: FrameDecoder,
    buf: Box<[u8]>,
}

impl<R: Read> FramedReader<R> {
    pub fn new(stream: R, codec: FrameCodec) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(codec),
            buf: vec![0; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Blocks until the next message arrives. `Ok(None)` means the peer closed the
    /// stream cleanly between two frames.
    pub fn read_message(&mut self) -> Result<Option<Message>, ChannelError> {
        loop {
            if let Some(message) = self.decoder.decode_next()? {
                return Ok(Some(message));
            }

            let n = match self.stream.read(&mut self.buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            if n == 0 {
                if self.decoder.buffered() > 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed in the middle of a frame",
                    )
                    .into());
                }
                return Ok(None);
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }
}

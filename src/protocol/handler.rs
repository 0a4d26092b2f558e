use std::{
    io::{self, Read},
    thread,
};

use log::{debug, info};

use super::{ChannelError, channel::Channel, codec::FrameCodec, transport::FramedReader};

/// Drives one connection's inbound side: decodes frames in wire order and hands each
/// message to the channel's dispatch. When the stream ends, exactly one of
/// [`Channel::channel_closed`] or [`Channel::exception_caught`] is invoked.
pub(crate) struct InboundHandler<R: Read> {
    channel: Channel,
    reader: FramedReader<R>,
}

impl<R: Read + Send + 'static> InboundHandler<R> {
    pub fn new(channel: Channel, stream: R, codec: FrameCodec) -> Self {
        Self {
            channel,
            reader: FramedReader::new(stream, codec),
        }
    }

    /// Runs the read loop on a dedicated thread.
    pub fn spawn(self) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("cachewire-reader-{}", self.channel.id()))
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        debug!("{} read loop started", self.channel);
        let _teardown = Teardown(&self.channel);

        loop {
            match self.reader.read_message() {
                Ok(Some(message)) => {
                    if !self.channel.is_valid() {
                        debug!("{} closed locally, discarding {message}", self.channel);
                        return;
                    }
                    self.channel.message_received(message);
                }
                Ok(None) => {
                    if self.channel.is_valid() {
                        info!("{} peer closed the connection", self.channel);
                        self.channel.channel_closed();
                    }
                    return;
                }
                Err(e) => {
                    if self.channel.is_valid() {
                        if is_idle_timeout(&e) {
                            info!("{} idle past the socket timeout", self.channel);
                        }
                        self.channel.exception_caught(e);
                    }
                    return;
                }
            }
        }
    }
}

/// Makes sure the channel is torn down if dispatch unwinds.
struct Teardown<'a>(&'a Channel);

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        if self.0.is_valid() {
            self.0.channel_closed();
        }
    }
}

fn is_idle_timeout(error: &ChannelError) -> bool {
    matches!(
        error,
        ChannelError::Transport(e)
            if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
    )
}

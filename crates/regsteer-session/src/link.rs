use std::io::{Read, Write};
use std::process::{ChildStdin, ChildStdout};
use std::thread;
use std::time::{Duration, Instant};

use regsteer_frame::{FrameConfig, FrameReader, FrameWriter};
use regsteer_proto::{codec, Message};
use regsteer_transport::IpcStream;
use tracing::{debug, trace};

use crate::error::{Result, SteerError};

type ModeSwitch = Box<dyn Fn(bool) -> std::io::Result<()> + Send>;

/// One steering connection: framed reads and writes of decoded messages.
///
/// Built from any reader/writer pair. Links made from sockets or helper
/// pipes can also be polled without blocking; other links block on reads.
pub struct Link {
    reader: FrameReader<Box<dyn Read + Send>>,
    writer: FrameWriter<Box<dyn Write + Send>>,
    mode: Option<ModeSwitch>,
    nonblocking: bool,
    peer: String,
}

impl Link {
    /// Wrap an arbitrary reader/writer pair.
    pub fn new(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        config: &FrameConfig,
    ) -> Self {
        Self {
            reader: FrameReader::with_config(Box::new(reader), config.clone()),
            writer: FrameWriter::with_config(Box::new(writer), config.clone()),
            mode: None,
            nonblocking: false,
            peer: "stream".to_string(),
        }
    }

    /// Use a connected socket for both directions.
    pub fn from_ipc(stream: IpcStream, config: &FrameConfig) -> Result<Self> {
        let reader_stream = stream.try_clone()?;
        let control = stream.try_clone()?;
        reader_stream.set_read_timeout(config.read_timeout)?;
        stream.set_write_timeout(config.write_timeout)?;

        let mut link = Self::new(reader_stream, stream, config);
        link.peer = "socket".to_string();
        link.mode = Some(Box::new(move |on| {
            control
                .set_nonblocking(on)
                .map_err(|err| std::io::Error::other(err.to_string()))
        }));
        Ok(link)
    }

    #[cfg(unix)]
    pub fn from_unix(stream: std::os::unix::net::UnixStream, config: &FrameConfig) -> Result<Self> {
        Self::from_ipc(IpcStream::from_unix(stream), config)
    }

    /// Talk through a helper process's pipes.
    #[cfg(unix)]
    pub fn from_proxy(stdout: ChildStdout, stdin: ChildStdin, config: &FrameConfig) -> Self {
        use std::os::fd::AsRawFd;

        let fds = [stdout.as_raw_fd(), stdin.as_raw_fd()];
        let mut link = Self::new(stdout, stdin, config);
        link.peer = "helper".to_string();
        link.mode = Some(Box::new(move |on| {
            for fd in fds {
                regsteer_transport::set_fd_nonblocking(fd, on)
                    .map_err(|err| std::io::Error::other(err.to_string()))?;
            }
            Ok(())
        }));
        link
    }

    /// Encode and send one message, blocking until it is written.
    ///
    /// Anything queued by [`Link::post`] goes out first. A configured write
    /// timeout bounds the wait.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        let text = codec::encode(message);
        self.set_nonblocking(false)?;
        self.writer.send(&text)?;
        debug!(peer = %self.peer, kind = %message.kind(), bytes = text.len(), "sent message");
        Ok(())
    }

    /// Send a bare text payload (the helper-process quit request).
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.set_nonblocking(false)?;
        self.writer.send(text)?;
        Ok(())
    }

    /// Queue one message and write what the peer accepts without blocking.
    ///
    /// Returns whether everything queued so far has been written. Fails with
    /// a backlog error once a peer that stopped reading lets the queue fill.
    pub fn post(&mut self, message: &Message) -> Result<bool> {
        let text = codec::encode(message);
        self.set_nonblocking(true)?;
        let drained = self.writer.queue(&text)?;
        debug!(peer = %self.peer, kind = %message.kind(), bytes = text.len(), drained, "posted message");
        Ok(drained)
    }

    /// Write queued output without blocking. Returns whether the queue is empty.
    pub fn flush_pending(&mut self) -> Result<bool> {
        if self.writer.pending_bytes() == 0 {
            return Ok(true);
        }
        self.set_nonblocking(true)?;
        Ok(self.writer.flush_pending()?)
    }

    /// Bytes posted but not yet accepted by the peer.
    pub fn pending_bytes(&self) -> usize {
        self.writer.pending_bytes()
    }

    /// Block until one message arrives.
    pub fn recv(&mut self) -> Result<Message> {
        self.set_nonblocking(false)?;
        let text = self.reader.read_message()?;
        self.decode(&text)
    }

    /// Return a message if one is ready, without blocking.
    ///
    /// On a link with no mode switch this blocks like [`Link::recv`].
    pub fn try_recv(&mut self) -> Result<Option<Message>> {
        self.set_nonblocking(true)?;
        match self.reader.poll_message()? {
            Some(text) => self.decode(&text).map(Some),
            None => Ok(None),
        }
    }

    /// Poll for a message until `timeout` elapses, sleeping `interval` between tries.
    pub fn recv_timeout(&mut self, timeout: Duration, interval: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_recv()? {
                return Ok(message);
            }
            if Instant::now() >= deadline {
                return Err(SteerError::Timeout(timeout));
            }
            thread::sleep(interval);
        }
    }

    /// Whether reads can be polled without blocking.
    pub fn can_poll(&self) -> bool {
        self.mode.is_some()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn decode(&self, text: &str) -> Result<Message> {
        let message = codec::decode(text)?;
        trace!(peer = %self.peer, kind = %message.kind(), "received message");
        Ok(message)
    }

    fn set_nonblocking(&mut self, on: bool) -> Result<()> {
        if self.nonblocking == on {
            return Ok(());
        }
        if let Some(mode) = &self.mode {
            mode(on)?;
            self.nonblocking = on;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.peer)
            .field("nonblocking", &self.nonblocking)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::os::unix::net::UnixStream;

    use regsteer_frame::FrameError;
    use regsteer_proto::{ControlMsg, StatusMsg};

    use super::*;

    fn pair() -> (Link, Link) {
        let (left, right) = UnixStream::pair().unwrap();
        let cfg = FrameConfig::default();
        (
            Link::from_unix(left, &cfg).unwrap(),
            Link::from_unix(right, &cfg).unwrap(),
        )
    }

    #[test]
    fn send_and_receive_over_socket_pair() {
        let (mut app, mut steerer) = pair();
        let status = Message::Status(StatusMsg {
            seq_num: 7,
            ..StatusMsg::default()
        });
        app.send(&status).unwrap();
        assert_eq!(steerer.recv().unwrap(), status);
    }

    #[test]
    fn try_recv_returns_none_when_idle() {
        let (_app, mut steerer) = pair();
        assert!(steerer.can_poll());
        assert!(steerer.try_recv().unwrap().is_none());
    }

    #[test]
    fn try_recv_then_blocking_recv() {
        let (mut app, mut steerer) = pair();
        assert!(steerer.try_recv().unwrap().is_none());

        app.send(&Message::Control(ControlMsg::default())).unwrap();
        assert_eq!(
            steerer.recv().unwrap(),
            Message::Control(ControlMsg::default())
        );
    }

    #[test]
    fn recv_timeout_expires() {
        let (_app, mut steerer) = pair();
        let err = steerer
            .recv_timeout(Duration::from_millis(30), Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, SteerError::Timeout(_)));
    }

    #[test]
    fn closed_peer_is_eof() {
        let (app, mut steerer) = pair();
        drop(app);
        assert!(steerer.try_recv().unwrap_err().is_eof());
    }

    #[test]
    fn garbage_is_protocol_error() {
        let wire = b"not a tag\n#END_OF_MSG#\n".to_vec();
        let mut link = Link::new(Cursor::new(wire), Vec::new(), &FrameConfig::default());
        assert!(!link.can_poll());
        assert!(matches!(link.recv(), Err(SteerError::Proto(_))));
    }

    #[test]
    fn oversized_message_is_truncated() {
        let cfg = FrameConfig {
            max_payload_size: 64,
            ..FrameConfig::default()
        };
        let (left, right) = UnixStream::pair().unwrap();
        let mut big = Link::from_unix(left, &FrameConfig::default()).unwrap();
        let mut small = Link::from_unix(right, &cfg).unwrap();

        big.send(&Message::Error("x".repeat(200))).unwrap();
        big.send(&Message::NotSet).unwrap();

        assert!(matches!(
            small.recv(),
            Err(SteerError::Frame(FrameError::Truncated { .. }))
        ));
        assert_eq!(small.recv().unwrap(), Message::NotSet);
    }

    #[test]
    fn post_holds_output_for_a_slow_reader() {
        let (mut app, mut steerer) = pair();
        let big = Message::Error("y".repeat(32 * 1024));

        let mut posted = 0;
        while app.post(&big).unwrap() {
            posted += 1;
            assert!(posted < 512, "socket buffer never filled");
        }
        assert!(app.pending_bytes() > 0);

        while app.pending_bytes() > 0 {
            assert_eq!(steerer.recv().unwrap(), big);
            app.flush_pending().unwrap();
        }
    }

    #[test]
    fn send_after_post_keeps_order() {
        let (mut app, mut steerer) = pair();
        app.post(&Message::NotSet).unwrap();
        app.send(&Message::Error("last".into())).unwrap();
        assert_eq!(steerer.recv().unwrap(), Message::NotSet);
        assert_eq!(steerer.recv().unwrap(), Message::Error("last".into()));
    }

    #[test]
    fn helper_pipes_echo_messages() {
        let (proxy, stdout, stdin) =
            regsteer_transport::ProxyProcess::spawn(std::process::Command::new("cat")).unwrap();
        let mut link = Link::from_proxy(stdout, stdin, &FrameConfig::default());

        assert!(link.try_recv().unwrap().is_none());
        link.send(&Message::NotSet).unwrap();
        assert_eq!(
            link.recv_timeout(Duration::from_secs(5), Duration::from_millis(5))
                .unwrap(),
            Message::NotSet
        );

        drop(link);
        proxy.wait().unwrap();
    }
}

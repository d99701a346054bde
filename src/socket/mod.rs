use crate::config::{Config, ExhaustionPolicy};
use crate::dispatch::{Mailbox, Message};
use crate::error::{Error, HandshakeError, Result};
use crate::frame::{self, DecodeError, Frame, FrameHeader, Opcode, RawFrame};
use crate::handshake;
use crate::payload::{Budget, Exhausted};
use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

mod shared;
pub use shared::LiveConnection;
use shared::{bounded, write_all, Writer};

/// Identifies one accepted connection for its whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingHandshake,
    Open,
    Closed,
}

/// Everything a connection needs from the rest of the process.
#[derive(Debug, Clone)]
pub struct Endpoint {
    mailbox: Mailbox,
    budget: Budget,
    live: LiveConnection,
    receive_timeout: Duration,
    send_timeout: Duration,
    policy: ExhaustionPolicy,
}

impl Endpoint {
    pub fn new(mailbox: Mailbox) -> Self {
        Self {
            mailbox,
            budget: Budget::unlimited(),
            live: LiveConnection::new(),
            receive_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            policy: ExhaustionPolicy::default(),
        }
    }

    pub fn from_config(config: &Config, mailbox: Mailbox) -> Self {
        Self::new(mailbox)
            .budget(Budget::new(config.payload_budget))
            .receive_timeout(config.receive_timeout())
            .send_timeout(config.send_timeout())
            .exhaustion(config.exhaustion_policy())
    }

    pub fn budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    pub fn live(mut self, live: LiveConnection) -> Self {
        self.live = live;
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Bound on each write of a whole frame, including waiting for the
    /// writer, and on the final shutdown.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn exhaustion(mut self, policy: ExhaustionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The slot out-of-band senders write through.
    pub fn live_connection(&self) -> &LiveConnection {
        &self.live
    }
}

/// What one decoded frame asks the connection to do.
enum Step {
    Dispatch(Frame),
    Reply(Bytes),
    Close,
    Skip(FrameHeader),
    Exhausted(Exhausted),
}

/// One upgraded connection, driven from handshake to close by `run`.
pub struct Connection<T> {
    id: ConnectionId,
    reader: ReadHalf<T>,
    writer: Writer,
    read_buf: BytesMut,
    state: State,
    exhaustion_streak: u32,
    endpoint: Endpoint,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(id: ConnectionId, transport: T, endpoint: Endpoint) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);

        Self {
            id,
            reader,
            writer: Arc::new(Mutex::new(writer)),
            read_buf: BytesMut::with_capacity(handshake::MAX_REQUEST_LEN),
            state: State::AwaitingHandshake,
            exhaustion_streak: 0,
            endpoint,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Serves the connection until it closes.
    ///
    /// Every per-connection failure ends in `Closed` with `Ok(())`. An error
    /// is returned only for payload exhaustion the policy says to restart on.
    pub async fn run(&mut self) -> Result<()> {
        let outcome = match self.handshake().await {
            Ok(accept) => match self.open(&accept).await {
                Ok(()) => self.serve_frames().await,
                Err(err) => {
                    debug!(connection = %self.id, error = %err, "upgrade response failed");
                    Ok(())
                }
            },
            Err(err) => {
                debug!(connection = %self.id, error = %err, "handshake failed");
                Ok(())
            }
        };

        self.close().await;
        outcome
    }

    /// Reads the upgrade request and derives the accept token for it.
    async fn handshake(&mut self) -> std::result::Result<String, HandshakeError> {
        let len = loop {
            if let Some(len) = handshake::request_len(&self.read_buf) {
                break len;
            }
            if self.read_buf.len() >= handshake::MAX_REQUEST_LEN {
                return Err(HandshakeError::TooLarge(handshake::MAX_REQUEST_LEN));
            }
            self.receive().await?;
        };

        let accept = {
            let key = handshake::find_key(&self.read_buf[..len])?;
            handshake::accept(key)
        };
        self.read_buf.advance(len);

        Ok(accept)
    }

    /// Sends the upgrade response and publishes the connection. The writer
    /// stays locked until the slot is filled, so no out-of-band frame can
    /// precede the response.
    async fn open(&mut self, accept: &str) -> io::Result<()> {
        let limit = self.endpoint.send_timeout;
        let response = handshake::response(accept);

        let mut transport = self.writer.lock().await;
        bounded(limit, async {
            transport.write_all(response.as_bytes()).await?;
            transport.flush().await
        })
        .await?;

        self.state = State::Open;
        self.endpoint.live.attach(self.id, self.writer.clone(), limit);
        info!(connection = %self.id, "websocket connected");
        Ok(())
    }

    async fn serve_frames(&mut self) -> Result<()> {
        loop {
            let step = match self.decode_step() {
                Ok(step) => step,
                Err(DecodeError::Incomplete { needed }) => {
                    trace!(connection = %self.id, needed, "waiting for more frame bytes");
                    if let Err(err) = self.receive().await {
                        debug!(connection = %self.id, error = %err, "receive failed");
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => {
                    // Without the extended length the end of the frame is unknown.
                    warn!(connection = %self.id, error = %err, "undecodable frame, closing");
                    return Ok(());
                }
            };

            match step {
                Step::Close => {
                    debug!(connection = %self.id, "websocket disconnected by client");
                    return Ok(());
                }
                Step::Reply(bytes) => {
                    if let Err(err) =
                        write_all(&self.writer, &bytes, self.endpoint.send_timeout).await
                    {
                        debug!(connection = %self.id, error = %err, "write failed");
                        return Ok(());
                    }
                    debug!(connection = %self.id, payload_len = bytes.len() - 2, "pong sent");
                }
                Step::Dispatch(frame) => {
                    // a rejected message is logged and freed by the mailbox
                    let message = Message::new(self.id, frame);
                    self.endpoint.mailbox.enqueue(message).await;
                }
                Step::Skip(header) => {
                    debug!(
                        connection = %self.id,
                        opcode = ?header.opcode,
                        control = header.opcode.is_control(),
                        payload_len = header.payload_len,
                        "frame ignored"
                    );
                }
                Step::Exhausted(err) => self.exhausted(err)?,
            }
        }
    }

    /// Decodes the next frame in the read buffer and consumes its bytes.
    ///
    /// Any payload that is allocated ends the current exhaustion streak.
    fn decode_step(&mut self) -> std::result::Result<Step, DecodeError> {
        let raw = RawFrame::parse(&self.read_buf)?;
        let used = raw.wire_len();
        let header = *raw.header();

        let step = match header.opcode {
            Opcode::Close => Step::Close,
            Opcode::Ping => match raw.into_payload(&self.endpoint.budget) {
                Ok(payload) => {
                    self.exhaustion_streak = 0;
                    debug!(connection = %self.id, payload_len = payload.len(), "ping received");
                    // a ping payload is at most as long as any pong payload
                    match frame::encode(Opcode::Pong, &payload) {
                        Ok(bytes) => Step::Reply(bytes),
                        Err(_) => Step::Skip(header),
                    }
                }
                Err(err) => Step::Exhausted(err),
            },
            Opcode::Text => match raw.into_frame(&self.endpoint.budget) {
                Ok(frame) => {
                    self.exhaustion_streak = 0;
                    Step::Dispatch(frame)
                }
                Err(err) => Step::Exhausted(err),
            },
            _ => Step::Skip(header),
        };

        self.read_buf.advance(used);
        Ok(step)
    }

    fn exhausted(&mut self, err: Exhausted) -> Result<()> {
        self.exhaustion_streak += 1;

        let restart = match self.endpoint.policy {
            ExhaustionPolicy::RestartOnExhaustion => true,
            ExhaustionPolicy::DropFrameOnExhaustion { max_consecutive } => {
                self.exhaustion_streak >= max_consecutive
            }
        };

        if restart {
            error!(
                connection = %self.id,
                error = %err,
                streak = self.exhaustion_streak,
                "payload memory exhausted, giving up"
            );
            return Err(Error::Exhausted(err));
        }

        warn!(
            connection = %self.id,
            error = %err,
            streak = self.exhaustion_streak,
            in_use = self.endpoint.budget.in_use(),
            "payload memory exhausted, frame dropped"
        );
        Ok(())
    }

    /// Reads once, bounded by the receive timeout.
    async fn receive(&mut self) -> io::Result<()> {
        let read = time::timeout(
            self.endpoint.receive_timeout,
            self.reader.read_buf(&mut self.read_buf),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "receive timed out"))??;

        if read == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.state == State::Open {
            self.endpoint.live.detach(self.id);
        }
        self.state = State::Closed;

        let writer = &self.writer;
        let shutdown = bounded(self.endpoint.send_timeout, async {
            writer.lock().await.shutdown().await
        });
        if let Err(err) = shutdown.await {
            debug!(connection = %self.id, error = %err, "shutdown failed");
        }
        info!(connection = %self.id, "connection closed");
    }
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("buffered", &self.read_buf.len())
            .finish()
    }
}

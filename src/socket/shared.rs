use super::ConnectionId;
use crate::error::SendError;
use crate::frame::{self, Opcode};
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time;
use tracing::trace;

/// Write half of a connection, shared between its receive loop and
/// out-of-band senders so whole frames never interleave.
pub(crate) type Writer = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Runs a send-side operation, failing with `TimedOut` once `limit` passes.
pub(crate) async fn bounded<F, T>(limit: Duration, op: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    time::timeout(limit, op)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "send timed out"))?
}

/// Writes and flushes one whole frame. Waiting for the lock counts against
/// the limit too.
pub(crate) async fn write_all(writer: &Writer, bytes: &[u8], limit: Duration) -> io::Result<()> {
    bounded(limit, async {
        let mut transport = writer.lock().await;
        transport.write_all(bytes).await?;
        transport.flush().await
    })
    .await
}

struct Live {
    id: ConnectionId,
    writer: Writer,
    send_timeout: Duration,
}

/// Handle to whichever connection is open right now, if any.
///
/// Clones share the same slot. The serving connection fills it when the
/// handshake completes and empties it when it closes; anyone else can use it
/// to push frames to the peer. An empty slot is the normal idle state.
#[derive(Clone, Default)]
pub struct LiveConnection {
    slot: Arc<std::sync::Mutex<Option<Live>>>,
}

impl LiveConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id of the open connection.
    pub fn current(&self) -> Option<ConnectionId> {
        self.lock().as_ref().map(|live| live.id)
    }

    pub fn is_open(&self) -> bool {
        self.current().is_some()
    }

    /// Sends a text frame to the open connection.
    pub async fn send_text(&self, payload: &[u8]) -> Result<(), SendError> {
        self.send(Opcode::Text, payload).await
    }

    /// Sends an unsolicited pong, the keep-alive the device uses.
    pub async fn send_keep_alive(&self, payload: &[u8]) -> Result<(), SendError> {
        self.send(Opcode::Pong, payload).await
    }

    async fn send(&self, opcode: Opcode, payload: &[u8]) -> Result<(), SendError> {
        let (id, writer, limit) = {
            let slot = self.lock();
            let live = slot.as_ref().ok_or(SendError::NotConnected)?;
            (live.id, live.writer.clone(), live.send_timeout)
        };

        let bytes = frame::encode(opcode, payload)?;
        write_all(&writer, &bytes, limit).await?;

        trace!(connection = %id, opcode = ?opcode, "out-of-band frame sent");
        Ok(())
    }

    pub(crate) fn attach(&self, id: ConnectionId, writer: Writer, send_timeout: Duration) {
        *self.lock() = Some(Live {
            id,
            writer,
            send_timeout,
        });
    }

    /// Empties the slot if it still refers to `id`.
    pub(crate) fn detach(&self, id: ConnectionId) {
        let mut slot = self.lock();
        if slot.as_ref().map(|live| live.id) == Some(id) {
            *slot = None;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Live>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveConnection")
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::EncodeError;
    use tokio::io::AsyncReadExt;

    const LIMIT: Duration = Duration::from_secs(1);

    fn writer(stream: tokio::io::DuplexStream) -> Writer {
        let transport: Box<dyn AsyncWrite + Send + Unpin> = Box::new(stream);
        Arc::new(Mutex::new(transport))
    }

    #[tokio::test]
    async fn idle_slot_reports_not_connected() {
        let live = LiveConnection::new();
        assert!(!live.is_open());

        let err = live.send_text(b"hi").await.unwrap_err();
        assert!(err.is_not_connected());
        let err = live.send_keep_alive(&[]).await.unwrap_err();
        assert!(err.is_not_connected());
    }

    #[tokio::test]
    async fn sends_to_attached_connection() {
        let (mut peer, local) = tokio::io::duplex(64);
        let live = LiveConnection::new();
        live.attach(ConnectionId::new(3), writer(local), LIMIT);
        assert_eq!(live.current(), Some(ConnectionId::new(3)));

        live.send_text(b"hi").await.unwrap();
        live.send_keep_alive(&[]).await.unwrap();

        let mut buf = [0; 6];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x81, 0x02, b'h', b'i', 0x8A, 0x00]);
    }

    #[tokio::test]
    async fn oversized_payload_is_refused() {
        let (_peer, local) = tokio::io::duplex(64);
        let live = LiveConnection::new();
        live.attach(ConnectionId::new(1), writer(local), LIMIT);

        let err = live.send_text(&[b'x'; 126]).await.unwrap_err();
        assert!(matches!(
            err,
            SendError::Encode(EncodeError::PayloadTooLong(126))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_peer_fails_the_send_with_timeout() {
        let (_peer, local) = tokio::io::duplex(2);
        let live = LiveConnection::new();
        live.attach(ConnectionId::new(4), writer(local), LIMIT);

        let err = live.send_text(b"hi").await.unwrap_err();
        assert!(matches!(
            err,
            SendError::Io(ref e) if e.kind() == io::ErrorKind::TimedOut
        ));

        // the lock was released with the timed out write
        let err = live.send_keep_alive(&[]).await.unwrap_err();
        assert!(matches!(err, SendError::Io(_)));
    }

    #[tokio::test]
    async fn detach_only_clears_own_connection() {
        let (_a, first) = tokio::io::duplex(8);
        let (_b, second) = tokio::io::duplex(8);
        let live = LiveConnection::new();

        live.attach(ConnectionId::new(1), writer(first), LIMIT);
        live.attach(ConnectionId::new(2), writer(second), LIMIT);
        live.detach(ConnectionId::new(1));
        assert_eq!(live.current(), Some(ConnectionId::new(2)));

        live.detach(ConnectionId::new(2));
        assert!(!live.is_open());
    }
}

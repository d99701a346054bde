use crate::frame::{Frame, FrameHeader};
use crate::payload::Payload;
use crate::socket::ConnectionId;
use futures::future;
use std::fmt;
use std::str::Utf8Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TryRecvError};
use tokio::sync::Mutex;
use tower_service::Service;
use tracing::{debug, warn};

/// A text frame handed to the application.
///
/// The message owns its payload; whoever holds the message last frees it by
/// dropping it.
pub struct Message {
    pub connection: ConnectionId,
    pub header: FrameHeader,
    pub payload_len: usize,
    pub payload: Payload,
}

impl Message {
    pub fn new(connection: ConnectionId, frame: Frame) -> Self {
        Self {
            connection,
            header: frame.header,
            payload_len: frame.payload.len(),
            payload: frame.payload,
        }
    }

    pub fn text(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.payload)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("connection", &self.connection)
            .field("header", &self.header)
            .field("payload_len", &self.payload_len)
            .finish()
    }
}

/// Producer side of the bounded dispatch queue.
#[derive(Clone)]
pub struct Mailbox {
    tx: mpsc::Sender<Message>,
    wait: Duration,
}

impl Mailbox {
    /// Creates a queue with `capacity` slots. A full queue makes `enqueue`
    /// wait at most `wait` for a slot.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, wait: Duration) -> (Self, Inbox) {
        let (tx, rx) = mpsc::channel(capacity);
        let inbox = Inbox {
            rx: Arc::new(Mutex::new(rx)),
        };
        (Self { tx, wait }, inbox)
    }

    /// Queues `message` behind everything already queued.
    ///
    /// Returns `false` if no slot opened up within the wait period or every
    /// consumer is gone. The message is dropped in that case, which frees its
    /// payload.
    pub async fn enqueue(&self, message: Message) -> bool {
        let connection = message.connection;
        match self.tx.send_timeout(message, self.wait).await {
            Ok(()) => {
                debug!(%connection, "websocket message queued");
                true
            }
            Err(SendTimeoutError::Timeout(message)) => {
                warn!(
                    %connection,
                    payload_len = message.payload_len,
                    wait_ms = self.wait.as_millis() as u64,
                    "dispatch queue full, message dropped"
                );
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                warn!(%connection, "dispatch queue has no consumer, message dropped");
                false
            }
        }
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("capacity", &self.tx.max_capacity())
            .field("wait", &self.wait)
            .finish()
    }
}

/// Consumer side of the dispatch queue. Clones share one queue, so several
/// consumers each take the next message in order.
#[derive(Clone)]
pub struct Inbox {
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl Inbox {
    /// Waits for the next message. `None` once every `Mailbox` is dropped and
    /// the queue is empty.
    pub async fn recv(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }

    pub fn try_recv(&self) -> Option<Message> {
        let mut rx = self.rx.try_lock().ok()?;
        match rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Feeds every message from `inbox` to `service` until the queue closes.
pub async fn drain<S>(inbox: Inbox, mut service: S)
where
    S: Service<Message, Response = ()>,
    S::Error: fmt::Display,
{
    while let Some(message) = inbox.recv().await {
        let connection = message.connection;

        if let Err(err) = future::poll_fn(|cx| service.poll_ready(cx)).await {
            warn!(%connection, error = %err, "consumer failed, stopping");
            return;
        }

        if let Err(err) = service.call(message).await {
            warn!(%connection, error = %err, "consumer rejected message");
        }
    }

    debug!("dispatch queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode;
    use crate::payload::Budget;
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::time::Instant;

    fn message(byte: u8, budget: &Budget) -> Message {
        let frame = decode(&[0x81, 0x01, byte], budget).unwrap();
        Message::new(ConnectionId::new(1), frame)
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_rejects_after_wait_without_losing_earlier_items() {
        let budget = Budget::unlimited();
        let (mailbox, inbox) = Mailbox::new(2, Duration::from_millis(50));

        assert!(mailbox.enqueue(message(b'a', &budget)).await);
        assert!(mailbox.enqueue(message(b'b', &budget)).await);

        let start = Instant::now();
        assert!(!mailbox.enqueue(message(b'c', &budget)).await);
        assert!(start.elapsed() >= Duration::from_millis(50));

        assert_eq!(inbox.recv().await.unwrap().payload.as_bytes(), b"a");
        assert_eq!(inbox.recv().await.unwrap().payload.as_bytes(), b"b");
        assert!(inbox.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_message_frees_its_payload() {
        let budget = Budget::new(8);
        let (mailbox, inbox) = Mailbox::new(1, Duration::from_millis(10));

        assert!(mailbox.enqueue(message(b'a', &budget)).await);
        assert!(!mailbox.enqueue(message(b'b', &budget)).await);
        assert_eq!(budget.in_use(), 1);

        drop(inbox.recv().await);
        assert_eq!(budget.in_use(), 0);
    }

    #[tokio::test]
    async fn enqueue_fails_without_consumers() {
        let (mailbox, inbox) = Mailbox::new(1, Duration::from_millis(10));
        drop(inbox);
        assert!(!mailbox.enqueue(message(b'a', &Budget::unlimited())).await);
    }

    #[tokio::test]
    async fn message_text_view() {
        let msg = message(b'x', &Budget::unlimited());
        assert_eq!(msg.text().unwrap(), "x");
        assert_eq!(msg.payload_len, 1);
        assert_eq!(msg.connection, ConnectionId::new(1));
    }

    struct Collect {
        seen: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl Service<Message> for Collect {
        type Response = ();
        type Error = std::convert::Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Ok(()).into()
        }

        fn call(&mut self, message: Message) -> Self::Future {
            let text = message.text().unwrap_or_default().to_owned();
            self.seen.lock().unwrap().push(text);
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn drain_delivers_in_order_and_stops_when_closed() {
        let budget = Budget::new(16);
        let (mailbox, inbox) = Mailbox::new(4, Duration::from_millis(10));
        for byte in [b'1', b'2', b'3'] {
            assert!(mailbox.enqueue(message(byte, &budget)).await);
        }
        drop(mailbox);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        drain(inbox, Collect { seen: seen.clone() }).await;

        assert_eq!(*seen.lock().unwrap(), ["1", "2", "3"]);
        assert_eq!(budget.in_use(), 0);
    }
}

use crate::config::Config;
use crate::error::Result;
use crate::socket::{Connection, ConnectionId, Endpoint};
use futures::future;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{error, info, trace};

/// A WebSocket server serving one connection at a time.
pub struct Server {
    listener: TcpListener,
    endpoint: Endpoint,
    accept_timeout: Option<Duration>,
    next_id: u64,
}

impl Server {
    /// Creates a new Server bound to the address in `config`.
    pub async fn bind(config: &Config, endpoint: Endpoint) -> Result<Self> {
        let listener = TcpListener::bind(config.addr()).await?;
        Ok(Self::from_listener(listener, endpoint).accept_timeout(config.accept_timeout()))
    }

    pub fn from_listener(listener: TcpListener, endpoint: Endpoint) -> Self {
        Self {
            listener,
            endpoint,
            accept_timeout: None,
            next_id: 1,
        }
    }

    pub fn accept_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Accepts and serves connections forever.
    pub async fn run(self) -> Result<()> {
        self.run_until(future::pending()).await
    }

    /// Accepts and serves connections until `shutdown` resolves.
    ///
    /// Each connection is served to completion before the next is accepted.
    /// `shutdown` is only observed while waiting for a connection. Accept
    /// failures are logged and the loop continues; the only error returned is
    /// payload exhaustion under a restart policy.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    return Ok(());
                }
                accepted = self.accept() => accepted,
            };

            match accepted {
                Ok(Some((stream, peer))) => {
                    let id = ConnectionId::new(self.next_id);
                    self.next_id += 1;
                    info!(connection = %id, %peer, "connection accepted");

                    let mut conn = Connection::new(id, stream, self.endpoint.clone());
                    conn.run().await?;
                }
                Ok(None) => trace!("accept timed out"),
                Err(err) => error!(error = %err, "accept failed"),
            }
        }
    }

    async fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        match self.accept_timeout {
            Some(timeout) => match time::timeout(timeout, self.listener.accept()).await {
                Ok(accepted) => accepted.map(Some),
                Err(_) => Ok(None),
            },
            None => self.listener.accept().await.map(Some),
        }
    }
}

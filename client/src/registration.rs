use std::{future::Future, io, time::Duration};

use comms::{
    FrameReceiver, FrameSender,
    frame::{Command, Frame, unexpected_frame},
};
use log::{info, warn};
use serde::Deserialize;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};

use crate::{ClientErr, Result};

/// Bounded exponential backoff for reaching the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Returns how long to wait after the zero based `attempt` failed.
    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as usize) as i32);
        let ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Runs `op` until it succeeds or the attempts run out.
    ///
    /// # Arguments
    /// * `what` - Names the operation in the logs.
    /// * `op` - Produces a fresh attempt every time it's called.
    ///
    /// # Returns
    /// The first success or `RegistrationExhausted`.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let attempts = self.max_attempts.max(1);

        for attempt in 0..attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => warn!(attempt = attempt + 1, attempts = attempts; "{what} failed: {e}"),
            }

            if attempt + 1 < attempts {
                time::sleep(self.delay(attempt)).await;
            }
        }

        Err(ClientErr::RegistrationExhausted { attempts })
    }
}

/// A connection to the registration endpoint of the aggregator.
pub struct RegistrationClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rx: FrameReceiver<R>,
    tx: FrameSender<W>,
    buf: Vec<u8>,
}

impl RegistrationClient<OwnedReadHalf, OwnedWriteHalf> {
    /// Connects to the endpoint at `addr`, retrying as `policy` says.
    pub async fn connect(addr: &str, policy: &RetryPolicy) -> Result<Self> {
        let stream = policy
            .retry("connecting to the registry", || TcpStream::connect(addr))
            .await?;
        stream.set_nodelay(true)?;

        info!("connected to the registry at {addr}");
        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);
        Ok(Self::new(rx, tx))
    }
}

impl<R, W> RegistrationClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(rx: FrameReceiver<R>, tx: FrameSender<W>) -> Self {
        Self {
            rx,
            tx,
            buf: Vec::new(),
        }
    }

    /// Registers `host_id` and returns the client id the aggregator assigned.
    pub async fn register(&mut self, host_id: &str) -> Result<String> {
        let cmd = Command::Register {
            host_id: host_id.to_string(),
        };

        match self.request(cmd).await? {
            Command::Registered { client_id } => {
                info!(client_id = client_id.as_str(); "registered");
                Ok(client_id)
            }
            other => Err(refused(other)),
        }
    }

    /// Joins the experiment, the client must already listen for broadcasts.
    pub async fn join(&mut self, client_id: &str) -> Result<()> {
        let cmd = Command::Join {
            client_id: client_id.to_string(),
        };

        self.expect_ok(cmd).await
    }

    pub async fn quit(&mut self, client_id: &str) -> Result<()> {
        let cmd = Command::Quit {
            client_id: client_id.to_string(),
        };

        self.expect_ok(cmd).await
    }

    /// Says goodbye to the endpoint and closes the connection.
    pub async fn close(mut self) -> Result<()> {
        self.tx
            .send(&Frame::Control(Command::Disconnect))
            .await
            .map_err(ClientErr::TransportFailure)?;

        self.tx.shutdown().await.map_err(ClientErr::TransportFailure)
    }

    async fn expect_ok(&mut self, cmd: Command) -> Result<()> {
        match self.request(cmd).await? {
            Command::Ok => Ok(()),
            other => Err(refused(other)),
        }
    }

    async fn request(&mut self, cmd: Command) -> Result<Command> {
        self.tx
            .send(&Frame::Control(cmd))
            .await
            .map_err(ClientErr::TransportFailure)?;

        match self.rx.recv_into(&mut self.buf).await {
            Ok(Frame::Control(reply)) => Ok(reply),
            Ok(other) => unexpected_frame(&other).map_err(ClientErr::TransportFailure),
            Err(e) => Err(ClientErr::TransportFailure(e)),
        }
    }
}

fn refused(reply: Command) -> ClientErr {
    match reply {
        Command::Rejected { reason } => ClientErr::Rejected(reason),
        other => ClientErr::Rejected(format!("unexpected reply {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{self as tio};

    use super::*;

    fn fast(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 3.0,
        };

        let delays: Vec<u64> = (0..5).map(|n| policy.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 300, 900, 1_000, 1_000]);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);

        let res: Result<()> = fast(3)
            .retry("connecting", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(io::Error::from(io::ErrorKind::ConnectionRefused)) }
            })
            .await;

        assert!(matches!(res, Err(ClientErr::RegistrationExhausted { attempts: 3 })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_at_the_first_success() {
        let calls = AtomicUsize::new(0);

        let value = fast(5)
            .retry("connecting", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(io::Error::from(io::ErrorKind::ConnectionRefused))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_reported() {
        let (near, far) = tio::duplex(1 << 12);

        let (rx, tx) = tio::split(near);
        let (rx, tx) = comms::channel(rx, tx);
        let mut client = RegistrationClient::new(rx, tx);

        let server = tokio::spawn(async move {
            let (rx, tx) = tio::split(far);
            let (mut rx, mut tx) = comms::channel(rx, tx);
            let mut buf = Vec::new();

            let request: Frame = rx.recv_into(&mut buf).await.unwrap();
            assert_eq!(
                request,
                Frame::Control(Command::Join {
                    client_id: "ghost".into()
                })
            );

            let reply = Command::Rejected {
                reason: "unknown client ghost".into(),
            };
            tx.send(&Frame::Control(reply)).await.unwrap();
        });

        let err = client.join("ghost").await.unwrap_err();
        assert!(matches!(err, ClientErr::Rejected(reason) if reason.contains("ghost")));
        server.await.unwrap();
    }
}

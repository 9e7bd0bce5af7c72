use std::{
    borrow::Cow,
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, ToSocketAddrs},
    sync::{mpsc, oneshot},
    time,
};

use super::{Delivery, Subscription, Transport};
use crate::{
    FrameReceiver, FrameSender, Qos,
    frame::{Command, Frame, Route},
};

/// Tuning of a `RemoteTransport` connection.
#[derive(Debug, Clone, Copy)]
pub struct RemoteConfig {
    /// The queue size of every subscription and of the outgoing frames.
    pub capacity: usize,
    /// How long to wait for the broker to acknowledge a request.
    pub ack_timeout: Duration,
    /// How many times an unacknowledged request is sent again before giving up.
    pub max_retries: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            ack_timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

#[derive(Clone)]
enum Outgoing {
    Command(Command),
    Publish {
        id: u64,
        topic: Arc<str>,
        qos: Qos,
        payload: Arc<[u8]>,
    },
}

/// The state shared with the reading task.
#[derive(Default)]
struct Routes {
    subscriptions: Mutex<HashMap<String, Vec<mpsc::Sender<Delivery>>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    closed: AtomicBool,
}

impl Routes {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().clear();
        self.subscriptions.lock().clear();
    }
}

struct Shared {
    outgoing: mpsc::Sender<Outgoing>,
    routes: Arc<Routes>,
    next_id: AtomicU64,
    config: RemoteConfig,
}

/// A connection to a `BrokerServer` over the framing protocol.
///
/// The connection is served by a reading and a writing task, it is closed once
/// every clone of the handle is dropped or `close` is called.
#[derive(Clone)]
pub struct RemoteTransport {
    shared: Arc<Shared>,
}

impl RemoteTransport {
    /// Connects to the broker listening at `addr`.
    pub async fn connect<A: ToSocketAddrs>(addr: A, config: RemoteConfig) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let (rx, tx) = stream.into_split();
        let (rx, tx) = crate::channel(rx, tx);
        Ok(Self::new(rx, tx, config))
    }

    /// Creates a new `RemoteTransport` over an already established channel.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    /// * `config` - The connection tuning.
    pub fn new<R, W>(rx: FrameReceiver<R>, tx: FrameSender<W>, config: RemoteConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(config.capacity.max(1));
        let routes = Arc::new(Routes::default());

        tokio::spawn(async move {
            if let Err(e) = write_loop(tx, out_rx).await {
                warn!("broker connection writer failed: {e}");
            }
        });

        tokio::spawn(read_loop(rx, routes.clone()));

        let shared = Shared {
            outgoing: out_tx,
            routes,
            next_id: AtomicU64::new(1),
            config,
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    /// Tells the broker this connection is leaving.
    pub async fn close(&self) -> io::Result<()> {
        self.send(Outgoing::Command(Command::Disconnect)).await
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, msg: Outgoing) -> io::Result<()> {
        self.shared.outgoing.send(msg).await.map_err(|_| closed())
    }

    /// Sends `msg` until the broker acknowledges `id` or the retries run out.
    async fn request(&self, id: u64, msg: Outgoing) -> io::Result<()> {
        let RemoteConfig {
            ack_timeout,
            max_retries,
            ..
        } = self.shared.config;
        let routes = &self.shared.routes;

        for attempt in 0..=max_retries {
            let (tx, rx) = oneshot::channel();
            routes.pending.lock().insert(id, tx);

            if routes.closed.load(Ordering::SeqCst) {
                routes.pending.lock().remove(&id);
                return Err(closed());
            }

            self.send(msg.clone()).await?;

            match time::timeout(ack_timeout, rx).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(_)) => return Err(closed()),
                Err(_) => warn!(id = id, attempt = attempt; "broker acknowledgment timed out"),
            }
        }

        routes.pending.lock().remove(&id);
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("the broker did not acknowledge request {id} after {} attempts", max_retries + 1),
        ))
    }
}

impl Transport for RemoteTransport {
    async fn subscribe(&self, topic: &str) -> io::Result<Subscription> {
        let (tx, rx) = mpsc::channel(self.shared.config.capacity.max(1));

        self.shared
            .routes
            .subscriptions
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        let id = self.next_id();
        let cmd = Command::Subscribe {
            id,
            topic: topic.to_string(),
        };

        self.request(id, Outgoing::Command(cmd)).await?;
        Ok(Subscription::new(topic.to_string(), rx))
    }

    async fn unsubscribe(&self, topic: &str) -> io::Result<()> {
        self.shared.routes.subscriptions.lock().remove(topic);

        let id = self.next_id();
        let cmd = Command::Unsubscribe {
            id,
            topic: topic.to_string(),
        };

        self.request(id, Outgoing::Command(cmd)).await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> io::Result<()> {
        let id = self.next_id();
        let msg = Outgoing::Publish {
            id,
            topic: topic.into(),
            qos,
            payload: payload.into(),
        };

        if qos.needs_ack() {
            self.request(id, msg).await
        } else {
            self.send(msg).await
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "the broker connection is closed")
}

async fn read_loop<R>(mut rx: FrameReceiver<R>, routes: Arc<Routes>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();

    loop {
        let frame = match rx.recv_into(&mut buf).await {
            Ok(frame) => frame,
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!("broker connection reader failed: {e}");
                }
                break;
            }
        };

        match frame {
            Frame::Control(Command::Ack { id }) => {
                if let Some(tx) = routes.pending.lock().remove(&id) {
                    let _ = tx.send(());
                }
            }
            Frame::Deliver(Route { topic, .. }, payload) => {
                let targets = match routes.subscriptions.lock().get_mut(&*topic) {
                    Some(subs) => {
                        subs.retain(|tx| !tx.is_closed());
                        subs.clone()
                    }
                    None => Vec::new(),
                };

                let delivery = Delivery {
                    topic: topic.into_owned(),
                    payload: payload.into(),
                };

                for tx in targets {
                    let _ = tx.send(delivery.clone()).await;
                }
            }
            Frame::Control(Command::Disconnect) => break,
            Frame::Err(detail) => warn!("broker reported an error: {detail}"),
            other => debug!("ignoring unexpected frame from the broker: {other:?}"),
        }
    }

    routes.close();
}

async fn write_loop<W>(mut tx: FrameSender<W>, mut out: mpsc::Receiver<Outgoing>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = out.recv().await {
        match msg {
            Outgoing::Command(cmd) => {
                let disconnect = cmd == Command::Disconnect;
                tx.send(&Frame::Control(cmd)).await?;

                if disconnect {
                    break;
                }
            }
            Outgoing::Publish {
                id,
                topic,
                qos,
                payload,
            } => {
                let route = Route {
                    id,
                    topic: Cow::Borrowed(&*topic),
                    qos,
                };

                tx.send(&Frame::Publish(route, &payload[..])).await?;
            }
        }
    }

    tx.shutdown().await
}

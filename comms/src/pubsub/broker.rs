use std::{
    borrow::Cow,
    collections::{HashMap, HashSet, VecDeque},
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::mpsc,
    task::JoinSet,
};

use crate::{
    FrameReceiver, FrameSender, Qos,
    frame::{Command, Frame, Route, unexpected_frame},
};

/// How many exactly once publish ids are remembered per connection.
const DEDUP_WINDOW: usize = 4096;

enum Outbound {
    Ack(u64),
    Deliver {
        topic: Arc<str>,
        qos: Qos,
        payload: Arc<[u8]>,
    },
}

struct Subscriber {
    conn: u64,
    tx: mpsc::Sender<Outbound>,
}

struct BrokerState {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_conn: AtomicU64,
    capacity: usize,
}

impl BrokerState {
    fn subscribe(&self, conn: u64, topic: String, tx: mpsc::Sender<Outbound>) {
        self.topics
            .lock()
            .entry(topic)
            .or_default()
            .push(Subscriber { conn, tx });
    }

    fn unsubscribe(&self, conn: u64, topic: &str) {
        let mut topics = self.topics.lock();

        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.conn != conn);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }

    fn drop_connection(&self, conn: u64) {
        self.topics.lock().retain(|_, subs| {
            subs.retain(|s| s.conn != conn);
            !subs.is_empty()
        });
    }

    async fn route(&self, topic: &str, qos: Qos, payload: &[u8]) {
        let targets: Vec<mpsc::Sender<Outbound>> = match self.topics.lock().get(topic) {
            Some(subs) => subs.iter().map(|s| s.tx.clone()).collect(),
            None => Vec::new(),
        };

        if targets.is_empty() {
            debug!(topic = topic; "no subscribers, message dropped");
            return;
        }

        let topic: Arc<str> = topic.into();
        let payload: Arc<[u8]> = payload.into();

        for tx in targets {
            let msg = Outbound::Deliver {
                topic: topic.clone(),
                qos,
                payload: payload.clone(),
            };

            // The subscriber's connection may be closing, that's not the publisher's problem.
            let _ = tx.send(msg).await;
        }
    }
}

/// Remembers the last publish ids of a connection to drop redelivered duplicates.
struct RecentIds {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
    limit: usize,
}

impl RecentIds {
    fn new(limit: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(limit),
            seen: HashSet::with_capacity(limit),
            limit,
        }
    }

    /// Returns `true` if `id` was not seen within the window.
    fn insert(&mut self, id: u64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }

        self.order.push_back(id);
        if self.order.len() > self.limit {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }

        true
    }
}

/// A topic broker serving peers over the framing protocol.
pub struct BrokerServer {
    state: Arc<BrokerState>,
    tasks: JoinSet<io::Result<()>>,
}

impl BrokerServer {
    /// Creates a new `BrokerServer`.
    ///
    /// # Arguments
    /// * `capacity` - The amount of frames queued per connection before publishers wait.
    pub fn new(capacity: usize) -> Self {
        let state = BrokerState {
            topics: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(0),
            capacity: capacity.max(1),
        };

        Self {
            state: Arc::new(state),
            tasks: JoinSet::new(),
        }
    }

    /// Accepts peers from `listener` until it fails.
    pub async fn run(&mut self, listener: TcpListener) -> io::Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    info!("broker accepted a connection from {addr}");

                    let (rx, tx) = stream.into_split();
                    let (rx, tx) = crate::channel(rx, tx);
                    self.spawn(rx, tx);
                }
                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match res {
                        Ok(Err(e)) => warn!("broker connection failed: {e}"),
                        Err(e) => warn!("broker connection task panicked: {e}"),
                        Ok(Ok(())) => {}
                    }
                }
            }
        }
    }

    /// Binds a new peer to this broker and spawns the task serving it.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    pub fn spawn<R, W>(&mut self, rx: FrameReceiver<R>, tx: FrameSender<W>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let state = self.state.clone();
        let conn = state.next_conn.fetch_add(1, Ordering::Relaxed);
        self.tasks.spawn(serve(state, conn, rx, tx));
    }
}

async fn serve<R, W>(
    state: Arc<BrokerState>,
    conn: u64,
    mut rx: FrameReceiver<R>,
    tx: FrameSender<W>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel(state.capacity);
    let writer = tokio::spawn(write_loop(tx, out_rx));

    let res = read_loop(&state, conn, &mut rx, &out_tx).await;
    state.drop_connection(conn);
    drop(out_tx);

    debug!(conn = conn; "broker connection closed");
    writer.await??;
    res
}

async fn read_loop<R>(
    state: &BrokerState,
    conn: u64,
    rx: &mut FrameReceiver<R>,
    out: &mpsc::Sender<Outbound>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut recent = RecentIds::new(DEDUP_WINDOW);

    loop {
        let frame = match rx.recv_into(&mut buf).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        match frame {
            Frame::Control(Command::Subscribe { id, topic }) => {
                debug!(conn = conn, topic = topic.as_str(); "subscribe");
                state.subscribe(conn, topic, out.clone());
                ack(out, id).await?;
            }
            Frame::Control(Command::Unsubscribe { id, topic }) => {
                debug!(conn = conn, topic = topic.as_str(); "unsubscribe");
                state.unsubscribe(conn, &topic);
                ack(out, id).await?;
            }
            Frame::Control(Command::Disconnect) => return Ok(()),
            Frame::Publish(Route { id, topic, qos }, payload) => {
                let fresh = qos != Qos::ExactlyOnce || recent.insert(id);

                if fresh {
                    state.route(&topic, qos, payload).await;
                } else {
                    debug!(conn = conn, id = id; "dropped a duplicated publish");
                }

                if qos.needs_ack() {
                    ack(out, id).await?;
                }
            }
            Frame::Err(detail) => warn!(conn = conn; "peer reported an error: {detail}"),
            other => return unexpected_frame(&other),
        }
    }
}

async fn ack(out: &mpsc::Sender<Outbound>, id: u64) -> io::Result<()> {
    out.send(Outbound::Ack(id))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "broker writer is gone"))
}

async fn write_loop<W>(mut tx: FrameSender<W>, mut out: mpsc::Receiver<Outbound>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = out.recv().await {
        match msg {
            Outbound::Ack(id) => {
                let frame = Frame::Control(Command::Ack { id });
                tx.send(&frame).await?;
            }
            Outbound::Deliver {
                topic,
                qos,
                payload,
            } => {
                let route = Route {
                    id: 0,
                    topic: Cow::Borrowed(&*topic),
                    qos,
                };

                tx.send(&Frame::Deliver(route, &payload[..])).await?;
            }
        }
    }

    tx.shutdown().await
}

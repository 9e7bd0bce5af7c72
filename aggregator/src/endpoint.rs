use std::{io, sync::Arc};

use comms::{
    FrameReceiver, FrameSender,
    frame::{Command, Frame, unexpected_frame},
    pubsub::Transport,
};
use log::{info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task::JoinSet,
};

use crate::{AggregatorErr, registry::ClientRegistry, sessions::SessionManager};

/// Serves the register, join and quit requests of the clients.
pub struct RegistrationServer<T: Transport> {
    registry: Arc<ClientRegistry>,
    sessions: Arc<SessionManager<T>>,
    tasks: JoinSet<io::Result<()>>,
}

impl<T: Transport> RegistrationServer<T> {
    pub fn new(registry: Arc<ClientRegistry>, sessions: Arc<SessionManager<T>>) -> Self {
        Self {
            registry,
            sessions,
            tasks: JoinSet::new(),
        }
    }

    /// Accepts clients from `listener` until it fails.
    pub async fn run(&mut self, listener: TcpListener) -> io::Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    info!("registration request from {addr}");

                    let (rx, tx) = stream.into_split();
                    let (rx, tx) = comms::channel(rx, tx);
                    self.spawn(rx, tx);
                }
                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match res {
                        Ok(Err(e)) => warn!("registration connection failed: {e}"),
                        Err(e) => warn!("registration task panicked: {e}"),
                        Ok(Ok(())) => {}
                    }
                }
            }
        }
    }

    /// Spawns the task answering the requests of a single connection.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the communication.
    /// * `tx` - The sending end of the communication.
    pub fn spawn<R, W>(&mut self, rx: FrameReceiver<R>, tx: FrameSender<W>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let registry = self.registry.clone();
        let sessions = self.sessions.clone();
        self.tasks.spawn(serve(registry, sessions, rx, tx));
    }
}

async fn serve<T, R, W>(
    registry: Arc<ClientRegistry>,
    sessions: Arc<SessionManager<T>>,
    mut rx: FrameReceiver<R>,
    mut tx: FrameSender<W>,
) -> io::Result<()>
where
    T: Transport,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();

    loop {
        let cmd = match rx.recv_into(&mut buf).await {
            Ok(Frame::Control(Command::Disconnect)) => break,
            Ok(Frame::Control(cmd)) => cmd,
            Ok(other) => return unexpected_frame(&other),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };

        let reply = handle(&registry, &sessions, cmd).await;
        tx.send(&Frame::Control(reply)).await?;
    }

    tx.shutdown().await
}

/// Answers a single registration request.
///
/// A join opens the session of the client and a quit closes it, so a joined client
/// always has a topic to receive broadcasts on.
pub async fn handle<T: Transport>(
    registry: &ClientRegistry,
    sessions: &SessionManager<T>,
    cmd: Command,
) -> Command {
    match cmd {
        Command::Register { host_id } => Command::Registered {
            client_id: registry.register(&host_id),
        },
        Command::Join { client_id } => match join(registry, sessions, &client_id).await {
            Ok(()) => Command::Ok,
            Err(e) => rejected(&client_id, e),
        },
        Command::Quit { client_id } => {
            sessions.close_session(&client_id).await;

            match registry.quit(&client_id) {
                Ok(()) => Command::Ok,
                Err(e) => rejected(&client_id, e),
            }
        }
        other => Command::Rejected {
            reason: format!("unsupported request {other:?}"),
        },
    }
}

async fn join<T: Transport>(
    registry: &ClientRegistry,
    sessions: &SessionManager<T>,
    client_id: &str,
) -> crate::Result<()> {
    registry.join(client_id)?;

    match sessions.open_session(client_id).await {
        Ok(_) | Err(AggregatorErr::DuplicateSession(_)) => Ok(()),
        Err(e) => {
            // The client can't be reached without a session.
            let _ = registry.quit(client_id);
            Err(e)
        }
    }
}

fn rejected(client_id: &str, err: AggregatorErr) -> Command {
    warn!(client_id = client_id; "registration request rejected: {err}");
    Command::Rejected {
        reason: err.to_string(),
    }
}

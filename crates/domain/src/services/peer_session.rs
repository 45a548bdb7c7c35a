//! One task per connected peer.
//!
//! The session owns the socket and speaks the wire protocol; every decision
//! (what to request, whom to unchoke) is made by the peer manager, which
//! talks to the session through `SessionCommand`s and hears back through
//! `SessionEvent`s.

use crate::errors::DomainError;
use crate::protocol::extension::{self, ExtensionHandshake, MetadataMessage};
use crate::protocol::{Handshake, Message, PeerId};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Request { index: u32, begin: u32, length: u32 },
    Cancel { index: u32, begin: u32, length: u32 },
    Have(u32),
    Interested(bool),
    Choke(bool),
    Block { index: u32, begin: u32, data: Vec<u8> },
    RequestMetadata(u32),
    RejectMetadata(u32),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected { peer_id: [u8; 20] },
    Extensions(ExtensionHandshake),
    Bitfield(Vec<u8>),
    Have(u32),
    Choked,
    Unchoked,
    Interested,
    NotInterested,
    Block { index: u32, begin: u32, data: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Cancel { index: u32, begin: u32, length: u32 },
    Metadata(MetadataMessage),
    /// Always the last event of a session. `None` means a requested shutdown.
    Closed(Option<DomainError>),
}

#[derive(Debug)]
pub struct SessionMessage {
    pub addr: SocketAddr,
    /// Id of the session that produced the event.
    pub session: u64,
    pub event: SessionEvent,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Distinguishes successive connections to the same address.
    pub session: u64,
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub idle_timeout: Duration,
    /// Our verified pieces, sent right after the handshake when non-empty.
    pub bitfield: Option<Vec<u8>>,
}

pub struct SessionHandle {
    pub id: u64,
    pub commands: mpsc::UnboundedSender<SessionCommand>,
    pub task: JoinHandle<()>,
}

enum Origin {
    Outbound,
    Inbound(TcpStream, Handshake),
}

pub fn spawn_outbound(
    addr: SocketAddr,
    config: SessionConfig,
    events: mpsc::Sender<SessionMessage>,
    permit: OwnedSemaphorePermit,
) -> SessionHandle {
    spawn(addr, Origin::Outbound, config, events, permit)
}

/// Attaches a connection whose handshake was already read by the listener.
pub fn spawn_inbound(
    stream: TcpStream,
    addr: SocketAddr,
    remote: Handshake,
    config: SessionConfig,
    events: mpsc::Sender<SessionMessage>,
    permit: OwnedSemaphorePermit,
) -> SessionHandle {
    spawn(addr, Origin::Inbound(stream, remote), config, events, permit)
}

fn spawn(
    addr: SocketAddr,
    origin: Origin,
    config: SessionConfig,
    events: mpsc::Sender<SessionMessage>,
    permit: OwnedSemaphorePermit,
) -> SessionHandle {
    let id = config.session;
    let (commands, command_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let session = PeerSession {
            addr,
            config,
            events: events.clone(),
            commands: command_rx,
            remote_metadata_id: None,
        };
        let outcome = session.run(origin).await;
        if let Err(ref e) = outcome {
            debug!(peer = %addr, error = %e, "Peer session ended");
        }
        let _ = events
            .send(SessionMessage {
                addr,
                session: id,
                event: SessionEvent::Closed(outcome.err()),
            })
            .await;
        drop(permit);
    });
    SessionHandle { id, commands, task }
}

struct PeerSession {
    addr: SocketAddr,
    config: SessionConfig,
    events: mpsc::Sender<SessionMessage>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    remote_metadata_id: Option<u8>,
}

fn io_error(addr: SocketAddr, e: std::io::Error) -> DomainError {
    DomainError::NetworkError(format!("{}: {}", addr, e))
}

impl PeerSession {
    async fn emit(&self, event: SessionEvent) -> Result<(), DomainError> {
        self.events
            .send(SessionMessage {
                addr: self.addr,
                session: self.config.session,
                event,
            })
            .await
            .map_err(|_| DomainError::EngineShutdown)
    }

    async fn connect(&self) -> Result<(TcpStream, Handshake), DomainError> {
        let ours = Handshake::new(self.config.info_hash, self.config.peer_id);
        tokio::time::timeout(self.config.connect_timeout, async {
            let mut stream = TcpStream::connect(self.addr)
                .await
                .map_err(|e| io_error(self.addr, e))?;
            ours.write_to(&mut stream).await.map_err(|e| io_error(self.addr, e))?;
            let theirs = Handshake::read_from(&mut stream).await?;
            Ok((stream, theirs))
        })
        .await
        .map_err(|_| DomainError::NetworkError(format!("{}: connect timed out", self.addr)))?
    }

    async fn run(mut self, origin: Origin) -> Result<(), DomainError> {
        let (stream, remote) = match origin {
            Origin::Outbound => self.connect().await?,
            Origin::Inbound(mut stream, remote) => {
                Handshake::new(self.config.info_hash, self.config.peer_id)
                    .write_to(&mut stream)
                    .await
                    .map_err(|e| io_error(self.addr, e))?;
                (stream, remote)
            }
        };

        if remote.info_hash != self.config.info_hash {
            return Err(DomainError::protocol(self.addr, "handshake for a different torrent"));
        }
        if remote.peer_id == *self.config.peer_id.as_bytes() {
            return Err(DomainError::protocol(self.addr, "connected to ourselves"));
        }
        let _ = stream.set_nodelay(true);
        self.emit(SessionEvent::Connected { peer_id: remote.peer_id }).await?;

        let (read_half, mut writer) = stream.into_split();
        if remote.supports_extensions() {
            Message::Extended {
                id: extension::HANDSHAKE_ID,
                payload: ExtensionHandshake::encode(None),
            }
            .write_to(&mut writer)
            .await
            .map_err(|e| io_error(self.addr, e))?;
        }
        if let Some(bits) = self.config.bitfield.take().filter(|b| b.iter().any(|&x| x != 0)) {
            Message::Bitfield(bits)
                .write_to(&mut writer)
                .await
                .map_err(|e| io_error(self.addr, e))?;
        }

        let (incoming_tx, mut incoming) = mpsc::channel(32);
        let reader = tokio::spawn(read_loop(read_half, self.addr, incoming_tx));
        let result = self.message_loop(&mut incoming, &mut writer).await;
        reader.abort();
        result
    }

    async fn message_loop(
        &mut self,
        incoming: &mut mpsc::Receiver<Result<Message, DomainError>>,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
    ) -> Result<(), DomainError> {
        let mut last_read = Instant::now();
        let mut last_write = Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(5).min(self.config.keep_alive));

        loop {
            tokio::select! {
                received = incoming.recv() => {
                    let message = match received {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Err(e),
                        None => return Err(DomainError::NetworkError(format!("{}: connection closed", self.addr))),
                    };
                    last_read = Instant::now();
                    self.dispatch(message).await?;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Ok(());
                    };
                    let Some(message) = self.translate(command) else {
                        return Ok(());
                    };
                    trace!(peer = %self.addr, ?message, "Sending");
                    message.write_to(writer).await.map_err(|e| io_error(self.addr, e))?;
                    last_write = Instant::now();
                }
                _ = ticker.tick() => {
                    if last_read.elapsed() >= self.config.idle_timeout {
                        return Err(DomainError::NetworkError(format!("{}: idle timeout", self.addr)));
                    }
                    if last_write.elapsed() >= self.config.keep_alive {
                        Message::KeepAlive.write_to(writer).await.map_err(|e| io_error(self.addr, e))?;
                        last_write = Instant::now();
                    }
                }
            }
        }
    }

    /// `None` ends the session.
    fn translate(&self, command: SessionCommand) -> Option<Message> {
        let message = match command {
            SessionCommand::Request { index, begin, length } => Message::Request { index, begin, length },
            SessionCommand::Cancel { index, begin, length } => Message::Cancel { index, begin, length },
            SessionCommand::Have(index) => Message::Have(index),
            SessionCommand::Interested(true) => Message::Interested,
            SessionCommand::Interested(false) => Message::NotInterested,
            SessionCommand::Choke(true) => Message::Choke,
            SessionCommand::Choke(false) => Message::Unchoke,
            SessionCommand::Block { index, begin, data } => Message::Piece { index, begin, data },
            SessionCommand::RequestMetadata(piece) => match self.remote_metadata_id {
                Some(id) => Message::Extended {
                    id,
                    payload: MetadataMessage::Request { piece }.encode(),
                },
                None => Message::KeepAlive,
            },
            SessionCommand::RejectMetadata(piece) => match self.remote_metadata_id {
                Some(id) => Message::Extended {
                    id,
                    payload: MetadataMessage::Reject { piece }.encode(),
                },
                None => Message::KeepAlive,
            },
            SessionCommand::Shutdown => return None,
        };
        Some(message)
    }

    async fn dispatch(&mut self, message: Message) -> Result<(), DomainError> {
        let event = match message {
            Message::KeepAlive | Message::Port(_) => return Ok(()),
            Message::Choke => SessionEvent::Choked,
            Message::Unchoke => SessionEvent::Unchoked,
            Message::Interested => SessionEvent::Interested,
            Message::NotInterested => SessionEvent::NotInterested,
            Message::Have(index) => SessionEvent::Have(index),
            Message::Bitfield(bits) => SessionEvent::Bitfield(bits),
            Message::Request { index, begin, length } => SessionEvent::Request { index, begin, length },
            Message::Piece { index, begin, data } => SessionEvent::Block { index, begin, data },
            Message::Cancel { index, begin, length } => SessionEvent::Cancel { index, begin, length },
            Message::Extended { id: extension::HANDSHAKE_ID, payload } => {
                let handshake = ExtensionHandshake::decode(&payload)
                    .map_err(|reason| DomainError::protocol(self.addr, reason))?;
                self.remote_metadata_id = handshake.metadata_id;
                SessionEvent::Extensions(handshake)
            }
            Message::Extended { id: extension::LOCAL_METADATA_ID, payload } => {
                let message = MetadataMessage::decode(&payload)
                    .map_err(|reason| DomainError::protocol(self.addr, reason))?;
                SessionEvent::Metadata(message)
            }
            Message::Extended { id, .. } => {
                trace!(peer = %self.addr, id, "Ignoring unsupported extension message");
                return Ok(());
            }
        };
        self.emit(event).await
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    addr: SocketAddr,
    incoming: mpsc::Sender<Result<Message, DomainError>>,
) {
    let peer = addr.to_string();
    loop {
        let result = Message::read_from(&mut reader, &peer).await;
        let failed = result.is_err();
        if incoming.send(result).await.is_err() || failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Semaphore;

    fn config(info_hash: [u8; 20]) -> SessionConfig {
        SessionConfig {
            session: 1,
            info_hash,
            peer_id: PeerId::generate(),
            connect_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(90),
            idle_timeout: Duration::from_secs(180),
            bitfield: Some(vec![0b1000_0000]),
        }
    }

    async fn next(rx: &mut mpsc::Receiver<SessionMessage>) -> SessionEvent {
        rx.recv().await.unwrap().event
    }

    #[tokio::test]
    async fn outbound_session_exchanges_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let remote_id = PeerId::generate();

        let remote = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let theirs = Handshake::read_from(&mut socket).await.unwrap();
            let mut ours = Handshake::new([3; 20], remote_id);
            ours.reserved = [0; 8];
            ours.write_to(&mut socket).await.unwrap();
            assert!(theirs.supports_extensions());

            // Our bitfield arrives first since the remote has no extensions
            let first = Message::read_from(&mut socket, "client").await.unwrap();
            assert_eq!(first, Message::Bitfield(vec![0b1000_0000]));
            Message::Unchoke.write_to(&mut socket).await.unwrap();
            Message::Piece { index: 0, begin: 0, data: vec![1, 2, 3] }
                .write_to(&mut socket)
                .await
                .unwrap();
            let request = Message::read_from(&mut socket, "client").await.unwrap();
            assert_eq!(request, Message::Request { index: 1, begin: 0, length: 16384 });
        });

        let (events_tx, mut events) = mpsc::channel(16);
        let permits = Arc::new(Semaphore::new(1));
        let permit = permits.clone().try_acquire_owned().unwrap();
        let handle = spawn_outbound(addr, config([3; 20]), events_tx, permit);

        assert_eq!(next(&mut events).await, SessionEvent::Connected { peer_id: remote_id.0 });
        assert_eq!(next(&mut events).await, SessionEvent::Unchoked);
        assert_eq!(
            next(&mut events).await,
            SessionEvent::Block { index: 0, begin: 0, data: vec![1, 2, 3] }
        );
        handle
            .commands
            .send(SessionCommand::Request { index: 1, begin: 0, length: 16384 })
            .unwrap();
        remote.await.unwrap();

        // Remote hung up
        assert!(matches!(next(&mut events).await, SessionEvent::Closed(Some(_))));
        handle.task.await.unwrap();
        assert_eq!(permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn wrong_info_hash_is_a_protocol_violation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = Handshake::read_from(&mut socket).await;
            Handshake::new([9; 20], PeerId::generate()).write_to(&mut socket).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let (events_tx, mut events) = mpsc::channel(4);
        let permit = Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap();
        spawn_outbound(addr, config([3; 20]), events_tx, permit);
        match next(&mut events).await {
            SessionEvent::Closed(Some(DomainError::PeerProtocolViolation { .. })) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn shutdown_command_closes_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = Handshake::read_from(&mut socket).await;
            Handshake::new([3; 20], PeerId::generate()).write_to(&mut socket).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (events_tx, mut events) = mpsc::channel(8);
        let permit = Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap();
        let handle = spawn_outbound(addr, config([3; 20]), events_tx, permit);
        assert!(matches!(next(&mut events).await, SessionEvent::Connected { .. }));
        handle.commands.send(SessionCommand::Shutdown).unwrap();
        loop {
            if let SessionEvent::Closed(reason) = next(&mut events).await {
                assert_eq!(reason, None);
                break;
            }
        }
    }
}

//! The per-torrent state machine.
//!
//! Each controller is a single tokio task that owns the torrent row, its piece
//! store, peer manager and tracker workers. Callers talk to it through a
//! cloneable [`TorrentController`] handle; every state change is serialized
//! through the task's command loop.

use crate::entities::{Peer, PeerStatus, Torrent, TorrentStatus, Tracker, TrackerStatus};
use crate::errors::DomainError;
use crate::protocol::metainfo::{info_hash_of, parse_info_dict, ParsedTorrent};
use crate::protocol::{Handshake, PeerId, BLOCK_SIZE};
use crate::repositories::Repositories;
use crate::services::disk::TorrentStorage;
use crate::services::peer_manager::{ManagerOutput, PeerConnectionManager};
use crate::services::peer_session::SessionMessage;
use crate::services::piece_store::{PieceStore, Verification};
use crate::services::tracker_client::{Announcer, TrackerUpdate, TrackerWorker, TransferStats};
use crate::settings::EngineSettings;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Notifications published by a controller.
#[derive(Debug, Clone, PartialEq)]
pub enum TorrentEvent {
    StatusChanged { from: TorrentStatus, to: TorrentStatus },
    /// Emitted exactly once per piece.
    PieceVerified(u32),
    PieceRejected { index: u32, peer: SocketAddr },
    PeerConnected(SocketAddr),
    PeerDisconnected { addr: SocketAddr, banned: bool },
    TrackerAnnounced { url: String, peers: usize },
    TrackerFailed { url: String, error: String },
    MetadataReady,
}

#[derive(Debug, Clone, Serialize)]
pub struct TorrentSnapshot {
    pub torrent: Torrent,
    pub verified_pieces: u32,
    pub connected_peers: usize,
    pub known_peers: usize,
    pub trackers: Vec<Tracker>,
}

impl TorrentSnapshot {
    fn idle(torrent: &Torrent) -> Self {
        Self {
            torrent: torrent.clone(),
            verified_pieces: 0,
            connected_peers: 0,
            known_peers: 0,
            trackers: Vec::new(),
        }
    }
}

/// Engine-wide collaborators every controller shares.
#[derive(Clone)]
pub struct ControllerContext {
    pub repositories: Repositories,
    pub settings: Arc<EngineSettings>,
    pub announcer: Arc<dyn Announcer>,
    pub peer_id: PeerId,
    pub global_slots: Arc<Semaphore>,
}

type Reply = oneshot::Sender<Result<TorrentStatus, DomainError>>;

enum Command {
    Start(Reply),
    Pause(Reply),
    Resume(Reply),
    Inbound {
        stream: TcpStream,
        addr: SocketAddr,
        handshake: Handshake,
    },
    Shutdown(oneshot::Sender<()>),
}

struct VerifyOutcome {
    index: u32,
    peer: SocketAddr,
    result: Result<Verification, DomainError>,
}

/// Handle to a running controller task.
#[derive(Clone)]
pub struct TorrentController {
    torrent_id: i32,
    info_hash: String,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<TorrentSnapshot>,
    events: broadcast::Sender<TorrentEvent>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

pub(crate) fn decode_info_hash(info_hash: &str) -> Result<[u8; 20], DomainError> {
    hex::decode(info_hash)
        .ok()
        .and_then(|bytes| <[u8; 20]>::try_from(bytes).ok())
        .ok_or_else(|| DomainError::MalformedMetadata(format!("invalid info hash '{}'", info_hash)))
}

impl TorrentController {
    /// Spawns the controller task for a persisted torrent. The torrent stays
    /// idle until `start` or `resume`.
    pub fn spawn(torrent: Torrent, context: ControllerContext) -> Result<Self, DomainError> {
        let torrent_id = torrent
            .id
            .ok_or_else(|| DomainError::ValidationError("torrent has not been persisted".to_string()))?;
        let info_hash = decode_info_hash(&torrent.info_hash)?;

        let (commands, command_rx) = mpsc::channel(32);
        let (events, _) = broadcast::channel(256);
        let (snapshot_tx, snapshot) = watch::channel(TorrentSnapshot::idle(&torrent));

        let handle = Self {
            torrent_id,
            info_hash: torrent.info_hash.clone(),
            commands,
            snapshot,
            events: events.clone(),
            task: Arc::new(Mutex::new(None)),
        };

        let actor = Actor::new(torrent_id, info_hash, torrent, context, events, snapshot_tx);
        let task = tokio::spawn(actor.run(command_rx));
        *handle.task.lock() = Some(task);
        Ok(handle)
    }

    pub fn torrent_id(&self) -> i32 {
        self.torrent_id
    }

    pub fn info_hash(&self) -> &str {
        &self.info_hash
    }

    async fn call(&self, command: impl FnOnce(Reply) -> Command) -> Result<TorrentStatus, DomainError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| DomainError::EngineShutdown)?;
        rx.await.map_err(|_| DomainError::EngineShutdown)?
    }

    /// Begins (or continues) fetching metadata, downloading or seeding.
    pub async fn start(&self) -> Result<TorrentStatus, DomainError> {
        self.call(Command::Start).await
    }

    /// Stops all transfers, releasing sockets and tracker timers.
    pub async fn pause(&self) -> Result<TorrentStatus, DomainError> {
        self.call(Command::Pause).await
    }

    /// Leaves `Paused` (or `Error`); verified pieces are never fetched again.
    pub async fn resume(&self) -> Result<TorrentStatus, DomainError> {
        self.call(Command::Resume).await
    }

    pub fn snapshot(&self) -> TorrentSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> TorrentStatus {
        self.snapshot.borrow().torrent.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TorrentEvent> {
        self.events.subscribe()
    }

    /// Waits until the published snapshot satisfies `condition`.
    pub async fn wait_for(&self, mut condition: impl FnMut(&TorrentSnapshot) -> bool) -> Result<TorrentSnapshot, DomainError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| condition(s))
            .await
            .map_err(|_| DomainError::EngineShutdown)?;
        Ok(snapshot.clone())
    }

    /// Hands an accepted connection to this torrent's peer pool.
    pub async fn attach_inbound(&self, stream: TcpStream, addr: SocketAddr, handshake: Handshake) -> bool {
        self.commands
            .send(Command::Inbound { stream, addr, handshake })
            .await
            .is_ok()
    }

    /// Stops the swarm and ends the task.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Tracker workers of an active torrent.
struct Swarm {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

struct Actor {
    torrent_id: i32,
    info_hash: [u8; 20],
    torrent: Torrent,
    ctx: ControllerContext,
    store: Option<Arc<PieceStore>>,
    manager: PeerConnectionManager,
    trackers: Vec<Tracker>,
    swarm: Option<Swarm>,
    session_rx: mpsc::Receiver<SessionMessage>,
    tracker_tx: mpsc::Sender<TrackerUpdate>,
    tracker_rx: mpsc::Receiver<TrackerUpdate>,
    verify_tx: mpsc::Sender<VerifyOutcome>,
    verify_rx: mpsc::Receiver<VerifyOutcome>,
    stats: watch::Sender<TransferStats>,
    events: broadcast::Sender<TorrentEvent>,
    snapshot: watch::Sender<TorrentSnapshot>,
    disk_backoff_until: Option<Instant>,
    starving_since: Option<Instant>,
}

impl Actor {
    fn new(
        torrent_id: i32,
        info_hash: [u8; 20],
        torrent: Torrent,
        ctx: ControllerContext,
        events: broadcast::Sender<TorrentEvent>,
        snapshot: watch::Sender<TorrentSnapshot>,
    ) -> Self {
        let (session_tx, session_rx) = mpsc::channel(1024);
        let (tracker_tx, tracker_rx) = mpsc::channel(64);
        let (verify_tx, verify_rx) = mpsc::channel(64);
        let manager = PeerConnectionManager::new(
            torrent_id,
            info_hash,
            ctx.peer_id,
            ctx.settings.clone(),
            ctx.global_slots.clone(),
            session_tx,
        );
        let (stats, _) = watch::channel(TransferStats::default());

        Self {
            torrent_id,
            info_hash,
            torrent,
            ctx,
            store: None,
            manager,
            trackers: Vec::new(),
            swarm: None,
            session_rx,
            tracker_tx,
            tracker_rx,
            verify_tx,
            verify_rx,
            stats,
            events,
            snapshot,
            disk_backoff_until: None,
            starving_since: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.load().await;

        let mut ticker = tokio::time::interval(self.ctx.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.stop_swarm().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.stop_swarm().await;
                        break;
                    }
                },
                Some(message) = self.session_rx.recv() => self.on_session(message).await,
                Some(update) = self.tracker_rx.recv() => self.on_tracker(update).await,
                Some(outcome) = self.verify_rx.recv() => self.on_verified(outcome).await,
                _ = ticker.tick() => self.on_tick().await,
            }
        }
        debug!(torrent_id = self.torrent_id, "Torrent controller stopped");
    }

    /// Reads trackers and persisted piece state so the first snapshot is
    /// accurate before the torrent is started.
    async fn load(&mut self) {
        match self.ctx.repositories.trackers.find_by_torrent_id(self.torrent_id).await {
            Ok(trackers) => self.trackers = trackers,
            Err(e) => warn!(torrent_id = self.torrent_id, error = %e, "Failed to load trackers"),
        }
        if self.torrent.has_metadata() && !self.torrent.status.is_error() {
            if let Err(e) = self.ensure_store().await {
                self.fail_with(&e).await;
            }
        }
        self.publish();
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let result = self.start().await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Pause(reply) => {
                let result = self.pause().await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Resume(reply) => {
                let result = self.resume().await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Inbound { stream, addr, handshake } => {
                if self.swarm.is_none() {
                    debug!(torrent_id = self.torrent_id, peer = %addr, "Refusing inbound peer: torrent is idle");
                    return;
                }
                if self.manager.attach_inbound(stream, addr, handshake, self.store.as_ref()) {
                    debug!(torrent_id = self.torrent_id, peer = %addr, "Accepted inbound peer");
                }
            }
            Command::Shutdown(_) => unreachable!("handled by the run loop"),
        }
    }

    async fn start(&mut self) -> Result<TorrentStatus, DomainError> {
        if self.torrent.status.is_error() {
            let next = if self.torrent.has_metadata() {
                TorrentStatus::MetadataReady
            } else {
                TorrentStatus::Parsing
            };
            self.set_status(next).await?;
        }

        match self.torrent.status.clone() {
            TorrentStatus::Parsing => {
                self.start_swarm().await;
                Ok(TorrentStatus::Parsing)
            }
            TorrentStatus::MetadataReady | TorrentStatus::Paused => self.begin_transfer().await,
            TorrentStatus::Completed => {
                self.ensure_store().await?;
                self.set_status(TorrentStatus::Seeding).await?;
                self.start_swarm().await;
                Ok(TorrentStatus::Seeding)
            }
            status @ (TorrentStatus::Downloading | TorrentStatus::Seeding) => {
                self.ensure_store().await?;
                self.start_swarm().await;
                Ok(status)
            }
            TorrentStatus::Error(reason) => Err(DomainError::ValidationError(reason)),
        }
    }

    async fn resume(&mut self) -> Result<TorrentStatus, DomainError> {
        match self.torrent.status.clone() {
            TorrentStatus::Paused | TorrentStatus::Error(_) => self.start().await,
            status if status.is_active() => Ok(status),
            status => Err(DomainError::InvalidTransition {
                from: status.name().to_string(),
                to: TorrentStatus::Downloading.name().to_string(),
            }),
        }
    }

    async fn pause(&mut self) -> Result<TorrentStatus, DomainError> {
        let status = self.torrent.status.clone();
        if status == TorrentStatus::Paused {
            return Ok(status);
        }
        if !status.can_transition_to(&TorrentStatus::Paused) {
            return Err(DomainError::InvalidTransition {
                from: status.name().to_string(),
                to: TorrentStatus::Paused.name().to_string(),
            });
        }
        self.stop_swarm().await;
        self.set_status(TorrentStatus::Paused).await?;
        Ok(TorrentStatus::Paused)
    }

    /// Moves a torrent with known layout into downloading, seeding or
    /// completed depending on what is already verified.
    async fn begin_transfer(&mut self) -> Result<TorrentStatus, DomainError> {
        if !self.torrent.has_metadata() {
            self.set_status(TorrentStatus::Parsing).await?;
            self.start_swarm().await;
            return Ok(TorrentStatus::Parsing);
        }

        let store = match self.ensure_store().await {
            Ok(store) => store,
            Err(e) => {
                self.fail_with(&e).await;
                return Err(e);
            }
        };
        let next = if !store.is_complete() {
            TorrentStatus::Downloading
        } else if self.ctx.settings.seed_after_complete {
            TorrentStatus::Seeding
        } else {
            TorrentStatus::Completed
        };
        self.set_status(next.clone()).await?;
        if next != TorrentStatus::Completed {
            self.start_swarm().await;
        }
        Ok(next)
    }

    async fn ensure_store(&mut self) -> Result<Arc<PieceStore>, DomainError> {
        if let Some(store) = &self.store {
            return Ok(store.clone());
        }
        let files = self.ctx.repositories.files.find_by_torrent_id(self.torrent_id).await?;
        let storage = TorrentStorage::new(&self.ctx.settings.download_dir, &self.torrent, &files);
        let root = storage.root_path().to_string_lossy().into_owned();
        let store = Arc::new(PieceStore::load(&self.torrent, storage, self.ctx.repositories.pieces.clone()).await?);

        self.manager.layout_ready(&store);
        self.torrent.update_progress(store.verified_count());
        if self.torrent.file_path.as_deref() != Some(root.as_str()) {
            self.torrent.file_path = Some(root);
            self.persist_torrent().await;
        }
        self.store = Some(store.clone());
        Ok(store)
    }

    async fn set_status(&mut self, next: TorrentStatus) -> Result<(), DomainError> {
        let from = self.torrent.status.clone();
        if from == next {
            return Ok(());
        }
        self.torrent.transition(next.clone())?;
        self.persist_torrent().await;
        info!(torrent_id = self.torrent_id, from = %from, to = %next, "Torrent status changed");
        let _ = self.events.send(TorrentEvent::StatusChanged { from, to: next });
        self.publish();
        Ok(())
    }

    /// Moves the torrent to `Error`; the swarm is stopped but the process and
    /// other torrents carry on.
    async fn fail(&mut self, reason: String) {
        self.stop_swarm().await;
        let from = self.torrent.status.clone();
        self.torrent.fail(reason.clone());
        self.persist_torrent().await;
        error!(torrent_id = self.torrent_id, reason = %reason, "Torrent entered error state");
        let _ = self.events.send(TorrentEvent::StatusChanged {
            from,
            to: self.torrent.status.clone(),
        });
        self.publish();
    }

    async fn fail_with(&mut self, error: &DomainError) {
        self.fail(error.to_string()).await;
    }

    async fn persist_torrent(&mut self) {
        match self.ctx.repositories.torrents.update(&self.torrent).await {
            Ok(saved) => self.torrent.updated_at = saved.updated_at,
            Err(e) => warn!(torrent_id = self.torrent_id, error = %e, "Failed to persist torrent"),
        }
    }

    async fn start_swarm(&mut self) {
        if self.swarm.is_some() {
            return;
        }
        let peers = &self.ctx.repositories.peers;
        if let Err(e) = peers.delete_old(self.torrent_id, self.ctx.settings.peer_retention_hours).await {
            warn!(torrent_id = self.torrent_id, error = %e, "Failed to prune stale peers");
        }
        match peers.find_by_torrent_id(self.torrent_id).await {
            Ok(known) => {
                let mut candidates = Vec::new();
                for peer in known {
                    let Some(addr) = peer.socket_addr() else {
                        continue;
                    };
                    if peer.status == PeerStatus::Banned {
                        self.manager.ban(addr);
                    } else {
                        candidates.push(addr);
                    }
                }
                self.manager.add_candidates(candidates);
            }
            Err(e) => warn!(torrent_id = self.torrent_id, error = %e, "Failed to load known peers"),
        }
        match self.ctx.repositories.trackers.find_by_torrent_id(self.torrent_id).await {
            Ok(trackers) => self.trackers = trackers,
            Err(e) => warn!(torrent_id = self.torrent_id, error = %e, "Failed to load trackers"),
        }

        self.publish_stats();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let workers = self
            .trackers
            .iter()
            .filter(|t| t.is_usable())
            .map(|tracker| {
                TrackerWorker {
                    tracker: tracker.clone(),
                    announcer: self.ctx.announcer.clone(),
                    info_hash: self.info_hash,
                    peer_id: self.ctx.peer_id,
                    port: self.ctx.settings.listen_port,
                    stats: self.stats.subscribe(),
                    updates: self.tracker_tx.clone(),
                    shutdown: shutdown_rx.clone(),
                    grace: self.ctx.settings.shutdown_grace,
                }
                .spawn()
            })
            .collect::<Vec<_>>();

        info!(
            torrent_id = self.torrent_id,
            trackers = workers.len(),
            candidates = self.manager.candidate_count(),
            "Swarm started"
        );
        self.swarm = Some(Swarm { shutdown, workers });
        self.starving_since = None;
        self.disk_backoff_until = None;
        self.manager.fill_pool(self.store.as_ref());
    }

    /// Cancels every session and tracker timer within the grace period.
    async fn stop_swarm(&mut self) {
        let Some(swarm) = self.swarm.take() else {
            return;
        };
        let _ = swarm.shutdown.send(true);
        self.manager.shutdown().await;

        let grace = self.ctx.settings.shutdown_grace * 2;
        for mut worker in swarm.workers {
            if tokio::time::timeout(grace, &mut worker).await.is_err() {
                worker.abort();
            }
        }
        if let Err(e) = self.ctx.repositories.peers.disconnect_all(self.torrent_id).await {
            warn!(torrent_id = self.torrent_id, error = %e, "Failed to mark peers disconnected");
        }
        info!(torrent_id = self.torrent_id, "Swarm stopped");
    }

    async fn on_session(&mut self, message: SessionMessage) {
        let outputs = self.manager.on_event(message, self.store.as_ref());
        let peers_changed = outputs.iter().any(|o| {
            matches!(o, ManagerOutput::PeerConnected { .. } | ManagerOutput::PeerDisconnected { .. })
        });
        for output in outputs {
            match output {
                ManagerOutput::PeerConnected { addr, peer_id } => {
                    let peers = &self.ctx.repositories.peers;
                    let result = match peers.upsert_batch(&[Peer::from_addr(self.torrent_id, addr)]).await {
                        Ok(()) => {
                            peers
                                .update_status(self.torrent_id, &addr.ip().to_string(), addr.port(), PeerStatus::Connected, Some(peer_id))
                                .await
                        }
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        warn!(torrent_id = self.torrent_id, peer = %addr, error = %e, "Failed to persist peer");
                    }
                    let _ = self.events.send(TorrentEvent::PeerConnected(addr));
                }
                ManagerOutput::PeerDisconnected { addr, reason, banned } => {
                    if let Some(reason) = &reason {
                        debug!(torrent_id = self.torrent_id, peer = %addr, reason = %reason, "Peer session ended");
                    }
                    let status = if banned { PeerStatus::Banned } else { PeerStatus::Disconnected };
                    if let Err(e) = self
                        .ctx
                        .repositories
                        .peers
                        .update_status(self.torrent_id, &addr.ip().to_string(), addr.port(), status, None)
                        .await
                    {
                        warn!(torrent_id = self.torrent_id, peer = %addr, error = %e, "Failed to persist peer");
                    }
                    let _ = self.events.send(TorrentEvent::PeerDisconnected { addr, banned });
                }
                ManagerOutput::PieceComplete { index, peer, data } => self.begin_verify(index, peer, data),
                ManagerOutput::MetadataComplete(bytes) => self.on_metadata(bytes).await,
            }
        }
        self.schedule();
        if peers_changed {
            self.publish();
        }
    }

    /// Hashing and the durable write run off the actor; the outcome comes
    /// back through `verify_rx`.
    fn begin_verify(&mut self, index: u32, peer: SocketAddr, data: Vec<u8>) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let tx = self.verify_tx.clone();
        tokio::spawn(async move {
            let result = match store.mark_downloaded(index, data).await {
                Ok(true) => store.verify(index).await,
                Ok(false) => Ok(Verification::AlreadyVerified),
                Err(e) => Err(e),
            };
            let _ = tx.send(VerifyOutcome { index, peer, result }).await;
        });
    }

    async fn on_verified(&mut self, outcome: VerifyOutcome) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let VerifyOutcome { index, peer, result } = outcome;
        match result {
            Ok(Verification::Verified) => {
                self.manager.piece_verified(index, &store);
                self.torrent.update_progress(store.verified_count());
                self.persist_torrent().await;
                debug!(torrent_id = self.torrent_id, piece = index, progress = self.torrent.progress, "Piece verified");
                let _ = self.events.send(TorrentEvent::PieceVerified(index));
                self.publish_stats();
                self.check_completion(&store).await;
            }
            Ok(Verification::AlreadyVerified) => self.manager.piece_failed(index),
            Ok(Verification::Rejected) => {
                let banned = self.manager.piece_rejected(index, peer);
                warn!(
                    torrent_id = self.torrent_id,
                    piece = index,
                    peer = %peer,
                    banned,
                    error = %DomainError::PieceHashMismatch(index),
                    "Discarding corrupt piece"
                );
                let _ = self.events.send(TorrentEvent::PieceRejected { index, peer });
            }
            Err(e @ DomainError::ResourceExhaustion(_)) => {
                self.manager.piece_failed(index);
                self.disk_backoff_until = Some(Instant::now() + self.ctx.settings.disk_full_backoff);
                warn!(
                    torrent_id = self.torrent_id,
                    piece = index,
                    error = %e,
                    backoff_secs = self.ctx.settings.disk_full_backoff.as_secs(),
                    "Throttling new pieces"
                );
            }
            Err(e) if e.is_fatal_to_torrent() => {
                self.manager.piece_failed(index);
                self.fail_with(&e).await;
            }
            Err(e) => {
                self.manager.piece_failed(index);
                warn!(torrent_id = self.torrent_id, piece = index, error = %e, "Piece could not be stored");
            }
        }
        self.schedule();
        self.publish();
    }

    async fn check_completion(&mut self, store: &PieceStore) {
        if !store.is_complete() || self.torrent.status != TorrentStatus::Downloading {
            return;
        }
        info!(torrent_id = self.torrent_id, "Download complete");
        if self.ctx.settings.seed_after_complete {
            if let Err(e) = self.set_status(TorrentStatus::Seeding).await {
                warn!(torrent_id = self.torrent_id, error = %e, "Cannot start seeding");
            }
        } else {
            self.stop_swarm().await;
            if let Err(e) = self.set_status(TorrentStatus::Completed).await {
                warn!(torrent_id = self.torrent_id, error = %e, "Cannot mark torrent completed");
            }
        }
    }

    async fn on_metadata(&mut self, bytes: Vec<u8>) {
        if info_hash_of(&bytes) != self.torrent.info_hash.to_ascii_lowercase() {
            warn!(torrent_id = self.torrent_id, "Received metadata does not match the info hash, retrying");
            self.manager.reset_metadata();
            return;
        }
        let parsed = match parse_info_dict(&bytes, &self.torrent.info_hash) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.fail_with(&e).await;
                return;
            }
        };
        if let Err(e) = self.install_layout(parsed).await {
            self.fail_with(&e).await;
        }
    }

    /// Persists a layout learned from peers, then continues as if the
    /// torrent had been added from a `.torrent` file.
    async fn install_layout(&mut self, parsed: ParsedTorrent) -> Result<(), DomainError> {
        self.torrent.apply_layout(
            parsed.name.clone(),
            parsed.total_size,
            parsed.piece_length as i32,
            parsed.piece_count(),
        );
        self.ctx.repositories.pieces.save_batch(&parsed.pieces(self.torrent_id)).await?;
        self.ctx
            .repositories
            .files
            .save_batch(&parsed.torrent_files(self.torrent_id))
            .await?;
        self.persist_torrent().await;
        self.ensure_store().await?;

        info!(
            torrent_id = self.torrent_id,
            name = %self.torrent.name,
            pieces = parsed.piece_count(),
            "Metadata received"
        );
        self.set_status(TorrentStatus::MetadataReady).await?;
        let _ = self.events.send(TorrentEvent::MetadataReady);
        if self.swarm.is_some() {
            self.begin_transfer().await?;
        }
        Ok(())
    }

    async fn on_tracker(&mut self, update: TrackerUpdate) {
        let tracker = match &update {
            TrackerUpdate::Announced { tracker, .. } | TrackerUpdate::Failed { tracker, .. } => tracker.clone(),
        };
        if let Err(e) = self.ctx.repositories.trackers.update(&tracker).await {
            warn!(torrent_id = self.torrent_id, tracker = %tracker.url, error = %e, "Failed to persist tracker");
        }
        if let Some(row) = self.trackers.iter_mut().find(|t| t.id == tracker.id) {
            *row = tracker.clone();
        }

        match update {
            TrackerUpdate::Announced { peers, .. } => {
                let _ = self.events.send(TorrentEvent::TrackerAnnounced {
                    url: tracker.url.clone(),
                    peers: peers.len(),
                });
                if self.swarm.is_none() {
                    return;
                }
                let rows: Vec<Peer> = peers.iter().map(|addr| Peer::from_addr(self.torrent_id, *addr)).collect();
                if let Err(e) = self.ctx.repositories.peers.upsert_batch(&rows).await {
                    warn!(torrent_id = self.torrent_id, error = %e, "Failed to persist discovered peers");
                }
                let added = self.manager.add_candidates(peers);
                debug!(torrent_id = self.torrent_id, tracker = %tracker.url, added, "New peer candidates");
                self.manager.fill_pool(self.store.as_ref());
            }
            TrackerUpdate::Failed { error, .. } => {
                let _ = self.events.send(TorrentEvent::TrackerFailed {
                    url: tracker.url.clone(),
                    error: error.to_string(),
                });
            }
        }
        self.publish();
    }

    async fn on_tick(&mut self) {
        if self.swarm.is_none() {
            return;
        }
        let now = Instant::now();
        self.manager.expire_requests(now);
        self.manager.fill_pool(self.store.as_ref());
        self.schedule();
        if self.is_starved(now) {
            self.fail("no reachable peers".to_string()).await;
        }
        self.publish_stats();
        self.publish();
    }

    fn schedule(&mut self) {
        if self.swarm.is_none() {
            return;
        }
        let allow_new = match self.disk_backoff_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                self.disk_backoff_until = None;
                true
            }
            None => true,
        };
        self.manager.schedule(self.store.as_ref(), allow_new);
    }

    /// True once a downloading torrent has had no peers, no candidates and
    /// no working tracker for longer than the starvation budget.
    fn is_starved(&mut self, now: Instant) -> bool {
        let starving = self.torrent.status == TorrentStatus::Downloading
            && self.manager.session_count() == 0
            && self.manager.candidate_count() == 0
            && self
                .trackers
                .iter()
                .all(|t| t.status == TrackerStatus::Error || !t.is_usable());
        if !starving {
            self.starving_since = None;
            return false;
        }
        let since = *self.starving_since.get_or_insert(now);
        now.duration_since(since) >= self.ctx.settings.starvation_timeout
    }

    fn publish_stats(&self) {
        let (left, complete) = match &self.store {
            Some(store) => (store.missing_bytes(), store.is_complete()),
            // Unknown until metadata arrives; non-zero keeps us a leecher
            None => (BLOCK_SIZE as u64, false),
        };
        self.stats.send_replace(TransferStats {
            uploaded: self.manager.uploaded(),
            downloaded: self.manager.downloaded(),
            left,
            complete,
        });
    }

    fn publish(&self) {
        self.snapshot.send_replace(TorrentSnapshot {
            torrent: self.torrent.clone(),
            verified_pieces: self.store.as_ref().map(|s| s.verified_count()).unwrap_or(0),
            connected_peers: self.manager.connected_count(),
            known_peers: self.manager.known_count(),
            trackers: self.trackers.clone(),
        });
    }
}

//! Peer pool and block assignment ledger for one torrent.
//!
//! Owned by the torrent's controller task, so every ledger mutation happens on
//! that task together with the request it describes.

use crate::errors::DomainError;
use crate::protocol::extension::MetadataAssembler;
use crate::protocol::extension::MetadataMessage;
use crate::protocol::{Bitfield, Handshake, PeerId, BLOCK_SIZE};
use crate::services::peer_session::{
    self, SessionCommand, SessionConfig, SessionEvent, SessionHandle, SessionMessage,
};
use crate::services::piece_store::PieceStore;
use crate::settings::EngineSettings;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Largest block a peer may request from us.
const MAX_UPLOAD_REQUEST: u32 = 128 * 1024;

#[derive(Debug)]
pub enum ManagerOutput {
    PeerConnected { addr: SocketAddr, peer_id: String },
    PeerDisconnected { addr: SocketAddr, reason: Option<DomainError>, banned: bool },
    /// Every block of a piece arrived from `peer`.
    PieceComplete { index: u32, peer: SocketAddr, data: Vec<u8> },
    MetadataComplete(Vec<u8>),
}

struct PeerState {
    handle: SessionHandle,
    connected: bool,
    peer_choking: bool,
    am_interested: bool,
    peer_interested: bool,
    am_choking: bool,
    bitfield: Option<Bitfield>,
    pending_bitfield: Option<Vec<u8>>,
    pending_haves: Vec<u32>,
    outstanding: usize,
    latency: Option<Duration>,
    metadata_capable: bool,
    violation: Option<DomainError>,
}

impl PeerState {
    fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            connected: false,
            peer_choking: true,
            am_interested: false,
            peer_interested: false,
            am_choking: true,
            bitfield: None,
            pending_bitfield: None,
            pending_haves: Vec::new(),
            outstanding: 0,
            latency: None,
            metadata_capable: false,
            violation: None,
        }
    }

    fn send(&self, command: SessionCommand) {
        // A closed channel means the session is already winding down
        let _ = self.handle.commands.send(command);
    }

    fn record_latency(&mut self, sample: Duration) {
        self.latency = Some(match self.latency {
            Some(current) => (current * 3 + sample) / 4,
            None => sample,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlockState {
    Missing,
    Requested(Instant),
    Received,
}

struct Assignment {
    peer: SocketAddr,
    blocks: Vec<BlockState>,
    data: Vec<u8>,
    received: usize,
    last_activity: Instant,
    verifying: bool,
}

impl Assignment {
    fn new(peer: SocketAddr, piece_size: u32, now: Instant) -> Self {
        let blocks = ((piece_size + BLOCK_SIZE - 1) / BLOCK_SIZE) as usize;
        Self {
            peer,
            blocks: vec![BlockState::Missing; blocks],
            data: vec![0u8; piece_size as usize],
            received: 0,
            last_activity: now,
            verifying: false,
        }
    }

    fn block_length(&self, block: usize) -> u32 {
        let start = block * BLOCK_SIZE as usize;
        (self.data.len() - start).min(BLOCK_SIZE as usize) as u32
    }
}

pub struct PeerConnectionManager {
    torrent_id: i32,
    info_hash: [u8; 20],
    peer_id: PeerId,
    settings: Arc<EngineSettings>,
    global_slots: Arc<Semaphore>,
    events: mpsc::Sender<SessionMessage>,
    candidates: VecDeque<SocketAddr>,
    candidate_set: HashSet<SocketAddr>,
    peers: HashMap<SocketAddr, PeerState>,
    banned: HashSet<SocketAddr>,
    hash_failures: HashMap<SocketAddr, u32>,
    ledger: HashMap<u32, Assignment>,
    failed_peers: HashMap<u32, HashSet<SocketAddr>>,
    availability: Vec<u32>,
    metadata: Option<MetadataAssembler>,
    metadata_requests: HashMap<u32, (SocketAddr, Instant)>,
    uploaded: u64,
    downloaded: u64,
    exhausted_logged: bool,
    next_session: u64,
}

impl PeerConnectionManager {
    pub fn new(
        torrent_id: i32,
        info_hash: [u8; 20],
        peer_id: PeerId,
        settings: Arc<EngineSettings>,
        global_slots: Arc<Semaphore>,
        events: mpsc::Sender<SessionMessage>,
    ) -> Self {
        Self {
            torrent_id,
            info_hash,
            peer_id,
            settings,
            global_slots,
            events,
            candidates: VecDeque::new(),
            candidate_set: HashSet::new(),
            peers: HashMap::new(),
            banned: HashSet::new(),
            hash_failures: HashMap::new(),
            ledger: HashMap::new(),
            failed_peers: HashMap::new(),
            availability: Vec::new(),
            metadata: None,
            metadata_requests: HashMap::new(),
            uploaded: 0,
            downloaded: 0,
            exhausted_logged: false,
            next_session: 0,
        }
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.connected).count()
    }

    /// Sessions still handshaking count as live too.
    pub fn session_count(&self) -> usize {
        self.peers.len()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn known_count(&self) -> usize {
        self.peers.len() + self.candidates.len()
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.banned.contains(addr)
    }

    pub fn ban(&mut self, addr: SocketAddr) {
        self.banned.insert(addr);
        self.candidate_set.remove(&addr);
        self.candidates.retain(|a| *a != addr);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Queues peers for outbound connection; known, connected and banned
    /// peers are skipped.
    pub fn add_candidates(&mut self, addrs: impl IntoIterator<Item = SocketAddr>) -> usize {
        let mut added = 0;
        for addr in addrs {
            if addr.port() == 0
                || addr.ip().is_unspecified()
                || self.banned.contains(&addr)
                || self.peers.contains_key(&addr)
                || !self.candidate_set.insert(addr)
            {
                continue;
            }
            self.candidates.push_back(addr);
            added += 1;
        }
        added
    }

    fn session_config(&mut self, store: Option<&Arc<PieceStore>>) -> SessionConfig {
        self.next_session += 1;
        SessionConfig {
            session: self.next_session,
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            connect_timeout: self.settings.connect_timeout,
            keep_alive: self.settings.keep_alive_interval,
            idle_timeout: self.settings.idle_timeout,
            bitfield: store.map(|s| s.bitfield().as_bytes().to_vec()),
        }
    }

    /// Opens outbound sessions until the per-torrent cap, the global cap or
    /// the candidate queue runs out. Returns the peers now connecting.
    pub fn fill_pool(&mut self, store: Option<&Arc<PieceStore>>) -> Vec<SocketAddr> {
        let mut started = Vec::new();
        while self.peers.len() < self.settings.max_peers_per_torrent {
            let Some(addr) = self.candidates.pop_front() else {
                break;
            };
            let permit = match self.global_slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.candidates.push_front(addr);
                    if !self.exhausted_logged {
                        let err = DomainError::ResourceExhaustion("global connection limit reached".to_string());
                        warn!(torrent_id = self.torrent_id, error = %err, "Deferring peer connections");
                        self.exhausted_logged = true;
                    }
                    break;
                }
            };
            self.exhausted_logged = false;
            self.candidate_set.remove(&addr);

            let config = self.session_config(store);
            let handle = peer_session::spawn_outbound(addr, config, self.events.clone(), permit);
            self.peers.insert(addr, PeerState::new(handle));
            started.push(addr);
        }
        if !started.is_empty() {
            debug!(torrent_id = self.torrent_id, count = started.len(), "Connecting to peers");
        }
        started
    }

    /// Adopts a connection accepted by the listener. Refused connections are
    /// dropped, closing the socket.
    pub fn attach_inbound(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
        remote: Handshake,
        store: Option<&Arc<PieceStore>>,
    ) -> bool {
        if self.banned.contains(&addr)
            || self.peers.contains_key(&addr)
            || self.peers.len() >= self.settings.max_peers_per_torrent
        {
            return false;
        }
        let Ok(permit) = self.global_slots.clone().try_acquire_owned() else {
            debug!(torrent_id = self.torrent_id, peer = %addr, "Refusing inbound peer: global limit reached");
            return false;
        };
        self.candidate_set.remove(&addr);
        self.candidates.retain(|a| *a != addr);

        let config = self.session_config(store);
        let handle = peer_session::spawn_inbound(stream, addr, remote, config, self.events.clone(), permit);
        self.peers.insert(addr, PeerState::new(handle));
        true
    }

    /// Tears a session down, remembering why for the `Closed` event.
    fn drop_peer(&mut self, addr: SocketAddr, reason: DomainError) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            debug!(torrent_id = self.torrent_id, peer = %addr, reason = %reason, "Dropping peer");
            peer.violation.get_or_insert(reason);
            peer.send(SessionCommand::Shutdown);
        }
        self.release_peer_work(addr);
    }

    /// Returns every unfinished piece owned by `addr` to the pending set.
    pub fn release_peer_work(&mut self, addr: SocketAddr) -> Vec<u32> {
        let released: Vec<u32> = self
            .ledger
            .iter()
            .filter(|(_, a)| a.peer == addr && !a.verifying)
            .map(|(index, _)| *index)
            .collect();
        for index in &released {
            self.ledger.remove(index);
        }
        self.metadata_requests.retain(|_, (peer, _)| *peer != addr);
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.outstanding = 0;
        }
        if !released.is_empty() {
            debug!(torrent_id = self.torrent_id, peer = %addr, pieces = ?released, "Released peer work");
        }
        released
    }

    /// Releases pieces whose owner made no progress within the piece
    /// timeout and drops that owner.
    pub fn expire_requests(&mut self, now: Instant) -> Vec<u32> {
        let timeout = self.settings.piece_timeout;
        let stale: Vec<(u32, SocketAddr)> = self
            .ledger
            .iter()
            .filter(|(_, a)| !a.verifying && now.duration_since(a.last_activity) >= timeout)
            .map(|(index, a)| (*index, a.peer))
            .collect();

        let mut expired = Vec::new();
        for (index, addr) in stale {
            if let Some(assignment) = self.ledger.remove(&index) {
                if let Some(peer) = self.peers.get(&addr) {
                    for (block, state) in assignment.blocks.iter().enumerate() {
                        if matches!(state, BlockState::Requested(_)) {
                            peer.send(SessionCommand::Cancel {
                                index,
                                begin: block as u32 * BLOCK_SIZE,
                                length: assignment.block_length(block),
                            });
                        }
                    }
                }
                expired.push(index);
            }
            self.drop_peer(addr, DomainError::NetworkError(format!("{}: piece {} timed out", addr, index)));
        }

        self.metadata_requests
            .retain(|_, (_, requested)| now.duration_since(*requested) < timeout);
        expired
    }

    /// Sends `have` to every connected peer and drops interest where the
    /// peer no longer has anything we need. Peers that were interested
    /// before we had anything to offer get their unchoke now.
    pub fn broadcast_have(&mut self, index: u32, store: &PieceStore) {
        for peer in self.peers.values().filter(|p| p.connected) {
            peer.send(SessionCommand::Have(index));
        }
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.update_interest(addr, store);
        }
        self.unchoke_interested(store);
    }

    /// A piece passed verification: forget its assignment and announce it.
    pub fn piece_verified(&mut self, index: u32, store: &PieceStore) {
        self.ledger.remove(&index);
        self.failed_peers.remove(&index);
        self.broadcast_have(index, store);
    }

    /// A piece from `peer` failed its hash check. Other holders of the piece
    /// are preferred over `peer` from now on, and `peer` is banned once it
    /// reaches the failure threshold.
    /// Returns whether the peer was banned.
    pub fn piece_rejected(&mut self, index: u32, peer: SocketAddr) -> bool {
        self.ledger.remove(&index);
        self.failed_peers.entry(index).or_default().insert(peer);
        let failures = {
            let count = self.hash_failures.entry(peer).or_insert(0);
            *count += 1;
            *count
        };
        if failures >= self.settings.ban_after_hash_failures {
            warn!(torrent_id = self.torrent_id, peer = %peer, failures, "Banning peer for corrupt pieces");
            self.ban(peer);
            self.drop_peer(
                peer,
                DomainError::protocol(peer, format!("{} pieces failed verification", failures)),
            );
            return true;
        }
        false
    }

    /// Verification could not complete (e.g. disk full); the piece becomes
    /// assignable again.
    pub fn piece_failed(&mut self, index: u32) {
        self.ledger.remove(&index);
    }

    pub fn reset_metadata(&mut self) {
        self.metadata = None;
        self.metadata_requests.clear();
    }

    /// Builds piece availability once the layout is known and validates
    /// bitfields that arrived before it.
    pub fn layout_ready(&mut self, store: &PieceStore) {
        self.metadata = None;
        self.metadata_requests.clear();
        self.availability = vec![0; store.piece_count() as usize];

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            let (raw, haves) = match self.peers.get_mut(&addr) {
                Some(peer) => (peer.pending_bitfield.take(), std::mem::take(&mut peer.pending_haves)),
                None => continue,
            };
            if let Some(raw) = raw {
                self.apply_bitfield(addr, raw, store);
            }
            for index in haves {
                self.apply_have(addr, index, store);
            }
        }
    }

    fn ensure_availability(&mut self, store: &PieceStore) {
        let count = store.piece_count() as usize;
        if self.availability.len() != count {
            self.availability = vec![0; count];
        }
    }

    fn apply_bitfield(&mut self, addr: SocketAddr, raw: Vec<u8>, store: &PieceStore) {
        self.ensure_availability(store);
        match Bitfield::from_bytes(raw, store.piece_count() as usize) {
            Ok(field) => {
                for index in field.iter_set() {
                    self.availability[index as usize] += 1;
                }
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.bitfield = Some(field);
                }
                self.update_interest(addr, store);
            }
            Err(reason) => self.drop_peer(addr, DomainError::protocol(addr, reason)),
        }
    }

    fn apply_have(&mut self, addr: SocketAddr, index: u32, store: &PieceStore) {
        if index >= store.piece_count() {
            self.drop_peer(addr, DomainError::protocol(addr, format!("have for piece {} out of range", index)));
            return;
        }
        self.ensure_availability(store);
        let piece_count = store.piece_count() as usize;
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        let field = peer.bitfield.get_or_insert_with(|| Bitfield::new(piece_count));
        if !field.has(index) {
            field.set(index);
            self.availability[index as usize] += 1;
        }
        self.update_interest(addr, store);
    }

    fn forget_availability(&mut self, peer: &PeerState) {
        if let Some(field) = &peer.bitfield {
            for index in field.iter_set() {
                if let Some(count) = self.availability.get_mut(index as usize) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    fn update_interest(&mut self, addr: SocketAddr, store: &PieceStore) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        if !peer.connected {
            return;
        }
        let wanted = peer
            .bitfield
            .as_ref()
            .map(|field| field.iter_set().any(|i| !store.is_verified(i)))
            .unwrap_or(false);
        if wanted != peer.am_interested {
            peer.am_interested = wanted;
            peer.send(SessionCommand::Interested(wanted));
        }
    }

    /// Applies one session event.
    pub fn on_event(&mut self, message: SessionMessage, store: Option<&Arc<PieceStore>>) -> Vec<ManagerOutput> {
        let SessionMessage { addr, session, event } = message;
        let mut outputs = Vec::new();

        // Events from an earlier connection to the same address are stale
        match self.peers.get(&addr) {
            Some(peer) if peer.handle.id == session => {}
            _ => {
                debug!(torrent_id = self.torrent_id, peer = %addr, session, "Ignoring event from a stale session");
                return outputs;
            }
        }

        if let SessionEvent::Closed(reason) = event {
            if let Some(peer) = self.peers.remove(&addr) {
                self.forget_availability(&peer);
                self.release_peer_work(addr);
                let reason = peer.violation.or(reason);
                if peer.connected || reason.is_some() {
                    outputs.push(ManagerOutput::PeerDisconnected {
                        addr,
                        reason,
                        banned: self.banned.contains(&addr),
                    });
                }
            }
            return outputs;
        }

        match event {
            SessionEvent::Connected { peer_id } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.connected = true;
                }
                info!(torrent_id = self.torrent_id, peer = %addr, "Peer connected");
                outputs.push(ManagerOutput::PeerConnected {
                    addr,
                    peer_id: hex::encode(peer_id),
                });
            }
            SessionEvent::Extensions(handshake) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.metadata_capable = handshake.metadata_id.is_some();
                }
                if store.is_none() && self.metadata.is_none() {
                    if let (Some(_), Some(size)) = (handshake.metadata_id, handshake.metadata_size) {
                        debug!(torrent_id = self.torrent_id, peer = %addr, size, "Starting metadata exchange");
                        self.metadata = Some(MetadataAssembler::new(size));
                    }
                }
            }
            SessionEvent::Bitfield(raw) => match store {
                Some(store) => self.apply_bitfield(addr, raw, store),
                None => {
                    if let Some(peer) = self.peers.get_mut(&addr) {
                        peer.pending_bitfield = Some(raw);
                    }
                }
            },
            SessionEvent::Have(index) => match store {
                Some(store) => self.apply_have(addr, index, store),
                None => {
                    if let Some(peer) = self.peers.get_mut(&addr) {
                        peer.pending_haves.push(index);
                    }
                }
            },
            SessionEvent::Choked => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_choking = true;
                }
                // A choke discards every pending request
                self.release_peer_work(addr);
            }
            SessionEvent::Unchoked => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_choking = false;
                }
            }
            SessionEvent::Interested => self.on_interested(addr, store),
            SessionEvent::NotInterested => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_interested = false;
                    if !peer.am_choking {
                        peer.am_choking = true;
                        peer.send(SessionCommand::Choke(true));
                    }
                }
            }
            SessionEvent::Block { index, begin, data } => {
                if let Some(output) = self.on_block(addr, index, begin, data) {
                    outputs.push(output);
                }
            }
            SessionEvent::Request { index, begin, length } => self.on_request(addr, index, begin, length, store),
            SessionEvent::Cancel { .. } => {}
            SessionEvent::Metadata(message) => {
                if let Some(output) = self.on_metadata(addr, message) {
                    outputs.push(output);
                }
            }
            SessionEvent::Closed(_) => unreachable!("handled above"),
        }
        outputs
    }

    fn on_interested(&mut self, addr: SocketAddr, store: Option<&Arc<PieceStore>>) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.peer_interested = true;
        }
        if let Some(store) = store {
            self.unchoke_interested(store);
        }
    }

    /// Unchokes waiting interested peers while upload slots remain. Nothing
    /// is offered before the first verified piece.
    fn unchoke_interested(&mut self, store: &PieceStore) {
        if store.verified_count() == 0 {
            return;
        }
        let mut unchoked = self.peers.values().filter(|p| !p.am_choking).count();
        let mut waiting: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, p)| p.connected && p.peer_interested && p.am_choking)
            .map(|(addr, _)| *addr)
            .collect();
        waiting.sort();

        for addr in waiting {
            if unchoked >= self.settings.max_unchoked_uploads {
                break;
            }
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.am_choking = false;
                peer.send(SessionCommand::Choke(false));
                unchoked += 1;
                debug!(torrent_id = self.torrent_id, peer = %addr, "Unchoked peer for upload");
            }
        }
    }

    fn on_request(&mut self, addr: SocketAddr, index: u32, begin: u32, length: u32, store: Option<&Arc<PieceStore>>) {
        let Some(store) = store else {
            return;
        };
        if index >= store.piece_count() || length == 0 || length > MAX_UPLOAD_REQUEST {
            self.drop_peer(addr, DomainError::protocol(addr, format!("invalid request for piece {}", index)));
            return;
        }
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        if peer.am_choking || !store.is_verified(index) {
            return;
        }

        self.uploaded += length as u64;
        let store = store.clone();
        let commands = peer.handle.commands.clone();
        tokio::spawn(async move {
            match store.read_block(index, begin, length).await {
                Ok(data) => {
                    let _ = commands.send(SessionCommand::Block { index, begin, data });
                }
                Err(e) => debug!(peer = %addr, piece = index, error = %e, "Cannot serve block"),
            }
        });
    }

    fn on_block(&mut self, addr: SocketAddr, index: u32, begin: u32, data: Vec<u8>) -> Option<ManagerOutput> {
        let now = Instant::now();
        let assignment = self.ledger.get_mut(&index).filter(|a| a.peer == addr && !a.verifying)?;
        let block = (begin / BLOCK_SIZE) as usize;
        let requested_at = match assignment.blocks.get(block) {
            Some(BlockState::Requested(at)) if begin % BLOCK_SIZE == 0 => *at,
            _ => {
                debug!(torrent_id = self.torrent_id, peer = %addr, piece = index, begin, "Ignoring unrequested block");
                return None;
            }
        };
        if data.len() != assignment.block_length(block) as usize {
            let reason = format!("block {}+{} has {} bytes", index, begin, data.len());
            self.drop_peer(addr, DomainError::protocol(addr, reason));
            return None;
        }

        let start = begin as usize;
        assignment.data[start..start + data.len()].copy_from_slice(&data);
        assignment.blocks[block] = BlockState::Received;
        assignment.received += 1;
        assignment.last_activity = now;
        let complete = assignment.received == assignment.blocks.len();
        let piece_data = if complete {
            assignment.verifying = true;
            Some(std::mem::take(&mut assignment.data))
        } else {
            None
        };

        self.downloaded += data.len() as u64;
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.outstanding = peer.outstanding.saturating_sub(1);
            peer.record_latency(now.duration_since(requested_at));
        }

        piece_data.map(|data| ManagerOutput::PieceComplete { index, peer: addr, data })
    }

    fn on_metadata(&mut self, addr: SocketAddr, message: MetadataMessage) -> Option<ManagerOutput> {
        match message {
            MetadataMessage::Request { piece } => {
                // Metadata is only fetched, never served
                if let Some(peer) = self.peers.get(&addr) {
                    peer.send(SessionCommand::RejectMetadata(piece));
                }
                None
            }
            MetadataMessage::Reject { piece } => {
                self.metadata_requests.remove(&piece);
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.metadata_capable = false;
                }
                None
            }
            MetadataMessage::Data { piece, total_size, data } => {
                self.metadata_requests.remove(&piece);
                let assembler = self.metadata.as_mut()?;
                if assembler.total_size() != total_size || !assembler.insert(piece, data) {
                    self.drop_peer(addr, DomainError::protocol(addr, "inconsistent metadata piece"));
                    return None;
                }
                if assembler.is_complete() {
                    let bytes = assembler.assemble();
                    self.metadata = None;
                    return bytes.map(ManagerOutput::MetadataComplete);
                }
                None
            }
        }
    }

    /// Issues block requests to unchoked peers, lowest latency first, using
    /// rarest-first piece selection. `allow_new` gates starting new pieces.
    pub fn schedule(&mut self, store: Option<&Arc<PieceStore>>, allow_new: bool) {
        let Some(store) = store else {
            self.schedule_metadata();
            return;
        };
        if store.is_complete() {
            return;
        }

        let mut ready: Vec<(Option<Duration>, SocketAddr)> = self
            .peers
            .iter()
            .filter(|(addr, p)| p.connected && !p.peer_choking && p.bitfield.is_some() && !self.banned.contains(*addr))
            .map(|(addr, p)| (p.latency, *addr))
            .collect();
        // Measured peers first, fastest first
        ready.sort_by_key(|(latency, addr)| (latency.is_none(), latency.unwrap_or_default(), *addr));

        let now = Instant::now();
        for (_, addr) in ready {
            while self.peers.get(&addr).map(|p| p.outstanding < self.settings.pipeline_depth).unwrap_or(false) {
                if self.request_next_block(addr, now) {
                    continue;
                }
                if !allow_new {
                    break;
                }
                match self.pick_piece(addr, store) {
                    Some(index) => {
                        self.ledger.insert(index, Assignment::new(addr, store.piece_size(index), now));
                    }
                    None => break,
                }
            }
        }
    }

    fn request_next_block(&mut self, addr: SocketAddr, now: Instant) -> bool {
        let Some((index, block)) = self.ledger.iter().filter(|(_, a)| a.peer == addr && !a.verifying).find_map(
            |(index, a)| a.blocks.iter().position(|b| *b == BlockState::Missing).map(|block| (*index, block)),
        ) else {
            return false;
        };
        let Some(assignment) = self.ledger.get_mut(&index) else {
            return false;
        };
        let length = assignment.block_length(block);
        assignment.blocks[block] = BlockState::Requested(now);
        assignment.last_activity = now;

        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.outstanding += 1;
            peer.send(SessionCommand::Request {
                index,
                begin: block as u32 * BLOCK_SIZE,
                length,
            });
        }
        true
    }

    fn pick_piece(&self, addr: SocketAddr, store: &PieceStore) -> Option<u32> {
        let field = self.peers.get(&addr)?.bitfield.as_ref()?;
        field
            .iter_set()
            .filter(|i| !store.is_verified(*i) && !self.ledger.contains_key(i))
            .filter(|i| !self.has_better_source(*i, addr))
            .min_by_key(|i| (self.availability.get(*i as usize).copied().unwrap_or(0), *i))
    }

    /// True when `addr` already sent a corrupt copy of `index` and another
    /// unchoked peer that has not could serve it instead.
    fn has_better_source(&self, index: u32, addr: SocketAddr) -> bool {
        let Some(failed) = self.failed_peers.get(&index) else {
            return false;
        };
        if !failed.contains(&addr) {
            return false;
        }
        self.peers.iter().any(|(other, p)| {
            p.connected
                && !p.peer_choking
                && !failed.contains(other)
                && !self.banned.contains(other)
                && p.bitfield.as_ref().map(|f| f.has(index)).unwrap_or(false)
        })
    }

    fn schedule_metadata(&mut self) {
        let Some(assembler) = &self.metadata else {
            return;
        };
        let now = Instant::now();
        let mut capable: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, p)| p.connected && p.metadata_capable)
            .map(|(addr, _)| *addr)
            .collect();
        capable.sort();
        if capable.is_empty() {
            return;
        }

        let missing: Vec<u32> = (0..crate::protocol::extension::metadata_piece_count(assembler.total_size()))
            .filter(|piece| !self.metadata_requests.contains_key(piece))
            .collect();
        for (n, piece) in missing.into_iter().enumerate() {
            if self.metadata_requests.len() >= capable.len() * 2 {
                break;
            }
            let addr = capable[n % capable.len()];
            if let Some(peer) = self.peers.get(&addr) {
                peer.send(SessionCommand::RequestMetadata(piece));
                self.metadata_requests.insert(piece, (addr, now));
            }
        }
    }

    /// Whether `piece` is currently owned by a peer.
    pub fn is_assigned(&self, piece: u32) -> bool {
        self.ledger.contains_key(&piece)
    }

    pub fn assigned_to(&self, piece: u32) -> Option<SocketAddr> {
        self.ledger.get(&piece).map(|a| a.peer)
    }

    /// Stops every session, waiting up to the grace period before aborting.
    pub async fn shutdown(&mut self) {
        let peers: Vec<PeerState> = self.peers.drain().map(|(_, p)| p).collect();
        for peer in &peers {
            peer.send(SessionCommand::Shutdown);
        }
        let grace = self.settings.shutdown_grace;
        for peer in peers {
            let mut task = peer.handle.task;
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.ledger.clear();
        self.metadata = None;
        self.metadata_requests.clear();
        self.candidates.clear();
        self.candidate_set.clear();
        for count in self.availability.iter_mut() {
            *count = 0;
        }
    }
}

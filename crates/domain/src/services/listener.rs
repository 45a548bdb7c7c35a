//! Accepts inbound peer connections and hands them to the owning torrent.

use crate::errors::DomainError;
use crate::protocol::Handshake;
use crate::services::engine_supervisor::EngineSupervisor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct PeerListener {
    listener: TcpListener,
    supervisor: Arc<EngineSupervisor>,
    handshake_timeout: Duration,
}

impl PeerListener {
    pub async fn bind(addr: SocketAddr, supervisor: Arc<EngineSupervisor>) -> Result<Self, DomainError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DomainError::NetworkError(format!("cannot listen on {}: {}", addr, e)))?;
        let handshake_timeout = supervisor.settings().connect_timeout;
        Ok(Self {
            listener,
            supervisor,
            handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DomainError> {
        self.listener
            .local_addr()
            .map_err(|e| DomainError::NetworkError(e.to_string()))
    }

    /// Runs the accept loop until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Ok(addr) = self.listener.local_addr() {
                info!(%addr, "Listening for peers");
            }
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let supervisor = self.supervisor.clone();
                            let timeout = self.handshake_timeout;
                            tokio::spawn(async move {
                                let mut stream = stream;
                                let handshake = match tokio::time::timeout(timeout, Handshake::read_from(&mut stream)).await {
                                    Ok(Ok(handshake)) => handshake,
                                    Ok(Err(e)) => {
                                        debug!(peer = %addr, error = %e, "Bad inbound handshake");
                                        return;
                                    }
                                    Err(_) => {
                                        debug!(peer = %addr, "Inbound handshake timed out");
                                        return;
                                    }
                                };
                                if !supervisor.route_inbound(stream, addr, handshake).await {
                                    debug!(peer = %addr, "No torrent for inbound peer");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                }
            }
            info!("Peer listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::metainfo::build_torrent_file;
    use crate::protocol::{PeerId, TorrentSource};
    use crate::repositories::memory::MemoryStore;
    use crate::services::tracker_client::{AnnounceRequest, AnnounceResponse, Announcer, ScrapeStats};
    use crate::settings::EngineSettings;
    use async_trait::async_trait;
    use tokio::net::TcpStream;

    struct NoPeers;

    #[async_trait]
    impl Announcer for NoPeers {
        async fn announce(&self, _url: &str, _request: &AnnounceRequest) -> Result<AnnounceResponse, DomainError> {
            Ok(AnnounceResponse::default())
        }

        async fn scrape(&self, _url: &str, _info_hash: &[u8; 20]) -> Result<ScrapeStats, DomainError> {
            Ok(ScrapeStats::default())
        }
    }

    #[tokio::test]
    async fn routes_inbound_peers_by_info_hash() {
        let memory = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let settings = EngineSettings {
            download_dir: dir.path().to_path_buf(),
            ..EngineSettings::default()
        };
        let supervisor = Arc::new(EngineSupervisor::new(memory.repositories(), settings, Arc::new(NoPeers)));
        let payload = vec![1u8; 20000];
        let torrent = supervisor
            .add(TorrentSource::TorrentBytes(build_torrent_file("in.bin", &payload, 16384, None)))
            .await
            .unwrap();
        let id = torrent.id.unwrap();
        supervisor.start(id).await.unwrap();
        let handle = supervisor.handle(id).await.unwrap();

        let listener = PeerListener::bind("127.0.0.1:0".parse().unwrap(), supervisor.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stop_rx) = watch::channel(false);
        let task = listener.spawn(stop_rx);

        // Unknown info hash: the connection is dropped without a reply
        let mut stranger = TcpStream::connect(addr).await.unwrap();
        Handshake::new([9; 20], PeerId::generate())
            .write_to(&mut stranger)
            .await
            .unwrap();
        assert!(Handshake::read_from(&mut stranger).await.is_err());

        let info_hash: [u8; 20] = hex::decode(&torrent.info_hash).unwrap().try_into().unwrap();
        let mut peer = TcpStream::connect(addr).await.unwrap();
        Handshake::new(info_hash, PeerId::generate()).write_to(&mut peer).await.unwrap();
        let reply = Handshake::read_from(&mut peer).await.unwrap();
        assert_eq!(reply.info_hash, info_hash);
        assert_eq!(&reply.peer_id, supervisor.peer_id().as_bytes());

        handle.wait_for(|s| s.connected_peers == 1).await.unwrap();

        stop.send(true).unwrap();
        task.await.unwrap();
        supervisor.shutdown().await;
    }
}

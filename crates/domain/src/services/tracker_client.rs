//! Tracker announce and scrape over HTTP (BEP 3/23/7) and UDP (BEP 15).

use crate::entities::{Tracker, TrackerStatus};
use crate::errors::DomainError;
use crate::protocol::bencode::{self, BencodedValue};
use crate::protocol::PeerId;
use async_trait::async_trait;
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);
pub const MAX_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);
const BASE_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Consecutive failures after which a tracker is flagged `error`.
pub const FAILURES_BEFORE_ERROR: u32 = 3;

const UDP_PROTOCOL_ID: u64 = 0x41727101980;
const UDP_ACTION_CONNECT: u32 = 0;
const UDP_ACTION_ANNOUNCE: u32 = 1;
const UDP_ACTION_SCRAPE: u32 = 2;
const UDP_ACTION_ERROR: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    fn http_name(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::None => None,
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Completed => Some("completed"),
        }
    }

    fn udp_code(self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub num_want: i32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnounceResponse {
    pub interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
    pub seeders: Option<i32>,
    pub leechers: Option<i32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScrapeStats {
    pub seeders: Option<i32>,
    pub leechers: Option<i32>,
    pub completed: Option<i32>,
}

/// One announce/scrape round trip against a tracker URL.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse, DomainError>;
    async fn scrape(&self, url: &str, info_hash: &[u8; 20]) -> Result<ScrapeStats, DomainError>;
}

/// Tracker interval bounded to `[60 s, 3600 s]`; 1800 s when the tracker is silent.
pub fn clamp_interval(interval: Option<Duration>) -> Duration {
    interval
        .unwrap_or(DEFAULT_ANNOUNCE_INTERVAL)
        .clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL)
}

/// Retry delay after `failures` consecutive failures: 30 s doubling, capped at an hour.
pub fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    (BASE_RETRY_DELAY * 2u32.pow(exponent)).min(MAX_ANNOUNCE_INTERVAL)
}

fn unreachable_err(url: &str, reason: impl Into<String>) -> DomainError {
    DomainError::TrackerUnreachable {
        url: url.to_string(),
        reason: reason.into(),
    }
}

fn parse_compact_v4(data: &[u8]) -> Result<Vec<SocketAddr>, String> {
    if data.len() % 6 != 0 {
        return Err("Invalid compact peer format".to_string());
    }
    Ok(data
        .chunks(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([c[4], c[5]]))
        })
        .collect())
}

fn parse_compact_v6(data: &[u8]) -> Result<Vec<SocketAddr>, String> {
    if data.len() % 18 != 0 {
        return Err("Invalid compact IPv6 peer format".to_string());
    }
    Ok(data
        .chunks(18)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[..16]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), u16::from_be_bytes([c[16], c[17]]))
        })
        .collect())
}

/// Parses a bencoded HTTP announce response.
pub fn parse_http_response(body: &[u8]) -> Result<AnnounceResponse, String> {
    let value = bencode::decode(body)?;
    if !matches!(value, BencodedValue::Dict(_)) {
        return Err("Tracker response is not a dictionary".to_string());
    }
    if let Some(reason) = value.get("failure reason").and_then(|v| v.as_str()) {
        return Err(format!("Tracker error: {}", reason));
    }

    let mut peers = Vec::new();
    match value.get("peers") {
        Some(BencodedValue::String(compact)) => peers.extend(parse_compact_v4(compact)?),
        Some(BencodedValue::List(list)) => {
            for entry in list {
                let ip = entry.get("ip").and_then(|v| v.as_str());
                let port = entry.get("port").and_then(|v| v.as_int());
                match (ip.and_then(|ip| ip.parse::<IpAddr>().ok()), port) {
                    (Some(ip), Some(port)) if (1..=65535).contains(&port) => {
                        peers.push(SocketAddr::new(ip, port as u16))
                    }
                    _ => debug!("Skipping unusable peer entry in tracker response"),
                }
            }
        }
        Some(_) => return Err("Invalid peers format in tracker response".to_string()),
        None => {}
    }
    if let Some(compact6) = value.get("peers6").and_then(|v| v.as_bytes()) {
        peers.extend(parse_compact_v6(compact6)?);
    }

    let to_count = |key: &str| {
        value
            .get(key)
            .and_then(|v| v.as_int())
            .and_then(|v| i32::try_from(v).ok())
    };
    Ok(AnnounceResponse {
        interval: value
            .get("interval")
            .and_then(|v| v.as_int())
            .filter(|v| *v > 0)
            .map(|v| Duration::from_secs(v as u64)),
        peers,
        seeders: to_count("complete"),
        leechers: to_count("incomplete"),
    })
}

/// `.../announce?x` becomes `.../scrape?x`; trackers not following the
/// convention cannot be scraped.
pub fn scrape_url(announce: &str) -> Option<String> {
    let mut url = url::Url::parse(announce).ok()?;
    let last = url.path_segments()?.last()?.to_string();
    let rest = last.strip_prefix("announce")?;
    let replaced = format!("scrape{}", rest);
    url.path_segments_mut().ok()?.pop().push(&replaced);
    Some(url.to_string())
}

/// Production announcer speaking both tracker protocols.
pub struct HttpUdpAnnouncer {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpUdpAnnouncer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn with_query(url: &str, params: &[(&str, String)]) -> Result<url::Url, DomainError> {
        let mut parsed = url::Url::parse(url).map_err(|e| unreachable_err(url, format!("Invalid tracker URL: {}", e)))?;
        // info_hash and peer_id are raw bytes, so the query is assembled by hand
        let extra: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let query = match parsed.query() {
            Some(existing) if !existing.is_empty() => format!("{}&{}", existing, extra.join("&")),
            _ => extra.join("&"),
        };
        parsed.set_query(Some(&query));
        Ok(parsed)
    }

    async fn http_get(&self, url: url::Url, tracker: &str) -> Result<Vec<u8>, DomainError> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| unreachable_err(tracker, format!("request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(unreachable_err(tracker, format!("status {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| unreachable_err(tracker, format!("failed to read response: {}", e)))?;
        Ok(bytes.to_vec())
    }

    async fn http_announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse, DomainError> {
        let mut params = vec![
            ("info_hash", percent_encode(&request.info_hash, NON_ALPHANUMERIC).to_string()),
            ("peer_id", percent_encode(request.peer_id.as_bytes(), NON_ALPHANUMERIC).to_string()),
            ("port", request.port.to_string()),
            ("uploaded", request.uploaded.to_string()),
            ("downloaded", request.downloaded.to_string()),
            ("left", request.left.to_string()),
            ("compact", "1".to_string()),
            ("numwant", request.num_want.max(0).to_string()),
        ];
        if let Some(event) = request.event.http_name() {
            params.push(("event", event.to_string()));
        }
        let full = Self::with_query(url, &params)?;
        debug!(tracker = %url, event = ?request.event, "HTTP announce");

        let body = self.http_get(full, url).await?;
        parse_http_response(&body).map_err(|reason| unreachable_err(url, reason))
    }

    async fn http_scrape(&self, url: &str, info_hash: &[u8; 20]) -> Result<ScrapeStats, DomainError> {
        let scrape = scrape_url(url).ok_or_else(|| unreachable_err(url, "tracker does not support scrape"))?;
        let full = Self::with_query(&scrape, &[("info_hash", percent_encode(info_hash, NON_ALPHANUMERIC).to_string())])?;
        let body = self.http_get(full, url).await?;

        let value = bencode::decode(&body).map_err(|reason| unreachable_err(url, reason))?;
        let files = match value.get("files") {
            Some(BencodedValue::Dict(files)) => files,
            _ => return Err(unreachable_err(url, "scrape response without files")),
        };
        let entry = files
            .get(&info_hash[..])
            .ok_or_else(|| unreachable_err(url, "torrent missing from scrape response"))?;
        let count = |key: &str| entry.get(key).and_then(|v| v.as_int()).and_then(|v| i32::try_from(v).ok());
        Ok(ScrapeStats {
            seeders: count("complete"),
            leechers: count("incomplete"),
            completed: count("downloaded"),
        })
    }

    async fn udp_socket(&self, url: &str) -> Result<(UdpSocket, SocketAddr), DomainError> {
        let parsed = url::Url::parse(url).map_err(|e| unreachable_err(url, format!("Invalid tracker URL: {}", e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| unreachable_err(url, "tracker URL has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = parsed.port().ok_or_else(|| unreachable_err(url, "UDP tracker URL has no port"))?;

        let addr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| unreachable_err(url, format!("DNS lookup failed: {}", e)))?
            .next()
            .ok_or_else(|| unreachable_err(url, "tracker host did not resolve"))?;

        let bind: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| DomainError::NetworkError(format!("Failed to bind UDP socket: {}", e)))?;
        Ok((socket, addr))
    }

    /// Sends `packet` and waits for a reply to `transaction_id` with the given action.
    async fn udp_exchange(
        &self,
        url: &str,
        socket: &UdpSocket,
        addr: SocketAddr,
        packet: &[u8],
        transaction_id: u32,
        action: u32,
    ) -> Result<Vec<u8>, DomainError> {
        socket
            .send_to(packet, addr)
            .await
            .map_err(|e| unreachable_err(url, format!("send failed: {}", e)))?;

        let mut buf = vec![0u8; 2048];
        let size = tokio::time::timeout(self.timeout, async {
            loop {
                let (size, from) = socket.recv_from(&mut buf).await?;
                if from == addr && size >= 8 && buf[4..8] == transaction_id.to_be_bytes() {
                    return Ok::<usize, std::io::Error>(size);
                }
            }
        })
        .await
        .map_err(|_| unreachable_err(url, "UDP tracker timeout"))?
        .map_err(|e| unreachable_err(url, format!("receive failed: {}", e)))?;

        let got = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if got == UDP_ACTION_ERROR {
            return Err(unreachable_err(url, String::from_utf8_lossy(&buf[8..size]).into_owned()));
        }
        if got != action {
            return Err(unreachable_err(url, format!("unexpected UDP action {}", got)));
        }
        buf.truncate(size);
        Ok(buf)
    }

    async fn udp_connect(&self, url: &str, socket: &UdpSocket, addr: SocketAddr) -> Result<u64, DomainError> {
        let transaction_id: u32 = rand::thread_rng().gen();
        let mut packet = Vec::with_capacity(16);
        packet.extend_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
        packet.extend_from_slice(&UDP_ACTION_CONNECT.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());

        let reply = self
            .udp_exchange(url, socket, addr, &packet, transaction_id, UDP_ACTION_CONNECT)
            .await?;
        if reply.len() < 16 {
            return Err(unreachable_err(url, "Invalid UDP connect response size"));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&reply[8..16]);
        Ok(u64::from_be_bytes(id))
    }

    async fn udp_announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse, DomainError> {
        let (socket, addr) = self.udp_socket(url).await?;
        let connection_id = self.udp_connect(url, &socket, addr).await?;

        let transaction_id: u32 = rand::thread_rng().gen();
        let key: u32 = rand::thread_rng().gen();
        let mut packet = Vec::with_capacity(98);
        packet.extend_from_slice(&connection_id.to_be_bytes());
        packet.extend_from_slice(&UDP_ACTION_ANNOUNCE.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        packet.extend_from_slice(&request.info_hash);
        packet.extend_from_slice(request.peer_id.as_bytes());
        packet.extend_from_slice(&request.downloaded.to_be_bytes());
        packet.extend_from_slice(&request.left.to_be_bytes());
        packet.extend_from_slice(&request.uploaded.to_be_bytes());
        packet.extend_from_slice(&request.event.udp_code().to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes()); // IP: use sender address
        packet.extend_from_slice(&key.to_be_bytes());
        packet.extend_from_slice(&request.num_want.to_be_bytes());
        packet.extend_from_slice(&request.port.to_be_bytes());
        debug!(tracker = %url, event = ?request.event, "UDP announce");

        let reply = self
            .udp_exchange(url, &socket, addr, &packet, transaction_id, UDP_ACTION_ANNOUNCE)
            .await?;
        if reply.len() < 20 {
            return Err(unreachable_err(url, "Invalid UDP announce response size"));
        }
        let word = |at: usize| u32::from_be_bytes([reply[at], reply[at + 1], reply[at + 2], reply[at + 3]]);
        let peers = if addr.is_ipv4() {
            parse_compact_v4(&reply[20..])
        } else {
            parse_compact_v6(&reply[20..])
        }
        .map_err(|reason| unreachable_err(url, reason))?;

        Ok(AnnounceResponse {
            interval: Some(Duration::from_secs(word(8) as u64)).filter(|d| !d.is_zero()),
            leechers: i32::try_from(word(12)).ok(),
            seeders: i32::try_from(word(16)).ok(),
            peers,
        })
    }

    async fn udp_scrape(&self, url: &str, info_hash: &[u8; 20]) -> Result<ScrapeStats, DomainError> {
        let (socket, addr) = self.udp_socket(url).await?;
        let connection_id = self.udp_connect(url, &socket, addr).await?;

        let transaction_id: u32 = rand::thread_rng().gen();
        let mut packet = Vec::with_capacity(36);
        packet.extend_from_slice(&connection_id.to_be_bytes());
        packet.extend_from_slice(&UDP_ACTION_SCRAPE.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        packet.extend_from_slice(info_hash);

        let reply = self
            .udp_exchange(url, &socket, addr, &packet, transaction_id, UDP_ACTION_SCRAPE)
            .await?;
        if reply.len() < 20 {
            return Err(unreachable_err(url, "Invalid UDP scrape response size"));
        }
        let word = |at: usize| u32::from_be_bytes([reply[at], reply[at + 1], reply[at + 2], reply[at + 3]]);
        Ok(ScrapeStats {
            seeders: i32::try_from(word(8)).ok(),
            completed: i32::try_from(word(12)).ok(),
            leechers: i32::try_from(word(16)).ok(),
        })
    }
}

#[async_trait]
impl Announcer for HttpUdpAnnouncer {
    async fn announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse, DomainError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.http_announce(url, request).await
        } else if url.starts_with("udp://") {
            self.udp_announce(url, request).await
        } else {
            Err(unreachable_err(url, "Unsupported tracker protocol"))
        }
    }

    async fn scrape(&self, url: &str, info_hash: &[u8; 20]) -> Result<ScrapeStats, DomainError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.http_scrape(url, info_hash).await
        } else if url.starts_with("udp://") {
            self.udp_scrape(url, info_hash).await
        } else {
            Err(unreachable_err(url, "Unsupported tracker protocol"))
        }
    }
}

/// Transfer counters a torrent reports in its announces.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransferStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub complete: bool,
}

/// Outcome of one announce, sent back to the owning controller.
#[derive(Debug, Clone)]
pub enum TrackerUpdate {
    Announced { tracker: Tracker, peers: Vec<SocketAddr> },
    Failed { tracker: Tracker, error: DomainError },
}

/// Announce loop for a single tracker. Runs until the shutdown flag flips,
/// then sends a best-effort `stopped` announce.
pub struct TrackerWorker {
    pub tracker: Tracker,
    pub announcer: Arc<dyn Announcer>,
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
    pub port: u16,
    pub stats: watch::Receiver<TransferStats>,
    pub updates: mpsc::Sender<TrackerUpdate>,
    pub shutdown: watch::Receiver<bool>,
    pub grace: Duration,
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_for_completion(rx: &mut watch::Receiver<TransferStats>) {
    loop {
        if rx.borrow().complete {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl TrackerWorker {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn request(&self, event: AnnounceEvent) -> AnnounceRequest {
        let stats = *self.stats.borrow();
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: stats.uploaded,
            downloaded: stats.downloaded,
            left: stats.left,
            event,
            num_want: if event == AnnounceEvent::Stopped { 0 } else { 50 },
        }
    }

    async fn run(mut self) {
        let mut failures = 0u32;
        let mut announced = false;
        let mut event = AnnounceEvent::Started;
        let mut reported_complete = self.stats.borrow().complete;
        // Torrents that start out complete never announce `completed`
        let mut completion_announced = reported_complete;

        loop {
            let request = self.request(event);
            let outcome = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => break,
                outcome = self.announcer.announce(&self.tracker.url, &request) => outcome,
            };

            let delay = match outcome {
                Ok(response) => {
                    failures = 0;
                    announced = true;
                    if event == AnnounceEvent::Completed {
                        completion_announced = true;
                    }
                    event = AnnounceEvent::None;
                    let interval = clamp_interval(response.interval);
                    self.tracker.mark_announce_success(interval);
                    self.tracker.update_stats(response.seeders, response.leechers, None);

                    if let Ok(scrape) = self.announcer.scrape(&self.tracker.url, &self.info_hash).await {
                        self.tracker.update_stats(scrape.seeders, scrape.leechers, scrape.completed);
                    }

                    info!(
                        tracker = %self.tracker.url,
                        peers = response.peers.len(),
                        interval_secs = interval.as_secs(),
                        "Tracker announce succeeded"
                    );
                    let update = TrackerUpdate::Announced {
                        tracker: self.tracker.clone(),
                        peers: response.peers,
                    };
                    if self.updates.send(update).await.is_err() {
                        break;
                    }
                    interval
                }
                Err(error) => {
                    failures += 1;
                    let delay = backoff_delay(failures);
                    self.tracker.mark_announce_failed(delay);
                    if failures >= FAILURES_BEFORE_ERROR && self.tracker.status != TrackerStatus::Error {
                        self.tracker.mark_error();
                    }
                    warn!(
                        tracker = %self.tracker.url,
                        failures,
                        retry_secs = delay.as_secs(),
                        error = %error,
                        "Tracker announce failed"
                    );
                    let update = TrackerUpdate::Failed {
                        tracker: self.tracker.clone(),
                        error,
                    };
                    if self.updates.send(update).await.is_err() {
                        break;
                    }
                    delay
                }
            };

            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => break,
                _ = wait_for_completion(&mut self.stats), if !reported_complete => {
                    reported_complete = true;
                    if announced {
                        event = AnnounceEvent::Completed;
                    } else {
                        completion_announced = true;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if announced {
            // Completion and shutdown can be signalled together
            if !completion_announced && self.stats.borrow().complete {
                self.final_announce(AnnounceEvent::Completed).await;
            }
            self.final_announce(AnnounceEvent::Stopped).await;
        }
    }

    async fn final_announce(&self, event: AnnounceEvent) {
        let request = self.request(event);
        match tokio::time::timeout(self.grace, self.announcer.announce(&self.tracker.url, &request)).await {
            Ok(Ok(_)) => debug!(tracker = %self.tracker.url, ?event, "Sent final announce"),
            Ok(Err(e)) => debug!(tracker = %self.tracker.url, ?event, error = %e, "Final announce failed"),
            Err(_) => debug!(tracker = %self.tracker.url, ?event, "Final announce timed out"),
        }
    }
}

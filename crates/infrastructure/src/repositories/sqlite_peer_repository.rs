use crate::database::{from_naive, peers, run, to_naive, SqlitePool};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::upsert::excluded;
use domain::{DomainError, Peer, PeerRepository, PeerStatus};
use std::time::{Duration, SystemTime};

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = peers)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct PeerModel {
    id: i32,
    torrent_id: i32,
    ip: String,
    port: i32,
    peer_id: Option<String>,
    last_seen: NaiveDateTime,
    status: String,
}

#[derive(Insertable)]
#[diesel(table_name = peers)]
struct NewPeerModel {
    torrent_id: i32,
    ip: String,
    port: i32,
    peer_id: Option<String>,
    last_seen: NaiveDateTime,
    status: String,
}

fn status_to_db(status: &PeerStatus) -> &'static str {
    match status {
        PeerStatus::Disconnected => "disconnected",
        PeerStatus::Connecting => "connecting",
        PeerStatus::Connected => "connected",
        PeerStatus::Banned => "banned",
    }
}

fn status_from_db(value: &str) -> PeerStatus {
    match value {
        "connecting" => PeerStatus::Connecting,
        "connected" => PeerStatus::Connected,
        "banned" => PeerStatus::Banned,
        _ => PeerStatus::Disconnected,
    }
}

impl From<PeerModel> for Peer {
    fn from(model: PeerModel) -> Self {
        Peer {
            id: Some(model.id),
            torrent_id: model.torrent_id,
            ip: model.ip,
            port: model.port as u16,
            peer_id: model.peer_id,
            last_seen: from_naive(model.last_seen),
            status: status_from_db(&model.status),
        }
    }
}

impl From<&Peer> for NewPeerModel {
    fn from(peer: &Peer) -> Self {
        NewPeerModel {
            torrent_id: peer.torrent_id,
            ip: peer.ip.clone(),
            port: peer.port as i32,
            peer_id: peer.peer_id.clone(),
            last_seen: to_naive(peer.last_seen),
            status: status_to_db(&peer.status).to_string(),
        }
    }
}

pub struct SqlitePeerRepository {
    pool: SqlitePool,
}

impl SqlitePeerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PeerRepository for SqlitePeerRepository {
    async fn find_by_torrent_id(&self, torrent_id: i32) -> Result<Vec<Peer>, DomainError> {
        let result = run(&self.pool, move |conn| {
            peers::table
                .filter(peers::torrent_id.eq(torrent_id))
                .select(PeerModel::as_select())
                .load::<PeerModel>(conn)
        })
        .await?;

        Ok(result.into_iter().map(Peer::from).collect())
    }

    async fn find_connected(&self, torrent_id: i32) -> Result<Vec<Peer>, DomainError> {
        let result = run(&self.pool, move |conn| {
            peers::table
                .filter(peers::torrent_id.eq(torrent_id))
                .filter(peers::status.eq(status_to_db(&PeerStatus::Connected)))
                .select(PeerModel::as_select())
                .load::<PeerModel>(conn)
        })
        .await?;

        Ok(result.into_iter().map(Peer::from).collect())
    }

    async fn upsert_batch(&self, peers: &[Peer]) -> Result<(), DomainError> {
        let rows: Vec<NewPeerModel> = peers.iter().map(NewPeerModel::from).collect();

        run(&self.pool, move |conn| {
            conn.transaction(|conn| {
                for row in &rows {
                    diesel::insert_into(peers::table)
                        .values(row)
                        .on_conflict((peers::torrent_id, peers::ip, peers::port))
                        .do_update()
                        .set(peers::last_seen.eq(excluded(peers::last_seen)))
                        .execute(conn)?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn update_status(
        &self,
        torrent_id: i32,
        ip: &str,
        port: u16,
        status: PeerStatus,
        peer_id: Option<String>,
    ) -> Result<(), DomainError> {
        let row = NewPeerModel {
            torrent_id,
            ip: ip.to_string(),
            port: port as i32,
            peer_id: peer_id.clone(),
            last_seen: chrono::Utc::now().naive_utc(),
            status: status_to_db(&status).to_string(),
        };

        run(&self.pool, move |conn| {
            let insert = diesel::insert_into(peers::table)
                .values(&row)
                .on_conflict((peers::torrent_id, peers::ip, peers::port))
                .do_update();
            match peer_id {
                Some(peer_id) => insert
                    .set((
                        peers::status.eq(excluded(peers::status)),
                        peers::last_seen.eq(excluded(peers::last_seen)),
                        peers::peer_id.eq(peer_id),
                    ))
                    .execute(conn),
                None => insert
                    .set((
                        peers::status.eq(excluded(peers::status)),
                        peers::last_seen.eq(excluded(peers::last_seen)),
                    ))
                    .execute(conn),
            }
        })
        .await?;

        Ok(())
    }

    async fn disconnect_all(&self, torrent_id: i32) -> Result<(), DomainError> {
        run(&self.pool, move |conn| {
            diesel::update(
                peers::table
                    .filter(peers::torrent_id.eq(torrent_id))
                    .filter(peers::status.ne(status_to_db(&PeerStatus::Banned))),
            )
            .set(peers::status.eq(status_to_db(&PeerStatus::Disconnected)))
            .execute(conn)
        })
        .await?;

        Ok(())
    }

    async fn delete_old(&self, torrent_id: i32, hours: u32) -> Result<(), DomainError> {
        let cutoff = to_naive(SystemTime::now() - Duration::from_secs(hours as u64 * 3600));

        run(&self.pool, move |conn| {
            diesel::delete(
                peers::table
                    .filter(peers::torrent_id.eq(torrent_id))
                    .filter(peers::last_seen.lt(cutoff)),
            )
            .execute(conn)
        })
        .await?;

        Ok(())
    }
}

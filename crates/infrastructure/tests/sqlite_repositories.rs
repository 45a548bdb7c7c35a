use domain::{
    Peer, PeerStatus, Piece, Repositories, Torrent, TorrentFile, TorrentStatus, Tracker, TrackerStatus,
};
use infrastructure::Database;
use std::time::Duration;

struct TestDb {
    repos: Repositories,
    _dir: tempfile::TempDir,
}

fn open() -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.db");
    let db = Database::new(path.to_str().unwrap()).unwrap();
    db.run_schema().unwrap();
    // A second run leaves the existing tables alone
    db.run_schema().unwrap();
    TestDb {
        repos: db.repositories(),
        _dir: dir,
    }
}

async fn saved_torrent(repos: &Repositories, hash_byte: &str) -> Torrent {
    repos
        .torrents
        .save(&Torrent::new(hash_byte.repeat(20), "sample".into(), 40_000, 16384, 3))
        .await
        .unwrap()
}

#[tokio::test]
async fn torrents_round_trip_with_status_and_unique_hash() {
    let db = open();
    let mut torrent = saved_torrent(&db.repos, "aa").await;
    let id = torrent.id.unwrap();
    assert_eq!(torrent.status, TorrentStatus::Parsing);

    let duplicate = Torrent::new("aa".repeat(20), "again".into(), 1, 1, 1);
    assert!(db.repos.torrents.save(&duplicate).await.is_err());

    torrent.status = TorrentStatus::Error("disk gone".into());
    torrent.progress = 0.5;
    torrent.file_path = Some("/tmp/sample".into());
    let updated = db.repos.torrents.update(&torrent).await.unwrap();
    assert_eq!(updated.status, TorrentStatus::Error("disk gone".into()));
    assert_eq!(updated.file_path.as_deref(), Some("/tmp/sample"));

    let by_hash = db.repos.torrents.find_by_info_hash(&"aa".repeat(20)).await.unwrap().unwrap();
    assert_eq!(by_hash.id, Some(id));
    assert!((by_hash.progress - 0.5).abs() < f32::EPSILON);

    let mut missing = torrent.clone();
    missing.id = Some(id + 100);
    assert!(db.repos.torrents.update(&missing).await.is_err());
}

#[tokio::test]
async fn magnet_layout_is_written_by_update() {
    let db = open();
    let mut torrent = db
        .repos
        .torrents
        .save(&Torrent::awaiting_metadata("cc".repeat(20), "magnet".into()))
        .await
        .unwrap();
    torrent.apply_layout("movie.mkv".into(), 1 << 20, 1 << 18, 4);
    let updated = db.repos.torrents.update(&torrent).await.unwrap();
    assert_eq!(updated.name, "movie.mkv");
    assert_eq!(updated.piece_count, 4);
    assert!(updated.has_metadata());
}

#[tokio::test]
async fn piece_flags_and_verified_count() {
    let db = open();
    let id = saved_torrent(&db.repos, "bb").await.id.unwrap();
    let pieces: Vec<Piece> = (0..3).map(|i| Piece::new(id, i, format!("{:040}", i))).collect();
    db.repos.pieces.save_batch(&pieces).await.unwrap();
    assert!(db.repos.pieces.save_batch(&pieces[..1]).await.is_err());

    db.repos.pieces.update_flags(id, 1, true, true).await.unwrap();
    db.repos.pieces.update_flags(id, 2, true, false).await.unwrap();
    assert_eq!(db.repos.pieces.count_verified(id).await.unwrap(), 1);
    assert!(db.repos.pieces.update_flags(id, 9, true, true).await.is_err());

    let stored = db.repos.pieces.find_by_torrent_id(id).await.unwrap();
    let indices: Vec<i32> = stored.iter().map(|p| p.piece_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    let piece = db.repos.pieces.find_by_torrent_and_index(id, 2).await.unwrap().unwrap();
    assert!(piece.downloaded && !piece.verified);
}

#[tokio::test]
async fn peers_upsert_on_torrent_ip_port() {
    let db = open();
    let id = saved_torrent(&db.repos, "dd").await.id.unwrap();
    let peers = vec![
        Peer::new(id, "10.0.0.1".into(), 6881),
        Peer::new(id, "10.0.0.1".into(), 6881),
        Peer::new(id, "10.0.0.1".into(), 6882),
    ];
    db.repos.peers.upsert_batch(&peers).await.unwrap();
    assert_eq!(db.repos.peers.find_by_torrent_id(id).await.unwrap().len(), 2);

    db.repos
        .peers
        .update_status(id, "10.0.0.1", 6881, PeerStatus::Connected, Some("-XX0001-abc".into()))
        .await
        .unwrap();
    db.repos
        .peers
        .update_status(id, "10.0.0.9", 7000, PeerStatus::Banned, None)
        .await
        .unwrap();
    let connected = db.repos.peers.find_connected(id).await.unwrap();
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].peer_id.as_deref(), Some("-XX0001-abc"));

    db.repos.peers.disconnect_all(id).await.unwrap();
    let all = db.repos.peers.find_by_torrent_id(id).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|p| p.status != PeerStatus::Connected));
    assert!(all.iter().any(|p| p.status == PeerStatus::Banned));

    let mut stale = Peer::new(id, "10.0.0.5".into(), 1);
    stale.last_seen -= Duration::from_secs(48 * 3600);
    db.repos.peers.upsert_batch(&[stale]).await.unwrap();
    db.repos.peers.delete_old(id, 24).await.unwrap();
    assert_eq!(db.repos.peers.find_by_torrent_id(id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn trackers_keep_announce_state() {
    let db = open();
    let id = saved_torrent(&db.repos, "ee").await.id.unwrap();
    let saved = db
        .repos
        .trackers
        .save_batch(&[
            Tracker::new(id, "http://a.test/announce".into()),
            Tracker::new(id, "udp://b.test:80".into()),
        ])
        .await
        .unwrap();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[1].url, "udp://b.test:80");

    let mut tracker = saved[0].clone();
    tracker.mark_announce_success(Duration::from_secs(1800));
    tracker.update_stats(Some(4), Some(2), Some(10));
    db.repos.trackers.update(&tracker).await.unwrap();

    let mut failing = saved[1].clone();
    failing.mark_error();
    db.repos.trackers.update(&failing).await.unwrap();

    let stored = db.repos.trackers.find_by_torrent_id(id).await.unwrap();
    assert_eq!(stored[0].seeders, Some(4));
    assert!(stored[0].next_announce.is_some());
    assert_eq!(stored[1].status, TrackerStatus::Error);
}

#[tokio::test]
async fn deleting_a_torrent_cascades() {
    let db = open();
    let id = saved_torrent(&db.repos, "ff").await.id.unwrap();
    db.repos.pieces.save_batch(&[Piece::new(id, 0, "0".repeat(40))]).await.unwrap();
    db.repos
        .trackers
        .save_batch(&[Tracker::new(id, "http://t.test/announce".into())])
        .await
        .unwrap();
    db.repos.peers.upsert_batch(&[Peer::new(id, "10.0.0.2".into(), 1)]).await.unwrap();
    db.repos
        .files
        .save_batch(&[
            TorrentFile::new(id, "dir/b.bin".into(), 10, 30_000),
            TorrentFile::new(id, "dir/a.bin".into(), 30_000, 0),
        ])
        .await
        .unwrap();
    let files = db.repos.files.find_by_torrent_id(id).await.unwrap();
    assert_eq!(files[0].path, "dir/a.bin");

    db.repos.torrents.delete(id).await.unwrap();

    assert!(db.repos.torrents.find_by_id(id).await.unwrap().is_none());
    assert!(db.repos.pieces.find_by_torrent_id(id).await.unwrap().is_empty());
    assert!(db.repos.trackers.find_by_torrent_id(id).await.unwrap().is_empty());
    assert!(db.repos.peers.find_by_torrent_id(id).await.unwrap().is_empty());
    assert!(db.repos.files.find_by_torrent_id(id).await.unwrap().is_empty());
}

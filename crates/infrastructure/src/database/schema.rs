diesel::table! {
    torrents (id) {
        id -> Integer,
        info_hash -> Text,
        name -> Text,
        total_size -> BigInt,
        piece_length -> Integer,
        piece_count -> Integer,
        file_path -> Nullable<Text>,
        status -> Text,            // parsing, metadata_ready, downloading, paused, seeding, completed, error: <reason>
        progress -> Float,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    torrent_files (id) {
        id -> Integer,
        torrent_id -> Integer,
        path -> Text,              // '/'-joined path inside the torrent
        length -> BigInt,
        offset -> BigInt,          // Byte offset in the torrent
    }
}

diesel::table! {
    pieces (id) {
        id -> Integer,
        torrent_id -> Integer,
        piece_index -> Integer,
        hash -> Text,              // 40-char hex SHA-1
        downloaded -> Bool,
        verified -> Bool,
    }
}

diesel::table! {
    peers (id) {
        id -> Integer,
        torrent_id -> Integer,
        ip -> Text,
        port -> Integer,
        peer_id -> Nullable<Text>,
        last_seen -> Timestamp,
        status -> Text,            // disconnected, connecting, connected, banned
    }
}

diesel::table! {
    trackers (id) {
        id -> Integer,
        torrent_id -> Integer,
        url -> Text,
        status -> Text,            // active, error, disabled
        last_announce -> Nullable<Timestamp>,
        next_announce -> Nullable<Timestamp>,
        seeders -> Nullable<Integer>,
        leechers -> Nullable<Integer>,
        completed -> Nullable<Integer>,
    }
}

diesel::joinable!(torrent_files -> torrents (torrent_id));
diesel::joinable!(pieces -> torrents (torrent_id));
diesel::joinable!(peers -> torrents (torrent_id));
diesel::joinable!(trackers -> torrents (torrent_id));

diesel::allow_tables_to_appear_in_same_query!(torrents, torrent_files, pieces, peers, trackers,);

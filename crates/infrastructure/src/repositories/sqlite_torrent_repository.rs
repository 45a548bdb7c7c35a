use crate::database::{from_naive, run, to_naive, torrents, SqlitePool};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use domain::{DomainError, Torrent, TorrentRepository, TorrentStatus};

// Database model - separate from domain entity
#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = torrents)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct TorrentModel {
    id: i32,
    info_hash: String,
    name: String,
    total_size: i64,
    piece_length: i32,
    piece_count: i32,
    file_path: Option<String>,
    status: String,
    progress: f32,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = torrents)]
struct NewTorrentModel {
    info_hash: String,
    name: String,
    total_size: i64,
    piece_length: i32,
    piece_count: i32,
    file_path: Option<String>,
    status: String,
    progress: f32,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

/// Persisted form of a status. Errors keep their reason after `error: `.
pub fn status_to_db(status: &TorrentStatus) -> String {
    match status {
        TorrentStatus::Error(reason) if reason.is_empty() => "error".to_string(),
        TorrentStatus::Error(reason) => format!("error: {}", reason),
        other => other.name().to_string(),
    }
}

pub fn status_from_db(value: &str) -> TorrentStatus {
    match value {
        "parsing" => TorrentStatus::Parsing,
        "metadata_ready" => TorrentStatus::MetadataReady,
        "downloading" => TorrentStatus::Downloading,
        "paused" => TorrentStatus::Paused,
        "seeding" => TorrentStatus::Seeding,
        "completed" => TorrentStatus::Completed,
        "error" => TorrentStatus::Error(String::new()),
        other => match other.strip_prefix("error: ") {
            Some(reason) => TorrentStatus::Error(reason.to_string()),
            None => TorrentStatus::Error(format!("unknown status '{}'", other)),
        },
    }
}

impl From<TorrentModel> for Torrent {
    fn from(model: TorrentModel) -> Self {
        Torrent {
            id: Some(model.id),
            info_hash: model.info_hash,
            name: model.name,
            total_size: model.total_size,
            piece_length: model.piece_length,
            piece_count: model.piece_count,
            file_path: model.file_path,
            status: status_from_db(&model.status),
            progress: model.progress,
            created_at: from_naive(model.created_at),
            updated_at: from_naive(model.updated_at),
        }
    }
}

impl From<&Torrent> for NewTorrentModel {
    fn from(torrent: &Torrent) -> Self {
        NewTorrentModel {
            info_hash: torrent.info_hash.clone(),
            name: torrent.name.clone(),
            total_size: torrent.total_size,
            piece_length: torrent.piece_length,
            piece_count: torrent.piece_count,
            file_path: torrent.file_path.clone(),
            status: status_to_db(&torrent.status),
            progress: torrent.progress,
            created_at: to_naive(torrent.created_at),
            updated_at: to_naive(torrent.updated_at),
        }
    }
}

pub struct SqliteTorrentRepository {
    pool: SqlitePool,
}

impl SqliteTorrentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TorrentRepository for SqliteTorrentRepository {
    async fn find_by_id(&self, id: i32) -> Result<Option<Torrent>, DomainError> {
        let result = run(&self.pool, move |conn| {
            torrents::table
                .filter(torrents::id.eq(id))
                .select(TorrentModel::as_select())
                .first::<TorrentModel>(conn)
                .optional()
        })
        .await?;

        Ok(result.map(Torrent::from))
    }

    async fn find_by_info_hash(&self, info_hash: &str) -> Result<Option<Torrent>, DomainError> {
        let info_hash = info_hash.to_string();
        let result = run(&self.pool, move |conn| {
            torrents::table
                .filter(torrents::info_hash.eq(info_hash))
                .select(TorrentModel::as_select())
                .first::<TorrentModel>(conn)
                .optional()
        })
        .await?;

        Ok(result.map(Torrent::from))
    }

    async fn save(&self, torrent: &Torrent) -> Result<Torrent, DomainError> {
        let new_torrent = NewTorrentModel::from(torrent);

        let result = run(&self.pool, move |conn| {
            conn.transaction(|conn| {
                diesel::insert_into(torrents::table)
                    .values(&new_torrent)
                    .execute(conn)?;

                torrents::table
                    .filter(torrents::info_hash.eq(&new_torrent.info_hash))
                    .select(TorrentModel::as_select())
                    .first::<TorrentModel>(conn)
            })
        })
        .await?;

        Ok(result.into())
    }

    async fn update(&self, torrent: &Torrent) -> Result<Torrent, DomainError> {
        let torrent_id = torrent.id.ok_or_else(|| {
            DomainError::ValidationError("Torrent ID is required for updates".to_string())
        })?;

        let name = torrent.name.clone();
        let total_size = torrent.total_size;
        let piece_length = torrent.piece_length;
        let piece_count = torrent.piece_count;
        let file_path = torrent.file_path.clone();
        let status = status_to_db(&torrent.status);
        let progress = torrent.progress;
        let now = chrono::Utc::now().naive_utc();

        let result = run(&self.pool, move |conn| {
            conn.transaction(|conn| {
                let updated = diesel::update(torrents::table.filter(torrents::id.eq(torrent_id)))
                    .set((
                        torrents::name.eq(name),
                        torrents::total_size.eq(total_size),
                        torrents::piece_length.eq(piece_length),
                        torrents::piece_count.eq(piece_count),
                        torrents::file_path.eq(file_path),
                        torrents::status.eq(status),
                        torrents::progress.eq(progress),
                        torrents::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                if updated == 0 {
                    return Ok(None);
                }

                torrents::table
                    .filter(torrents::id.eq(torrent_id))
                    .select(TorrentModel::as_select())
                    .first::<TorrentModel>(conn)
                    .map(Some)
            })
        })
        .await?;

        result
            .map(Torrent::from)
            .ok_or(DomainError::TorrentNotFound(torrent_id))
    }

    async fn delete(&self, id: i32) -> Result<(), DomainError> {
        run(&self.pool, move |conn| {
            diesel::delete(torrents::table.filter(torrents::id.eq(id))).execute(conn)
        })
        .await?;

        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<Torrent>, DomainError> {
        let result = run(&self.pool, |conn| {
            torrents::table
                .order(torrents::id.asc())
                .select(TorrentModel::as_select())
                .load::<TorrentModel>(conn)
        })
        .await?;

        Ok(result.into_iter().map(Torrent::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_reasons_survive_the_status_column() {
        let status = TorrentStatus::Error("no reachable peers".into());
        assert_eq!(status_to_db(&status), "error: no reachable peers");
        assert_eq!(status_from_db("error: no reachable peers"), status);
        assert_eq!(status_from_db("error"), TorrentStatus::Error(String::new()));
        assert_eq!(status_from_db("metadata_ready"), TorrentStatus::MetadataReady);
        assert!(status_from_db("connecting").is_error());
    }
}

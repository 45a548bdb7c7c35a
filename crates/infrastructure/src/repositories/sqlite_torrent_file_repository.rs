use crate::database::{run, torrent_files, SqlitePool};
use async_trait::async_trait;
use diesel::prelude::*;
use domain::{DomainError, TorrentFile, TorrentFileRepository};

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = torrent_files)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct TorrentFileModel {
    id: i32,
    torrent_id: i32,
    path: String,
    length: i64,
    offset: i64,
}

#[derive(Insertable)]
#[diesel(table_name = torrent_files)]
struct NewTorrentFileModel {
    torrent_id: i32,
    path: String,
    length: i64,
    offset: i64,
}

impl From<TorrentFileModel> for TorrentFile {
    fn from(model: TorrentFileModel) -> Self {
        TorrentFile {
            id: Some(model.id),
            torrent_id: model.torrent_id,
            path: model.path,
            length: model.length,
            offset: model.offset,
        }
    }
}

pub struct SqliteTorrentFileRepository {
    pool: SqlitePool,
}

impl SqliteTorrentFileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TorrentFileRepository for SqliteTorrentFileRepository {
    async fn find_by_torrent_id(&self, torrent_id: i32) -> Result<Vec<TorrentFile>, DomainError> {
        let result = run(&self.pool, move |conn| {
            torrent_files::table
                .filter(torrent_files::torrent_id.eq(torrent_id))
                .order(torrent_files::offset.asc())
                .select(TorrentFileModel::as_select())
                .load::<TorrentFileModel>(conn)
        })
        .await?;

        Ok(result.into_iter().map(TorrentFile::from).collect())
    }

    async fn save_batch(&self, files: &[TorrentFile]) -> Result<(), DomainError> {
        let rows: Vec<NewTorrentFileModel> = files
            .iter()
            .map(|f| NewTorrentFileModel {
                torrent_id: f.torrent_id,
                path: f.path.clone(),
                length: f.length,
                offset: f.offset,
            })
            .collect();

        run(&self.pool, move |conn| {
            conn.transaction(|conn| {
                for chunk in rows.chunks(150) {
                    diesel::insert_into(torrent_files::table)
                        .values(chunk)
                        .execute(conn)?;
                }
                Ok(())
            })
        })
        .await
    }
}

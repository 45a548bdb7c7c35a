use crate::database::{pieces, run, SqlitePool};
use async_trait::async_trait;
use diesel::prelude::*;
use domain::{DomainError, Piece, PieceRepository};

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = pieces)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct PieceModel {
    id: i32,
    torrent_id: i32,
    piece_index: i32,
    hash: String,
    downloaded: bool,
    verified: bool,
}

#[derive(Insertable)]
#[diesel(table_name = pieces)]
struct NewPieceModel {
    torrent_id: i32,
    piece_index: i32,
    hash: String,
    downloaded: bool,
    verified: bool,
}

impl From<PieceModel> for Piece {
    fn from(model: PieceModel) -> Self {
        Piece {
            id: Some(model.id),
            torrent_id: model.torrent_id,
            piece_index: model.piece_index,
            hash: model.hash,
            downloaded: model.downloaded,
            verified: model.verified,
        }
    }
}

impl From<&Piece> for NewPieceModel {
    fn from(piece: &Piece) -> Self {
        NewPieceModel {
            torrent_id: piece.torrent_id,
            piece_index: piece.piece_index,
            hash: piece.hash.clone(),
            downloaded: piece.downloaded,
            verified: piece.verified,
        }
    }
}

pub struct SqlitePieceRepository {
    pool: SqlitePool,
}

impl SqlitePieceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PieceRepository for SqlitePieceRepository {
    async fn find_by_torrent_id(&self, torrent_id: i32) -> Result<Vec<Piece>, DomainError> {
        let result = run(&self.pool, move |conn| {
            pieces::table
                .filter(pieces::torrent_id.eq(torrent_id))
                .order(pieces::piece_index.asc())
                .select(PieceModel::as_select())
                .load::<PieceModel>(conn)
        })
        .await?;

        Ok(result.into_iter().map(Piece::from).collect())
    }

    async fn find_by_torrent_and_index(
        &self,
        torrent_id: i32,
        piece_index: i32,
    ) -> Result<Option<Piece>, DomainError> {
        let result = run(&self.pool, move |conn| {
            pieces::table
                .filter(pieces::torrent_id.eq(torrent_id))
                .filter(pieces::piece_index.eq(piece_index))
                .select(PieceModel::as_select())
                .first::<PieceModel>(conn)
                .optional()
        })
        .await?;

        Ok(result.map(Piece::from))
    }

    async fn save_batch(&self, pieces: &[Piece]) -> Result<(), DomainError> {
        let rows: Vec<NewPieceModel> = pieces.iter().map(NewPieceModel::from).collect();

        // Chunks stay under SQLite's bound-parameter limit
        run(&self.pool, move |conn| {
            conn.transaction(|conn| {
                for chunk in rows.chunks(150) {
                    diesel::insert_into(pieces::table)
                        .values(chunk)
                        .execute(conn)?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn update_flags(
        &self,
        torrent_id: i32,
        piece_index: i32,
        downloaded: bool,
        verified: bool,
    ) -> Result<(), DomainError> {
        let updated = run(&self.pool, move |conn| {
            diesel::update(
                pieces::table
                    .filter(pieces::torrent_id.eq(torrent_id))
                    .filter(pieces::piece_index.eq(piece_index)),
            )
            .set((pieces::downloaded.eq(downloaded), pieces::verified.eq(verified)))
            .execute(conn)
        })
        .await?;

        if updated == 0 {
            return Err(DomainError::ValidationError(format!(
                "Piece {} not found",
                piece_index
            )));
        }
        Ok(())
    }

    async fn count_verified(&self, torrent_id: i32) -> Result<i32, DomainError> {
        let count = run(&self.pool, move |conn| {
            pieces::table
                .filter(pieces::torrent_id.eq(torrent_id))
                .filter(pieces::downloaded.eq(true))
                .filter(pieces::verified.eq(true))
                .count()
                .get_result::<i64>(conn)
        })
        .await?;

        Ok(count as i32)
    }
}

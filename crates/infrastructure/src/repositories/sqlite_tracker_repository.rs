use crate::database::{from_naive, run, to_naive, trackers, SqlitePool};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use domain::{DomainError, Tracker, TrackerRepository, TrackerStatus};

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = trackers)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct TrackerModel {
    id: i32,
    torrent_id: i32,
    url: String,
    status: String,
    last_announce: Option<NaiveDateTime>,
    next_announce: Option<NaiveDateTime>,
    seeders: Option<i32>,
    leechers: Option<i32>,
    completed: Option<i32>,
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = trackers)]
#[diesel(treat_none_as_null = true)]
struct NewTrackerModel {
    torrent_id: i32,
    url: String,
    status: String,
    last_announce: Option<NaiveDateTime>,
    next_announce: Option<NaiveDateTime>,
    seeders: Option<i32>,
    leechers: Option<i32>,
    completed: Option<i32>,
}

fn status_to_db(status: &TrackerStatus) -> &'static str {
    match status {
        TrackerStatus::Active => "active",
        TrackerStatus::Error => "error",
        TrackerStatus::Disabled => "disabled",
    }
}

fn status_from_db(value: &str) -> TrackerStatus {
    match value {
        "active" => TrackerStatus::Active,
        "disabled" => TrackerStatus::Disabled,
        // "failed" is how older databases spelled it
        _ => TrackerStatus::Error,
    }
}

impl From<TrackerModel> for Tracker {
    fn from(model: TrackerModel) -> Self {
        Tracker {
            id: Some(model.id),
            torrent_id: model.torrent_id,
            url: model.url,
            status: status_from_db(&model.status),
            last_announce: model.last_announce.map(from_naive),
            next_announce: model.next_announce.map(from_naive),
            seeders: model.seeders,
            leechers: model.leechers,
            completed: model.completed,
        }
    }
}

impl From<&Tracker> for NewTrackerModel {
    fn from(tracker: &Tracker) -> Self {
        NewTrackerModel {
            torrent_id: tracker.torrent_id,
            url: tracker.url.clone(),
            status: status_to_db(&tracker.status).to_string(),
            last_announce: tracker.last_announce.map(to_naive),
            next_announce: tracker.next_announce.map(to_naive),
            seeders: tracker.seeders,
            leechers: tracker.leechers,
            completed: tracker.completed,
        }
    }
}

pub struct SqliteTrackerRepository {
    pool: SqlitePool,
}

impl SqliteTrackerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrackerRepository for SqliteTrackerRepository {
    async fn find_by_torrent_id(&self, torrent_id: i32) -> Result<Vec<Tracker>, DomainError> {
        let result = run(&self.pool, move |conn| {
            trackers::table
                .filter(trackers::torrent_id.eq(torrent_id))
                .order(trackers::id.asc())
                .select(TrackerModel::as_select())
                .load::<TrackerModel>(conn)
        })
        .await?;

        Ok(result.into_iter().map(Tracker::from).collect())
    }

    async fn update(&self, tracker: &Tracker) -> Result<Tracker, DomainError> {
        let tracker_id = tracker.id.ok_or_else(|| {
            DomainError::ValidationError("Tracker ID is required for updates".to_string())
        })?;
        let changes = NewTrackerModel::from(tracker);

        let result = run(&self.pool, move |conn| {
            conn.transaction(|conn| {
                diesel::update(trackers::table.filter(trackers::id.eq(tracker_id)))
                    .set(&changes)
                    .execute(conn)?;

                trackers::table
                    .filter(trackers::id.eq(tracker_id))
                    .select(TrackerModel::as_select())
                    .first::<TrackerModel>(conn)
                    .optional()
            })
        })
        .await?;

        result
            .map(Tracker::from)
            .ok_or_else(|| DomainError::RepositoryError(format!("Tracker {} not found", tracker_id)))
    }

    async fn save_batch(&self, trackers: &[Tracker]) -> Result<Vec<Tracker>, DomainError> {
        let rows: Vec<NewTrackerModel> = trackers.iter().map(NewTrackerModel::from).collect();

        let result = run(&self.pool, move |conn| {
            conn.transaction(|conn| {
                let mut saved = Vec::with_capacity(rows.len());
                for row in &rows {
                    diesel::insert_into(trackers::table)
                        .values(row)
                        .execute(conn)?;
                    // Writes are serialized inside the transaction, so the
                    // newest id is this row
                    let model = trackers::table
                        .order(trackers::id.desc())
                        .select(TrackerModel::as_select())
                        .first::<TrackerModel>(conn)?;
                    saved.push(model);
                }
                Ok(saved)
            })
        })
        .await?;

        Ok(result.into_iter().map(Tracker::from).collect())
    }
}

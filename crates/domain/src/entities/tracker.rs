use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    Active,
    Error,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tracker {
    pub id: Option<i32>,
    pub torrent_id: i32,
    pub url: String,
    pub status: TrackerStatus,
    pub last_announce: Option<SystemTime>,
    pub next_announce: Option<SystemTime>,
    pub seeders: Option<i32>,
    pub leechers: Option<i32>,
    pub completed: Option<i32>,
}

impl Tracker {
    pub fn new(torrent_id: i32, url: String) -> Self {
        Self {
            id: None,
            torrent_id,
            url,
            status: TrackerStatus::Active,
            last_announce: None,
            next_announce: None,
            seeders: None,
            leechers: None,
            completed: None,
        }
    }

    pub fn mark_announce_success(&mut self, interval: Duration) {
        let now = SystemTime::now();
        self.last_announce = Some(now);
        self.next_announce = Some(now + interval);
        self.status = TrackerStatus::Active;
    }

    /// Records a failed announce; the tracker is only flagged `Error`
    /// once `mark_error` is reached by the retry policy.
    pub fn mark_announce_failed(&mut self, retry_in: Duration) {
        let now = SystemTime::now();
        self.last_announce = Some(now);
        self.next_announce = Some(now + retry_in);
    }

    pub fn mark_error(&mut self) {
        self.status = TrackerStatus::Error;
    }

    pub fn update_stats(&mut self, seeders: Option<i32>, leechers: Option<i32>, completed: Option<i32>) {
        if seeders.is_some() {
            self.seeders = seeders;
        }
        if leechers.is_some() {
            self.leechers = leechers;
        }
        if completed.is_some() {
            self.completed = completed;
        }
    }

    pub fn is_usable(&self) -> bool {
        !matches!(self.status, TrackerStatus::Disabled)
    }

    pub fn should_announce(&self) -> bool {
        match self.next_announce {
            Some(next) => SystemTime::now() >= next,
            None => true, // First announce
        }
    }
}

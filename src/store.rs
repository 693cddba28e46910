use crate::error::{Error, Result};
use crate::experiments::{Experiment, ExperimentKind};
use crate::quota::{Bucket, Caller, QuotaStore, Tier, UserQuota};
use crate::session::{GazeSessionRecord, GazeSessionStore};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    tier TEXT NOT NULL,
    allotment REAL NOT NULL,
    last_consumed_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS anonymous_quotas (
    ip TEXT PRIMARY KEY,
    allotment REAL NOT NULL,
    last_consumed_at TEXT
);

CREATE TABLE IF NOT EXISTS pictures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_user TEXT,
    owner_ip TEXT,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS experiments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    picture_id INTEGER NOT NULL REFERENCES pictures(id),
    kind TEXT NOT NULL,
    charged BOOLEAN NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_experiments_picture ON experiments(picture_id);

CREATE TABLE IF NOT EXISTS gaze_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_id INTEGER NOT NULL REFERENCES experiments(id),
    record TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// An uploaded image experiments run against
#[derive(Debug, Clone, PartialEq)]
pub struct Picture {
    pub id: i64,
    pub owner: Caller,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

fn parse_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_optional_time(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_time(idx, &s)).transpose()
}

fn bad_text(idx: usize, what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unknown {} '{}'", what, raw).into(),
    )
}

/// SQLite-backed storage for users, quotas, pictures, experiments and gaze
/// sessions
#[derive(Debug)]
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (creating if needed) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Self::init(Connection::open(path)?)?;
        info!("opened database {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Db { conn })
    }

    /// Run `f` inside one transaction, committed only if `f` succeeds
    pub fn transaction<T>(&self, f: impl FnOnce(&Db) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }

    /// Register a user with a full bucket for their tier
    pub fn add_user(&self, user_id: &str, tier: Tier, now: DateTime<Utc>) -> Result<UserQuota> {
        let quota = UserQuota {
            tier,
            bucket: Bucket::full(tier.config()),
        };
        self.conn.execute(
            "INSERT INTO users (id, tier, allotment, last_consumed_at, created_at) VALUES (?1, ?2, ?3, NULL, ?4)",
            params![user_id, tier.to_string(), quota.bucket.allotment, now.to_rfc3339()],
        )?;
        info!("added {} user {}", tier, user_id);
        Ok(quota)
    }

    pub fn users(&self) -> Result<Vec<(String, UserQuota)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, tier, allotment, last_consumed_at FROM users ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, user_quota_from_row(row)?)))?;
        let mut users = Vec::new();
        for user in rows {
            users.push(user?);
        }
        Ok(users)
    }

    pub fn add_picture(&self, owner: &Caller, name: &str, now: DateTime<Utc>) -> Result<Picture> {
        let (user, ip) = match owner {
            Caller::User(id) => (Some(id.as_str()), None),
            Caller::Anonymous { ip } => (None, Some(ip.as_str())),
        };
        self.conn.execute(
            "INSERT INTO pictures (owner_user, owner_ip, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user, ip, name, now.to_rfc3339()],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!("picture {} '{}' stored", id, name);
        Ok(Picture {
            id,
            owner: owner.clone(),
            name: name.to_string(),
            created_at: now,
        })
    }

    pub fn picture(&self, id: i64) -> Result<Option<Picture>> {
        let picture = self
            .conn
            .query_row(
                "SELECT id, owner_user, owner_ip, name, created_at FROM pictures WHERE id = ?1",
                [id],
                picture_from_row,
            )
            .optional()?;
        Ok(picture)
    }

    pub fn pictures(&self) -> Result<Vec<Picture>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, owner_user, owner_ip, name, created_at FROM pictures ORDER BY id")?;
        let rows = stmt.query_map([], picture_from_row)?;
        let mut pictures = Vec::new();
        for picture in rows {
            pictures.push(picture?);
        }
        Ok(pictures)
    }

    /// Experiments already run on a picture
    pub fn experiment_count(&self, picture_id: i64) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM experiments WHERE picture_id = ?1",
            [picture_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn insert_experiment(
        &self,
        picture_id: i64,
        kind: ExperimentKind,
        charged: bool,
        now: DateTime<Utc>,
    ) -> Result<Experiment> {
        self.conn.execute(
            "INSERT INTO experiments (picture_id, kind, charged, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![picture_id, kind.to_string(), charged, now.to_rfc3339()],
        )?;
        Ok(Experiment {
            id: self.conn.last_insert_rowid(),
            picture_id,
            kind,
            charged,
            created_at: now,
        })
    }

    pub fn experiment(&self, id: i64) -> Result<Option<Experiment>> {
        let experiment = self
            .conn
            .query_row(
                "SELECT id, picture_id, kind, charged, created_at FROM experiments WHERE id = ?1",
                [id],
                |row| {
                    let kind: String = row.get(2)?;
                    let created_at: String = row.get(4)?;
                    Ok(Experiment {
                        id: row.get(0)?,
                        picture_id: row.get(1)?,
                        kind: kind
                            .parse::<ExperimentKind>()
                            .map_err(|_| bad_text(2, "experiment kind", &kind))?,
                        charged: row.get(3)?,
                        created_at: parse_time(4, &created_at)?,
                    })
                },
            )
            .optional()?;
        Ok(experiment)
    }

    pub fn gaze_sessions(&self, experiment_id: i64) -> Result<Vec<GazeSessionRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM gaze_sessions WHERE experiment_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map([experiment_id], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(serde_json::from_str(&raw?)?);
        }
        Ok(records)
    }
}

fn user_quota_from_row(row: &Row<'_>) -> rusqlite::Result<UserQuota> {
    let tier: String = row.get(1)?;
    Ok(UserQuota {
        tier: tier.parse::<Tier>().map_err(|_| bad_text(1, "tier", &tier))?,
        bucket: Bucket {
            allotment: row.get(2)?,
            last_consumed_at: parse_optional_time(3, row.get(3)?)?,
        },
    })
}

fn picture_from_row(row: &Row<'_>) -> rusqlite::Result<Picture> {
    let user: Option<String> = row.get(1)?;
    let ip: Option<String> = row.get(2)?;
    let owner = match (user, ip) {
        (Some(id), _) => Caller::User(id),
        (None, Some(ip)) => Caller::Anonymous { ip },
        (None, None) => return Err(bad_text(1, "picture owner", "")),
    };
    let created_at: String = row.get(4)?;
    Ok(Picture {
        id: row.get(0)?,
        owner,
        name: row.get(3)?,
        created_at: parse_time(4, &created_at)?,
    })
}

impl QuotaStore for Db {
    fn user_quota(&self, user_id: &str) -> Result<Option<UserQuota>> {
        let quota = self
            .conn
            .query_row(
                "SELECT id, tier, allotment, last_consumed_at FROM users WHERE id = ?1",
                [user_id],
                user_quota_from_row,
            )
            .optional()?;
        Ok(quota)
    }

    fn save_user_quota(&self, user_id: &str, quota: &UserQuota) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE users SET tier = ?2, allotment = ?3, last_consumed_at = ?4 WHERE id = ?1",
            params![
                user_id,
                quota.tier.to_string(),
                quota.bucket.allotment,
                quota.bucket.last_consumed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    fn anonymous_bucket(&self, ip: &str) -> Result<Option<Bucket>> {
        let bucket = self
            .conn
            .query_row(
                "SELECT allotment, last_consumed_at FROM anonymous_quotas WHERE ip = ?1",
                [ip],
                |row| {
                    Ok(Bucket {
                        allotment: row.get(0)?,
                        last_consumed_at: parse_optional_time(1, row.get(1)?)?,
                    })
                },
            )
            .optional()?;
        Ok(bucket)
    }

    fn save_anonymous_bucket(&self, ip: &str, bucket: &Bucket) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO anonymous_quotas (ip, allotment, last_consumed_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(ip) DO UPDATE SET allotment = excluded.allotment,
                last_consumed_at = excluded.last_consumed_at
            "#,
            params![ip, bucket.allotment, bucket.last_consumed_at.map(|t| t.to_rfc3339())],
        )?;
        Ok(())
    }
}

impl GazeSessionStore for Db {
    fn save_gaze_session(&self, experiment_id: i64, record: &GazeSessionRecord) -> Result<i64> {
        if self.experiment(experiment_id)?.is_none() {
            return Err(Error::NotFound(format!("experiment {}", experiment_id)));
        }
        self.conn.execute(
            "INSERT INTO gaze_sessions (experiment_id, record, created_at) VALUES (?1, ?2, ?3)",
            params![
                experiment_id,
                serde_json::to_string(record)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(
            "gaze session {} saved for experiment {} ({} points)",
            id,
            experiment_id,
            record.gaze_points.len()
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaze::GazeSample;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn user_quota_roundtrip() {
        let db = Db::open_in_memory().unwrap();
        db.add_user("ana", Tier::Premium, t0()).unwrap();
        let mut quota = db.user_quota("ana").unwrap().unwrap();
        assert_eq!(quota.tier, Tier::Premium);
        assert_eq!(quota.bucket.allotment, 100.0);
        assert_eq!(quota.bucket.last_consumed_at, None);

        quota.bucket.allotment = 41.5;
        quota.bucket.last_consumed_at = Some(t0());
        db.save_user_quota("ana", &quota).unwrap();
        assert_eq!(db.user_quota("ana").unwrap(), Some(quota));
        assert_eq!(db.users().unwrap().len(), 1);
    }

    #[test]
    fn saving_unknown_user_fails() {
        let db = Db::open_in_memory().unwrap();
        let quota = UserQuota {
            tier: Tier::Free,
            bucket: Bucket::full(Tier::Free.config()),
        };
        assert_matches!(db.save_user_quota("ghost", &quota), Err(Error::NotFound(_)));
        assert_eq!(db.user_quota("ghost").unwrap(), None);
    }

    #[test]
    fn duplicate_user_is_rejected() {
        let db = Db::open_in_memory().unwrap();
        db.add_user("bo", Tier::Free, t0()).unwrap();
        assert_matches!(db.add_user("bo", Tier::Free, t0()), Err(Error::Storage(_)));
    }

    #[test]
    fn anonymous_bucket_upserts() {
        let db = Db::open_in_memory().unwrap();
        assert_eq!(db.anonymous_bucket("10.0.0.1").unwrap(), None);
        let mut bucket = Bucket {
            allotment: 4.0,
            last_consumed_at: Some(t0()),
        };
        db.save_anonymous_bucket("10.0.0.1", &bucket).unwrap();
        bucket.allotment = 3.0;
        db.save_anonymous_bucket("10.0.0.1", &bucket).unwrap();
        assert_eq!(db.anonymous_bucket("10.0.0.1").unwrap(), Some(bucket));
    }

    #[test]
    fn pictures_and_experiments() {
        let db = Db::open_in_memory().unwrap();
        let pic = db.add_picture(&Caller::anonymous("1.2.3.4"), "dune.jpg", t0()).unwrap();
        assert_eq!(db.picture(pic.id).unwrap(), Some(pic.clone()));
        assert_eq!(db.picture(999).unwrap(), None);
        assert_eq!(db.experiment_count(pic.id).unwrap(), 0);

        let exp = db
            .insert_experiment(pic.id, ExperimentKind::ValueStudy, true, t0())
            .unwrap();
        assert_eq!(db.experiment_count(pic.id).unwrap(), 1);
        assert_eq!(db.experiment(exp.id).unwrap(), Some(exp));
        assert_eq!(db.pictures().unwrap().len(), 1);
    }

    #[test]
    fn gaze_session_requires_experiment() {
        let db = Db::open_in_memory().unwrap();
        let record = GazeSessionRecord {
            gaze_points: vec![GazeSample::new(1.0, 2.0, 3, 0.5)],
            session_duration: Some(0),
            ..GazeSessionRecord::default()
        };
        assert_matches!(db.save_gaze_session(7, &record), Err(Error::NotFound(_)));

        let pic = db.add_picture(&Caller::user("ana"), "a.png", t0()).unwrap();
        let exp = db
            .insert_experiment(pic.id, ExperimentKind::GazeTracking, true, t0())
            .unwrap();
        db.save_gaze_session(exp.id, &record).unwrap();
        assert_eq!(db.gaze_sessions(exp.id).unwrap(), vec![record]);
    }

    #[test]
    fn file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("gazalyzer.db");
        {
            let db = Db::open(&path).unwrap();
            db.add_user("cy", Tier::Professional, t0()).unwrap();
        }
        let db = Db::open(&path).unwrap();
        assert_eq!(
            db.user_quota("cy").unwrap().map(|q| q.tier),
            Some(Tier::Professional)
        );
    }

    #[test]
    fn failed_experiment_insert_refunds_quota() {
        use crate::experiments::{create_experiment, ExperimentRequest};

        let db = Db::open_in_memory().unwrap();
        db.add_user("ana", Tier::Free, t0()).unwrap();
        let caller = Caller::user("ana");
        let pic = db.add_picture(&caller, "dunes.jpg", t0()).unwrap();
        db.conn
            .execute_batch(
                "CREATE TRIGGER reject_experiments BEFORE INSERT ON experiments
                 BEGIN SELECT RAISE(ABORT, 'experiments are read-only'); END;",
            )
            .unwrap();

        let request = ExperimentRequest {
            caller,
            picture_id: pic.id,
            kind: ExperimentKind::Composition,
        };
        assert_matches!(create_experiment(&db, &request, t0()), Err(Error::Storage(_)));
        let quota = db.user_quota("ana").unwrap().unwrap();
        assert_eq!(quota.bucket.allotment, 3.0);
        assert_eq!(quota.bucket.last_consumed_at, None);
        assert_eq!(db.experiment_count(pic.id).unwrap(), 0);
    }
}

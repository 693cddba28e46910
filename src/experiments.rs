use crate::error::{Error, Result};
use crate::quota::{Caller, QuotaLedger};
use crate::store::Db;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Analyses a picture can be put through
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExperimentKind {
    ValueStudy,
    EdgeDetection,
    GazeTracking,
    Composition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: i64,
    pub picture_id: i64,
    pub kind: ExperimentKind,
    /// Whether this experiment drew from the caller's quota
    pub charged: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentRequest {
    pub caller: Caller,
    pub picture_id: i64,
    pub kind: ExperimentKind,
}

/// Create an experiment, charging the caller's quota the first time a
/// picture is experimented on.
pub fn create_experiment(db: &Db, request: &ExperimentRequest, now: DateTime<Utc>) -> Result<Experiment> {
    let picture = db
        .picture(request.picture_id)?
        .ok_or_else(|| Error::NotFound(format!("picture {}", request.picture_id)))?;

    let picture_used = db.experiment_count(picture.id)? > 0;
    let experiment = db.transaction(|db| {
        QuotaLedger::new(db).try_consume_at(&request.caller, picture_used, now)?;
        db.insert_experiment(picture.id, request.kind, !picture_used, now)
    })?;
    info!(
        "experiment {} ({}) created on picture {}{}",
        experiment.id,
        experiment.kind,
        picture.id,
        if picture_used { ", free re-run" } else { "" }
    );
    Ok(experiment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{QuotaStore, Tier};
    use assert_matches::assert_matches;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap()
    }

    #[test]
    fn reruns_on_same_picture_are_free() {
        let db = Db::open_in_memory().unwrap();
        db.add_user("ana", Tier::Free, t0()).unwrap();
        let caller = Caller::user("ana");
        let pic = db.add_picture(&caller, "still-life.jpg", t0()).unwrap();

        for kind in [
            ExperimentKind::ValueStudy,
            ExperimentKind::EdgeDetection,
            ExperimentKind::Composition,
        ] {
            let request = ExperimentRequest {
                caller: caller.clone(),
                picture_id: pic.id,
                kind,
            };
            create_experiment(&db, &request, t0()).unwrap();
        }

        let quota = db.user_quota("ana").unwrap().unwrap();
        assert_eq!(quota.bucket.allotment, 2.0);
        assert_eq!(db.experiment_count(pic.id).unwrap(), 3);
    }

    #[test]
    fn missing_picture_is_not_found() {
        let db = Db::open_in_memory().unwrap();
        let request = ExperimentRequest {
            caller: Caller::anonymous("9.9.9.9"),
            picture_id: 12,
            kind: ExperimentKind::GazeTracking,
        };
        assert_matches!(create_experiment(&db, &request, t0()), Err(Error::NotFound(_)));
        assert_eq!(db.anonymous_bucket("9.9.9.9").unwrap(), None);
    }

    #[test]
    fn exhausted_quota_blocks_new_pictures() {
        let db = Db::open_in_memory().unwrap();
        db.add_user("bo", Tier::Free, t0()).unwrap();
        let caller = Caller::user("bo");
        let mut at = t0();
        for i in 0..3 {
            let pic = db.add_picture(&caller, &format!("p{}.jpg", i), at).unwrap();
            let request = ExperimentRequest {
                caller: caller.clone(),
                picture_id: pic.id,
                kind: ExperimentKind::ValueStudy,
            };
            let exp = create_experiment(&db, &request, at).unwrap();
            assert!(exp.charged);
            at += Duration::minutes(1);
        }

        let pic = db.add_picture(&caller, "p3.jpg", at).unwrap();
        let request = ExperimentRequest {
            caller,
            picture_id: pic.id,
            kind: ExperimentKind::ValueStudy,
        };
        let err = create_experiment(&db, &request, at).unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(db.experiment_count(pic.id).unwrap(), 0);
    }

    #[test]
    fn kind_names_roundtrip() {
        for kind in [
            ExperimentKind::ValueStudy,
            ExperimentKind::EdgeDetection,
            ExperimentKind::GazeTracking,
            ExperimentKind::Composition,
        ] {
            assert_eq!(kind.to_string().parse::<ExperimentKind>(), Ok(kind));
        }
        assert!("sketch".parse::<ExperimentKind>().is_err());
    }
}

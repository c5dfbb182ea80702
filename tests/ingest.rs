mod common;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::seq::SliceRandom;
use tempfile::tempdir;
use trackdb::storage::Keyspace;
use trackdb::{StoreError, TrackDb, VisitFilter};
use uuid::Uuid;

use common::*;

#[test]
fn test_end_to_end_tonga() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    let stored = db.populate(&tonga_payload()).unwrap();
    assert_eq!(stored, 10);

    let lk = db.last_known().unwrap();
    let latest = &lk[TONGA_NAME];
    assert_eq!(latest.time, t0() + Duration::seconds(9));
    assert_eq!(latest.accuracy, 7.4);
    assert_eq!(latest.properties["Activity"], "Bike");

    let filter = VisitFilter {
        bbox_sw: Some(vec![33.0, -112.0]),
        bbox_ne: Some(vec![34.0, -111.0]),
        ..Default::default()
    };
    let res = db.query_visits(&filter).unwrap();
    assert_eq!(res.matches, 10);
    assert_eq!(res.visits.len(), 10);
    assert!(res.scanned >= 10);
    // Newest first by default.
    assert_eq!(res.visits[0].arrival_time, t0() + Duration::seconds(9));

    let again = db.populate(&tonga_payload()).unwrap();
    assert_eq!(again, 0);
    assert_eq!(db.last_known().unwrap(), lk);
    assert_eq!(db.store().len(Keyspace::Tracks).unwrap(), 10);

    let md = db.metadata().unwrap().unwrap();
    assert_eq!(md.key_count, 10);
    assert_eq!(md.last_updated_by, TONGA_NAME);
    assert_eq!(md.last_updated_points, 0);
}

#[test]
fn test_single_feature_twice() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let body = payload(&[feature("rye", "u-1", 45.0, -93.0, t0(), 5.0)]);

    assert_eq!(db.populate(&body).unwrap(), 1);
    assert_eq!(db.populate(&body).unwrap(), 0);
}

#[test]
fn test_mixed_uuids_rejects_whole_batch() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let body = payload(&[
        feature("rye", "u-1", 45.0, -93.0, t0(), 5.0),
        feature("rye", "u-2", 45.0, -93.0, t0() + Duration::seconds(1), 5.0),
    ]);

    match db.populate(&body) {
        Err(StoreError::Batch(_)) => {}
        other => panic!("expected batch error, got {other:?}"),
    }
    assert_eq!(db.store().len(Keyspace::Tracks).unwrap(), 0);
    assert_eq!(db.store().len(Keyspace::Visits).unwrap(), 0);
    assert!(db.last_known().unwrap().is_empty());
}

#[test]
fn test_more_accurate_twin_wins_in_either_order() {
    let t = Utc.timestamp_opt(100, 0).unwrap();
    let coarse = feature("rye", "u-1", 45.0, -93.0, t, 5.0);
    let fine = feature("rye", "u-1", 45.0001, -93.0001, t, 1.0);

    for order in [[coarse.clone(), fine.clone()], [fine.clone(), coarse.clone()]] {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());

        let stored = db.populate_features(&payload(&order)).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].accuracy, 1.0);

        let track = db.get_track("rye+u-1+100").unwrap().unwrap();
        assert_eq!(track.accuracy, 1.0);
        assert!((track.lat - 45.0001).abs() < 1e-9);
    }
}

#[test]
fn test_shuffled_batch_is_written_in_time_order() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let uuid = Uuid::new_v4().to_string();

    let mut features: Vec<_> = (0..20)
        .map(|i| feature("rye", &uuid, 45.0, -93.0, t0() + Duration::seconds(i), (20 - i) as f64))
        .collect();
    features.shuffle(&mut rand::thread_rng());
    let input_last = features.last().unwrap()["properties"]["Time"].as_str().unwrap().to_string();
    let input_last = DateTime::parse_from_rfc3339(&input_last).unwrap();

    let stored = db.populate_features(&payload(&features)).unwrap();
    assert_eq!(stored.len(), 20);
    assert!(stored.windows(2).all(|w| w[0].time < w[1].time));

    // Last-known follows input order, not time order.
    let lk = db.last_known().unwrap();
    assert_eq!(lk["rye"].time, input_last);
}

#[test]
fn test_invalid_features_are_dropped() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let mut missing_uuid = feature("rye", "u-1", 45.0, -93.0, t0() + Duration::seconds(2), 5.0);
    missing_uuid["properties"].as_object_mut().unwrap().remove("UUID");

    let body = payload(&[
        feature("rye", "u-1", 45.0, -93.0, t0(), 5.0),
        feature("rye", "u-1", 91.0, -93.0, t0() + Duration::seconds(1), 5.0),
        missing_uuid,
        feature("rye", "u-1", 45.0, -181.0, t0() + Duration::seconds(3), 5.0),
    ]);

    let stored = db.populate_features(&body).unwrap();
    assert_eq!(stored.len(), 1);
    for f in &stored {
        assert!((-90.0..=90.0).contains(&f.lat));
        assert!((-180.0..=180.0).contains(&f.lng));
        assert!(!f.name.is_empty() && !f.uuid.is_empty());
    }
}

#[test]
fn test_empty_and_unrecognized_payloads() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    assert!(matches!(db.populate(b"[]"), Err(StoreError::EmptyBatch)));
    assert!(matches!(db.populate(b"not json at all"), Err(StoreError::Format(_))));

    // Every feature invalid leaves nothing to store.
    let body = payload(&[feature("rye", "u-1", 95.0, -93.0, t0(), 5.0)]);
    assert!(matches!(db.populate(&body), Err(StoreError::EmptyBatch)));
}

#[test]
fn test_trackpoint_with_null_fields_is_stored() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let body = br#"[{"uuid":"u-1","name":"rye","lat":45.0,"long":-93.0,"accuracy":5,"heartrate":null,"time":"2023-11-14T10:00:00Z"}]"#;
    assert_eq!(db.populate(body).unwrap(), 1);
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempdir().unwrap();
    let lk = {
        let db = open_db(dir.path());
        db.populate(&tonga_payload()).unwrap();
        db.last_known().unwrap()
    };

    let db = open_db(dir.path());
    let reopened = db.last_known().unwrap();
    assert_eq!(reopened.len(), lk.len());
    assert_eq!(reopened[TONGA_NAME].time, lk[TONGA_NAME].time);
    assert_eq!(reopened[TONGA_NAME].uuid, TONGA_UUID);
    assert_eq!(db.store().len(Keyspace::Tracks).unwrap(), 10);
    assert_eq!(db.query_visits(&VisitFilter::default()).unwrap().matches, 10);

    // The dedup cache is memory only: a resubmission overwrites in place.
    assert_eq!(db.populate(&tonga_payload()).unwrap(), 10);
    assert_eq!(db.store().len(Keyspace::Tracks).unwrap(), 10);
}

#[test]
fn test_testing_prefix_and_purge() {
    let dir = tempdir().unwrap();
    {
        let db = open_db(dir.path());
        db.populate(&payload(&[feature("rye", "u-1", 45.0, -93.0, t0(), 5.0)])).unwrap();
    }

    let db = TrackDb::open(config(dir.path()).with_testing(true)).unwrap();
    db.populate(&tonga_payload()).unwrap();
    let prefixed = format!("{}{}", db.config().testing_prefix, TONGA_NAME);
    assert!(db.last_known().unwrap().contains_key(&prefixed));
    assert_eq!(db.store().len(Keyspace::Tracks).unwrap(), 11);

    let removed = db.delete_testing_data().unwrap();
    assert_eq!(removed, 10);
    assert_eq!(db.store().len(Keyspace::Tracks).unwrap(), 1);
    assert_eq!(db.store().len(Keyspace::Visits).unwrap(), 1);
    assert_eq!(db.store().len(Keyspace::VisitsByCoord).unwrap(), 1);

    let lk = db.last_known().unwrap();
    assert_eq!(lk.keys().collect::<Vec<_>>(), vec!["rye"]);
}

#[test]
fn test_purge_keeps_production_visit_of_same_point() {
    let dir = tempdir().unwrap();
    let body = payload(&[feature("rye", "u-1", 45.0, -93.0, t0(), 5.0)]);
    {
        let db = open_db(dir.path());
        assert_eq!(db.populate(&body).unwrap(), 1);
    }

    let db = TrackDb::open(config(dir.path()).with_testing(true)).unwrap();
    assert_eq!(db.populate(&body).unwrap(), 1);
    assert_eq!(db.store().len(Keyspace::Tracks).unwrap(), 2);
    assert_eq!(db.store().len(Keyspace::Visits).unwrap(), 2);
    assert_eq!(db.store().len(Keyspace::VisitsByCoord).unwrap(), 2);

    assert_eq!(db.delete_testing_data().unwrap(), 1);
    assert_eq!(db.store().len(Keyspace::Visits).unwrap(), 1);
    assert_eq!(db.store().len(Keyspace::VisitsByCoord).unwrap(), 1);

    let res = db
        .query_visits(&VisitFilter { names: vec!["rye".into()], ..Default::default() })
        .unwrap();
    assert_eq!(res.matches, 1);
    assert_eq!(res.visits[0].track_key, format!("rye+u-1+{}", t0().timestamp()));
}

#[test]
fn test_compaction_keeps_live_data() {
    let dir = tempdir().unwrap();
    {
        let db = open_db(dir.path());
        db.populate(&tonga_payload()).unwrap();
    }
    // A fresh dedup cache lets the same batch overwrite every record.
    let db = open_db(dir.path());
    db.populate(&tonga_payload()).unwrap();

    let stats = db.compact().unwrap();
    assert!(stats.bytes_after < stats.bytes_before);
    // 10 tracks, 10 + 10 visit keys, lastknown and metadata.
    assert_eq!(stats.live_entries, 32);

    assert_eq!(db.query_visits(&VisitFilter::default()).unwrap().matches, 10);
    drop(db);
    let db = open_db(dir.path());
    assert_eq!(db.last_known().unwrap()[TONGA_NAME].time, t0() + Duration::seconds(9));
}

#[test]
fn test_archives_mirror_stored_features() {
    let dir = tempdir().unwrap();
    let archive_dir = dir.path().join("archive");
    std::fs::create_dir_all(&archive_dir).unwrap();
    let master = archive_dir.join("master.json");
    let edge = archive_dir.join("edge.json");

    let db = TrackDb::open(config(dir.path()).with_archives(Some(master.clone()), Some(edge))).unwrap();
    db.populate(&tonga_payload()).unwrap();
    db.populate(&tonga_payload()).unwrap();
    db.flush_archives();

    let text = read_archive(&master);
    assert_eq!(text.lines().count(), 10);

    let fin: Vec<_> = std::fs::read_dir(&archive_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("edge.json-fin-"))
        .collect();
    // One file per batch, the second one empty.
    assert_eq!(fin.len(), 2);
    let lines: usize = fin
        .iter()
        .map(|n| read_archive(&archive_dir.join(n)).lines().count())
        .sum();
    assert_eq!(lines, 10);
}

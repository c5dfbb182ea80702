#![allow(dead_code)]

use std::path::Path;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use trackdb::{Config, TrackDb};

pub const TONGA_NAME: &str = "tonga-moto-63b2";
pub const TONGA_UUID: &str = "A4F1D8E2-3C55-4C8B-9E0B-5D0F2B7C63B2";

pub fn config(dir: &Path) -> Config {
    Config::new(dir).with_strict_durability(false)
}

pub fn open_db(dir: &Path) -> TrackDb {
    TrackDb::open(config(dir)).unwrap()
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 11, 14, 10, 0, 0).unwrap()
}

/// Ten canonical track points one second apart.
pub fn tonga_payload() -> Vec<u8> {
    let points: Vec<Value> = (0..10)
        .map(|i| {
            json!({
                "uuid": TONGA_UUID,
                "name": TONGA_NAME,
                "version": "V.customizableCatTrackHat",
                "lat": 33.4227288 + i as f64 * 0.0001,
                "long": -111.6902394,
                "accuracy": 7.4,
                "elevation": 421.3,
                "speed": 3.2,
                "heading": 87.0,
                "time": (t0() + Duration::seconds(i)).to_rfc3339(),
                "notes": "{\"activity\":\"Bike\",\"numberOfSteps\":12}"
            })
        })
        .collect();
    serde_json::to_vec(&points).unwrap()
}

pub fn feature(name: &str, uuid: &str, lat: f64, lng: f64, time: DateTime<Utc>, accuracy: f64) -> Value {
    json!({
        "type": "Feature",
        "geometry": { "type": "Point", "coordinates": [lng, lat] },
        "properties": {
            "Name": name,
            "UUID": uuid,
            "Time": time.to_rfc3339(),
            "Accuracy": accuracy
        }
    })
}

pub fn payload(features: &[Value]) -> Vec<u8> {
    serde_json::to_vec(features).unwrap()
}

/// Decompressed text of an archive file, every gzip member concatenated.
pub fn read_archive(path: &std::path::Path) -> String {
    use std::io::Read;
    let mut text = String::new();
    flate2::read::MultiGzDecoder::new(std::fs::File::open(path).unwrap())
        .read_to_string(&mut text)
        .unwrap();
    text
}

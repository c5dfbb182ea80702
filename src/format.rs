//! Payload decoding.
//!
//! Clients push tracks in several encodings. [`normalize`] tries, in order:
//!
//! 1. an array of canonical track point records
//! 2. an array of GeoJSON features
//! 3. a GeoJSON feature collection
//! 4. newline-delimited GeoJSON features, then newline-delimited track points
//!
//! The first decoding that succeeds wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::FormatError;
use crate::model::{
    format_time, FeatureCollection, RawFeature, PROP_ACCURACY, PROP_NAME, PROP_TIME, PROP_UUID,
    PROP_VISIT,
};

/// Unix seconds of Go's zero `time.Time`, which older clients send for "unset".
const ZERO_TIME_UNIX: i64 = -62_135_596_800;

/// Reads JSON `null` as the field's zero value.
fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(d).map(Option::unwrap_or_default)
}

/// Canonical track point record, as pushed by the tracking app.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct TrackPoint {
    #[serde(deserialize_with = "null_as_default")]
    pub uuid: String,
    #[serde(rename = "pushToken", deserialize_with = "null_as_default")]
    pub push_token: String,
    #[serde(deserialize_with = "null_as_default")]
    pub version: String,
    #[serde(deserialize_with = "null_as_default")]
    pub id: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub lat: f64,
    #[serde(rename = "long", deserialize_with = "null_as_default")]
    pub lng: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub accuracy: f64,
    #[serde(rename = "vAccuracy", deserialize_with = "null_as_default")]
    pub v_accuracy: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub elevation: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub speed: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub speed_accuracy: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub tilt: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub heading: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub heading_accuracy: f64,
    #[serde(rename = "heartrate", deserialize_with = "null_as_default")]
    pub heart_rate: f64,
    pub time: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "null_as_default")]
    pub floor: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub notes: String,
    #[serde(rename = "COVerified", deserialize_with = "null_as_default")]
    pub co_verified: bool,
    #[serde(rename = "remoteaddr", deserialize_with = "null_as_default")]
    pub remote_addr: String,
}

/// Structured notes the app serializes into `TrackPoint::notes`.
#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "camelCase")]
struct Notes {
    #[serde(deserialize_with = "null_as_default")]
    activity: String,
    activity_confidence: Option<f64>,
    #[serde(deserialize_with = "null_as_default")]
    pressure: f64,
    #[serde(deserialize_with = "null_as_default")]
    custom_note: String,
    #[serde(rename = "imgS3", deserialize_with = "null_as_default")]
    img_s3: String,
    visit: Option<Value>,
    #[serde(deserialize_with = "null_as_default")]
    number_of_steps: i64,
    #[serde(deserialize_with = "null_as_default")]
    average_active_pace: f64,
    #[serde(deserialize_with = "null_as_default")]
    current_pace: f64,
    #[serde(deserialize_with = "null_as_default")]
    current_cadence: f64,
    #[serde(deserialize_with = "null_as_default")]
    floors_ascended: i64,
    #[serde(deserialize_with = "null_as_default")]
    floors_descended: i64,
    current_trip_start: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "null_as_default")]
    distance: f64,
    #[serde(deserialize_with = "null_as_default")]
    battery_status: String,
    #[serde(deserialize_with = "null_as_default")]
    network_info: String,
    #[serde(deserialize_with = "null_as_default")]
    heart_rate_s: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct BatteryStatus {
    level: f64,
    status: String,
}

fn to_fixed(num: f64, precision: i32) -> f64 {
    let scale = 10f64.powi(precision);
    (num * scale).round() / scale
}

fn is_valid_visit(v: &Value) -> bool {
    let parsed = match v {
        Value::String(s) => serde_json::from_str::<Value>(s).ok(),
        other => Some(other.clone()),
    };
    parsed.is_some_and(|p| p.get("validVisit") == Some(&Value::Bool(true)))
}

impl TrackPoint {
    pub fn has_time(&self) -> bool {
        self.time.is_some_and(|t| t.timestamp() != ZERO_TIME_UNIX)
    }

    /// Converts the record to a GeoJSON feature with the app's property names.
    pub fn to_feature(&self) -> RawFeature {
        let mut props = Map::new();
        props.insert(PROP_UUID.into(), Value::from(self.uuid.clone()));
        props.insert(PROP_NAME.into(), Value::from(self.name.clone()));
        if let Some(t) = &self.time {
            props.insert(PROP_TIME.into(), Value::from(format_time(t)));
            props.insert("UnixTime".into(), Value::from(t.timestamp()));
        }
        props.insert("Version".into(), Value::from(self.version.clone()));
        props.insert("Speed".into(), Value::from(to_fixed(self.speed, 3)));
        props.insert("Elevation".into(), Value::from(to_fixed(self.elevation, 2)));
        props.insert("Heading".into(), Value::from(to_fixed(self.heading, 1)));
        props.insert(PROP_ACCURACY.into(), Value::from(to_fixed(self.accuracy, 2)));

        if self.v_accuracy > 0.0 {
            props.insert("vAccuracy".into(), Value::from(self.v_accuracy));
        }
        if self.speed_accuracy > 0.0 {
            props.insert("speed_accuracy".into(), Value::from(self.speed_accuracy));
        }
        if self.heading_accuracy > 0.0 {
            props.insert("heading_accuracy".into(), Value::from(self.heading_accuracy));
        }
        if self.heart_rate != 0.0 {
            props.insert("HeartRate".into(), Value::from(self.heart_rate));
        }

        if let Ok(notes) = serde_json::from_str::<Notes>(&self.notes) {
            self.apply_notes(notes, &mut props);
        }

        RawFeature::point(self.lng, self.lat, props)
    }

    fn apply_notes(&self, ns: Notes, props: &mut Map<String, Value>) {
        props.insert("Activity".into(), Value::from(ns.activity));
        if let Some(v) = ns.activity_confidence {
            props.insert("ActivityConfidence".into(), Value::from(v));
        }
        props.insert("Pressure".into(), Value::from(to_fixed(ns.pressure, 2)));
        if !ns.custom_note.is_empty() {
            props.insert("Notes".into(), Value::from(ns.custom_note.clone()));
            props.insert("CustomNote".into(), Value::from(ns.custom_note));
        }
        if !ns.img_s3.is_empty() {
            props.insert("imgS3".into(), Value::from(ns.img_s3));
        }
        if let Some(visit) = ns.visit.filter(is_valid_visit) {
            props.insert(PROP_VISIT.into(), visit);
        }
        if self.heart_rate == 0.0 {
            if let Ok(hr) = ns.heart_rate_s.trim().parse::<f64>() {
                if hr > 0.0 {
                    props.insert("HeartRate".into(), Value::from(to_fixed(hr, 2)));
                }
            }
        }
        if ns.number_of_steps > 0 {
            props.insert("NumberOfSteps".into(), Value::from(ns.number_of_steps));
        }
        if ns.average_active_pace > 0.0 {
            props.insert("AverageActivePace".into(), Value::from(to_fixed(ns.average_active_pace, 2)));
        }
        if ns.current_pace > 0.0 {
            props.insert("CurrentPace".into(), Value::from(to_fixed(ns.current_pace, 2)));
        }
        if ns.current_cadence > 0.0 {
            props.insert("CurrentCadence".into(), Value::from(to_fixed(ns.current_cadence, 2)));
        }
        if ns.floors_ascended > 0 {
            props.insert("FloorsAscended".into(), Value::from(ns.floors_ascended));
        }
        if ns.floors_descended > 0 {
            props.insert("FloorsDescended".into(), Value::from(ns.floors_descended));
        }
        if let Some(t) = ns.current_trip_start {
            props.insert("CurrentTripStart".into(), Value::from(format_time(&t)));
        }
        if ns.distance > 0.0 {
            props.insert("Distance".into(), Value::from(to_fixed(ns.distance, 2)));
        }
        if let Ok(bs) = serde_json::from_str::<BatteryStatus>(&ns.battery_status) {
            props.insert("BatteryStatus".into(), Value::from(bs.status));
            props.insert("BatteryLevel".into(), Value::from(to_fixed(bs.level, 2)));
        }
        if !ns.network_info.is_empty() {
            props.insert("NetworkInfo".into(), Value::from(ns.network_info));
        }
    }
}

/// Accepts a track point array only when it is non-empty and its first
/// record carries a time; other shapes decode "successfully" into defaults.
fn decode_track_points(data: &[u8]) -> Option<Vec<TrackPoint>> {
    let points: Vec<TrackPoint> = serde_json::from_slice(data).ok()?;
    match points.first() {
        Some(first) if first.has_time() => Some(points),
        _ => None,
    }
}

/// Wraps newline-delimited JSON values into one JSON array.
fn nd_to_json_array(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2);
    out.push(b'[');
    let mut first = true;
    for line in data.split(|b| *b == b'\n') {
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }
        if !first {
            out.push(b',');
        }
        out.extend_from_slice(line);
        first = false;
    }
    out.push(b']');
    out
}

/// Decodes any supported payload into raw features.
pub fn normalize(payload: &[u8]) -> Result<Vec<RawFeature>, FormatError> {
    if let Some(points) = decode_track_points(payload) {
        debug!(count = points.len(), "decoded trackpoints");
        return Ok(points.iter().map(TrackPoint::to_feature).collect());
    }
    if let Ok(features) = serde_json::from_slice::<Vec<RawFeature>>(payload) {
        debug!(count = features.len(), "decoded geojson features");
        return Ok(features);
    }
    if let Ok(collection) = serde_json::from_slice::<FeatureCollection>(payload) {
        debug!(count = collection.features.len(), "decoded geojson feature collection");
        return Ok(collection.features);
    }

    let wrapped = nd_to_json_array(payload);
    if let Ok(features) = serde_json::from_slice::<Vec<RawFeature>>(&wrapped) {
        debug!(count = features.len(), "decoded newline-delimited geojson");
        return Ok(features);
    }
    if let Some(points) = decode_track_points(&wrapped) {
        debug!(count = points.len(), "decoded newline-delimited trackpoints");
        return Ok(points.iter().map(TrackPoint::to_feature).collect());
    }

    Err(FormatError::Unrecognized)
}

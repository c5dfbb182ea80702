//! Structural checks applied before anything is persisted.
//!
//! Per-feature failures drop only that feature; a batch whose features belong
//! to more than one tracked entity is rejected as a whole.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{BatchError, ValidationError};
use crate::model::{RawFeature, TrackFeature, PROP_ACCURACY, PROP_NAME, PROP_TIME, PROP_UUID};

/// Validates one decoded feature, producing its typed form.
pub fn validate(raw: RawFeature) -> Result<TrackFeature, ValidationError> {
    TrackFeature::try_from(raw)
}

/// Checks that every feature shares the first feature's (name, uuid) pair.
pub fn validate_batch(features: &[TrackFeature]) -> Result<(), BatchError> {
    let Some(first) = features.first() else {
        return Ok(());
    };
    for (index, f) in features.iter().enumerate().skip(1) {
        if f.name != first.name || f.uuid != first.uuid {
            return Err(BatchError::MixedEntities {
                index,
                expected_name: first.name.clone(),
                expected_uuid: first.uuid.clone(),
                found_name: f.name.clone(),
                found_uuid: f.uuid.clone(),
            });
        }
    }
    Ok(())
}

impl TryFrom<RawFeature> for TrackFeature {
    type Error = ValidationError;

    fn try_from(raw: RawFeature) -> Result<Self, Self::Error> {
        let geometry = raw.geometry.ok_or(ValidationError::MissingGeometry)?;
        if geometry.kind != "Point" {
            return Err(ValidationError::NotAPoint(geometry.kind));
        }
        let (lng, lat) = point_coordinates(&geometry.coordinates)?;
        if !(-90.0..=90.0).contains(&lat) {
            return Err(ValidationError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(ValidationError::LongitudeOutOfRange(lng));
        }

        let mut properties = raw.properties.ok_or(ValidationError::MissingName)?;
        let name = take_string(&mut properties, PROP_NAME)
            .ok_or(ValidationError::MissingName)?
            .ok_or(ValidationError::NameNotString)?;
        let uuid = take_string(&mut properties, PROP_UUID)
            .ok_or(ValidationError::MissingUuid)?
            .ok_or(ValidationError::UuidNotString)?;
        let time = take_time(&mut properties)?;
        let accuracy = match properties.remove(PROP_ACCURACY) {
            None | Some(Value::Null) => return Err(ValidationError::MissingAccuracy),
            Some(v) => v.as_f64().ok_or(ValidationError::AccuracyNotNumber)?,
        };

        Ok(TrackFeature { lng, lat, name, uuid, time, accuracy, properties })
    }
}

fn point_coordinates(coordinates: &Value) -> Result<(f64, f64), ValidationError> {
    let arr = coordinates.as_array().ok_or(ValidationError::MalformedCoordinates)?;
    match (arr.first().and_then(Value::as_f64), arr.get(1).and_then(Value::as_f64)) {
        (Some(lng), Some(lat)) => Ok((lng, lat)),
        _ => Err(ValidationError::MalformedCoordinates),
    }
}

/// `None` when absent, `Some(None)` when present but not a string.
fn take_string(properties: &mut Map<String, Value>, key: &str) -> Option<Option<String>> {
    match properties.remove(key)? {
        Value::Null => None,
        Value::String(s) => Some(Some(s)),
        _ => Some(None),
    }
}

fn take_time(properties: &mut Map<String, Value>) -> Result<DateTime<Utc>, ValidationError> {
    match properties.remove(PROP_TIME) {
        None | Some(Value::Null) => Err(ValidationError::MissingTime),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| ValidationError::InvalidTime(s)),
        Some(other) => Err(ValidationError::InvalidTime(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Geometry;
    use serde_json::json;

    fn raw(props: Value) -> RawFeature {
        let properties = props.as_object().cloned().unwrap();
        RawFeature::point(-93.0, 45.0, properties)
    }

    fn good_props() -> Value {
        json!({
            "Name": "rye",
            "UUID": "9B4843BB-0EF7-4B54-832A-B6940304C531",
            "Time": "2023-12-22T15:42:05.018Z",
            "Accuracy": 5.0,
            "Speed": 1.2
        })
    }

    #[test]
    fn test_valid_feature() {
        let f = validate(raw(good_props())).unwrap();
        assert_eq!(f.name, "rye");
        assert_eq!(f.lat, 45.0);
        assert_eq!(f.lng, -93.0);
        assert_eq!(f.accuracy, 5.0);
        assert_eq!(f.unix_seconds(), 1703259725);
        // Required fields leave the side table.
        assert!(f.properties.get("Name").is_none());
        assert_eq!(f.properties.get("Speed"), Some(&json!(1.2)));
    }

    #[test]
    fn test_geometry_failures() {
        let mut r = raw(good_props());
        r.geometry = None;
        assert_eq!(validate(r).unwrap_err(), ValidationError::MissingGeometry);

        let mut r = raw(good_props());
        r.geometry = Some(Geometry { kind: "LineString".into(), coordinates: json!([[0, 0], [1, 1]]) });
        assert_eq!(validate(r).unwrap_err(), ValidationError::NotAPoint("LineString".into()));

        let mut r = raw(good_props());
        r.geometry = Some(Geometry { kind: "Point".into(), coordinates: json!(["a", 1]) });
        assert_eq!(validate(r).unwrap_err(), ValidationError::MalformedCoordinates);
    }

    #[test]
    fn test_coordinate_bounds() {
        let props = good_props().as_object().cloned().unwrap();
        let r = RawFeature::point(-93.0, 90.5, props.clone());
        assert_eq!(validate(r).unwrap_err(), ValidationError::LatitudeOutOfRange(90.5));

        let r = RawFeature::point(180.01, 0.0, props.clone());
        assert_eq!(validate(r).unwrap_err(), ValidationError::LongitudeOutOfRange(180.01));

        // Bounds are inclusive.
        assert!(validate(RawFeature::point(-180.0, -90.0, props)).is_ok());
    }

    #[test]
    fn test_required_property_failures() {
        let cases = [
            ("Name", Value::Null, ValidationError::MissingName),
            ("Name", json!(7), ValidationError::NameNotString),
            ("UUID", Value::Null, ValidationError::MissingUuid),
            ("UUID", json!(["x"]), ValidationError::UuidNotString),
            ("Time", Value::Null, ValidationError::MissingTime),
            ("Time", json!("yesterday"), ValidationError::InvalidTime("yesterday".into())),
            ("Accuracy", Value::Null, ValidationError::MissingAccuracy),
            ("Accuracy", json!("7.4"), ValidationError::AccuracyNotNumber),
        ];
        for (key, value, expected) in cases {
            let mut props = good_props();
            props[key] = value;
            assert_eq!(validate(raw(props)).unwrap_err(), expected, "property {key}");
        }

        let mut r = raw(good_props());
        r.properties = None;
        assert_eq!(validate(r).unwrap_err(), ValidationError::MissingName);
    }

    #[test]
    fn test_batch_of_one_entity() {
        let a = validate(raw(good_props())).unwrap();
        let mut b = a.clone();
        b.time += chrono::Duration::seconds(1);
        assert!(validate_batch(&[a.clone(), b]).is_ok());
        assert!(validate_batch(&[]).is_ok());
    }

    #[test]
    fn test_batch_with_two_uuids() {
        let a = validate(raw(good_props())).unwrap();
        let mut b = a.clone();
        b.uuid = "other".into();
        match validate_batch(&[a.clone(), a, b]).unwrap_err() {
            BatchError::MixedEntities { index, found_uuid, .. } => {
                assert_eq!(index, 2);
                assert_eq!(found_uuid, "other");
            }
        }
    }
}

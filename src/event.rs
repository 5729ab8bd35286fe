//! Decoded trace events.
//!
//! A [`DecodedEvent`] is built by the session backend for every raw record it
//! receives and handed to the dispatcher. Property decoding can fail
//! independently of the header, so the decoded properties are kept as a
//! `Result` and the dispatcher decides what to do with a failure.

use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use thiserror::Error;

use crate::guid::ProviderGuid;

/// The static part of an event, identical for every instance of an event
/// type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventDescriptor {
    #[serde(rename = "ID")]
    pub id: u16,
    pub version: u8,
    pub channel: u8,
    pub level: u8,
    pub op_code: u8,
    pub task: u16,
    pub keyword: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventHeader {
    #[serde(flatten)]
    pub descriptor: EventDescriptor,
    #[serde(rename = "ThreadID")]
    pub thread_id: u32,
    #[serde(rename = "ProcessID")]
    pub process_id: u32,
    pub time_stamp: DateTime<Utc>,
    #[serde(rename = "ProviderID", serialize_with = "serialize_guid")]
    pub provider_id: ProviderGuid,
    #[serde(rename = "ActivityID", serialize_with = "serialize_guid")]
    pub activity_id: ProviderGuid,
    pub flags: u16,
    pub kernel_time: u32,
    pub user_time: u32,
    pub processor_time: u64,
}

impl EventHeader {
    pub fn id(&self) -> u16 {
        self.descriptor.id
    }
}

/// 100ns intervals between 1601-01-01 and the Unix epoch.
const FILETIME_UNIX_EPOCH: i64 = 116_444_736_000_000_000;

/// Convert a Windows `FILETIME` tick count (100ns since 1601) to UTC.
/// Values that cannot be represented fall back to the Unix epoch.
pub fn timestamp_from_filetime(ticks: i64) -> DateTime<Utc> {
    let Some(since_unix) = ticks.checked_sub(FILETIME_UNIX_EPOCH) else {
        return DateTime::default();
    };
    let secs = since_unix.div_euclid(10_000_000);
    let nanos = (since_unix.rem_euclid(10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}

fn serialize_guid<S: Serializer>(guid: &ProviderGuid, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(guid)
}

/// A decoded property value. Scalars are kept in their formatted string
/// form, structs become nested maps and arrays become sequences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Scalar(String),
    Struct(Properties),
    Array(Vec<PropertyValue>),
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Scalar(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Scalar(s)
    }
}

/// Named properties in schema declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(Vec<(String, PropertyValue)>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }
}

impl From<Properties> for PropertyValue {
    fn from(p: Properties) -> Self {
        PropertyValue::Struct(p)
    }
}

impl<K: Into<String>, V: Into<PropertyValue>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Properties(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl Serialize for Properties {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no schema for event (status {0})")]
    MissingSchema(u32),
    #[error("failed to format property {name}: status {status}")]
    Format { name: String, status: u32 },
    #[error("property {name} refers to unknown length/count property {index}")]
    BadReference { name: String, index: u16 },
    #[error("event payload truncated at property {0}")]
    Truncated(String),
}

#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub header: EventHeader,
    pub properties: Result<Properties, DecodeError>,
}

impl DecodedEvent {
    pub fn id(&self) -> u16 {
        self.header.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn header(id: u16) -> EventHeader {
        EventHeader {
            descriptor: EventDescriptor {
                id,
                version: 1,
                level: 4,
                ..Default::default()
            },
            thread_id: 10,
            process_id: 20,
            time_stamp: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            provider_id: ProviderGuid::parse("{00000000-0000-0000-0000-000000000001}").unwrap(),
            activity_id: ProviderGuid::from_bytes([0; 16]),
            flags: 0,
            kernel_time: 0,
            user_time: 0,
            processor_time: 0,
        }
    }

    #[test]
    fn test_header_field_names() {
        let v = serde_json::to_value(header(42)).unwrap();
        assert_eq!(v["ID"], 42);
        assert_eq!(v["Version"], 1);
        assert_eq!(v["OpCode"], 0);
        assert_eq!(v["ThreadID"], 10);
        assert_eq!(v["ProcessID"], 20);
        assert_eq!(v["TimeStamp"], "2024-01-02T03:04:05Z");
        assert_eq!(v["ProviderID"], "{00000000-0000-0000-0000-000000000001}");
    }

    #[test]
    fn test_filetime_conversion() {
        assert_eq!(
            timestamp_from_filetime(FILETIME_UNIX_EPOCH),
            DateTime::<Utc>::default()
        );
        // 2024-01-02T03:04:05.5Z
        let ticks = FILETIME_UNIX_EPOCH + 1_704_164_645 * 10_000_000 + 5_000_000;
        assert_eq!(
            timestamp_from_filetime(ticks).to_rfc3339(),
            "2024-01-02T03:04:05.500+00:00"
        );
        assert_eq!(timestamp_from_filetime(0).to_rfc3339(), "1601-01-01T00:00:00+00:00");
        assert_eq!(timestamp_from_filetime(i64::MIN), DateTime::<Utc>::default());
    }

    #[test]
    fn test_properties_keep_declaration_order() {
        let mut inner = Properties::new();
        inner.push("Port", "443");
        let mut props = Properties::new();
        props.push("Zeta", "1");
        props.push("Alpha", inner);
        props.push(
            "List",
            PropertyValue::Array(vec!["a".into(), "b".into()]),
        );

        let text = serde_json::to_string(&props).unwrap();
        assert_eq!(
            text,
            r#"{"Zeta":"1","Alpha":{"Port":"443"},"List":["a","b"]}"#
        );
        assert_eq!(props.get("Zeta"), Some(&PropertyValue::from("1")));
        assert_eq!(props.len(), 3);
    }
}

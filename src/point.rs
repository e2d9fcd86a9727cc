use std::borrow::Cow;
use std::fmt;

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::sanitize::{Policy, Sanitizer};

/// A tag map with stable insertion order.
///
/// Inserting an existing key keeps its position while replacing the value,
/// which is what makes global tags override a point's own same-named tag in
/// place when batches are serialized.
pub type TagMap = IndexMap<String, String>;

/// A measured value, either integral or floating point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// An integral measurement, e.g. a counter reading.
    Integer(i64),
    /// A floating-point measurement, e.g. a gauge or a quantile.
    Float(f64),
}

impl Value {
    /// Appends the wire text of this value (a bare number literal).
    pub(crate) fn write_to(self, buf: &mut Vec<u8>) {
        match self {
            Value::Integer(v) => {
                let mut formatter = itoa::Buffer::new();
                buf.extend_from_slice(formatter.format(v).as_bytes());
            }
            Value::Float(v) => {
                let mut formatter = ryu::Buffer::new();
                buf.extend_from_slice(formatter.format(v).as_bytes());
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

/// One observation ready for transport: metric name, epoch timestamp, value,
/// and tags.
///
/// Points are immutable once constructed; a collector builds a fresh batch
/// every reporting cycle and discards it after the send. The epoch is carried
/// verbatim onto every wire form, so its unit is whatever the consuming
/// backend expects (seconds for the UDP collector daemon).
///
/// The `Display` form is the debug text
/// `<metric> <epoch> <value>[ <key>=<value>]*` with no sanitization and no
/// global tags applied.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    metric: String,
    timestamp: u64,
    value: Value,
    tags: TagMap,
}

impl DataPoint {
    /// Creates a data point. `tags` may be empty.
    pub fn new(
        metric: impl Into<String>,
        timestamp: u64,
        value: impl Into<Value>,
        tags: TagMap,
    ) -> Self {
        DataPoint { metric: metric.into(), timestamp, value: value.into(), tags }
    }

    /// Returns the metric name.
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Returns the epoch timestamp.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Returns the measured value.
    pub fn value(&self) -> Value {
        self.value
    }

    /// Returns the point's own tags, in insertion order.
    pub fn tags(&self) -> &TagMap {
        &self.tags
    }

    /// Appends the line-protocol form to `buf`, newline-terminated:
    /// `<metric> <epoch> <value>[ <key>=<value>]*\n`.
    ///
    /// The metric name and tag keys pass through `sanitizer`; tag values are
    /// written as-is. `global_tags` are merged on top of the point's own tags
    /// and win on key collision.
    pub fn write_line(&self, buf: &mut Vec<u8>, global_tags: Option<&TagMap>, sanitizer: &Sanitizer) {
        self.write_text(buf, global_tags, sanitizer);
        buf.push(b'\n');
    }

    fn write_text(&self, buf: &mut Vec<u8>, global_tags: Option<&TagMap>, sanitizer: &Sanitizer) {
        buf.extend_from_slice(sanitizer.sanitize(&self.metric).as_bytes());
        buf.push(b' ');

        let mut formatter = itoa::Buffer::new();
        buf.extend_from_slice(formatter.format(self.timestamp).as_bytes());
        buf.push(b' ');

        self.value.write_to(buf);

        for (key, value) in self.merged_tags(global_tags).iter() {
            buf.push(b' ');
            buf.extend_from_slice(sanitizer.sanitize(key).as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(value.as_bytes());
        }
    }

    /// The point's tags with `global_tags` merged on top. The merge starts
    /// from the point's tags, so a global tag lands at the position of the
    /// point tag it replaces.
    fn merged_tags(&self, global_tags: Option<&TagMap>) -> Cow<'_, TagMap> {
        match global_tags {
            None => Cow::Borrowed(&self.tags),
            Some(global) if global.is_empty() => Cow::Borrowed(&self.tags),
            Some(global) => {
                let mut merged = self.tags.clone();
                for (key, value) in global {
                    merged.insert(key.clone(), value.clone());
                }
                Cow::Owned(merged)
            }
        }
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = Vec::with_capacity(64);
        self.write_text(&mut buf, None, &Sanitizer::new(Policy::Noop));
        f.write_str(&String::from_utf8_lossy(&buf))
    }
}

/// Serializes one point as its wire JSON object:
/// `{"metric":...,"timestamp":...,"value":...,"tags":{...}}`.
///
/// The metric name and tag keys pass through the sanitizer; tag values are
/// JSON-escaped only.
pub(crate) struct JsonPoint<'a> {
    pub(crate) point: &'a DataPoint,
    pub(crate) global_tags: Option<&'a TagMap>,
    pub(crate) sanitizer: &'a Sanitizer,
}

impl Serialize for JsonPoint<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("metric", &self.sanitizer.sanitize(self.point.metric()))?;
        map.serialize_entry("timestamp", &self.point.timestamp())?;
        match self.point.value() {
            Value::Integer(v) => map.serialize_entry("value", &v)?,
            Value::Float(v) => map.serialize_entry("value", &v)?,
        }
        map.serialize_entry(
            "tags",
            &JsonTags {
                point: self.point,
                global_tags: self.global_tags,
                sanitizer: self.sanitizer,
            },
        )?;
        map.end()
    }
}

struct JsonTags<'a> {
    point: &'a DataPoint,
    global_tags: Option<&'a TagMap>,
    sanitizer: &'a Sanitizer,
}

impl Serialize for JsonTags<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let merged = self.point.merged_tags(self.global_tags);
        let mut map = serializer.serialize_map(Some(merged.len()))?;
        for (key, value) in merged.iter() {
            map.serialize_entry(&self.sanitizer.sanitize(key), value)?;
        }
        map.end()
    }
}

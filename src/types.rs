use crate::index::TimeSeriesIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Timestamp type (milliseconds since epoch).
pub type Timestamp = i64;

/// Tag set type. A BTreeMap keeps JSON output deterministic.
pub type TagSet = BTreeMap<String, String>;

/// Element type of a time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeSeriesDataType {
    #[serde(rename = "DOUBLE")]
    Double,
    #[serde(rename = "STRING")]
    String,
}

/// One (position, absolute time, value) triple produced while streaming a
/// numeric chunk or series. For a compressed run, a single point is emitted
/// at the run's first position; the run extends until the next point.
#[derive(Debug, Clone, PartialEq)]
pub struct DoublePoint {
    pub position: usize,
    pub time: Timestamp,
    pub value: f64,
}

/// Streaming point of a text series. `None` is the missing-value sentinel.
#[derive(Debug, Clone, PartialEq)]
pub struct StringPoint {
    pub position: usize,
    pub time: Timestamp,
    pub value: Option<String>,
}

/// Metadata shared by stored and calculated series: name, element type,
/// free-form tags and the time index the positions refer to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesMetadata {
    pub name: String,
    pub data_type: TimeSeriesDataType,
    #[serde(default, skip_serializing_if = "TagSet::is_empty")]
    pub tags: TagSet,
    #[serde(flatten)]
    pub index: TimeSeriesIndex,
}

impl TimeSeriesMetadata {
    pub fn new(name: impl Into<String>, data_type: TimeSeriesDataType, index: TimeSeriesIndex) -> Self {
        Self {
            name: name.into(),
            data_type,
            tags: TagSet::new(),
            index,
        }
    }

    pub fn with_tags(mut self, tags: TagSet) -> Self {
        self.tags = tags;
        self
    }
}

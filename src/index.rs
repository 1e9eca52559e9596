//! Time indices: the pure mapping from an integer position in
//! `[0, point_count)` to an absolute instant.

use crate::error::TimeSeriesError;
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};

/// Type tag of the regular index in the JSON wire format.
pub const REGULAR_INDEX_TAG: &str = "regularIndex";
/// Type tag of the irregular index in the JSON wire format.
pub const IRREGULAR_INDEX_TAG: &str = "irregularIndex";
/// Type tag of the infinite index in the JSON wire format.
pub const INFINITE_INDEX_TAG: &str = "infiniteIndex";

/// First instant of the infinite index (minimum representable time).
pub const INFINITE_START_TIME: Timestamp = Timestamp::MIN;
/// Last instant of the infinite index (maximum representable time).
pub const INFINITE_END_TIME: Timestamp = Timestamp::MAX;

/// A time index. Pure lookup structure, no mutation after construction.
///
/// Three variants:
/// - regular: fixed-step grid defined by start, end and spacing;
/// - irregular: explicit, strictly increasing instant list;
/// - infinite: two-point sentinel spanning the representable time range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeSeriesIndex {
    #[serde(rename = "regularIndex", rename_all = "camelCase")]
    Regular {
        start_time: Timestamp,
        end_time: Timestamp,
        spacing: i64,
    },
    #[serde(rename = "irregularIndex")]
    Irregular(Vec<Timestamp>),
    // a struct variant, not a unit one, so it keeps flattening into
    // metadata objects as "infiniteIndex":{}
    #[serde(rename = "infiniteIndex")]
    Infinite {},
}

/// The process-wide infinite index constant.
pub const INFINITE_INDEX: TimeSeriesIndex = TimeSeriesIndex::Infinite {};

impl TimeSeriesIndex {
    /// Builds a regular index. Times are epoch milliseconds, spacing is in
    /// milliseconds and must evenly divide the `[start, end]` range.
    pub fn regular(
        start_time: Timestamp,
        end_time: Timestamp,
        spacing: i64,
    ) -> Result<Self, TimeSeriesError> {
        if end_time <= start_time {
            return Err(TimeSeriesError::InvalidArgument(format!(
                "End time {end_time} is expected to be after start time {start_time}"
            )));
        }
        if spacing <= 0 {
            return Err(TimeSeriesError::InvalidArgument(format!(
                "Spacing {spacing} is expected to be positive"
            )));
        }
        if (end_time - start_time) % spacing != 0 {
            return Err(TimeSeriesError::InvalidArgument(format!(
                "Spacing {spacing} does not evenly divide the range [{start_time}, {end_time}]"
            )));
        }
        Ok(TimeSeriesIndex::Regular {
            start_time,
            end_time,
            spacing,
        })
    }

    /// Builds an irregular index from a non-empty, strictly increasing
    /// instant list.
    pub fn irregular(instants: Vec<Timestamp>) -> Result<Self, TimeSeriesError> {
        if instants.is_empty() {
            return Err(TimeSeriesError::InvalidArgument(
                "Empty instant list".to_string(),
            ));
        }
        if instants.windows(2).any(|w| w[1] <= w[0]) {
            return Err(TimeSeriesError::InvalidArgument(
                "Instants are expected to be strictly increasing".to_string(),
            ));
        }
        Ok(TimeSeriesIndex::Irregular(instants))
    }

    /// Re-checks the construction invariants, for indices obtained from the
    /// wire rather than from the checked constructors.
    pub fn validate(&self) -> Result<(), TimeSeriesError> {
        match self {
            TimeSeriesIndex::Regular {
                start_time,
                end_time,
                spacing,
            } => Self::regular(*start_time, *end_time, *spacing).map(|_| ()),
            TimeSeriesIndex::Irregular(instants) => {
                Self::irregular(instants.clone()).map(|_| ())
            }
            TimeSeriesIndex::Infinite {} => Ok(()),
        }
    }

    pub fn point_count(&self) -> usize {
        match self {
            TimeSeriesIndex::Regular {
                start_time,
                end_time,
                spacing,
            } => ((end_time - start_time) / spacing) as usize + 1,
            TimeSeriesIndex::Irregular(instants) => instants.len(),
            TimeSeriesIndex::Infinite {} => 2,
        }
    }

    /// Absolute instant of `position`. `position` must be `< point_count()`;
    /// this is a caller responsibility.
    pub fn time_at(&self, position: usize) -> Timestamp {
        debug_assert!(position < self.point_count());
        match self {
            TimeSeriesIndex::Regular {
                start_time, spacing, ..
            } => start_time + position as i64 * spacing,
            TimeSeriesIndex::Irregular(instants) => instants[position],
            TimeSeriesIndex::Infinite {} => {
                if position == 0 {
                    INFINITE_START_TIME
                } else {
                    INFINITE_END_TIME
                }
            }
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, TimeSeriesIndex::Infinite {})
    }

    /// Type tag used for polymorphic wire (de)serialization.
    pub fn type_tag(&self) -> &'static str {
        match self {
            TimeSeriesIndex::Regular { .. } => REGULAR_INDEX_TAG,
            TimeSeriesIndex::Irregular(_) => IRREGULAR_INDEX_TAG,
            TimeSeriesIndex::Infinite {} => INFINITE_INDEX_TAG,
        }
    }

    /// Finite, restartable iteration over all instants.
    pub fn iter(&self) -> impl Iterator<Item = Timestamp> + '_ {
        (0..self.point_count()).map(move |p| self.time_at(p))
    }
}

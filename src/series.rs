//! Stored and calculated time series, plus the JSON list format both travel
//! in.
//!
//! A stored series pairs metadata with a sparse, ordered set of chunks; gaps
//! read back as the missing-value sentinel. A calculated series is an
//! expression tree that materializes on demand through a name resolver.

use crate::ast::{self, EvaluationContext, NodeCalc, NodeRef};
use crate::buffer::{BigDoubleBuffer, BigStringBuffer};
use crate::chunk::{DoubleDataChunk, StringDataChunk};
use crate::error::TimeSeriesError;
use crate::index::TimeSeriesIndex;
use crate::json;
use crate::types::{DoublePoint, StringPoint, TimeSeriesDataType, TimeSeriesMetadata, Timestamp};
use chrono::DateTime;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Looks stored series up by name on behalf of calculated series.
pub trait TimeSeriesNameResolver: Send + Sync {
    /// Metadata of the named series, in the same order as `names`.
    fn metadata(&self, names: &[String]) -> Result<Vec<TimeSeriesMetadata>, TimeSeriesError>;

    /// Version numbers for which the named series has data.
    fn data_versions(&self, name: &str) -> Result<BTreeSet<i32>, TimeSeriesError>;

    /// Numeric series bodies, in the same order as `names`.
    fn double_time_series(
        &self,
        names: &[String],
    ) -> Result<Vec<StoredDoubleTimeSeries>, TimeSeriesError>;
}

fn check_chunks_ordered<C, F>(
    chunks: &[C],
    point_count: usize,
    name: &str,
    bounds: F,
) -> Result<(), TimeSeriesError>
where
    F: Fn(&C) -> (usize, usize),
{
    let mut previous_end = 0usize;
    for (i, chunk) in chunks.iter().enumerate() {
        let (offset, length) = bounds(chunk);
        if i > 0 && offset < previous_end {
            return Err(TimeSeriesError::InvalidArgument(format!(
                "Chunks of time series '{name}' overlap at offset {offset}"
            )));
        }
        if offset + length > point_count {
            return Err(TimeSeriesError::InvalidArgument(format!(
                "Chunk [{offset}, {}) of time series '{name}' exceeds index point count {point_count}",
                offset + length
            )));
        }
        previous_end = offset + length;
    }
    Ok(())
}

fn split_bounds(point_count: usize, parts: usize) -> Result<Vec<usize>, TimeSeriesError> {
    if parts == 0 || parts > point_count {
        return Err(TimeSeriesError::InvalidArgument(format!(
            "Cannot split {point_count} points into {parts} windows"
        )));
    }
    Ok((0..=parts).map(|w| w * point_count / parts).collect())
}

// ---------------------------------------------------------------------------
// stored series
// ---------------------------------------------------------------------------

/// A numeric series held as chunks. Chunks are kept sorted by offset,
/// never overlap and never exceed the index point count.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDoubleTimeSeries {
    metadata: TimeSeriesMetadata,
    chunks: Vec<DoubleDataChunk>,
}

impl StoredDoubleTimeSeries {
    pub fn new(
        metadata: TimeSeriesMetadata,
        mut chunks: Vec<DoubleDataChunk>,
    ) -> Result<Self, TimeSeriesError> {
        if metadata.data_type != TimeSeriesDataType::Double {
            return Err(TimeSeriesError::InvalidArgument(format!(
                "Time series '{}' does not hold numeric data",
                metadata.name
            )));
        }
        chunks.sort_by_key(DoubleDataChunk::offset);
        check_chunks_ordered(&chunks, metadata.index.point_count(), &metadata.name, |c| {
            (c.offset(), c.length())
        })?;
        Ok(StoredDoubleTimeSeries { metadata, chunks })
    }

    /// Dense single-chunk series covering the whole index.
    pub fn from_values(
        name: impl Into<String>,
        index: TimeSeriesIndex,
        values: Vec<f64>,
    ) -> Result<Self, TimeSeriesError> {
        let name = name.into();
        if values.len() != index.point_count() {
            return Err(TimeSeriesError::InvalidArgument(format!(
                "Time series '{name}' holds {} values for {} index points",
                values.len(),
                index.point_count()
            )));
        }
        let chunk = DoubleDataChunk::uncompressed(0, values)?;
        Self::new(
            TimeSeriesMetadata::new(name, TimeSeriesDataType::Double, index),
            vec![chunk],
        )
    }

    pub fn metadata(&self) -> &TimeSeriesMetadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn chunks(&self) -> &[DoubleDataChunk] {
        &self.chunks
    }

    /// Dense materialization over the whole index; uncovered positions are
    /// NaN.
    pub fn to_array(&self) -> Vec<f64> {
        let mut array = vec![f64::NAN; self.metadata.index.point_count()];
        for chunk in &self.chunks {
            chunk.fill_array(&mut array);
        }
        array
    }

    pub fn fill_buffer(&self, buffer: &mut BigDoubleBuffer, base_offset: usize) {
        for chunk in &self.chunks {
            chunk.fill_buffer(buffer, base_offset);
        }
    }

    /// Streams the series as points: chunk points in position order, plus
    /// one NaN sentinel at the first position of every maximal uncovered
    /// gap (leading, internal and trailing).
    pub fn points(&self) -> impl Iterator<Item = DoublePoint> {
        let index = &self.metadata.index;
        let mut points = Vec::new();
        let mut next_position = 0usize;
        for chunk in &self.chunks {
            if chunk.offset() > next_position {
                points.push(DoublePoint {
                    position: next_position,
                    time: index.time_at(next_position),
                    value: f64::NAN,
                });
            }
            points.extend(chunk.points(index));
            next_position = chunk.offset() + chunk.length();
        }
        if next_position < index.point_count() {
            points.push(DoublePoint {
                position: next_position,
                time: index.time_at(next_position),
                value: f64::NAN,
            });
        }
        points.into_iter()
    }

    /// Splits the series into `parts` window series over the same index.
    /// Window `w` covers positions `[w*n/parts, (w+1)*n/parts)`; chunks are
    /// cut at window boundaries and keep their global offsets, so each
    /// window reads back as the original values inside its range and NaN
    /// outside it.
    pub fn split(&self, parts: usize) -> Result<Vec<StoredDoubleTimeSeries>, TimeSeriesError> {
        let bounds = split_bounds(self.metadata.index.point_count(), parts)?;
        let mut windows: Vec<Vec<DoubleDataChunk>> = vec![Vec::new(); parts];
        for chunk in &self.chunks {
            let mut rest = chunk.clone();
            loop {
                let window = bounds.partition_point(|&b| b <= rest.offset()) - 1;
                let window_end = bounds[window + 1];
                if rest.offset() + rest.length() <= window_end {
                    windows[window].push(rest);
                    break;
                }
                let (left, right) = rest.split_at(window_end)?;
                windows[window].push(left);
                rest = right;
            }
        }
        windows
            .into_iter()
            .map(|chunks| StoredDoubleTimeSeries::new(self.metadata.clone(), chunks))
            .collect()
    }

    pub fn write_json(&self, out: &mut String) {
        out.push_str("{\"metadata\":");
        out.push_str(&serde_json::to_string(&self.metadata).expect("metadata serializes to JSON"));
        out.push_str(",\"chunks\":[");
        for (i, chunk) in self.chunks.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            chunk.write_json(out);
        }
        out.push_str("]}");
    }

    pub(crate) fn from_json_value(value: &serde_json::Value) -> Result<Self, TimeSeriesError> {
        let object = value
            .as_object()
            .ok_or_else(|| TimeSeriesError::Json("Series JSON is not an object".to_string()))?;
        let metadata: TimeSeriesMetadata =
            serde_json::from_value(json::required(object, "metadata", "series")?.clone())?;
        metadata.index.validate()?;
        let chunks = json::required(object, "chunks", "series")?
            .as_array()
            .ok_or_else(|| TimeSeriesError::Json("'chunks' is not an array".to_string()))?
            .iter()
            .map(DoubleDataChunk::from_json_value)
            .collect::<Result<Vec<_>, _>>()?;
        StoredDoubleTimeSeries::new(metadata, chunks)
    }
}

/// A text series held as chunks, mirroring [`StoredDoubleTimeSeries`] with
/// `None` as the missing-value sentinel.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredStringTimeSeries {
    metadata: TimeSeriesMetadata,
    chunks: Vec<StringDataChunk>,
}

impl StoredStringTimeSeries {
    pub fn new(
        metadata: TimeSeriesMetadata,
        mut chunks: Vec<StringDataChunk>,
    ) -> Result<Self, TimeSeriesError> {
        if metadata.data_type != TimeSeriesDataType::String {
            return Err(TimeSeriesError::InvalidArgument(format!(
                "Time series '{}' does not hold text data",
                metadata.name
            )));
        }
        chunks.sort_by_key(StringDataChunk::offset);
        check_chunks_ordered(&chunks, metadata.index.point_count(), &metadata.name, |c| {
            (c.offset(), c.length())
        })?;
        Ok(StoredStringTimeSeries { metadata, chunks })
    }

    pub fn from_values(
        name: impl Into<String>,
        index: TimeSeriesIndex,
        values: Vec<Option<String>>,
    ) -> Result<Self, TimeSeriesError> {
        let name = name.into();
        if values.len() != index.point_count() {
            return Err(TimeSeriesError::InvalidArgument(format!(
                "Time series '{name}' holds {} values for {} index points",
                values.len(),
                index.point_count()
            )));
        }
        let chunk = StringDataChunk::uncompressed(0, values)?;
        Self::new(
            TimeSeriesMetadata::new(name, TimeSeriesDataType::String, index),
            vec![chunk],
        )
    }

    pub fn metadata(&self) -> &TimeSeriesMetadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn chunks(&self) -> &[StringDataChunk] {
        &self.chunks
    }

    pub fn to_array(&self) -> Vec<Option<String>> {
        let mut array = vec![None; self.metadata.index.point_count()];
        for chunk in &self.chunks {
            chunk.fill_array(&mut array);
        }
        array
    }

    pub fn fill_buffer(&self, buffer: &mut BigStringBuffer, base_offset: usize) {
        for chunk in &self.chunks {
            chunk.fill_buffer(buffer, base_offset);
        }
    }

    pub fn points(&self) -> impl Iterator<Item = StringPoint> {
        let index = &self.metadata.index;
        let mut points = Vec::new();
        let mut next_position = 0usize;
        for chunk in &self.chunks {
            if chunk.offset() > next_position {
                points.push(StringPoint {
                    position: next_position,
                    time: index.time_at(next_position),
                    value: None,
                });
            }
            points.extend(chunk.points(index));
            next_position = chunk.offset() + chunk.length();
        }
        if next_position < index.point_count() {
            points.push(StringPoint {
                position: next_position,
                time: index.time_at(next_position),
                value: None,
            });
        }
        points.into_iter()
    }

    pub fn split(&self, parts: usize) -> Result<Vec<StoredStringTimeSeries>, TimeSeriesError> {
        let bounds = split_bounds(self.metadata.index.point_count(), parts)?;
        let mut windows: Vec<Vec<StringDataChunk>> = vec![Vec::new(); parts];
        for chunk in &self.chunks {
            let mut rest = chunk.clone();
            loop {
                let window = bounds.partition_point(|&b| b <= rest.offset()) - 1;
                let window_end = bounds[window + 1];
                if rest.offset() + rest.length() <= window_end {
                    windows[window].push(rest);
                    break;
                }
                let (left, right) = rest.split_at(window_end)?;
                windows[window].push(left);
                rest = right;
            }
        }
        windows
            .into_iter()
            .map(|chunks| StoredStringTimeSeries::new(self.metadata.clone(), chunks))
            .collect()
    }

    pub fn write_json(&self, out: &mut String) {
        out.push_str("{\"metadata\":");
        out.push_str(&serde_json::to_string(&self.metadata).expect("metadata serializes to JSON"));
        out.push_str(",\"chunks\":[");
        for (i, chunk) in self.chunks.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            chunk.write_json(out);
        }
        out.push_str("]}");
    }

    pub(crate) fn from_json_value(value: &serde_json::Value) -> Result<Self, TimeSeriesError> {
        let object = value
            .as_object()
            .ok_or_else(|| TimeSeriesError::Json("Series JSON is not an object".to_string()))?;
        let metadata: TimeSeriesMetadata =
            serde_json::from_value(json::required(object, "metadata", "series")?.clone())?;
        metadata.index.validate()?;
        let chunks = json::required(object, "chunks", "series")?
            .as_array()
            .ok_or_else(|| TimeSeriesError::Json("'chunks' is not an array".to_string()))?
            .iter()
            .map(StringDataChunk::from_json_value)
            .collect::<Result<Vec<_>, _>>()?;
        StoredStringTimeSeries::new(metadata, chunks)
    }
}

// ---------------------------------------------------------------------------
// calculated series
// ---------------------------------------------------------------------------

/// An expression-defined numeric series. It has no data of its own; its
/// index is bound once by [`CalculatedTimeSeries::synchronize`] or inherited
/// from the stored series it references.
pub struct CalculatedTimeSeries {
    name: String,
    node: NodeRef,
    index: Option<TimeSeriesIndex>,
    resolver: Option<Arc<dyn TimeSeriesNameResolver>>,
}

impl std::fmt::Debug for CalculatedTimeSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculatedTimeSeries")
            .field("name", &self.name)
            .field("expr", &ast::print(&self.node))
            .field("index", &self.index)
            .finish()
    }
}

impl Clone for CalculatedTimeSeries {
    fn clone(&self) -> Self {
        CalculatedTimeSeries {
            name: self.name.clone(),
            node: Arc::clone(&self.node),
            index: self.index.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

struct ColumnContext<'a> {
    columns: &'a [Vec<f64>],
    names: &'a HashMap<String, i32>,
    position: usize,
    time: Timestamp,
}

impl EvaluationContext for ColumnContext<'_> {
    fn series_value(&self, num: i32) -> Result<f64, TimeSeriesError> {
        usize::try_from(num)
            .ok()
            .and_then(|n| self.columns.get(n))
            .map(|column| column[self.position])
            .ok_or_else(|| TimeSeriesError::SeriesNotFound(format!("timeSeries[{num}]")))
    }

    fn series_value_by_name(&self, name: &str) -> Result<f64, TimeSeriesError> {
        let num = *self
            .names
            .get(name)
            .ok_or_else(|| TimeSeriesError::SeriesNotFound(name.to_string()))?;
        self.series_value(num)
    }

    fn current_time(&self) -> Timestamp {
        self.time
    }
}

impl CalculatedTimeSeries {
    pub fn new(name: impl Into<String>, node: NodeRef) -> Self {
        CalculatedTimeSeries {
            name: name.into(),
            node,
            index: None,
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn TimeSeriesNameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn set_resolver(&mut self, resolver: Arc<dyn TimeSeriesNameResolver>) {
        self.resolver = Some(resolver);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    /// Names of the stored series the expression references, sorted.
    pub fn dependency_names(&self) -> BTreeSet<String> {
        ast::referenced_names(&self.node)
    }

    /// Binds the series to a finite index. Rebinding to the same index is a
    /// no-op; rebinding to a different one is an error, the operation is
    /// one-way.
    pub fn synchronize(&mut self, index: TimeSeriesIndex) -> Result<(), TimeSeriesError> {
        if index.is_infinite() {
            return Err(TimeSeriesError::InvalidArgument(format!(
                "Cannot synchronize time series '{}' on an infinite index",
                self.name
            )));
        }
        match &self.index {
            None => {
                self.index = Some(index);
                Ok(())
            }
            Some(current) if *current == index => Ok(()),
            Some(_) => Err(TimeSeriesError::InvalidArgument(format!(
                "Time series '{}' is already synchronized on another index",
                self.name
            ))),
        }
    }

    /// The effective index: the synchronized one, else the common index of
    /// all referenced stored series, else the infinite placeholder for a
    /// constant expression.
    pub fn index(&self) -> Result<TimeSeriesIndex, TimeSeriesError> {
        if let Some(index) = &self.index {
            return Ok(index.clone());
        }
        let names: Vec<String> = self.dependency_names().into_iter().collect();
        if names.is_empty() {
            return Ok(crate::index::INFINITE_INDEX);
        }
        let resolver = self.resolver()?;
        let metadata = resolver.metadata(&names)?;
        let mut common: Option<TimeSeriesIndex> = None;
        for m in metadata {
            match &common {
                None => common = Some(m.index),
                Some(index) if *index == m.index => {}
                Some(_) => {
                    return Err(TimeSeriesError::InvalidArgument(format!(
                        "Time series '{}' references series with different indices",
                        self.name
                    )))
                }
            }
        }
        common.ok_or_else(|| {
            TimeSeriesError::SeriesNotFound(names.first().cloned().unwrap_or_default())
        })
    }

    pub fn metadata(&self) -> Result<TimeSeriesMetadata, TimeSeriesError> {
        Ok(TimeSeriesMetadata::new(
            self.name.clone(),
            TimeSeriesDataType::Double,
            self.index()?,
        ))
    }

    fn resolver(&self) -> Result<&Arc<dyn TimeSeriesNameResolver>, TimeSeriesError> {
        self.resolver.as_ref().ok_or_else(|| {
            TimeSeriesError::InvalidArgument(format!(
                "Time series '{}' has no resolver to look dependencies up",
                self.name
            ))
        })
    }

    /// Versions for which every referenced series has data. A constant
    /// expression has none.
    pub fn versions(&self) -> Result<BTreeSet<i32>, TimeSeriesError> {
        let names = self.dependency_names();
        let mut versions: Option<BTreeSet<i32>> = None;
        if names.is_empty() {
            return Ok(BTreeSet::new());
        }
        let resolver = self.resolver()?;
        for name in &names {
            let found = resolver.data_versions(name)?;
            versions = Some(match versions {
                None => found,
                Some(current) => current.intersection(&found).copied().collect(),
            });
        }
        Ok(versions.unwrap_or_default())
    }

    /// Evaluates the expression at every index position. All referenced
    /// series must share the effective index.
    pub fn to_array(&self) -> Result<Vec<f64>, TimeSeriesError> {
        let index = self.index()?;
        if index.is_infinite() {
            return Err(TimeSeriesError::NotSynchronized(self.name.clone()));
        }
        let point_count = index.point_count();
        let names: Vec<String> = self.dependency_names().into_iter().collect();
        let columns = if names.is_empty() {
            Vec::new()
        } else {
            let dependencies = self.resolver()?.double_time_series(&names)?;
            let mut columns = Vec::with_capacity(dependencies.len());
            for series in &dependencies {
                if series.metadata().index.point_count() != point_count {
                    return Err(TimeSeriesError::InvalidArgument(format!(
                        "Time series '{}' has {} points, {} expected",
                        series.name(),
                        series.metadata().index.point_count(),
                        point_count
                    )));
                }
                columns.push(series.to_array());
            }
            columns
        };
        let numbers: HashMap<String, i32> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as i32))
            .collect();
        let node = ast::resolve_references(&self.node, &numbers)?;
        let mut values = Vec::with_capacity(point_count);
        for position in 0..point_count {
            let ctx = ColumnContext {
                columns: &columns,
                names: &numbers,
                position,
                time: index.time_at(position),
            };
            values.push(ast::evaluate(&node, &ctx)?);
        }
        Ok(values)
    }

    /// Materializes the expression into `buffer` at `base_offset`.
    pub fn fill_buffer(
        &self,
        buffer: &mut BigDoubleBuffer,
        base_offset: usize,
    ) -> Result<(), TimeSeriesError> {
        for (position, value) in self.to_array()?.into_iter().enumerate() {
            buffer.put(base_offset + position, value);
        }
        Ok(())
    }

    /// Splits the materialized series into `parts` window series; a
    /// calculated series splits by evaluating first.
    pub fn split(&self, parts: usize) -> Result<Vec<StoredDoubleTimeSeries>, TimeSeriesError> {
        let index = self.index()?;
        if index.is_infinite() {
            return Err(TimeSeriesError::NotSynchronized(self.name.clone()));
        }
        StoredDoubleTimeSeries::from_values(self.name.clone(), index, self.to_array()?)?
            .split(parts)
    }

    pub fn points(&self) -> Result<Vec<DoublePoint>, TimeSeriesError> {
        let index = self.index()?;
        Ok(self
            .to_array()?
            .into_iter()
            .enumerate()
            .map(|(position, value)| DoublePoint {
                position,
                time: index.time_at(position),
                value,
            })
            .collect())
    }

    pub fn write_json(&self, out: &mut String) {
        out.push_str("{\"name\":");
        out.push_str(&serde_json::to_string(&self.name).expect("name serializes to JSON"));
        out.push_str(",\"expr\":");
        // a non-finite literal comes out as null; parsing maps it back to NaN
        out.push_str(
            &serde_json::to_string(self.node.as_ref()).expect("expression serializes to JSON"),
        );
        out.push('}');
    }

    pub(crate) fn from_json_value(value: &serde_json::Value) -> Result<Self, TimeSeriesError> {
        let object = value
            .as_object()
            .ok_or_else(|| TimeSeriesError::Json("Series JSON is not an object".to_string()))?;
        let name = json::required(object, "name", "calculated series")?
            .as_str()
            .ok_or_else(|| TimeSeriesError::Json("'name' is not a string".to_string()))?;
        let node: NodeCalc =
            serde_json::from_value(json::required(object, "expr", "calculated series")?.clone())?;
        Ok(CalculatedTimeSeries::new(name, Arc::new(node)))
    }
}

// ---------------------------------------------------------------------------
// mixed lists
// ---------------------------------------------------------------------------

/// Any series kind, as found in a JSON series list.
#[derive(Debug, Clone)]
pub enum TimeSeries {
    Double(StoredDoubleTimeSeries),
    String(StoredStringTimeSeries),
    Calculated(CalculatedTimeSeries),
}

impl TimeSeries {
    pub fn name(&self) -> &str {
        match self {
            TimeSeries::Double(s) => s.name(),
            TimeSeries::String(s) => s.name(),
            TimeSeries::Calculated(s) => s.name(),
        }
    }

    pub fn write_json(&self, out: &mut String) {
        match self {
            TimeSeries::Double(s) => s.write_json(out),
            TimeSeries::String(s) => s.write_json(out),
            TimeSeries::Calculated(s) => s.write_json(out),
        }
    }

    fn from_json_value(value: &serde_json::Value) -> Result<Self, TimeSeriesError> {
        let object = value
            .as_object()
            .ok_or_else(|| TimeSeriesError::Json("Series JSON is not an object".to_string()))?;
        if object.contains_key("expr") {
            return Ok(TimeSeries::Calculated(CalculatedTimeSeries::from_json_value(value)?));
        }
        let metadata = json::required(object, "metadata", "series")?;
        let data_type = json::required(
            metadata
                .as_object()
                .ok_or_else(|| TimeSeriesError::Json("'metadata' is not an object".to_string()))?,
            "dataType",
            "metadata",
        )?;
        match data_type.as_str() {
            Some("DOUBLE") => Ok(TimeSeries::Double(StoredDoubleTimeSeries::from_json_value(
                value,
            )?)),
            Some("STRING") => Ok(TimeSeries::String(StoredStringTimeSeries::from_json_value(
                value,
            )?)),
            _ => Err(TimeSeriesError::Json(format!(
                "Unexpected data type {data_type}"
            ))),
        }
    }
}

/// Writes a series list as a JSON array, NaN spelled as a bare token.
pub fn series_list_to_json(list: &[TimeSeries]) -> String {
    let mut out = String::from("[");
    for (i, series) in list.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        series.write_json(&mut out);
    }
    out.push(']');
    out
}

/// Parses a JSON series array, accepting bare NaN tokens.
pub fn series_list_from_json(text: &str) -> Result<Vec<TimeSeries>, TimeSeriesError> {
    let value = json::parse_value(text)?;
    value
        .as_array()
        .ok_or_else(|| TimeSeriesError::Json("Series list JSON is not an array".to_string()))?
        .iter()
        .map(TimeSeries::from_json_value)
        .collect()
}

// ---------------------------------------------------------------------------
// CSV import
// ---------------------------------------------------------------------------

/// One header column being accumulated during a CSV parse. Its data type is
/// decided by the first data row and then kept for every later version.
struct CsvColumn {
    name: String,
    data_type: Option<TimeSeriesDataType>,
    doubles: Vec<f64>,
    strings: Vec<Option<String>>,
}

impl CsvColumn {
    fn new(name: &str) -> Self {
        CsvColumn {
            name: name.to_string(),
            data_type: None,
            doubles: Vec::new(),
            strings: Vec::new(),
        }
    }

    fn push(&mut self, token: &str) {
        let data_type = match self.data_type {
            Some(data_type) => data_type,
            None => {
                let data_type = if token.parse::<f64>().is_ok() {
                    TimeSeriesDataType::Double
                } else {
                    TimeSeriesDataType::String
                };
                self.data_type = Some(data_type);
                data_type
            }
        };
        match data_type {
            TimeSeriesDataType::Double => self.doubles.push(token.parse().unwrap_or(f64::NAN)),
            TimeSeriesDataType::String => self.strings.push(if token.is_empty() {
                None
            } else {
                Some(token.to_string())
            }),
        }
    }

    fn build(&self, index: &TimeSeriesIndex) -> Result<TimeSeries, TimeSeriesError> {
        let data_type = self
            .data_type
            .ok_or_else(|| TimeSeriesError::Csv(format!("Column '{}' holds no value", self.name)))?;
        let metadata = TimeSeriesMetadata::new(self.name.clone(), data_type, index.clone());
        match data_type {
            TimeSeriesDataType::Double => {
                let chunk = DoubleDataChunk::uncompressed(0, self.doubles.clone())?;
                let chunk = chunk.try_to_compress().or_original(chunk);
                Ok(TimeSeries::Double(StoredDoubleTimeSeries::new(
                    metadata,
                    vec![chunk],
                )?))
            }
            TimeSeriesDataType::String => {
                let chunk = StringDataChunk::uncompressed(0, self.strings.clone())?;
                let chunk = chunk.try_to_compress().or_original(chunk);
                Ok(TimeSeries::String(StoredStringTimeSeries::new(
                    metadata,
                    vec![chunk],
                )?))
            }
        }
    }

    fn clear(&mut self) {
        self.doubles.clear();
        self.strings.clear();
    }
}

/// RFC 3339 date-time or raw epoch milliseconds.
fn parse_csv_instant(token: &str) -> Result<Timestamp, TimeSeriesError> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(token) {
        return Ok(instant.timestamp_millis());
    }
    token
        .parse()
        .map_err(|_| TimeSeriesError::Csv(format!("Cannot parse instant '{token}'")))
}

/// A regular index when the instants are evenly spaced, an irregular one
/// otherwise. At least two rows are required to tell the two apart.
fn detect_csv_index(instants: &[Timestamp]) -> Result<TimeSeriesIndex, TimeSeriesError> {
    if instants.len() < 2 {
        return Err(TimeSeriesError::Csv(
            "At least 2 rows are expected per version".to_string(),
        ));
    }
    let spacing = instants[1] - instants[0];
    if spacing > 0 && instants.windows(2).all(|w| w[1] - w[0] == spacing) {
        TimeSeriesIndex::regular(instants[0], instants[instants.len() - 1], spacing)
    } else {
        TimeSeriesIndex::irregular(instants.to_vec())
    }
}

fn flush_csv_version(
    columns: &mut [CsvColumn],
    instants: &mut Vec<Timestamp>,
    reference_index: &mut Option<TimeSeriesIndex>,
) -> Result<Vec<TimeSeries>, TimeSeriesError> {
    let index = detect_csv_index(instants)?;
    match reference_index {
        None => *reference_index = Some(index.clone()),
        Some(reference) if *reference == index => {}
        Some(reference) => {
            return Err(TimeSeriesError::Csv(format!(
                "Every version is expected to share one index: {reference:?} != {index:?}"
            )))
        }
    }
    let list = columns
        .iter()
        .map(|column| column.build(&index))
        .collect::<Result<Vec<_>, _>>()?;
    instants.clear();
    for column in columns.iter_mut() {
        column.clear();
    }
    Ok(list)
}

impl TimeSeries {
    /// Parses versioned CSV text, `Time{separator}Version{separator}...`
    /// with one column per series, back into per-version series lists.
    ///
    /// Rows of one version must be contiguous. Each column's data type is
    /// detected from its first data row; empty numeric cells read as NaN,
    /// empty text cells as `None`. Evenly spaced instants produce a regular
    /// index, anything else an irregular one, and all versions must agree on
    /// it. Cells are taken verbatim, there is no quoting.
    pub fn parse_csv(
        text: &str,
        separator: char,
    ) -> Result<BTreeMap<i32, Vec<TimeSeries>>, TimeSeriesError> {
        let start = std::time::Instant::now();
        let mut lines = text.lines().filter(|line| !line.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| TimeSeriesError::Csv("CSV header is missing".to_string()))?;
        let tokens: Vec<&str> = header.split(separator).map(str::trim).collect();
        if tokens.len() < 3
            || !tokens[0].eq_ignore_ascii_case("time")
            || !tokens[1].eq_ignore_ascii_case("version")
        {
            return Err(TimeSeriesError::Csv(format!(
                "Bad CSV header, 'Time{separator}Version{separator}...' expected"
            )));
        }
        let names = &tokens[2..];
        let mut seen = BTreeSet::new();
        for name in names {
            if !seen.insert(*name) {
                return Err(TimeSeriesError::Csv(format!(
                    "Duplicate time series name '{name}' in CSV header"
                )));
            }
        }
        let mut columns: Vec<CsvColumn> = names.iter().map(|name| CsvColumn::new(name)).collect();
        let mut per_version = BTreeMap::new();
        let mut instants: Vec<Timestamp> = Vec::new();
        let mut reference_index: Option<TimeSeriesIndex> = None;
        let mut current_version: Option<i32> = None;
        for (row, line) in lines.enumerate() {
            let cells: Vec<&str> = line.split(separator).collect();
            if cells.len() != columns.len() + 2 {
                return Err(TimeSeriesError::Csv(format!(
                    "Columns of row {row} are inconsistent with the header"
                )));
            }
            let version = cells[1].trim().parse().map_err(|_| {
                TimeSeriesError::Csv(format!("Cannot parse version '{}'", cells[1]))
            })?;
            if current_version != Some(version) {
                if let Some(done) = current_version {
                    per_version.insert(
                        done,
                        flush_csv_version(&mut columns, &mut instants, &mut reference_index)?,
                    );
                }
                current_version = Some(version);
            }
            instants.push(parse_csv_instant(cells[0].trim())?);
            for (column, token) in columns.iter_mut().zip(&cells[2..]) {
                column.push(token.trim());
            }
        }
        let version = current_version
            .ok_or_else(|| TimeSeriesError::Csv("CSV holds no data row".to_string()))?;
        per_version.insert(
            version,
            flush_csv_version(&mut columns, &mut instants, &mut reference_index)?,
        );
        log::info!(
            "{} time series loaded from CSV in {:?}",
            per_version.values().map(Vec::len).sum::<usize>(),
            start.elapsed()
        );
        Ok(per_version)
    }
}

//! Columnar table caching several versions of several series for fast
//! per-position reads, statistics and CSV export.
//!
//! Column layout is fixed by the first load: names are sorted once and every
//! later load must stick to them. Values live in big buffers, one for
//! numeric columns and one for text columns, addressed by
//! `(column, version, position)`.

use crate::buffer::{BigDoubleBuffer, BigStringBuffer, BufferAllocator, HeapAllocator};
use crate::error::TimeSeriesError;
use crate::index::TimeSeriesIndex;
use crate::series::TimeSeries;
use crate::types::TimeSeriesDataType;
use chrono::{DateTime, FixedOffset, SecondsFormat};
use rayon::prelude::*;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

struct ColumnInfo {
    name: String,
    data_type: TimeSeriesDataType,
    /// Position among the columns of the same data type.
    type_column: usize,
}

/// Multi-version columnar cache over one time index.
pub struct TimeSeriesTable {
    from_version: i32,
    to_version: i32,
    index: TimeSeriesIndex,
    allocator: Arc<dyn BufferAllocator>,
    columns: Vec<ColumnInfo>,
    /// Indices into `columns` for numeric columns, by type column.
    double_columns: Vec<usize>,
    string_columns: Vec<usize>,
    double_buffer: Option<BigDoubleBuffer>,
    string_buffer: Option<BigStringBuffer>,
    /// Lazy per-(column, version) statistics, NaN when not yet computed.
    means: Vec<f64>,
    std_devs: Vec<f64>,
}

impl TimeSeriesTable {
    /// Builds an empty table for versions `from_version..=to_version`, all
    /// loaded on `index`. The column set is fixed by the first load.
    pub fn new(
        from_version: i32,
        to_version: i32,
        index: TimeSeriesIndex,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<Self, TimeSeriesError> {
        if from_version > to_version {
            return Err(TimeSeriesError::InvalidArgument(format!(
                "Invalid version range [{from_version}, {to_version}]"
            )));
        }
        if index.is_infinite() {
            return Err(TimeSeriesError::InvalidArgument(
                "A table cannot be built on an infinite index".to_string(),
            ));
        }
        Ok(TimeSeriesTable {
            from_version,
            to_version,
            index,
            allocator,
            columns: Vec::new(),
            double_columns: Vec::new(),
            string_columns: Vec::new(),
            double_buffer: None,
            string_buffer: None,
            means: Vec::new(),
            std_devs: Vec::new(),
        })
    }

    /// Heap-backed table.
    pub fn in_memory(
        from_version: i32,
        to_version: i32,
        index: TimeSeriesIndex,
    ) -> Result<Self, TimeSeriesError> {
        Self::new(from_version, to_version, index, Arc::new(HeapAllocator))
    }

    pub fn index(&self) -> &TimeSeriesIndex {
        &self.index
    }

    pub fn from_version(&self) -> i32 {
        self.from_version
    }

    pub fn to_version(&self) -> i32 {
        self.to_version
    }

    /// Column names in table order (sorted). Empty before the first load.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    fn version_count(&self) -> usize {
        (self.to_version - self.from_version + 1) as usize
    }

    fn check_version(&self, version: i32) -> Result<(), TimeSeriesError> {
        if version < self.from_version || version > self.to_version {
            return Err(TimeSeriesError::InvalidArgument(format!(
                "Version {version} is out of range [{}, {}]",
                self.from_version, self.to_version
            )));
        }
        Ok(())
    }

    fn check_point(&self, point: usize) -> Result<(), TimeSeriesError> {
        if point >= self.index.point_count() {
            return Err(TimeSeriesError::InvalidArgument(format!(
                "Point {point} is out of range [0, {})",
                self.index.point_count()
            )));
        }
        Ok(())
    }

    fn column(&self, name: &str) -> Result<&ColumnInfo, TimeSeriesError> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| TimeSeriesError::SeriesNotFound(name.to_string()))
    }

    /// Buffer offset of `(type_column, version)`, position 0.
    fn value_offset(&self, type_column: usize, version: i32) -> usize {
        (type_column * self.version_count() + (version - self.from_version) as usize)
            * self.index.point_count()
    }

    fn stat_slot(&self, type_column: usize, version: i32) -> usize {
        type_column * self.version_count() + (version - self.from_version) as usize
    }

    fn init_columns(&mut self, series: &[TimeSeries]) -> Result<(), TimeSeriesError> {
        let mut infos: Vec<(String, TimeSeriesDataType)> = Vec::with_capacity(series.len());
        for s in series {
            let data_type = match s {
                TimeSeries::Double(_) | TimeSeries::Calculated(_) => TimeSeriesDataType::Double,
                TimeSeries::String(_) => TimeSeriesDataType::String,
            };
            infos.push((s.name().to_string(), data_type));
        }
        infos.sort_by(|a, b| a.0.cmp(&b.0));
        if infos.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(TimeSeriesError::InvalidArgument(
                "Duplicate time series names in the loaded list".to_string(),
            ));
        }
        for (name, data_type) in infos {
            let type_column = match data_type {
                TimeSeriesDataType::Double => {
                    self.double_columns.push(self.columns.len());
                    self.double_columns.len() - 1
                }
                TimeSeriesDataType::String => {
                    self.string_columns.push(self.columns.len());
                    self.string_columns.len() - 1
                }
            };
            self.columns.push(ColumnInfo {
                name,
                data_type,
                type_column,
            });
        }
        let cells_per_column = self.index.point_count() * self.version_count();
        if !self.double_columns.is_empty() {
            self.double_buffer = Some(BigDoubleBuffer::with_default(
                self.double_columns.len() * cells_per_column,
                f64::NAN,
                Arc::clone(&self.allocator),
            ));
            self.means = vec![f64::NAN; self.double_columns.len() * self.version_count()];
            self.std_devs = vec![f64::NAN; self.double_columns.len() * self.version_count()];
        }
        if !self.string_columns.is_empty() {
            self.string_buffer = Some(BigStringBuffer::new(
                self.string_columns.len() * cells_per_column,
                Arc::clone(&self.allocator),
            ));
        }
        Ok(())
    }

    /// Loads one version of the given series into the table. The first call
    /// fixes the column set; later calls may reload any subset of it.
    /// Calculated series are synchronized on the table index and evaluated
    /// here.
    pub fn load(&mut self, version: i32, series: &mut [TimeSeries]) -> Result<(), TimeSeriesError> {
        self.check_version(version)?;
        if series.is_empty() {
            return Err(TimeSeriesError::InvalidArgument(
                "Empty time series list".to_string(),
            ));
        }
        let start = Instant::now();
        for s in series.iter_mut() {
            match s {
                TimeSeries::Double(stored) => {
                    if stored.metadata().index != self.index {
                        return Err(TimeSeriesError::NotSynchronized(stored.name().to_string()));
                    }
                }
                TimeSeries::String(stored) => {
                    if stored.metadata().index != self.index {
                        return Err(TimeSeriesError::NotSynchronized(stored.name().to_string()));
                    }
                }
                TimeSeries::Calculated(calc) => calc.synchronize(self.index.clone())?,
            }
        }
        if self.columns.is_empty() {
            self.init_columns(series)?;
        }
        for s in series.iter() {
            let info = self.column(s.name())?;
            let type_column = info.type_column;
            let expected = info.data_type;
            match s {
                TimeSeries::Double(stored) => {
                    if expected != TimeSeriesDataType::Double {
                        return Err(type_mismatch(s.name()));
                    }
                    let base = self.value_offset(type_column, version);
                    let buffer = self.double_buffer_mut()?;
                    stored.fill_buffer(buffer, base);
                    self.reset_stats(type_column, version);
                }
                TimeSeries::Calculated(calc) => {
                    if expected != TimeSeriesDataType::Double {
                        return Err(type_mismatch(s.name()));
                    }
                    let values = calc.to_array()?;
                    let base = self.value_offset(type_column, version);
                    let buffer = self.double_buffer_mut()?;
                    for (i, value) in values.into_iter().enumerate() {
                        buffer.put(base + i, value);
                    }
                    self.reset_stats(type_column, version);
                }
                TimeSeries::String(stored) => {
                    if expected != TimeSeriesDataType::String {
                        return Err(type_mismatch(s.name()));
                    }
                    let base = self.value_offset(type_column, version);
                    let buffer = self.string_buffer_mut()?;
                    stored.fill_buffer(buffer, base);
                }
            }
        }
        log::info!(
            "{} time series loaded into table for version {version} in {:?}",
            series.len(),
            start.elapsed()
        );
        Ok(())
    }

    fn double_buffer_mut(&mut self) -> Result<&mut BigDoubleBuffer, TimeSeriesError> {
        self.double_buffer
            .as_mut()
            .ok_or_else(|| TimeSeriesError::InvalidArgument("Table holds no numeric column".to_string()))
    }

    fn string_buffer_mut(&mut self) -> Result<&mut BigStringBuffer, TimeSeriesError> {
        self.string_buffer
            .as_mut()
            .ok_or_else(|| TimeSeriesError::InvalidArgument("Table holds no text column".to_string()))
    }

    fn reset_stats(&mut self, type_column: usize, version: i32) {
        let slot = self.stat_slot(type_column, version);
        if slot < self.means.len() {
            self.means[slot] = f64::NAN;
            self.std_devs[slot] = f64::NAN;
        }
    }

    pub fn double_value(&self, version: i32, name: &str, point: usize) -> Result<f64, TimeSeriesError> {
        self.check_version(version)?;
        self.check_point(point)?;
        let info = self.column(name)?;
        if info.data_type != TimeSeriesDataType::Double {
            return Err(type_mismatch(name));
        }
        let buffer = self
            .double_buffer
            .as_ref()
            .ok_or_else(|| TimeSeriesError::SeriesNotFound(name.to_string()))?;
        Ok(buffer.get(self.value_offset(info.type_column, version) + point))
    }

    pub fn string_value(
        &self,
        version: i32,
        name: &str,
        point: usize,
    ) -> Result<Option<String>, TimeSeriesError> {
        self.check_version(version)?;
        self.check_point(point)?;
        let info = self.column(name)?;
        if info.data_type != TimeSeriesDataType::String {
            return Err(type_mismatch(name));
        }
        let buffer = self
            .string_buffer
            .as_ref()
            .ok_or_else(|| TimeSeriesError::SeriesNotFound(name.to_string()))?;
        Ok(buffer.get_string(self.value_offset(info.type_column, version) + point))
    }

    /// Mean over the column's non-NaN values, NaN for an all-NaN column.
    /// Computed lazily and cached per (column, version).
    pub fn mean(&mut self, version: i32, name: &str) -> Result<f64, TimeSeriesError> {
        self.check_version(version)?;
        let type_column = self.double_column_index(name)?;
        self.ensure_stats(type_column, version);
        Ok(self.means[self.stat_slot(type_column, version)])
    }

    /// Sample standard deviation over the column's non-NaN values.
    pub fn std_dev(&mut self, version: i32, name: &str) -> Result<f64, TimeSeriesError> {
        self.check_version(version)?;
        let type_column = self.double_column_index(name)?;
        self.ensure_stats(type_column, version);
        Ok(self.std_devs[self.stat_slot(type_column, version)])
    }

    /// Ordinal of a numeric column among the numeric columns, in table
    /// order. This is the number expression references resolve to.
    pub fn double_column_index(&self, name: &str) -> Result<usize, TimeSeriesError> {
        let info = self.column(name)?;
        if info.data_type != TimeSeriesDataType::Double {
            return Err(type_mismatch(name));
        }
        Ok(info.type_column)
    }

    /// Ordinal of a text column among the text columns, in table order.
    pub fn string_column_index(&self, name: &str) -> Result<usize, TimeSeriesError> {
        let info = self.column(name)?;
        if info.data_type != TimeSeriesDataType::String {
            return Err(type_mismatch(name));
        }
        Ok(info.type_column)
    }

    fn ensure_stats(&mut self, type_column: usize, version: i32) {
        let slot = self.stat_slot(type_column, version);
        if !self.means[slot].is_nan() && !self.std_devs[slot].is_nan() {
            return;
        }
        let (mean, std_dev) = self.compute_stats(type_column, version);
        self.means[slot] = mean;
        self.std_devs[slot] = std_dev;
    }

    fn compute_stats(&self, type_column: usize, version: i32) -> (f64, f64) {
        let buffer = match &self.double_buffer {
            Some(b) => b,
            None => return (f64::NAN, f64::NAN),
        };
        let base = self.value_offset(type_column, version);
        let mut count = 0usize;
        let mut sum = 0.0;
        for point in 0..self.index.point_count() {
            let value = buffer.get(base + point);
            if !value.is_nan() {
                count += 1;
                sum += value;
            }
        }
        if count == 0 {
            return (f64::NAN, f64::NAN);
        }
        let mean = sum / count as f64;
        if count < 2 {
            return (mean, f64::NAN);
        }
        let mut squares = 0.0;
        for point in 0..self.index.point_count() {
            let value = buffer.get(base + point);
            if !value.is_nan() {
                squares += (value - mean) * (value - mean);
            }
        }
        (mean, (squares / (count - 1) as f64).sqrt())
    }

    /// Pearson product-moment correlation coefficient between two numeric
    /// columns of one version, over the positions where both are non-NaN.
    pub fn compute_ppmcc(
        &mut self,
        version: i32,
        name1: &str,
        name2: &str,
    ) -> Result<f64, TimeSeriesError> {
        self.check_version(version)?;
        let c1 = self.double_column_index(name1)?;
        let c2 = self.double_column_index(name2)?;
        self.ensure_stats(c1, version);
        self.ensure_stats(c2, version);
        Ok(self.ppmcc(version, c1, c2))
    }

    fn ppmcc(&self, version: i32, c1: usize, c2: usize) -> f64 {
        let buffer = match &self.double_buffer {
            Some(b) => b,
            None => return f64::NAN,
        };
        let mean1 = self.means[self.stat_slot(c1, version)];
        let mean2 = self.means[self.stat_slot(c2, version)];
        let std1 = self.std_devs[self.stat_slot(c1, version)];
        let std2 = self.std_devs[self.stat_slot(c2, version)];
        if std1 == 0.0 || std2 == 0.0 || std1.is_nan() || std2.is_nan() {
            return f64::NAN;
        }
        let base1 = self.value_offset(c1, version);
        let base2 = self.value_offset(c2, version);
        let mut covariance = 0.0;
        let mut count = 0usize;
        for point in 0..self.index.point_count() {
            let v1 = buffer.get(base1 + point);
            let v2 = buffer.get(base2 + point);
            if !v1.is_nan() && !v2.is_nan() {
                covariance += (v1 - mean1) * (v2 - mean2);
                count += 1;
            }
        }
        if count < 2 {
            return f64::NAN;
        }
        covariance / ((count - 1) as f64 * std1 * std2)
    }

    /// The `max` numeric columns most correlated with `name` for one
    /// version, ranked by absolute coefficient, the named column excluded.
    /// Columns are scanned in parallel.
    pub fn find_most_correlated(
        &mut self,
        version: i32,
        name: &str,
        max: usize,
    ) -> Result<Vec<(String, f64)>, TimeSeriesError> {
        self.check_version(version)?;
        let target = self.double_column_index(name)?;
        for type_column in 0..self.double_columns.len() {
            self.ensure_stats(type_column, version);
        }
        let table: &Self = self;
        let mut scored: Vec<(String, f64)> = (0..table.double_columns.len())
            .into_par_iter()
            .filter(|&type_column| type_column != target)
            .map(|type_column| {
                let column = &table.columns[table.double_columns[type_column]];
                (column.name.clone(), table.ppmcc(version, target, type_column))
            })
            .filter(|(_, r)| !r.is_nan())
            .collect();
        scored.sort_by(|a, b| {
            b.1.abs()
                .partial_cmp(&a.1.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(max);
        Ok(scored)
    }

    /// Writes the whole table as CSV: a `Time{separator}Version` prefix
    /// followed by one column per series, one row per (version, position).
    /// NaN and missing text cells are left empty; instants are ISO-8601 in
    /// the given offset.
    pub fn write_csv<W: Write>(
        &self,
        writer: &mut W,
        separator: char,
        offset: FixedOffset,
    ) -> Result<(), TimeSeriesError> {
        let start = Instant::now();
        let mut line = String::new();
        line.push_str("Time");
        line.push(separator);
        line.push_str("Version");
        for column in &self.columns {
            line.push(separator);
            line.push_str(&column.name);
        }
        line.push('\n');
        writer.write_all(line.as_bytes())?;
        for version in self.from_version..=self.to_version {
            for point in 0..self.index.point_count() {
                line.clear();
                line.push_str(&format_instant(self.index.time_at(point), offset)?);
                line.push(separator);
                line.push_str(&version.to_string());
                for column in &self.columns {
                    line.push(separator);
                    match column.data_type {
                        TimeSeriesDataType::Double => {
                            let value = self.double_value(version, &column.name, point)?;
                            if !value.is_nan() {
                                line.push_str(&value.to_string());
                            }
                        }
                        TimeSeriesDataType::String => {
                            if let Some(value) = self.string_value(version, &column.name, point)? {
                                line.push_str(&value);
                            }
                        }
                    }
                }
                line.push('\n');
                writer.write_all(line.as_bytes())?;
            }
        }
        log::info!("Table written to CSV in {:?}", start.elapsed());
        Ok(())
    }

    pub fn to_csv_string(
        &self,
        separator: char,
        offset: FixedOffset,
    ) -> Result<String, TimeSeriesError> {
        let mut buffer = Vec::new();
        self.write_csv(&mut buffer, separator, offset)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn type_mismatch(name: &str) -> TimeSeriesError {
    TimeSeriesError::InvalidArgument(format!(
        "Time series '{name}' does not have the expected data type"
    ))
}

fn format_instant(millis: i64, offset: FixedOffset) -> Result<String, TimeSeriesError> {
    let instant = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| {
            TimeSeriesError::InvalidArgument(format!("Instant {millis} is out of range"))
        })?
        .with_timezone(&offset);
    Ok(instant.to_rfc3339_opts(SecondsFormat::Millis, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::NodeCalc;
    use crate::series::{StoredDoubleTimeSeries, StoredStringTimeSeries};
    use crate::types::TimeSeriesMetadata;

    fn four_point_index() -> TimeSeriesIndex {
        TimeSeriesIndex::regular(0, 3000, 1000).unwrap()
    }

    fn loaded_table() -> TimeSeriesTable {
        let index = four_point_index();
        let mut table = TimeSeriesTable::in_memory(1, 2, index.clone()).unwrap();
        let mut v1 = vec![
            TimeSeries::Double(
                StoredDoubleTimeSeries::from_values("ts1", index.clone(), vec![1.0, 2.0, 3.0, 4.0])
                    .unwrap(),
            ),
            TimeSeries::Double(
                StoredDoubleTimeSeries::from_values("ts2", index.clone(), vec![4.0, 3.0, 2.0, 1.0])
                    .unwrap(),
            ),
            TimeSeries::String(
                StoredStringTimeSeries::from_values(
                    "st1",
                    index.clone(),
                    vec![Some("a".to_string()), None, Some("b".to_string()), None],
                )
                .unwrap(),
            ),
        ];
        table.load(1, &mut v1).unwrap();
        let mut v2 = vec![TimeSeries::Double(
            StoredDoubleTimeSeries::from_values("ts1", index, vec![10.0, 20.0, f64::NAN, 40.0])
                .unwrap(),
        )];
        table.load(2, &mut v2).unwrap();
        table
    }

    #[test]
    fn values_are_addressed_by_version_and_point() {
        let table = loaded_table();
        assert_eq!(1.0, table.double_value(1, "ts1", 0).unwrap());
        assert_eq!(4.0, table.double_value(1, "ts1", 3).unwrap());
        assert_eq!(4.0, table.double_value(1, "ts2", 0).unwrap());
        assert_eq!(20.0, table.double_value(2, "ts1", 1).unwrap());
        // ts2 was never loaded for version 2
        assert!(table.double_value(2, "ts2", 0).unwrap().is_nan());
        assert_eq!(Some("a".to_string()), table.string_value(1, "st1", 0).unwrap());
        assert_eq!(None, table.string_value(1, "st1", 1).unwrap());
    }

    #[test]
    fn bad_lookups_are_rejected() {
        let table = loaded_table();
        assert!(table.double_value(0, "ts1", 0).is_err());
        assert!(table.double_value(1, "ts1", 4).is_err());
        assert!(matches!(
            table.double_value(1, "nope", 0),
            Err(TimeSeriesError::SeriesNotFound(_))
        ));
        // type mismatch both ways
        assert!(table.double_value(1, "st1", 0).is_err());
        assert!(table.string_value(1, "ts1", 0).is_err());
    }

    #[test]
    fn column_ordinals_follow_sorted_type_order() {
        let table = loaded_table();
        assert_eq!(0, table.double_column_index("ts1").unwrap());
        assert_eq!(1, table.double_column_index("ts2").unwrap());
        assert_eq!(0, table.string_column_index("st1").unwrap());
        assert!(matches!(
            table.double_column_index("nope"),
            Err(TimeSeriesError::SeriesNotFound(_))
        ));
        // type mismatch both ways
        assert!(table.double_column_index("st1").is_err());
        assert!(table.string_column_index("ts1").is_err());
    }

    #[test]
    fn load_rejects_unsynchronized_series() {
        let index = four_point_index();
        let mut table = TimeSeriesTable::in_memory(1, 1, index).unwrap();
        let other_index = TimeSeriesIndex::regular(0, 2000, 1000).unwrap();
        let mut series = vec![TimeSeries::Double(
            StoredDoubleTimeSeries::from_values("ts1", other_index, vec![1.0, 2.0, 3.0]).unwrap(),
        )];
        assert!(matches!(
            table.load(1, &mut series),
            Err(TimeSeriesError::NotSynchronized(_))
        ));
    }

    #[test]
    fn load_evaluates_calculated_series() {
        let index = four_point_index();
        let mut table = TimeSeriesTable::in_memory(1, 1, index).unwrap();
        let mut series = vec![TimeSeries::Calculated(
            crate::series::CalculatedTimeSeries::new(
                "twice",
                NodeCalc::multiply(NodeCalc::double(2.0), NodeCalc::double(3.0)),
            ),
        )];
        table.load(1, &mut series).unwrap();
        for point in 0..4 {
            assert_eq!(6.0, table.double_value(1, "twice", point).unwrap());
        }
    }

    #[test]
    fn statistics_skip_nan_cells() {
        let mut table = loaded_table();
        assert_eq!(2.5, table.mean(1, "ts1").unwrap());
        let expected_std = (5.0f64 / 3.0).sqrt();
        assert!((table.std_dev(1, "ts1").unwrap() - expected_std).abs() < 1e-12);
        // version 2 has a NaN hole, mean over the three remaining values
        let mean = table.mean(2, "ts1").unwrap();
        assert!((mean - 70.0 / 3.0).abs() < 1e-12);
        // never-loaded column is all NaN
        assert!(table.mean(2, "ts2").unwrap().is_nan());
        assert!(table.mean(1, "st1").is_err());
    }

    #[test]
    fn ppmcc_of_opposite_columns_is_minus_one() {
        let mut table = loaded_table();
        let r = table.compute_ppmcc(1, "ts1", "ts2").unwrap();
        assert!((r + 1.0).abs() < 1e-12);
        let r = table.compute_ppmcc(1, "ts1", "ts1").unwrap();
        assert!((r - 1.0).abs() < 1e-12);
    }

    #[test]
    fn most_correlated_ranks_by_absolute_coefficient() {
        let index = four_point_index();
        let mut table = TimeSeriesTable::in_memory(1, 1, index.clone()).unwrap();
        let mut series = vec![
            TimeSeries::Double(
                StoredDoubleTimeSeries::from_values("base", index.clone(), vec![1.0, 2.0, 3.0, 4.0])
                    .unwrap(),
            ),
            TimeSeries::Double(
                StoredDoubleTimeSeries::from_values(
                    "inverse",
                    index.clone(),
                    vec![4.0, 3.0, 2.0, 1.0],
                )
                .unwrap(),
            ),
            TimeSeries::Double(
                StoredDoubleTimeSeries::from_values("noisy", index, vec![1.0, 3.0, 2.0, 4.0])
                    .unwrap(),
            ),
        ];
        table.load(1, &mut series).unwrap();
        let ranked = table.find_most_correlated(1, "base", 10).unwrap();
        assert_eq!(2, ranked.len());
        // perfect anti-correlation outranks the noisy column
        assert_eq!("inverse", ranked[0].0);
        assert!((ranked[0].1 + 1.0).abs() < 1e-12);
        assert_eq!("noisy", ranked[1].0);
        let limited = table.find_most_correlated(1, "base", 1).unwrap();
        assert_eq!(1, limited.len());
    }

    #[test]
    fn csv_export_layout() {
        let index = TimeSeriesIndex::regular(0, 1000, 1000).unwrap();
        let mut table = TimeSeriesTable::in_memory(1, 1, index.clone()).unwrap();
        let mut series = vec![
            TimeSeries::Double(
                StoredDoubleTimeSeries::new(
                    TimeSeriesMetadata::new(
                        "ts1",
                        TimeSeriesDataType::Double,
                        index.clone(),
                    ),
                    vec![crate::chunk::DoubleDataChunk::uncompressed(0, vec![1.5]).unwrap()],
                )
                .unwrap(),
            ),
            TimeSeries::String(
                StoredStringTimeSeries::from_values(
                    "st1",
                    index,
                    vec![Some("a".to_string()), Some("b".to_string())],
                )
                .unwrap(),
            ),
        ];
        table.load(1, &mut series).unwrap();
        let csv = table
            .to_csv_string(';', FixedOffset::east_opt(0).unwrap())
            .unwrap();
        assert_eq!(
            "Time;Version;st1;ts1\n\
             1970-01-01T00:00:00.000+00:00;1;a;1.5\n\
             1970-01-01T00:00:01.000+00:00;1;b;\n",
            csv
        );
    }

    #[test]
    fn table_rejects_infinite_index_and_bad_version_range() {
        assert!(TimeSeriesTable::in_memory(1, 1, crate::index::INFINITE_INDEX).is_err());
        assert!(TimeSeriesTable::in_memory(2, 1, four_point_index()).is_err());
    }
}

//! Array chunks: immutable contiguous runs of one series' values, stored
//! either verbatim or run-length-compressed, with split/append/compress and
//! point streaming.

use crate::buffer::{BigDoubleBuffer, BigStringBuffer};
use crate::error::TimeSeriesError;
use crate::index::TimeSeriesIndex;
use crate::json;
use crate::types::{DoublePoint, StringPoint};
use serde::{Deserialize, Serialize};

/// Bytes of run metadata per compressed run (one u32 run length).
pub const RUN_METADATA_BYTES: usize = 4;
/// Bytes per stored numeric element.
pub const DOUBLE_ELEMENT_BYTES: usize = 8;

/// Result of [`DoubleDataChunk::try_to_compress`] /
/// [`StringDataChunk::try_to_compress`].
///
/// An explicit outcome replaces the reference-identity convention some
/// implementations use for "compression did not help": under value
/// semantics, `Unchanged` is the only meaningful no-op signal.
#[derive(Debug, Clone, PartialEq)]
pub enum CompressionOutcome<C> {
    /// Compression reduced the estimated size; here is the new chunk.
    Compressed(C),
    /// Compression would not strictly reduce the estimated size.
    Unchanged,
}

impl<C> CompressionOutcome<C> {
    /// The compressed chunk, or `original` when compression did not help.
    pub fn or_original(self, original: C) -> C {
        match self {
            CompressionOutcome::Compressed(c) => c,
            CompressionOutcome::Unchanged => original,
        }
    }
}

fn check_compressed_arrays<T>(
    step_values: &[T],
    step_lengths: &[usize],
    uncompressed_length: usize,
) -> Result<(), TimeSeriesError> {
    if step_values.len() != step_lengths.len() {
        return Err(TimeSeriesError::InvalidArgument(format!(
            "Step values and step lengths arrays have inconsistent sizes {} and {}",
            step_values.len(),
            step_lengths.len()
        )));
    }
    if step_values.is_empty() {
        return Err(TimeSeriesError::InvalidArgument(
            "A compressed chunk is expected to hold at least one run".to_string(),
        ));
    }
    if step_lengths.iter().any(|&l| l == 0) {
        return Err(TimeSeriesError::InvalidArgument(
            "Zero-length run in compressed chunk".to_string(),
        ));
    }
    let total: usize = step_lengths.iter().sum();
    if total != uncompressed_length {
        return Err(TimeSeriesError::InvalidArgument(format!(
            "Sum of run lengths {total} does not match uncompressed length {uncompressed_length}"
        )));
    }
    Ok(())
}

fn check_split_position(
    position: usize,
    offset: usize,
    length: usize,
) -> Result<(), TimeSeriesError> {
    if position <= offset || position >= offset + length {
        return Err(TimeSeriesError::InvalidArgument(format!(
            "Split position {position} is out of chunk range ]{}, {}[",
            offset,
            offset + length
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// numeric chunk
// ---------------------------------------------------------------------------

/// A contiguous run `[offset, offset+length)` of one numeric series.
/// Immutable once constructed; split and compression produce new chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DoubleDataChunk {
    Uncompressed {
        offset: usize,
        values: Vec<f64>,
    },
    Compressed {
        offset: usize,
        uncompressed_length: usize,
        step_values: Vec<f64>,
        step_lengths: Vec<usize>,
    },
}

/// Structural equality. NaN compares equal to itself (bit comparison) so
/// wire round-trips of sentinel-bearing chunks can be checked directly.
impl PartialEq for DoubleDataChunk {
    fn eq(&self, other: &Self) -> bool {
        fn same(a: &[f64], b: &[f64]) -> bool {
            a.len() == b.len()
                && a.iter()
                    .zip(b.iter())
                    .all(|(x, y)| x.to_bits() == y.to_bits())
        }
        match (self, other) {
            (
                DoubleDataChunk::Uncompressed { offset: o1, values: v1 },
                DoubleDataChunk::Uncompressed { offset: o2, values: v2 },
            ) => o1 == o2 && same(v1, v2),
            (
                DoubleDataChunk::Compressed {
                    offset: o1,
                    uncompressed_length: l1,
                    step_values: v1,
                    step_lengths: s1,
                },
                DoubleDataChunk::Compressed {
                    offset: o2,
                    uncompressed_length: l2,
                    step_values: v2,
                    step_lengths: s2,
                },
            ) => o1 == o2 && l1 == l2 && same(v1, v2) && s1 == s2,
            _ => false,
        }
    }
}

impl DoubleDataChunk {
    /// Builds an uncompressed chunk holding `values` starting at `offset`.
    pub fn uncompressed(offset: usize, values: Vec<f64>) -> Result<Self, TimeSeriesError> {
        if values.is_empty() {
            return Err(TimeSeriesError::InvalidArgument(
                "A chunk is expected to hold at least one value".to_string(),
            ));
        }
        Ok(DoubleDataChunk::Uncompressed { offset, values })
    }

    /// Builds a compressed chunk from parallel run arrays. Fails on
    /// mismatched array sizes, zero run lengths or an inconsistent
    /// uncompressed length.
    pub fn compressed(
        offset: usize,
        uncompressed_length: usize,
        step_values: Vec<f64>,
        step_lengths: Vec<usize>,
    ) -> Result<Self, TimeSeriesError> {
        check_compressed_arrays(&step_values, &step_lengths, uncompressed_length)?;
        Ok(DoubleDataChunk::Compressed {
            offset,
            uncompressed_length,
            step_values,
            step_lengths,
        })
    }

    pub fn offset(&self) -> usize {
        match self {
            DoubleDataChunk::Uncompressed { offset, .. } => *offset,
            DoubleDataChunk::Compressed { offset, .. } => *offset,
        }
    }

    pub fn length(&self) -> usize {
        match self {
            DoubleDataChunk::Uncompressed { values, .. } => values.len(),
            DoubleDataChunk::Compressed {
                uncompressed_length, ..
            } => *uncompressed_length,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, DoubleDataChunk::Compressed { .. })
    }

    /// Estimated in-memory size in bytes: raw values for the uncompressed
    /// form, value plus run metadata per run for the compressed form.
    pub fn estimated_size(&self) -> usize {
        match self {
            DoubleDataChunk::Uncompressed { values, .. } => values.len() * DOUBLE_ELEMENT_BYTES,
            DoubleDataChunk::Compressed { step_values, .. } => {
                step_values.len() * (DOUBLE_ELEMENT_BYTES + RUN_METADATA_BYTES)
            }
        }
    }

    fn uncompressed_estimated_size(&self) -> usize {
        self.length() * DOUBLE_ELEMENT_BYTES
    }

    pub fn compression_factor(&self) -> f64 {
        self.estimated_size() as f64 / self.uncompressed_estimated_size() as f64
    }

    /// Merges consecutive equal values into run-length pairs. Returns
    /// `Compressed` only when the result is strictly smaller than the
    /// input's estimated size.
    pub fn try_to_compress(&self) -> CompressionOutcome<DoubleDataChunk> {
        let (offset, values) = match self {
            DoubleDataChunk::Compressed { .. } => return CompressionOutcome::Unchanged,
            DoubleDataChunk::Uncompressed { offset, values } => (*offset, values),
        };
        let mut step_values = Vec::new();
        let mut step_lengths: Vec<usize> = Vec::new();
        for &value in values {
            match step_values.last() {
                Some(&last) if last == value => {
                    *step_lengths.last_mut().expect("parallel run arrays") += 1
                }
                _ => {
                    step_values.push(value);
                    step_lengths.push(1);
                }
            }
        }
        let compressed_size = step_values.len() * (DOUBLE_ELEMENT_BYTES + RUN_METADATA_BYTES);
        if compressed_size >= self.estimated_size() {
            return CompressionOutcome::Unchanged;
        }
        CompressionOutcome::Compressed(DoubleDataChunk::Compressed {
            offset,
            uncompressed_length: values.len(),
            step_values,
            step_lengths,
        })
    }

    /// Splits the chunk in two at `position`, which must lie strictly
    /// inside `]offset, offset+length[`. When a compressed run straddles
    /// the boundary the run itself is divided; no resulting run is empty.
    pub fn split_at(&self, position: usize) -> Result<(Self, Self), TimeSeriesError> {
        check_split_position(position, self.offset(), self.length())?;
        match self {
            DoubleDataChunk::Uncompressed { offset, values } => {
                let cut = position - offset;
                Ok((
                    DoubleDataChunk::Uncompressed {
                        offset: *offset,
                        values: values[..cut].to_vec(),
                    },
                    DoubleDataChunk::Uncompressed {
                        offset: position,
                        values: values[cut..].to_vec(),
                    },
                ))
            }
            DoubleDataChunk::Compressed {
                offset,
                uncompressed_length,
                step_values,
                step_lengths,
            } => {
                let mut left_values = Vec::new();
                let mut left_lengths = Vec::new();
                let mut right_values = Vec::new();
                let mut right_lengths = Vec::new();
                let mut run_start = *offset;
                for (&value, &len) in step_values.iter().zip(step_lengths.iter()) {
                    let run_end = run_start + len;
                    if run_end <= position {
                        left_values.push(value);
                        left_lengths.push(len);
                    } else if run_start >= position {
                        right_values.push(value);
                        right_lengths.push(len);
                    } else {
                        // the run straddles the boundary
                        left_values.push(value);
                        left_lengths.push(position - run_start);
                        right_values.push(value);
                        right_lengths.push(run_end - position);
                    }
                    run_start = run_end;
                }
                Ok((
                    DoubleDataChunk::Compressed {
                        offset: *offset,
                        uncompressed_length: position - offset,
                        step_values: left_values,
                        step_lengths: left_lengths,
                    },
                    DoubleDataChunk::Compressed {
                        offset: position,
                        uncompressed_length: offset + uncompressed_length - position,
                        step_values: right_values,
                        step_lengths: right_lengths,
                    },
                ))
            }
        }
    }

    /// Concatenates an adjacent chunk of the same storage form
    /// (`other.offset == self.offset + self.length`).
    pub fn append(&self, other: &Self) -> Result<Self, TimeSeriesError> {
        if other.offset() != self.offset() + self.length() {
            return Err(TimeSeriesError::InvalidArgument(format!(
                "Chunk at offset {} is not contiguous with chunk ending at {}",
                other.offset(),
                self.offset() + self.length()
            )));
        }
        match (self, other) {
            (
                DoubleDataChunk::Uncompressed { offset, values },
                DoubleDataChunk::Uncompressed { values: others, .. },
            ) => {
                let mut merged = values.clone();
                merged.extend_from_slice(others);
                Ok(DoubleDataChunk::Uncompressed {
                    offset: *offset,
                    values: merged,
                })
            }
            (
                DoubleDataChunk::Compressed {
                    offset,
                    uncompressed_length,
                    step_values,
                    step_lengths,
                },
                DoubleDataChunk::Compressed {
                    uncompressed_length: other_length,
                    step_values: other_values,
                    step_lengths: other_lengths,
                    ..
                },
            ) => {
                let mut values = step_values.clone();
                let mut lengths = step_lengths.clone();
                for (&value, &len) in other_values.iter().zip(other_lengths.iter()) {
                    match values.last() {
                        Some(&last) if last == value => {
                            *lengths.last_mut().expect("parallel run arrays") += len
                        }
                        _ => {
                            values.push(value);
                            lengths.push(len);
                        }
                    }
                }
                Ok(DoubleDataChunk::Compressed {
                    offset: *offset,
                    uncompressed_length: uncompressed_length + other_length,
                    step_values: values,
                    step_lengths: lengths,
                })
            }
            _ => Err(TimeSeriesError::InvalidArgument(
                "Chunks to append have inconsistent compression".to_string(),
            )),
        }
    }

    /// Writes every element into `buffer` at `base_offset + offset + i`.
    /// Positions outside the chunk's range are left untouched.
    pub fn fill_buffer(&self, buffer: &mut BigDoubleBuffer, base_offset: usize) {
        match self {
            DoubleDataChunk::Uncompressed { offset, values } => {
                for (i, &value) in values.iter().enumerate() {
                    buffer.put(base_offset + offset + i, value);
                }
            }
            DoubleDataChunk::Compressed {
                offset,
                step_values,
                step_lengths,
                ..
            } => {
                let mut position = *offset;
                for (&value, &len) in step_values.iter().zip(step_lengths.iter()) {
                    for i in 0..len {
                        buffer.put(base_offset + position + i, value);
                    }
                    position += len;
                }
            }
        }
    }

    /// Same as [`Self::fill_buffer`] over a plain slice indexed by series
    /// position.
    pub fn fill_array(&self, array: &mut [f64]) {
        match self {
            DoubleDataChunk::Uncompressed { offset, values } => {
                array[*offset..offset + values.len()].copy_from_slice(values);
            }
            DoubleDataChunk::Compressed {
                offset,
                step_values,
                step_lengths,
                ..
            } => {
                let mut position = *offset;
                for (&value, &len) in step_values.iter().zip(step_lengths.iter()) {
                    array[position..position + len].fill(value);
                    position += len;
                }
            }
        }
    }

    /// Streams the chunk as points: one per element for the uncompressed
    /// form, one per run (anchored at the run's first position) for the
    /// compressed form, so iteration cost is proportional to run count.
    pub fn points<'a>(
        &'a self,
        index: &'a TimeSeriesIndex,
    ) -> Box<dyn Iterator<Item = DoublePoint> + 'a> {
        match self {
            DoubleDataChunk::Uncompressed { offset, values } => {
                Box::new(values.iter().enumerate().map(move |(i, &value)| DoublePoint {
                    position: offset + i,
                    time: index.time_at(offset + i),
                    value,
                }))
            }
            DoubleDataChunk::Compressed {
                offset,
                step_values,
                step_lengths,
                ..
            } => {
                let mut position = *offset;
                Box::new(step_values.iter().zip(step_lengths.iter()).map(
                    move |(&value, &len)| {
                        let p = position;
                        position += len;
                        DoublePoint {
                            position: p,
                            time: index.time_at(p),
                            value,
                        }
                    },
                ))
            }
        }
    }

    pub fn write_json(&self, out: &mut String) {
        match self {
            DoubleDataChunk::Uncompressed { offset, values } => {
                out.push_str(&format!("{{\"offset\":{offset},\"values\":["));
                for (i, &value) in values.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    json::write_double(out, value);
                }
                out.push_str("]}");
            }
            DoubleDataChunk::Compressed {
                offset,
                uncompressed_length,
                step_values,
                step_lengths,
            } => {
                out.push_str(&format!(
                    "{{\"offset\":{offset},\"uncompressedLength\":{uncompressed_length},\"stepValues\":["
                ));
                for (i, &value) in step_values.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    json::write_double(out, value);
                }
                out.push_str("],\"stepLengths\":[");
                for (i, &len) in step_lengths.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&len.to_string());
                }
                out.push_str("]}");
            }
        }
    }

    pub fn to_json(&self) -> String {
        let mut out = String::new();
        self.write_json(&mut out);
        out
    }

    pub fn from_json(text: &str) -> Result<Self, TimeSeriesError> {
        Self::from_json_value(&json::parse_value(text)?)
    }

    pub(crate) fn from_json_value(value: &serde_json::Value) -> Result<Self, TimeSeriesError> {
        let object = value
            .as_object()
            .ok_or_else(|| TimeSeriesError::Json("Chunk JSON is not an object".to_string()))?;
        let offset = json::as_usize(json::required(object, "offset", "chunk")?, "offset")?;
        if let Some(values) = object.get("values") {
            let values = parse_double_array(values)?;
            DoubleDataChunk::uncompressed(offset, values)
        } else if object.contains_key("stepValues") {
            let uncompressed_length = json::as_usize(
                json::required(object, "uncompressedLength", "compressed chunk")?,
                "uncompressedLength",
            )?;
            let step_values = parse_double_array(json::required(object, "stepValues", "compressed chunk")?)?;
            let step_lengths = json::required(object, "stepLengths", "compressed chunk")?
                .as_array()
                .ok_or_else(|| TimeSeriesError::Json("'stepLengths' is not an array".to_string()))?
                .iter()
                .map(|v| json::as_usize(v, "stepLengths"))
                .collect::<Result<Vec<_>, _>>()?;
            DoubleDataChunk::compressed(offset, uncompressed_length, step_values, step_lengths)
        } else {
            Err(TimeSeriesError::Json(
                "Chunk JSON holds neither 'values' nor 'stepValues'".to_string(),
            ))
        }
    }

    /// Binary wire encoding (bincode). Round-trips NaN exactly.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TimeSeriesError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TimeSeriesError> {
        let chunk: DoubleDataChunk = bincode::deserialize(bytes)?;
        chunk.validate()?;
        Ok(chunk)
    }

    fn validate(&self) -> Result<(), TimeSeriesError> {
        match self {
            DoubleDataChunk::Uncompressed { values, .. } => {
                if values.is_empty() {
                    return Err(TimeSeriesError::InvalidArgument(
                        "A chunk is expected to hold at least one value".to_string(),
                    ));
                }
                Ok(())
            }
            DoubleDataChunk::Compressed {
                uncompressed_length,
                step_values,
                step_lengths,
                ..
            } => check_compressed_arrays(step_values, step_lengths, *uncompressed_length),
        }
    }
}

fn parse_double_array(value: &serde_json::Value) -> Result<Vec<f64>, TimeSeriesError> {
    value
        .as_array()
        .ok_or_else(|| TimeSeriesError::Json("Numeric values field is not an array".to_string()))?
        .iter()
        .map(|v| {
            if v.is_null() {
                // bare NaN tokens are sanitized to null upstream
                Ok(f64::NAN)
            } else {
                v.as_f64()
                    .ok_or_else(|| TimeSeriesError::Json(format!("Not a number: {v}")))
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// text chunk
// ---------------------------------------------------------------------------

/// A contiguous run of one text series. `None` is the missing-value
/// sentinel; it serializes as JSON `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StringDataChunk {
    Uncompressed {
        offset: usize,
        values: Vec<Option<String>>,
    },
    Compressed {
        offset: usize,
        uncompressed_length: usize,
        step_values: Vec<Option<String>>,
        step_lengths: Vec<usize>,
    },
}

impl StringDataChunk {
    pub fn uncompressed(offset: usize, values: Vec<Option<String>>) -> Result<Self, TimeSeriesError> {
        if values.is_empty() {
            return Err(TimeSeriesError::InvalidArgument(
                "A chunk is expected to hold at least one value".to_string(),
            ));
        }
        Ok(StringDataChunk::Uncompressed { offset, values })
    }

    pub fn compressed(
        offset: usize,
        uncompressed_length: usize,
        step_values: Vec<Option<String>>,
        step_lengths: Vec<usize>,
    ) -> Result<Self, TimeSeriesError> {
        check_compressed_arrays(&step_values, &step_lengths, uncompressed_length)?;
        Ok(StringDataChunk::Compressed {
            offset,
            uncompressed_length,
            step_values,
            step_lengths,
        })
    }

    pub fn offset(&self) -> usize {
        match self {
            StringDataChunk::Uncompressed { offset, .. } => *offset,
            StringDataChunk::Compressed { offset, .. } => *offset,
        }
    }

    pub fn length(&self) -> usize {
        match self {
            StringDataChunk::Uncompressed { values, .. } => values.len(),
            StringDataChunk::Compressed {
                uncompressed_length, ..
            } => *uncompressed_length,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, StringDataChunk::Compressed { .. })
    }

    fn value_bytes(value: &Option<String>) -> usize {
        value.as_ref().map_or(0, |s| s.len())
    }

    pub fn estimated_size(&self) -> usize {
        match self {
            StringDataChunk::Uncompressed { values, .. } => {
                values.iter().map(Self::value_bytes).sum()
            }
            StringDataChunk::Compressed { step_values, .. } => step_values
                .iter()
                .map(|v| Self::value_bytes(v) + RUN_METADATA_BYTES)
                .sum(),
        }
    }

    fn uncompressed_estimated_size(&self) -> usize {
        match self {
            StringDataChunk::Uncompressed { values, .. } => {
                values.iter().map(Self::value_bytes).sum()
            }
            StringDataChunk::Compressed {
                step_values,
                step_lengths,
                ..
            } => step_values
                .iter()
                .zip(step_lengths.iter())
                .map(|(v, &l)| Self::value_bytes(v) * l)
                .sum(),
        }
    }

    pub fn compression_factor(&self) -> f64 {
        self.estimated_size() as f64 / self.uncompressed_estimated_size() as f64
    }

    pub fn try_to_compress(&self) -> CompressionOutcome<StringDataChunk> {
        let (offset, values) = match self {
            StringDataChunk::Compressed { .. } => return CompressionOutcome::Unchanged,
            StringDataChunk::Uncompressed { offset, values } => (*offset, values),
        };
        let mut step_values: Vec<Option<String>> = Vec::new();
        let mut step_lengths: Vec<usize> = Vec::new();
        for value in values {
            match step_values.last() {
                Some(last) if last == value => {
                    *step_lengths.last_mut().expect("parallel run arrays") += 1
                }
                _ => {
                    step_values.push(value.clone());
                    step_lengths.push(1);
                }
            }
        }
        let compressed_size: usize = step_values
            .iter()
            .map(|v| Self::value_bytes(v) + RUN_METADATA_BYTES)
            .sum();
        if compressed_size >= self.estimated_size() {
            return CompressionOutcome::Unchanged;
        }
        CompressionOutcome::Compressed(StringDataChunk::Compressed {
            offset,
            uncompressed_length: values.len(),
            step_values,
            step_lengths,
        })
    }

    pub fn split_at(&self, position: usize) -> Result<(Self, Self), TimeSeriesError> {
        check_split_position(position, self.offset(), self.length())?;
        match self {
            StringDataChunk::Uncompressed { offset, values } => {
                let cut = position - offset;
                Ok((
                    StringDataChunk::Uncompressed {
                        offset: *offset,
                        values: values[..cut].to_vec(),
                    },
                    StringDataChunk::Uncompressed {
                        offset: position,
                        values: values[cut..].to_vec(),
                    },
                ))
            }
            StringDataChunk::Compressed {
                offset,
                uncompressed_length,
                step_values,
                step_lengths,
            } => {
                let mut left_values = Vec::new();
                let mut left_lengths = Vec::new();
                let mut right_values = Vec::new();
                let mut right_lengths = Vec::new();
                let mut run_start = *offset;
                for (value, &len) in step_values.iter().zip(step_lengths.iter()) {
                    let run_end = run_start + len;
                    if run_end <= position {
                        left_values.push(value.clone());
                        left_lengths.push(len);
                    } else if run_start >= position {
                        right_values.push(value.clone());
                        right_lengths.push(len);
                    } else {
                        left_values.push(value.clone());
                        left_lengths.push(position - run_start);
                        right_values.push(value.clone());
                        right_lengths.push(run_end - position);
                    }
                    run_start = run_end;
                }
                Ok((
                    StringDataChunk::Compressed {
                        offset: *offset,
                        uncompressed_length: position - offset,
                        step_values: left_values,
                        step_lengths: left_lengths,
                    },
                    StringDataChunk::Compressed {
                        offset: position,
                        uncompressed_length: offset + uncompressed_length - position,
                        step_values: right_values,
                        step_lengths: right_lengths,
                    },
                ))
            }
        }
    }

    pub fn append(&self, other: &Self) -> Result<Self, TimeSeriesError> {
        if other.offset() != self.offset() + self.length() {
            return Err(TimeSeriesError::InvalidArgument(format!(
                "Chunk at offset {} is not contiguous with chunk ending at {}",
                other.offset(),
                self.offset() + self.length()
            )));
        }
        match (self, other) {
            (
                StringDataChunk::Uncompressed { offset, values },
                StringDataChunk::Uncompressed { values: others, .. },
            ) => {
                let mut merged = values.clone();
                merged.extend_from_slice(others);
                Ok(StringDataChunk::Uncompressed {
                    offset: *offset,
                    values: merged,
                })
            }
            (
                StringDataChunk::Compressed {
                    offset,
                    uncompressed_length,
                    step_values,
                    step_lengths,
                },
                StringDataChunk::Compressed {
                    uncompressed_length: other_length,
                    step_values: other_values,
                    step_lengths: other_lengths,
                    ..
                },
            ) => {
                let mut values = step_values.clone();
                let mut lengths = step_lengths.clone();
                for (value, &len) in other_values.iter().zip(other_lengths.iter()) {
                    match values.last() {
                        Some(last) if last == value => {
                            *lengths.last_mut().expect("parallel run arrays") += len
                        }
                        _ => {
                            values.push(value.clone());
                            lengths.push(len);
                        }
                    }
                }
                Ok(StringDataChunk::Compressed {
                    offset: *offset,
                    uncompressed_length: uncompressed_length + other_length,
                    step_values: values,
                    step_lengths: lengths,
                })
            }
            _ => Err(TimeSeriesError::InvalidArgument(
                "Chunks to append have inconsistent compression".to_string(),
            )),
        }
    }

    pub fn fill_buffer(&self, buffer: &mut BigStringBuffer, base_offset: usize) {
        match self {
            StringDataChunk::Uncompressed { offset, values } => {
                for (i, value) in values.iter().enumerate() {
                    buffer.put_string(base_offset + offset + i, value.as_deref());
                }
            }
            StringDataChunk::Compressed {
                offset,
                step_values,
                step_lengths,
                ..
            } => {
                let mut position = *offset;
                for (value, &len) in step_values.iter().zip(step_lengths.iter()) {
                    for i in 0..len {
                        buffer.put_string(base_offset + position + i, value.as_deref());
                    }
                    position += len;
                }
            }
        }
    }

    pub fn fill_array(&self, array: &mut [Option<String>]) {
        match self {
            StringDataChunk::Uncompressed { offset, values } => {
                array[*offset..offset + values.len()].clone_from_slice(values);
            }
            StringDataChunk::Compressed {
                offset,
                step_values,
                step_lengths,
                ..
            } => {
                let mut position = *offset;
                for (value, &len) in step_values.iter().zip(step_lengths.iter()) {
                    for slot in &mut array[position..position + len] {
                        *slot = value.clone();
                    }
                    position += len;
                }
            }
        }
    }

    pub fn points<'a>(
        &'a self,
        index: &'a TimeSeriesIndex,
    ) -> Box<dyn Iterator<Item = StringPoint> + 'a> {
        match self {
            StringDataChunk::Uncompressed { offset, values } => {
                Box::new(values.iter().enumerate().map(move |(i, value)| StringPoint {
                    position: offset + i,
                    time: index.time_at(offset + i),
                    value: value.clone(),
                }))
            }
            StringDataChunk::Compressed {
                offset,
                step_values,
                step_lengths,
                ..
            } => {
                let mut position = *offset;
                Box::new(step_values.iter().zip(step_lengths.iter()).map(
                    move |(value, &len)| {
                        let p = position;
                        position += len;
                        StringPoint {
                            position: p,
                            time: index.time_at(p),
                            value: value.clone(),
                        }
                    },
                ))
            }
        }
    }

    pub fn write_json(&self, out: &mut String) {
        match self {
            StringDataChunk::Uncompressed { offset, values } => {
                out.push_str(&format!("{{\"offset\":{offset},\"values\":["));
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    json::write_string(out, value.as_deref());
                }
                out.push_str("]}");
            }
            StringDataChunk::Compressed {
                offset,
                uncompressed_length,
                step_values,
                step_lengths,
            } => {
                out.push_str(&format!(
                    "{{\"offset\":{offset},\"uncompressedLength\":{uncompressed_length},\"stepValues\":["
                ));
                for (i, value) in step_values.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    json::write_string(out, value.as_deref());
                }
                out.push_str("],\"stepLengths\":[");
                for (i, &len) in step_lengths.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&len.to_string());
                }
                out.push_str("]}");
            }
        }
    }

    pub fn to_json(&self) -> String {
        let mut out = String::new();
        self.write_json(&mut out);
        out
    }

    pub fn from_json(text: &str) -> Result<Self, TimeSeriesError> {
        Self::from_json_value(&json::parse_value(text)?)
    }

    pub(crate) fn from_json_value(value: &serde_json::Value) -> Result<Self, TimeSeriesError> {
        let object = value
            .as_object()
            .ok_or_else(|| TimeSeriesError::Json("Chunk JSON is not an object".to_string()))?;
        let offset = json::as_usize(json::required(object, "offset", "chunk")?, "offset")?;
        if let Some(values) = object.get("values") {
            let values = parse_string_array(values)?;
            StringDataChunk::uncompressed(offset, values)
        } else if object.contains_key("stepValues") {
            let uncompressed_length = json::as_usize(
                json::required(object, "uncompressedLength", "compressed chunk")?,
                "uncompressedLength",
            )?;
            let step_values = parse_string_array(json::required(object, "stepValues", "compressed chunk")?)?;
            let step_lengths = json::required(object, "stepLengths", "compressed chunk")?
                .as_array()
                .ok_or_else(|| TimeSeriesError::Json("'stepLengths' is not an array".to_string()))?
                .iter()
                .map(|v| json::as_usize(v, "stepLengths"))
                .collect::<Result<Vec<_>, _>>()?;
            StringDataChunk::compressed(offset, uncompressed_length, step_values, step_lengths)
        } else {
            Err(TimeSeriesError::Json(
                "Chunk JSON holds neither 'values' nor 'stepValues'".to_string(),
            ))
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TimeSeriesError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TimeSeriesError> {
        let chunk: StringDataChunk = bincode::deserialize(bytes)?;
        chunk.validate()?;
        Ok(chunk)
    }

    fn validate(&self) -> Result<(), TimeSeriesError> {
        match self {
            StringDataChunk::Uncompressed { values, .. } => {
                if values.is_empty() {
                    return Err(TimeSeriesError::InvalidArgument(
                        "A chunk is expected to hold at least one value".to_string(),
                    ));
                }
                Ok(())
            }
            StringDataChunk::Compressed {
                uncompressed_length,
                step_values,
                step_lengths,
                ..
            } => check_compressed_arrays(step_values, step_lengths, *uncompressed_length),
        }
    }
}

fn parse_string_array(value: &serde_json::Value) -> Result<Vec<Option<String>>, TimeSeriesError> {
    value
        .as_array()
        .ok_or_else(|| TimeSeriesError::Json("Text values field is not an array".to_string()))?
        .iter()
        .map(|v| {
            if v.is_null() {
                Ok(None)
            } else {
                v.as_str()
                    .map(|s| Some(s.to_string()))
                    .ok_or_else(|| TimeSeriesError::Json(format!("Not a string: {v}")))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seven_point_index() -> TimeSeriesIndex {
        TimeSeriesIndex::regular(0, 6000, 1000).unwrap()
    }

    #[test]
    fn compress_merges_runs_and_reports_sizes() {
        let chunk = DoubleDataChunk::uncompressed(1, vec![1.0, 2.0, 2.0, 2.0, 2.0, 3.0]).unwrap();
        assert_eq!(48, chunk.estimated_size());
        let compressed = match chunk.try_to_compress() {
            CompressionOutcome::Compressed(c) => c,
            CompressionOutcome::Unchanged => panic!("compression expected to help"),
        };
        assert_eq!(
            DoubleDataChunk::compressed(1, 6, vec![1.0, 2.0, 3.0], vec![1, 4, 1]).unwrap(),
            compressed
        );
        assert_eq!(36, compressed.estimated_size());
        assert!((compressed.compression_factor() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn compress_gives_up_when_not_smaller() {
        let chunk = DoubleDataChunk::uncompressed(0, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(CompressionOutcome::Unchanged, chunk.try_to_compress());
        // already-compressed input stays unchanged
        let compressed = DoubleDataChunk::compressed(0, 4, vec![5.0], vec![4]).unwrap();
        assert_eq!(CompressionOutcome::Unchanged, compressed.try_to_compress());
    }

    #[test]
    fn compress_never_changes_decompressed_values() {
        let values = vec![1.0, 1.0, 1.0, 2.0, 2.0, 9.0, 9.0, 9.0, 9.0];
        let chunk = DoubleDataChunk::uncompressed(0, values.clone()).unwrap();
        let compressed = chunk.try_to_compress().or_original(chunk.clone());
        let mut array = vec![f64::NAN; values.len()];
        compressed.fill_array(&mut array);
        assert_eq!(values, array);
    }

    #[test]
    fn compressed_construction_validation() {
        assert!(DoubleDataChunk::compressed(0, 3, vec![1.0, 2.0], vec![1]).is_err());
        assert!(DoubleDataChunk::compressed(0, 3, vec![], vec![]).is_err());
        assert!(DoubleDataChunk::compressed(0, 3, vec![1.0, 2.0], vec![0, 3]).is_err());
        assert!(DoubleDataChunk::compressed(0, 5, vec![1.0, 2.0], vec![1, 3]).is_err());
        assert!(DoubleDataChunk::uncompressed(0, vec![]).is_err());
    }

    #[test]
    fn stream_uncompressed_yields_one_point_per_element() {
        let index = seven_point_index();
        let chunk = DoubleDataChunk::uncompressed(2, vec![5.0, 6.0]).unwrap();
        let points: Vec<_> = chunk.points(&index).collect();
        assert_eq!(2, points.len());
        assert_eq!((2, 2000, 5.0), (points[0].position, points[0].time, points[0].value));
        assert_eq!((3, 3000, 6.0), (points[1].position, points[1].time, points[1].value));
    }

    #[test]
    fn stream_compressed_yields_one_point_per_run() {
        let index = seven_point_index();
        let chunk = DoubleDataChunk::compressed(1, 6, vec![1.0, 2.0, 3.0], vec![1, 4, 1]).unwrap();
        let points: Vec<_> = chunk.points(&index).collect();
        assert_eq!(
            vec![(1, 1.0), (2, 2.0), (6, 3.0)],
            points.iter().map(|p| (p.position, p.value)).collect::<Vec<_>>()
        );
        assert_eq!(vec![1000, 2000, 6000], points.iter().map(|p| p.time).collect::<Vec<_>>());
    }

    #[test]
    fn split_uncompressed_recombines_exactly() {
        let chunk = DoubleDataChunk::uncompressed(3, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        for position in 4..7 {
            let (left, right) = chunk.split_at(position).unwrap();
            assert_eq!(3, left.offset());
            assert_eq!(position, right.offset());
            assert_eq!(chunk.length(), left.length() + right.length());
            let mut array = vec![f64::NAN; 7];
            left.fill_array(&mut array);
            right.fill_array(&mut array);
            assert_eq!(vec![1.0, 2.0, 3.0, 4.0], array[3..7].to_vec());
        }
    }

    #[test]
    fn split_compressed_divides_straddling_run() {
        let chunk = DoubleDataChunk::compressed(1, 6, vec![1.0, 2.0, 3.0], vec![1, 4, 1]).unwrap();
        let (left, right) = chunk.split_at(4).unwrap();
        assert_eq!(
            DoubleDataChunk::compressed(1, 3, vec![1.0, 2.0], vec![1, 2]).unwrap(),
            left
        );
        assert_eq!(
            DoubleDataChunk::compressed(4, 3, vec![2.0, 3.0], vec![2, 1]).unwrap(),
            right
        );
        // every valid position recombines to the original values
        for position in 2..7 {
            let (l, r) = chunk.split_at(position).unwrap();
            let mut array = vec![f64::NAN; 7];
            l.fill_array(&mut array);
            r.fill_array(&mut array);
            assert_eq!(vec![1.0, 2.0, 2.0, 2.0, 2.0, 3.0], array[1..7].to_vec());
        }
    }

    #[test]
    fn split_position_bounds_are_exclusive() {
        let chunk = DoubleDataChunk::uncompressed(2, vec![1.0, 2.0]).unwrap();
        assert!(chunk.split_at(2).is_err());
        assert!(chunk.split_at(4).is_err());
        assert!(chunk.split_at(0).is_err());
        assert!(chunk.split_at(3).is_ok());
    }

    #[test]
    fn append_adjacent_chunks() {
        let a = DoubleDataChunk::uncompressed(0, vec![1.0, 2.0]).unwrap();
        let b = DoubleDataChunk::uncompressed(2, vec![3.0]).unwrap();
        assert_eq!(
            DoubleDataChunk::uncompressed(0, vec![1.0, 2.0, 3.0]).unwrap(),
            a.append(&b).unwrap()
        );
        assert!(b.append(&a).is_err());

        let c = DoubleDataChunk::compressed(0, 3, vec![7.0], vec![3]).unwrap();
        let d = DoubleDataChunk::compressed(3, 2, vec![7.0, 8.0], vec![1, 1]).unwrap();
        // the boundary run merges
        assert_eq!(
            DoubleDataChunk::compressed(0, 5, vec![7.0, 8.0], vec![4, 1]).unwrap(),
            c.append(&d).unwrap()
        );
        assert!(a.append(&d).is_err());
    }

    #[test]
    fn json_round_trip_with_nan() {
        let chunk = DoubleDataChunk::uncompressed(1, vec![1.0, f64::NAN, 3.0]).unwrap();
        let json = chunk.to_json();
        assert_eq!(r#"{"offset":1,"values":[1.0,NaN,3.0]}"#, json);
        assert_eq!(chunk, DoubleDataChunk::from_json(&json).unwrap());

        let compressed =
            DoubleDataChunk::compressed(1, 6, vec![1.0, 2.0, 3.0], vec![1, 4, 1]).unwrap();
        let json = compressed.to_json();
        assert_eq!(
            r#"{"offset":1,"uncompressedLength":6,"stepValues":[1.0,2.0,3.0],"stepLengths":[1,4,1]}"#,
            json
        );
        assert_eq!(compressed, DoubleDataChunk::from_json(&json).unwrap());
    }

    #[test]
    fn malformed_chunk_json_fails() {
        assert!(DoubleDataChunk::from_json(r#"{"offset":0}"#).is_err());
        assert!(DoubleDataChunk::from_json(r#"{"values":[1.0]}"#).is_err());
        assert!(DoubleDataChunk::from_json(r#"{"offset":0,"values":["a"]}"#).is_err());
        assert!(DoubleDataChunk::from_json(
            r#"{"offset":0,"uncompressedLength":2,"stepValues":[1.0],"stepLengths":[1,1]}"#
        )
        .is_err());
    }

    #[test]
    fn binary_round_trip_with_nan() {
        let chunk = DoubleDataChunk::uncompressed(4, vec![f64::NAN, 2.0]).unwrap();
        let bytes = chunk.to_bytes().unwrap();
        assert_eq!(chunk, DoubleDataChunk::from_bytes(&bytes).unwrap());
    }

    #[test]
    fn string_chunk_compress_and_split() {
        let chunk = StringDataChunk::uncompressed(
            0,
            vec![
                Some("on".to_string()),
                Some("on".to_string()),
                Some("on".to_string()),
                None,
                Some("off".to_string()),
            ],
        )
        .unwrap();
        let compressed = match chunk.try_to_compress() {
            CompressionOutcome::Compressed(c) => c,
            CompressionOutcome::Unchanged => panic!("compression expected to help"),
        };
        assert_eq!(
            StringDataChunk::compressed(
                0,
                5,
                vec![Some("on".to_string()), None, Some("off".to_string())],
                vec![3, 1, 1]
            )
            .unwrap(),
            compressed
        );
        let (left, right) = compressed.split_at(2).unwrap();
        let mut array: Vec<Option<String>> = vec![None; 5];
        left.fill_array(&mut array);
        right.fill_array(&mut array);
        assert_eq!(Some("on".to_string()), array[0]);
        assert_eq!(Some("on".to_string()), array[2]);
        assert_eq!(None, array[3]);
        assert_eq!(Some("off".to_string()), array[4]);
    }

    #[test]
    fn string_chunk_json_round_trip_with_null() {
        let chunk = StringDataChunk::uncompressed(
            0,
            vec![None, Some("a".to_string()), Some("b\"c".to_string())],
        )
        .unwrap();
        let json = chunk.to_json();
        assert_eq!(r#"{"offset":0,"values":[null,"a","b\"c"]}"#, json);
        assert_eq!(chunk, StringDataChunk::from_json(&json).unwrap());
    }

    #[test]
    fn string_points_anchor_runs() {
        let index = seven_point_index();
        let chunk = StringDataChunk::compressed(
            0,
            4,
            vec![Some("x".to_string()), None],
            vec![3, 1],
        )
        .unwrap();
        let points: Vec<_> = chunk.points(&index).collect();
        assert_eq!(2, points.len());
        assert_eq!(0, points[0].position);
        assert_eq!(Some("x".to_string()), points[0].value);
        assert_eq!(3, points[1].position);
        assert_eq!(None, points[1].value);
    }
}

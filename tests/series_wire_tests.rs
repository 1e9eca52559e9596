use tessera::*;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::sync::Arc;

// Helper resolver backed by a plain map, the way a client library would
// adapt its own store.
struct MapResolver {
    series: HashMap<String, StoredDoubleTimeSeries>,
}

impl MapResolver {
    fn of(series: Vec<StoredDoubleTimeSeries>) -> Arc<Self> {
        Arc::new(MapResolver {
            series: series
                .into_iter()
                .map(|s| (s.name().to_string(), s))
                .collect(),
        })
    }
}

impl TimeSeriesNameResolver for MapResolver {
    fn metadata(&self, names: &[String]) -> Result<Vec<TimeSeriesMetadata>, TimeSeriesError> {
        names
            .iter()
            .map(|n| {
                self.series
                    .get(n)
                    .map(|s| s.metadata().clone())
                    .ok_or_else(|| TimeSeriesError::SeriesNotFound(n.clone()))
            })
            .collect()
    }

    fn data_versions(&self, name: &str) -> Result<BTreeSet<i32>, TimeSeriesError> {
        if self.series.contains_key(name) {
            Ok(BTreeSet::from([1]))
        } else {
            Err(TimeSeriesError::SeriesNotFound(name.to_string()))
        }
    }

    fn double_time_series(
        &self,
        names: &[String],
    ) -> Result<Vec<StoredDoubleTimeSeries>, TimeSeriesError> {
        names
            .iter()
            .map(|n| {
                self.series
                    .get(n)
                    .cloned()
                    .ok_or_else(|| TimeSeriesError::SeriesNotFound(n.clone()))
            })
            .collect()
    }
}

#[test]
fn test_series_list_survives_a_file_round_trip() {
    let index = TimeSeriesIndex::regular(0, 3000, 1000).unwrap();
    let stored =
        StoredDoubleTimeSeries::from_values("load", index.clone(), vec![1.0, f64::NAN, 3.0, 4.0])
            .unwrap();
    let text = StoredStringTimeSeries::from_values(
        "state",
        index,
        vec![Some("on".to_string()), Some("on".to_string()), None, Some("off".to_string())],
    )
    .unwrap();
    let calc = CalculatedTimeSeries::new(
        "double_load",
        NodeCalc::multiply(NodeCalc::time_series_name("load"), NodeCalc::integer(2)),
    );
    let list = vec![
        TimeSeries::Double(stored.clone()),
        TimeSeries::String(text.clone()),
        TimeSeries::Calculated(calc),
    ];

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.json");
    fs::write(&path, series::series_list_to_json(&list)).unwrap();

    let parsed = series::series_list_from_json(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(3, parsed.len());
    match &parsed[0] {
        TimeSeries::Double(s) => assert_eq!(&stored, s),
        other => panic!("numeric series expected, got {other:?}"),
    }
    match &parsed[1] {
        TimeSeries::String(s) => assert_eq!(&text, s),
        other => panic!("text series expected, got {other:?}"),
    }
    match &parsed[2] {
        TimeSeries::Calculated(s) => assert_eq!("double_load", s.name()),
        other => panic!("calculated series expected, got {other:?}"),
    }
}

#[test]
fn test_parsed_calculated_series_evaluates_against_its_dependencies() {
    let index = TimeSeriesIndex::regular(0, 2000, 1000).unwrap();
    let base =
        StoredDoubleTimeSeries::from_values("base", index.clone(), vec![1.0, 2.0, 3.0]).unwrap();
    let json = r#"[{"name":"scaled","expr":{"binaryOp":{"op":"MULTIPLY","left":{"timeSeriesName":"base"},"right":{"integer":3}}}}]"#;

    let parsed = series::series_list_from_json(json).unwrap();
    let mut calc = match parsed.into_iter().next().unwrap() {
        TimeSeries::Calculated(c) => c,
        other => panic!("calculated series expected, got {other:?}"),
    };
    calc.set_resolver(MapResolver::of(vec![base]));
    assert_eq!(index, calc.index().unwrap());
    assert_eq!(vec![3.0, 6.0, 9.0], calc.to_array().unwrap());
    assert_eq!(BTreeSet::from([1]), calc.versions().unwrap());
}

#[test]
fn test_sparse_series_wire_text_keeps_nan_tokens() {
    let index = TimeSeriesIndex::regular(0, 7000, 1000).unwrap();
    let metadata = TimeSeriesMetadata::new("ts1", TimeSeriesDataType::Double, index);
    let series = StoredDoubleTimeSeries::new(
        metadata,
        vec![
            DoubleDataChunk::uncompressed(2, vec![1.0, 2.0]).unwrap(),
            DoubleDataChunk::compressed(5, 3, vec![3.0, 4.0], vec![1, 2]).unwrap(),
        ],
    )
    .unwrap();
    let json = series::series_list_to_json(&[TimeSeries::Double(series.clone())]);
    // a strict emitter cannot write these, a lenient parser must read them
    assert!(json.contains("\"stepValues\":[3.0,4.0]"));
    let parsed = series::series_list_from_json(&json).unwrap();
    match &parsed[0] {
        TimeSeries::Double(s) => {
            let array = s.to_array();
            assert!(array[0].is_nan());
            assert!(array[4].is_nan());
            assert_eq!(vec![1.0, 2.0], array[2..4].to_vec());
            assert_eq!(vec![3.0, 4.0, 4.0], array[5..8].to_vec());
        }
        other => panic!("numeric series expected, got {other:?}"),
    }
}

#[test]
fn test_chunk_binary_form_survives_a_file_round_trip() {
    let chunk = DoubleDataChunk::compressed(1, 6, vec![1.0, f64::NAN, 3.0], vec![1, 4, 1]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chunk.bin");
    fs::write(&path, chunk.to_bytes().unwrap()).unwrap();
    let read = DoubleDataChunk::from_bytes(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(chunk, read);
}

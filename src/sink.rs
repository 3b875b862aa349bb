use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

use camino::Utf8PathBuf;
use serde::Serialize;
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use tempfile::Builder;
use tracing::info;

use crate::error::CensusError;
use crate::geometry::Crs;
use crate::joiner::{JoinedGeometry, JoinedRecord};
use crate::transform::RecordSet;

/// Destination and format parameters handed to a sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkTarget {
    pub name: String,
    pub path: Option<Utf8PathBuf>,
    pub params: BTreeMap<String, String>,
}

impl SinkTarget {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn file(path: impl Into<Utf8PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.file_stem().unwrap_or("records").to_string(),
            path: Some(path),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Accepts a whole record set or nothing.
pub trait RecordSink: Send + Sync {
    fn write(&self, records: &RecordSet, target: &SinkTarget) -> Result<(), CensusError>;
}

/// Keeps written record sets in memory, keyed by target name.
#[derive(Debug, Default)]
pub struct MemorySink {
    written: Mutex<Vec<(String, RecordSet)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> Vec<(String, RecordSet)> {
        self.written
            .lock()
            .map(|written| written.clone())
            .unwrap_or_default()
    }

    pub fn last(&self) -> Option<RecordSet> {
        self.written().pop().map(|(_, records)| records)
    }
}

impl RecordSink for MemorySink {
    fn write(&self, records: &RecordSet, target: &SinkTarget) -> Result<(), CensusError> {
        let mut written = self
            .written
            .lock()
            .map_err(|_| CensusError::SinkWrite("memory sink poisoned".to_string()))?;
        written.push((target.name.clone(), records.clone()));
        Ok(())
    }
}

/// Writes a GeoJSON FeatureCollection, replacing the target file atomically.
/// Set `pretty=true` on the target for indented output.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFileSink;

impl RecordSink for JsonFileSink {
    fn write(&self, records: &RecordSet, target: &SinkTarget) -> Result<(), CensusError> {
        let path = target
            .path
            .as_ref()
            .ok_or_else(|| CensusError::SinkWrite("json sink requires a path".to_string()))?;
        let parent = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| CensusError::SinkWrite(format!("{parent}: {err}")))?;
        let mut temp = Builder::new()
            .prefix(".census-etl")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| CensusError::SinkWrite(err.to_string()))?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            let collection = FeatureCollection(records);
            let encoded = if target.param("pretty") == Some("true") {
                serde_json::to_writer_pretty(&mut writer, &collection)
            } else {
                serde_json::to_writer(&mut writer, &collection)
            };
            encoded.map_err(|err| CensusError::SinkWrite(err.to_string()))?;
            writer
                .flush()
                .map_err(|err| CensusError::SinkWrite(err.to_string()))?;
        }
        temp.persist(path.as_std_path())
            .map_err(|err| CensusError::SinkWrite(format!("{path}: {err}")))?;
        info!(path = %path, records = records.len(), "wrote feature collection");
        Ok(())
    }
}

struct FeatureCollection<'a>(&'a RecordSet);

impl Serialize for FeatureCollection<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let records = self.0;
        let crs = records
            .records()
            .iter()
            .find_map(|record| match &record.geometry {
                JoinedGeometry::Present { crs, .. } => Some(*crs),
                JoinedGeometry::Absent => None,
            });
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", "FeatureCollection")?;
        if let Some(crs) = crs {
            map.serialize_entry("crs", &NamedCrs(crs))?;
        }
        map.serialize_entry("columns", records.columns())?;
        map.serialize_entry("features", &Features(records))?;
        map.end()
    }
}

struct NamedCrs(Crs);

impl Serialize for NamedCrs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let name = format!("urn:ogc:def:crs:EPSG::{}", self.0.code());
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", "name")?;
        map.serialize_entry("properties", &BTreeMap::from([("name", name)]))?;
        map.end()
    }
}

struct Features<'a>(&'a RecordSet);

impl Serialize for Features<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for record in self.0.records() {
            seq.serialize_element(&Feature {
                record,
                columns: self.0.columns(),
            })?;
        }
        seq.end()
    }
}

struct Feature<'a> {
    record: &'a JoinedRecord,
    columns: &'a [String],
}

impl Serialize for Feature<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("type", "Feature")?;
        map.serialize_entry("id", &self.record.geoid)?;
        map.serialize_entry("properties", &Properties(self))?;
        match &self.record.geometry {
            JoinedGeometry::Present { geometry, .. } => map.serialize_entry("geometry", geometry)?,
            JoinedGeometry::Absent => map.serialize_entry("geometry", &())?,
        }
        map.end()
    }
}

struct Properties<'a, 'b>(&'b Feature<'a>);

// Properties follow the declared column order.
impl Serialize for Properties<'_, '_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let record = self.0.record;
        let mut map = serializer.serialize_map(Some(self.0.columns.len() + 2))?;
        map.serialize_entry("GEOID", &record.geoid)?;
        map.serialize_entry("NAME", &record.name)?;
        for column in self.0.columns {
            map.serialize_entry(column, record.get(column))?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    use super::*;
    use crate::domain::Value;
    use crate::geometry::Geometry;

    fn records() -> RecordSet {
        RecordSet::new(
            vec!["pop".to_string(), "rate".to_string()],
            vec![
                JoinedRecord {
                    geoid: "39049".to_string(),
                    name: Some("Franklin County, Ohio".to_string()),
                    values: [
                        ("pop".to_string(), Value::Number(1_300_000.0)),
                        ("rate".to_string(), Value::Undefined),
                    ]
                    .into_iter()
                    .collect(),
                    geometry: JoinedGeometry::Present {
                        geometry: Geometry::Polygon(vec![vec![[0.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]),
                        crs: Crs::WGS84,
                    },
                },
                JoinedRecord {
                    geoid: "39035".to_string(),
                    name: None,
                    values: BTreeMap::new(),
                    geometry: JoinedGeometry::Absent,
                },
            ],
        )
    }

    #[test]
    fn json_sink_writes_feature_collection() {
        let temp = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("out").join("counties.geojson"))
            .unwrap();
        JsonFileSink
            .write(&records(), &SinkTarget::file(path.clone()))
            .unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path.as_std_path()).unwrap()).unwrap();
        assert_eq!(written["type"], "FeatureCollection");
        assert_eq!(written["crs"]["properties"]["name"], "urn:ogc:def:crs:EPSG::4326");
        let features = written["features"].as_array().unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0]["properties"]["rate"], "undefined");
        assert_eq!(features[0]["geometry"]["type"], "Polygon");
        assert!(features[1]["geometry"].is_null());
        assert!(features[1]["properties"]["pop"].is_null());
    }

    #[test]
    fn json_sink_requires_path() {
        let err = JsonFileSink
            .write(&records(), &SinkTarget::named("nowhere"))
            .unwrap_err();
        assert_matches!(err, CensusError::SinkWrite(_));
    }

    #[test]
    fn memory_sink_keeps_sets() {
        let sink = MemorySink::new();
        sink.write(&records(), &SinkTarget::named("first")).unwrap();
        assert_eq!(sink.written()[0].0, "first");
        assert_eq!(sink.last().map(|set| set.len()), Some(2));
    }
}

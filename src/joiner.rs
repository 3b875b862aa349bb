use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::boundaries::{BoundaryFeature, GeometrySource};
use crate::domain::{Row, Value};
use crate::error::CensusError;
use crate::geography::GeographyLevel;
use crate::geometry::{Crs, Geometry, reproject};
use crate::store::BoundaryCache;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum JoinedGeometry {
    Present { geometry: Geometry, crs: Crs },
    Absent,
}

impl JoinedGeometry {
    pub fn is_present(&self) -> bool {
        matches!(self, JoinedGeometry::Present { .. })
    }
}

/// A tabular row after the join, keyed by its GEOID.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinedRecord {
    pub geoid: String,
    pub name: Option<String>,
    pub values: BTreeMap<String, Value>,
    pub geometry: JoinedGeometry,
}

impl JoinedRecord {
    pub fn without_geometry(row: Row) -> Self {
        Self {
            geoid: row.geoid,
            name: row.name,
            values: row.values,
            geometry: JoinedGeometry::Absent,
        }
    }

    pub fn get(&self, column: &str) -> &Value {
        self.values.get(column).unwrap_or(&Value::Missing)
    }

    pub fn has_geometry(&self) -> bool {
        self.geometry.is_present()
    }
}

pub struct GeometryJoiner<G: GeometrySource> {
    source: G,
    cache: BoundaryCache,
}

impl<G: GeometrySource> GeometryJoiner<G> {
    pub fn new(source: G, cache: BoundaryCache) -> Self {
        Self { source, cache }
    }

    pub fn cache(&self) -> &BoundaryCache {
        &self.cache
    }

    pub fn join(
        &self,
        level: GeographyLevel,
        year: u16,
        rows: &[Row],
        target: Crs,
    ) -> Result<Vec<JoinedRecord>, CensusError> {
        let entry = self.cache.lookup_or_fetch(level, year, &self.source)?;
        let records = join_features(&entry.features, rows, target)?;
        let absent = records.iter().filter(|record| !record.has_geometry()).count();
        if absent > 0 {
            warn!(%level, year, absent, "rows without matching boundary retained");
        }
        info!(%level, year, records = records.len(), target = %target, "joined rows to boundaries");
        Ok(records)
    }
}

/// Left join of `rows` onto `features` by GEOID, preserving row order.
pub fn join_features(
    features: &[BoundaryFeature],
    rows: &[Row],
    target: Crs,
) -> Result<Vec<JoinedRecord>, CensusError> {
    let mut index: HashMap<&str, Vec<&BoundaryFeature>> = HashMap::new();
    for feature in features {
        index.entry(feature.geoid.as_str()).or_default().push(feature);
    }

    let mut seen = HashSet::with_capacity(rows.len());
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        if !seen.insert(row.geoid.as_str()) {
            return Err(CensusError::DuplicateJoinKey(row.geoid.clone()));
        }
        let geometry = match index.get(row.geoid.as_str()) {
            Some(matches) => JoinedGeometry::Present {
                geometry: merge_matches(matches, target)?,
                crs: target,
            },
            None => {
                debug!(geoid = %row.geoid, "no boundary for row");
                JoinedGeometry::Absent
            }
        };
        let name = row.name.clone().or_else(|| {
            index
                .get(row.geoid.as_str())
                .and_then(|matches| matches.iter().find_map(|feature| feature.name.clone()))
        });
        records.push(JoinedRecord {
            geoid: row.geoid.clone(),
            name,
            values: row.values.clone(),
            geometry,
        });
    }
    Ok(records)
}

fn merge_matches(matches: &[&BoundaryFeature], target: Crs) -> Result<Geometry, CensusError> {
    let mut merged: Option<Geometry> = None;
    for feature in matches {
        let geometry = reproject(&feature.geometry, feature.crs, target)?;
        merged = Some(match merged {
            Some(existing) => existing.merge(geometry),
            None => geometry,
        });
    }
    merged.ok_or_else(|| CensusError::Geometry("empty boundary match".to_string()))
}

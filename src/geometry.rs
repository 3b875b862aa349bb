//! Boundary geometries and the coordinate references they are declared in.
//!
//! Geometries follow the GeoJSON coordinate layout (`[x, y]` positions,
//! rings of positions, polygons of rings) so cache entries and sink output
//! can embed them directly.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CensusError;

/// Semi-major axis of the WGS 84 ellipsoid, used by spherical Web Mercator.
const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Latitude at which Web Mercator becomes square.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

pub type Position = [f64; 2];
pub type Ring = Vec<Position>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
}

impl Geometry {
    pub fn polygon_count(&self) -> usize {
        match self {
            Geometry::Polygon(_) => 1,
            Geometry::MultiPolygon(polygons) => polygons.len(),
        }
    }

    pub fn into_polygons(self) -> Vec<Vec<Ring>> {
        match self {
            Geometry::Polygon(rings) => vec![rings],
            Geometry::MultiPolygon(polygons) => polygons,
        }
    }

    /// Combines two geometries into one multipolygon, `self` first.
    pub fn merge(self, other: Geometry) -> Geometry {
        let mut polygons = self.into_polygons();
        polygons.extend(other.into_polygons());
        Geometry::MultiPolygon(polygons)
    }

    pub fn try_map_positions<F>(&self, mut f: F) -> Result<Geometry, CensusError>
    where
        F: FnMut(Position) -> Result<Position, CensusError>,
    {
        let mut map_rings = |rings: &Vec<Ring>| -> Result<Vec<Ring>, CensusError> {
            rings
                .iter()
                .map(|ring| {
                    ring.iter()
                        .map(|position| f(*position))
                        .collect::<Result<Ring, _>>()
                })
                .collect()
        };
        match self {
            Geometry::Polygon(rings) => Ok(Geometry::Polygon(map_rings(rings)?)),
            Geometry::MultiPolygon(polygons) => Ok(Geometry::MultiPolygon(
                polygons
                    .iter()
                    .map(&mut map_rings)
                    .collect::<Result<_, _>>()?,
            )),
        }
    }
}

/// EPSG-coded coordinate reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Crs(u32);

impl Crs {
    pub const WGS84: Crs = Crs(4326);
    pub const NAD83: Crs = Crs(4269);
    pub const WEB_MERCATOR: Crs = Crs(3857);

    pub fn epsg(code: u32) -> Self {
        Crs(code)
    }

    pub fn code(self) -> u32 {
        self.0
    }

    pub fn is_supported(self) -> bool {
        matches!(self.0, 4326 | 4269 | 3857)
    }

    fn is_geographic(self) -> bool {
        matches!(self.0, 4326 | 4269)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

/// Accepts `EPSG:4326`, a bare code, OGC URNs and `CRS84`.
impl FromStr for Crs {
    type Err = CensusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let upper = trimmed.to_ascii_uppercase();
        if upper.ends_with("CRS84") {
            return Ok(Crs::WGS84);
        }
        let code = upper
            .strip_prefix("EPSG:")
            .or_else(|| upper.strip_prefix("URN:OGC:DEF:CRS:EPSG::"))
            .or_else(|| upper.strip_prefix("URN:OGC:DEF:CRS:EPSG:"))
            .unwrap_or(&upper);
        code.parse::<u32>()
            .map(Crs)
            .map_err(|_| CensusError::Reprojection {
                from: trimmed.to_string(),
                to: "an EPSG reference".to_string(),
            })
    }
}

impl TryFrom<String> for Crs {
    type Error = CensusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Crs> for String {
    fn from(crs: Crs) -> Self {
        crs.to_string()
    }
}

/// Reprojects `geometry` from `from` to `to`. NAD83 and WGS 84 are treated
/// as coincident.
pub fn reproject(geometry: &Geometry, from: Crs, to: Crs) -> Result<Geometry, CensusError> {
    if !from.is_supported() || !to.is_supported() {
        return Err(CensusError::Reprojection {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    if from == to || (from.is_geographic() && to.is_geographic()) {
        return Ok(geometry.clone());
    }
    if to == Crs::WEB_MERCATOR {
        geometry.try_map_positions(to_web_mercator)
    } else {
        geometry.try_map_positions(|position| Ok(from_web_mercator(position)))
    }
}

/// Forward spherical Mercator of a `[lon, lat]` position in degrees.
pub fn to_web_mercator([lon, lat]: Position) -> Result<Position, CensusError> {
    if !lon.is_finite() || !lat.is_finite() || lat.abs() > 90.0 {
        return Err(CensusError::Geometry(format!(
            "position [{lon}, {lat}] is not a geographic coordinate"
        )));
    }
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    let x = EARTH_RADIUS_M * lon * PI / 180.0;
    let y = EARTH_RADIUS_M * (lat * PI / 180.0).tan().asinh();
    Ok([x, y])
}

pub fn from_web_mercator([x, y]: Position) -> Position {
    let lon = x / EARTH_RADIUS_M * 180.0 / PI;
    let lat = (y / EARTH_RADIUS_M).sinh().atan() * 180.0 / PI;
    [lon, lat]
}

//! Canonical geometry types: cell indexes, regions and the accepted
//! geometry input variants.

pub mod wkb;

use std::fmt;
use std::str::FromStr;

use geo::{Area, BooleanOps, BoundingRect, Intersects};
use geo_types::{Geometry, Polygon, Rect};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Share of a cell's area that must lie inside a region before the cell
/// counts as overlapping it. Filters out cells that only touch an edge.
const OVERLAP_EPSILON: f64 = 1e-6;

/// Opaque 64-bit hexagonal (or planar) grid cell index.
///
/// Displays as lowercase hex, which is the canonical H3 string form and the
/// window identifier written to the output store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(pub u64);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl From<u64> for CellId {
    fn from(v: u64) -> Self {
        CellId(v)
    }
}

impl From<CellId> for u64 {
    fn from(c: CellId) -> Self {
        c.0
    }
}

/// A simple lon/lat polygon the pipeline works on.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    polygon: Polygon<f64>,
    bounds: Rect<f64>,
}

impl Region {
    /// Validates and wraps a polygon.
    ///
    /// Requires finite coordinates, a ring of at least four coordinates and a
    /// positive area.
    pub fn new(polygon: Polygon<f64>) -> Result<Self> {
        if polygon.exterior().0.len() < 4 {
            return Err(PipelineError::UnsupportedGeometry(
                "polygon ring needs at least 4 coordinates".into(),
            ));
        }
        let all_finite = std::iter::once(polygon.exterior())
            .chain(polygon.interiors())
            .flat_map(|ring| ring.0.iter())
            .all(|c| c.x.is_finite() && c.y.is_finite());
        if !all_finite {
            return Err(PipelineError::UnsupportedGeometry(
                "polygon has non-finite coordinates".into(),
            ));
        }
        if polygon.unsigned_area() <= 0.0 {
            return Err(PipelineError::UnsupportedGeometry(
                "polygon has zero area".into(),
            ));
        }
        let bounds = polygon.bounding_rect().ok_or_else(|| {
            PipelineError::UnsupportedGeometry("polygon has no bounding box".into())
        })?;
        Ok(Self { polygon, bounds })
    }

    /// Converts any accepted input variant into a region.
    pub fn from_input(input: GeometryInput) -> Result<Self> {
        match input {
            GeometryInput::Polygon(p) => Self::new(p),
            GeometryInput::Text(text) => Self::from_geometry(parse_text(&text)?),
            GeometryInput::Binary(bytes) => Self::from_geometry(wkb::decode(&bytes)?),
            GeometryInput::Interface(obj) => {
                let geometry = obj.geo_interface().ok_or_else(|| {
                    PipelineError::UnsupportedGeometry(
                        "object does not expose a usable geometry".into(),
                    )
                })?;
                Self::from_geometry(geometry)
            }
        }
    }

    /// Accepts polygons, rectangles and single-member multipolygons.
    pub fn from_geometry(geometry: Geometry<f64>) -> Result<Self> {
        match geometry {
            Geometry::Polygon(p) => Self::new(p),
            Geometry::Rect(r) => Self::new(r.to_polygon()),
            Geometry::MultiPolygon(mp) => {
                let members = mp.0.len();
                match <[Polygon<f64>; 1]>::try_from(mp.0) {
                    Ok([p]) => Self::new(p),
                    Err(_) => Err(PipelineError::UnsupportedGeometry(format!(
                        "multipolygon with {members} members, expected a single polygon"
                    ))),
                }
            }
            other => Err(PipelineError::UnsupportedGeometry(format!(
                "{} is not a polygon",
                geometry_type_name(&other)
            ))),
        }
    }

    pub fn polygon(&self) -> &Polygon<f64> {
        &self.polygon
    }

    pub fn into_polygon(self) -> Polygon<f64> {
        self.polygon
    }

    pub fn bounds(&self) -> Rect<f64> {
        self.bounds
    }

    pub fn area(&self) -> f64 {
        self.polygon.unsigned_area()
    }

    pub fn to_wkb(&self) -> Vec<u8> {
        wkb::encode_polygon(&self.polygon)
    }

    /// Returns `true` when `other` shares interior area with this region,
    /// not just a boundary.
    pub fn overlaps(&self, other: &Polygon<f64>) -> bool {
        if !self.polygon.intersects(other) {
            return false;
        }
        let shared = self.polygon.intersection(other).unsigned_area();
        shared > other.unsigned_area() * OVERLAP_EPSILON
    }
}

/// Anything that can hand out its geometry, the way GeoJSON objects do.
pub trait GeoInterface {
    fn geo_interface(&self) -> Option<Geometry<f64>>;
}

impl GeoInterface for Geometry<f64> {
    fn geo_interface(&self) -> Option<Geometry<f64>> {
        Some(self.clone())
    }
}

impl GeoInterface for geojson::Geometry {
    fn geo_interface(&self) -> Option<Geometry<f64>> {
        Geometry::<f64>::try_from(self.clone()).ok()
    }
}

impl GeoInterface for geojson::Feature {
    fn geo_interface(&self) -> Option<Geometry<f64>> {
        self.geometry.as_ref().and_then(|g| g.geo_interface())
    }
}

impl GeoInterface for geojson::GeoJson {
    fn geo_interface(&self) -> Option<Geometry<f64>> {
        match self {
            geojson::GeoJson::Geometry(g) => g.geo_interface(),
            geojson::GeoJson::Feature(f) => f.geo_interface(),
            geojson::GeoJson::FeatureCollection(fc) if fc.features.len() == 1 => {
                fc.features[0].geo_interface()
            }
            geojson::GeoJson::FeatureCollection(_) => None,
        }
    }
}

/// The closed set of inputs a region can be built from.
pub enum GeometryInput {
    /// An already constructed polygon.
    Polygon(Polygon<f64>),
    /// GeoJSON (starting with `{`) or WKT text.
    Text(String),
    /// WKB or PostGIS EWKB bytes.
    Binary(Vec<u8>),
    /// An object exposing its geometry through [`GeoInterface`].
    Interface(Box<dyn GeoInterface + Send + Sync>),
}

impl GeometryInput {
    /// Maps a JSON configuration value: strings are text, objects GeoJSON.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(s) => Ok(GeometryInput::Text(s)),
            serde_json::Value::Object(_) => {
                let gj = geojson::GeoJson::from_json_value(value)
                    .map_err(|e| PipelineError::UnsupportedGeometry(e.to_string()))?;
                Ok(GeometryInput::Interface(Box::new(gj)))
            }
            other => Err(PipelineError::UnsupportedGeometry(format!(
                "cannot read a geometry from JSON {other}"
            ))),
        }
    }
}

fn parse_text(text: &str) -> Result<Geometry<f64>> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        let gj = geojson::GeoJson::from_str(trimmed)
            .map_err(|e| PipelineError::UnsupportedGeometry(format!("GeoJSON: {e}")))?;
        return gj.geo_interface().ok_or_else(|| {
            PipelineError::UnsupportedGeometry("GeoJSON carries no single geometry".into())
        });
    }
    wkt::Wkt::<f64>::from_str(trimmed)
        .map_err(|e| PipelineError::UnsupportedGeometry(format!("WKT: {e}")))
        .and_then(|w| {
            w.try_into().map_err(|e: wkt::conversion::Error| {
                PipelineError::UnsupportedGeometry(format!("WKT: {e:?}"))
            })
        })
}

fn geometry_type_name(g: &Geometry<f64>) -> &'static str {
    match g {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
        #[allow(unreachable_patterns)]
        _ => "Geometry",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{point, polygon};

    const AOI: &str = r#"{ "type": "Polygon", "coordinates": [ [ [ 11.08, 47.97 ], [ 11.28, 47.97 ], [ 11.28, 48.09 ], [ 11.08, 48.09 ], [ 11.08, 47.97 ] ] ] }"#;

    fn unit_square() -> Polygon<f64> {
        polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)]
    }

    #[test]
    fn test_cell_id_displays_as_hex() {
        assert_eq!(CellId(0x8a1fb46622dffff).to_string(), "8a1fb46622dffff");
    }

    #[test]
    fn test_region_from_geojson_text() {
        let region = Region::from_input(GeometryInput::Text(AOI.to_string())).unwrap();
        let b = region.bounds();
        assert_eq!(b.min().x, 11.08);
        assert_eq!(b.max().y, 48.09);
    }

    #[test]
    fn test_region_from_wkt_text() {
        let region = Region::from_input(GeometryInput::Text(
            "POLYGON((0 0, 2 0, 2 2, 0 2, 0 0))".into(),
        ))
        .unwrap();
        assert_eq!(region.area(), 4.0);
    }

    #[test]
    fn test_region_from_wkb_and_interface_agree() {
        let from_binary =
            Region::from_input(GeometryInput::Binary(wkb::encode_polygon(&unit_square()))).unwrap();
        let gj: geojson::GeoJson = AOI.parse().unwrap();
        let from_interface = Region::from_input(GeometryInput::Interface(Box::new(gj))).unwrap();

        assert_eq!(from_binary.area(), 1.0);
        assert_eq!(from_interface.bounds().min().x, 11.08);
    }

    #[test]
    fn test_region_from_wkb_with_impossible_point_count() {
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Region::from_input(GeometryInput::Binary(bytes)),
            Err(PipelineError::UnsupportedGeometry(_))
        ));
    }

    #[test]
    fn test_json_config_value_variants() {
        let value: serde_json::Value = serde_json::from_str(AOI).unwrap();
        assert!(Region::from_input(GeometryInput::from_json(value).unwrap()).is_ok());
        assert!(GeometryInput::from_json(serde_json::json!(42)).is_err());
    }

    #[test]
    fn test_unsupported_geometries() {
        let point = Geometry::Point(point!(x: 1.0, y: 2.0));
        assert!(matches!(
            Region::from_geometry(point),
            Err(PipelineError::UnsupportedGeometry(_))
        ));

        let degenerate = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0), (x: 2.0, y: 2.0)];
        assert!(Region::new(degenerate).is_err());

        assert!(Region::from_input(GeometryInput::Text("not a geometry".into())).is_err());
    }

    #[test]
    fn test_overlaps_ignores_shared_edges() {
        let region = Region::new(unit_square()).unwrap();
        let neighbour = polygon![(x: 1.0, y: 0.0), (x: 2.0, y: 0.0), (x: 2.0, y: 1.0), (x: 1.0, y: 1.0)];
        let straddling = polygon![(x: 0.5, y: 0.0), (x: 1.5, y: 0.0), (x: 1.5, y: 1.0), (x: 0.5, y: 1.0)];

        assert!(!region.overlaps(&neighbour));
        assert!(region.overlaps(&straddling));
    }
}

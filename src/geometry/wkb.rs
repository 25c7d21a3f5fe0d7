//! Minimal (E)WKB codec for polygons.
//!
//! Encoding always writes little-endian 2D WKB polygons. Decoding accepts
//! both byte orders, the PostGIS EWKB SRID flag, polygons and multipolygons.

use geo_types::{Coord, Geometry, LineString, MultiPolygon, Polygon};

use crate::error::{PipelineError, Result};

const WKB_POLYGON: u32 = 3;
const WKB_MULTIPOLYGON: u32 = 6;
const EWKB_SRID_FLAG: u32 = 0x2000_0000;
const EWKB_TYPE_MASK: u32 = 0x0000_ffff;

/// Encodes a polygon as little-endian WKB.
pub fn encode_polygon(polygon: &Polygon<f64>) -> Vec<u8> {
    let rings: Vec<&LineString<f64>> = std::iter::once(polygon.exterior())
        .chain(polygon.interiors().iter())
        .collect();
    let points: usize = rings.iter().map(|r| r.0.len()).sum();

    let mut out = Vec::with_capacity(9 + rings.len() * 4 + points * 16);
    out.push(1u8);
    out.extend_from_slice(&WKB_POLYGON.to_le_bytes());
    out.extend_from_slice(&(rings.len() as u32).to_le_bytes());
    for ring in rings {
        out.extend_from_slice(&(ring.0.len() as u32).to_le_bytes());
        for c in &ring.0 {
            out.extend_from_slice(&c.x.to_le_bytes());
            out.extend_from_slice(&c.y.to_le_bytes());
        }
    }
    out
}

/// Decodes a WKB or EWKB polygon/multipolygon.
pub fn decode(bytes: &[u8]) -> Result<Geometry<f64>> {
    let mut reader = Reader { bytes, pos: 0 };
    let geometry = reader.geometry()?;
    if reader.pos != bytes.len() {
        return Err(PipelineError::UnsupportedGeometry(format!(
            "{} trailing bytes after WKB geometry",
            bytes.len() - reader.pos
        )));
    }
    Ok(geometry)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| PipelineError::UnsupportedGeometry("truncated WKB".into()))?;
        self.pos = end;
        let mut buf = [0u8; N];
        buf.copy_from_slice(slice);
        Ok(buf)
    }

    fn u32(&mut self, little: bool) -> Result<u32> {
        let b = self.take::<4>()?;
        Ok(if little {
            u32::from_le_bytes(b)
        } else {
            u32::from_be_bytes(b)
        })
    }

    fn f64(&mut self, little: bool) -> Result<f64> {
        let b = self.take::<8>()?;
        Ok(if little {
            f64::from_le_bytes(b)
        } else {
            f64::from_be_bytes(b)
        })
    }

    /// Reads an element count, rejecting counts the remaining bytes cannot
    /// hold at `min_size` bytes per element.
    fn count(&mut self, little: bool, min_size: usize, what: &str) -> Result<usize> {
        let n = self.u32(little)? as usize;
        let left = self.bytes.len() - self.pos;
        if n.saturating_mul(min_size) > left {
            return Err(PipelineError::UnsupportedGeometry(format!(
                "WKB declares {n} {what} but only {left} bytes remain"
            )));
        }
        Ok(n)
    }

    /// Reads the byte-order marker and type, skipping an EWKB SRID.
    fn header(&mut self) -> Result<(bool, u32)> {
        let little = match self.take::<1>()?[0] {
            0 => false,
            1 => true,
            other => {
                return Err(PipelineError::UnsupportedGeometry(format!(
                    "invalid WKB byte order marker {other}"
                )));
            }
        };
        let raw_type = self.u32(little)?;
        if raw_type & EWKB_SRID_FLAG != 0 {
            self.u32(little)?;
        }
        Ok((little, raw_type & EWKB_TYPE_MASK))
    }

    fn geometry(&mut self) -> Result<Geometry<f64>> {
        let (little, kind) = self.header()?;
        match kind {
            WKB_POLYGON => Ok(Geometry::Polygon(self.polygon_body(little)?)),
            WKB_MULTIPOLYGON => {
                let n = self.count(little, 9, "polygons")?;
                let mut polygons = Vec::with_capacity(n);
                for _ in 0..n {
                    let (inner_little, inner_kind) = self.header()?;
                    if inner_kind != WKB_POLYGON {
                        return Err(PipelineError::UnsupportedGeometry(format!(
                            "multipolygon member of WKB type {inner_kind}"
                        )));
                    }
                    polygons.push(self.polygon_body(inner_little)?);
                }
                Ok(Geometry::MultiPolygon(MultiPolygon::new(polygons)))
            }
            other => Err(PipelineError::UnsupportedGeometry(format!(
                "WKB geometry type {other} is not a polygon"
            ))),
        }
    }

    fn polygon_body(&mut self, little: bool) -> Result<Polygon<f64>> {
        let n_rings = self.count(little, 4, "rings")?;
        let mut rings = Vec::with_capacity(n_rings);
        for _ in 0..n_rings {
            let n_points = self.count(little, 16, "points")?;
            let mut coords = Vec::with_capacity(n_points);
            for _ in 0..n_points {
                let x = self.f64(little)?;
                let y = self.f64(little)?;
                coords.push(Coord { x, y });
            }
            rings.push(LineString::new(coords));
        }
        let mut rings = rings.into_iter();
        let exterior = rings
            .next()
            .ok_or_else(|| PipelineError::UnsupportedGeometry("polygon without rings".into()))?;
        Ok(Polygon::new(exterior, rings.collect()))
    }
}

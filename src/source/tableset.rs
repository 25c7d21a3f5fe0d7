//! Tableset discovery, query templates and uncompaction.
//!
//! A tableset is a family of tables sharing a base name, one per grid
//! resolution:
//!
//! ```text
//! water_coverage_10_base        full-resolution rows at resolution 10
//! water_coverage_06_compacted   rows stored against coarser ancestor cells
//! ```
//!
//! A query at resolution `R` reads the base table at `R` and every compacted
//! table at a coarser resolution, combined with `union all`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::debug;

use super::{Observation, QueryPart, SelectQuery};
use crate::error::{PipelineError, Result};
use crate::geometry::CellId;
use crate::grid::GridIndexer;

pub const TABLE_PLACEHOLDER: &str = "<[table]>";
pub const CELLS_PLACEHOLDER: &str = "<[h3indexes]>";

pub const DEFAULT_FETCH_TEMPLATE: &str = "select h3index, scene_id, recorded_at, \
     area_percent_water_class_090_100, area_percent_water_class_080_090, \
     area_percent_water_class_070_080 \
     from <[table]> where h3index in <[h3indexes]>";

pub const DEFAULT_PREFETCH_TEMPLATE: &str = "select h3index from <[table]> where h3index in <[h3indexes]>";

/// A single table name decomposed into its tableset parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub basename: String,
    pub resolution: u8,
    pub compacted: bool,
}

impl Table {
    /// Parses `<basename>_<rr>_base` or `<basename>_<rr>_compacted`.
    pub fn parse(name: &str) -> Option<Self> {
        let mut pieces = name.rsplitn(3, '_');
        let kind = pieces.next()?;
        let rr = pieces.next()?;
        let basename = pieces.next()?;

        let compacted = match kind {
            "base" => false,
            "compacted" => true,
            _ => return None,
        };
        if rr.len() != 2 || !rr.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if !is_identifier(basename) {
            return None;
        }
        Some(Self {
            basename: basename.to_string(),
            resolution: rr.parse().ok()?,
            compacted,
        })
    }

    pub fn name(&self) -> String {
        let kind = if self.compacted { "compacted" } else { "base" };
        format!("{}_{:02}_{}", self.basename, self.resolution, kind)
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, the identifiers accepted as table names.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The tables available for one base name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSet {
    basename: String,
    base_resolutions: BTreeSet<u8>,
    compacted_resolutions: BTreeSet<u8>,
}

impl TableSet {
    pub fn new(basename: impl Into<String>) -> Self {
        Self {
            basename: basename.into(),
            ..Default::default()
        }
    }

    pub fn with_base(mut self, resolution: u8) -> Self {
        self.base_resolutions.insert(resolution);
        self
    }

    pub fn with_compacted(mut self, resolution: u8) -> Self {
        self.compacted_resolutions.insert(resolution);
        self
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub fn base_resolutions(&self) -> &BTreeSet<u8> {
        &self.base_resolutions
    }

    pub fn compacted_resolutions(&self) -> &BTreeSet<u8> {
        &self.compacted_resolutions
    }

    pub fn has_base(&self, resolution: u8) -> bool {
        self.base_resolutions.contains(&resolution)
    }

    /// Finest base resolution not finer than `resolution`.
    pub fn base_at_or_above(&self, resolution: u8) -> Option<u8> {
        self.base_resolutions.range(..=resolution).next_back().copied()
    }

    fn table_name(&self, resolution: u8, compacted: bool) -> String {
        Table {
            basename: self.basename.clone(),
            resolution,
            compacted,
        }
        .name()
    }

    /// Renders `template` for `cells`, which must all share one resolution.
    pub fn build_select_query<G: GridIndexer + ?Sized>(
        &self,
        grid: &G,
        cells: &[CellId],
        template: &QueryTemplate,
    ) -> Result<SelectQuery> {
        let Some(first) = cells.first() else {
            return Err(PipelineError::Query("query for an empty cell set".into()));
        };
        let resolution = grid.resolution(*first)?;
        for cell in cells {
            if grid.resolution(*cell)? != resolution {
                return Err(PipelineError::Query(format!(
                    "mixed resolutions in one query: {first} and {cell}"
                )));
            }
        }
        if !self.has_base(resolution) {
            return Err(PipelineError::Query(format!(
                "tableset {} has no base table at resolution {resolution}",
                self.basename
            )));
        }

        let mut parts = Vec::new();
        for &r in self.compacted_resolutions.range(..resolution) {
            let parents = cells
                .iter()
                .map(|c| grid.parent(*c, r))
                .collect::<Result<BTreeSet<_>>>()?;
            let parents: Vec<CellId> = parents.into_iter().collect();
            let table = self.table_name(r, true);
            let sql = template.render(&table, &parents)?;
            parts.push(QueryPart {
                table,
                resolution: r,
                cells: parents,
                sql,
            });
        }

        let table = self.table_name(resolution, false);
        let sql = template.render(&table, cells)?;
        parts.push(QueryPart {
            table,
            resolution,
            cells: cells.to_vec(),
            sql,
        });
        Ok(SelectQuery::new(parts))
    }
}

/// Groups table names into tablesets keyed by base name. Names that do not
/// follow the tableset convention are ignored.
pub fn find_tablesets<T: AsRef<str>>(names: &[T]) -> BTreeMap<String, TableSet> {
    let mut sets: BTreeMap<String, TableSet> = BTreeMap::new();
    for name in names {
        let Some(table) = Table::parse(name.as_ref()) else {
            continue;
        };
        let set = sets
            .entry(table.basename.clone())
            .or_insert_with(|| TableSet::new(table.basename.clone()));
        if table.compacted {
            set.compacted_resolutions.insert(table.resolution);
        } else {
            set.base_resolutions.insert(table.resolution);
        }
    }
    sets
}

/// SQL text with `<[table]>`, `<[h3indexes]>` and caller parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    text: String,
    params: BTreeMap<String, String>,
}

impl QueryTemplate {
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        for placeholder in [TABLE_PLACEHOLDER, CELLS_PLACEHOLDER] {
            if !text.contains(placeholder) {
                return Err(PipelineError::Query(format!(
                    "query template is missing the {placeholder} placeholder"
                )));
            }
        }
        Ok(Self {
            text,
            params: BTreeMap::new(),
        })
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn render(&self, table: &str, cells: &[CellId]) -> Result<String> {
        let mut sql = self
            .text
            .replace(TABLE_PLACEHOLDER, table)
            .replace(CELLS_PLACEHOLDER, &array_literal(cells));
        for (name, value) in &self.params {
            sql = sql.replace(&format!("<[{name}]>"), value);
        }

        let unresolved = unresolved_params(&sql);
        if !unresolved.is_empty() {
            return Err(PipelineError::Query(format!(
                "unresolved query parameters: {}",
                unresolved.join(", ")
            )));
        }
        Ok(sql)
    }
}

/// Renders cells as a ClickHouse array literal, e.g. `[1,2,3]`.
pub fn array_literal(cells: &[CellId]) -> String {
    let joined = cells
        .iter()
        .map(|c| c.0.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("[{joined}]")
}

fn unresolved_params(sql: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = sql;
    while let Some(start) = rest.find("<[") {
        let after = &rest[start + 2..];
        match after.find("]>") {
            Some(end) => {
                found.push(after[..end].to_string());
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    found
}

/// Maps rows onto the `queried` cells.
///
/// Rows already at a queried cell are kept. Rows stored against a coarser
/// ancestor are copied onto every queried descendant. Anything else is
/// dropped.
pub fn uncompact<G: GridIndexer + ?Sized>(
    grid: &G,
    rows: Vec<Observation>,
    queried: &[CellId],
) -> Result<Vec<Observation>> {
    let Some(first) = queried.first() else {
        return Ok(Vec::new());
    };
    let target = grid.resolution(*first)?;
    let wanted: HashSet<CellId> = queried.iter().copied().collect();
    let mut by_parent: HashMap<u8, HashMap<CellId, Vec<CellId>>> = HashMap::new();

    let mut out = Vec::with_capacity(rows.len());
    let mut dropped = 0usize;
    for row in rows {
        if wanted.contains(&row.cell) {
            out.push(row);
            continue;
        }
        let r = grid.resolution(row.cell)?;
        if r >= target {
            dropped += 1;
            continue;
        }
        if !by_parent.contains_key(&r) {
            let mut index: HashMap<CellId, Vec<CellId>> = HashMap::new();
            for cell in queried {
                index.entry(grid.parent(*cell, r)?).or_default().push(*cell);
            }
            by_parent.insert(r, index);
        }
        match by_parent.get(&r).and_then(|index| index.get(&row.cell)) {
            Some(children) => {
                for child in children {
                    out.push(Observation {
                        cell: *child,
                        ..row.clone()
                    });
                }
            }
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        debug!(dropped, "Dropped rows outside the queried cells");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::QuadGrid;
    use crate::source::WaterCoverage;
    use chrono::{TimeZone, Utc};
    use geo_types::{Coord, Rect};

    fn grid() -> QuadGrid {
        QuadGrid::new(Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 }))
    }

    fn obs(cell: CellId) -> Observation {
        Observation {
            scene_id: "s1".into(),
            cell,
            recorded_at: Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap(),
            coverage: WaterCoverage::new(1.0, 0.0, 0.0),
        }
    }

    #[test]
    fn test_find_tablesets_groups_by_basename() {
        let names = [
            "water_10_base",
            "water_06_compacted",
            "water_08_base",
            "other_03_base",
            "water_1_base",
            "water_10_raw",
            "system_log",
        ];
        let sets = find_tablesets(&names[..]);

        assert_eq!(sets.len(), 2);
        let water = &sets["water"];
        assert_eq!(water.base_resolutions().iter().copied().collect::<Vec<_>>(), vec![8, 10]);
        assert!(water.compacted_resolutions().contains(&6));
        assert_eq!(water.base_at_or_above(9), Some(8));
        assert_eq!(water.base_at_or_above(7), None);
    }

    #[test]
    fn test_table_name_round_trip() {
        let t = Table::parse("water_coverage_05_compacted").unwrap();
        assert_eq!(t.basename, "water_coverage");
        assert_eq!(t.resolution, 5);
        assert!(t.compacted);
        assert_eq!(t.name(), "water_coverage_05_compacted");
    }

    #[test]
    fn test_template_requires_placeholders() {
        assert!(QueryTemplate::new("select * from <[table]>").is_err());
        assert!(QueryTemplate::new(DEFAULT_FETCH_TEMPLATE).is_ok());
    }

    #[test]
    fn test_template_params_and_unresolved() {
        let template = QueryTemplate::new(
            "select * from <[table]> where h3index in <[h3indexes]> and recorded_at > '<[since]>'",
        )
        .unwrap();
        let err = template.render("t", &[CellId(1)]).unwrap_err();
        assert!(err.to_string().contains("since"));

        let template = template.with_params(BTreeMap::from([(
            "since".to_string(),
            "2021-01-01".to_string(),
        )]));
        let sql = template.render("t", &[CellId(1), CellId(2)]).unwrap();
        assert_eq!(
            sql,
            "select * from t where h3index in [1,2] and recorded_at > '2021-01-01'"
        );
    }

    #[test]
    fn test_select_query_unions_compacted_tables() {
        let g = grid();
        let set = TableSet::new("water")
            .with_base(3)
            .with_compacted(1)
            .with_compacted(3);
        let template = QueryTemplate::new("select * from <[table]> where h3index in <[h3indexes]>").unwrap();
        let cells = g.children(g.cell_at(2, 0, 0), 3).unwrap();

        let query = set.build_select_query(&g, &cells, &template).unwrap();
        assert_eq!(query.parts().len(), 2);
        assert_eq!(query.parts()[0].table, "water_01_compacted");
        assert_eq!(query.parts()[0].cells, vec![g.cell_at(1, 0, 0)]);
        assert_eq!(query.parts()[1].table, "water_03_base");
        assert!(query.sql().contains(" union all "));

        assert!(set.build_select_query(&g, &[g.cell_at(2, 0, 0)], &template).is_err());
        assert!(set.build_select_query(&g, &[], &template).is_err());
    }

    #[test]
    fn test_uncompact_expands_coarse_rows() {
        let g = grid();
        let queried = g.children(g.cell_at(2, 0, 0), 3).unwrap();
        let rows = vec![
            obs(queried[0]),
            obs(g.cell_at(1, 0, 0)),
            obs(g.cell_at(1, 1, 1)),
            obs(g.cell_at(3, 7, 7)),
        ];

        let out = uncompact(&g, rows, &queried).unwrap();
        assert_eq!(out.len(), 1 + queried.len());
        assert!(out.iter().all(|o| queried.contains(&o.cell)));
    }
}

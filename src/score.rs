//! Scorer and classifier.

use std::collections::{BTreeMap, BTreeSet};

use crate::gapfill::JoinedRow;
use crate::geometry::CellId;
use crate::source::WaterCoverage;

/// Weight of each certainty class in a row's water certainty.
static WEIGHTS: &[(&str, f64)] = &[
    ("class_90_100", 1.5),
    ("class_80_90", 0.85),
    ("class_70_80", 0.75),
];

fn weighted(coverage: &WaterCoverage) -> f64 {
    let values = [coverage.class_90_100, coverage.class_80_90, coverage.class_70_80];
    WEIGHTS.iter().zip(values).map(|((_, w), v)| w * v).sum()
}

/// Mean weighted water certainty per cell over all of its rows.
pub fn cell_scores(rows: &[JoinedRow]) -> BTreeMap<CellId, f64> {
    let mut sums: BTreeMap<CellId, (f64, usize)> = BTreeMap::new();
    for row in rows {
        let entry = sums.entry(row.cell).or_insert((0.0, 0));
        entry.0 += weighted(&row.coverage);
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(cell, (sum, n))| (cell, sum / n as f64))
        .collect()
}

/// Cells whose mean certainty reaches `threshold`.
pub fn score_and_classify(rows: &[JoinedRow], threshold: f64) -> BTreeSet<CellId> {
    cell_scores(rows)
        .into_iter()
        .filter(|(_, score)| *score >= threshold)
        .map(|(cell, _)| cell)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};

    fn row(cell: u64, day: u32, coverage: WaterCoverage) -> JoinedRow {
        JoinedRow {
            scene_id: format!("s{day}"),
            cell: CellId(cell),
            recorded_at: Utc.with_ymd_and_hms(2021, 6, day, 0, 0, 0).unwrap(),
            coverage,
            matched: true,
        }
    }

    #[test]
    fn test_weighted_mean_per_cell() {
        let rows = vec![
            row(1, 1, WaterCoverage::new(0.9, 0.0, 0.0)),
            row(2, 1, WaterCoverage::new(0.0, 0.5, 0.0)),
            row(2, 2, WaterCoverage::default()),
            row(3, 1, WaterCoverage::new(0.2, 0.4, 0.6)),
        ];
        let scores = cell_scores(&rows);

        assert_relative_eq!(scores[&CellId(1)], 1.35, epsilon = 1e-12);
        assert_relative_eq!(scores[&CellId(2)], 0.2125, epsilon = 1e-12);
        assert_relative_eq!(scores[&CellId(3)], 1.09, epsilon = 1e-12);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let rows = vec![
            row(1, 1, WaterCoverage::new(0.0, 0.0, 0.8 / 0.75)),
            row(2, 1, WaterCoverage::new(0.5, 0.0, 0.0)),
        ];
        let positive = score_and_classify(&rows, 0.75);
        assert_eq!(positive, BTreeSet::from([CellId(1), CellId(2)]));
        assert!(score_and_classify(&rows, 0.81).is_empty());
    }

    #[test]
    fn test_order_independent() {
        let mut rows = vec![
            row(1, 1, WaterCoverage::new(0.9, 0.0, 0.0)),
            row(1, 2, WaterCoverage::new(0.1, 0.3, 0.0)),
            row(2, 1, WaterCoverage::new(0.4, 0.0, 0.2)),
            row(2, 3, WaterCoverage::new(0.0, 0.0, 0.0)),
        ];
        let forward = cell_scores(&rows);
        rows.reverse();
        let backward = cell_scores(&rows);
        for (cell, score) in &forward {
            assert_relative_eq!(*score, backward[cell], epsilon = 1e-12);
        }
        assert_eq!(score_and_classify(&rows, 0.5), BTreeSet::from([CellId(1)]));
    }
}

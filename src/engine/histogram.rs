//! Per-population feature histograms and 2D density contour maps.
//!
//! Both pipelines fetch every scaled column before dispatch, then run one
//! pool task per (feature, population) or (feature pair, population) and
//! reduce the results into nested maps. A failing task fails the batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;
use rayon::prelude::*;

use super::{Engine, value_at};
use crate::data::model::{ObjectId, PopulationId};
use crate::data::params::{ExemplarSet, FeatureSet};
use crate::error::{EngineError, Result};

/// Counts per bin, index = bin.
pub type Histogram = Vec<u64>;

/// Feature → population → histogram.
pub type FeatureHistograms = BTreeMap<String, BTreeMap<PopulationId, Histogram>>;

/// Square grid of contour levels, `grid[x_bin][y_bin]`.
pub type LevelGrid = Vec<Vec<u8>>;

/// Feature x → feature y → population → contour grid.
pub type ContourMatrix = BTreeMap<String, BTreeMap<String, BTreeMap<PopulationId, LevelGrid>>>;

// ---------------------------------------------------------------------------
// Pure kernels
// ---------------------------------------------------------------------------

/// Bucket of a scaled value among `bins` equal-width buckets over `[0, 1]`.
/// `1.0` lands in the last bucket. `None` for non-finite values.
pub fn bin_index(value: f64, bins: usize) -> Option<usize> {
    if !value.is_finite() {
        return None;
    }
    let scaled = (value * bins as f64).floor().max(0.0) as usize;
    Some(scaled.min(bins - 1))
}

/// Histogram of `column` restricted to `objects`. Non-finite values are
/// skipped.
pub fn histogram(column: &[f64], objects: &[ObjectId], bins: usize) -> Result<Histogram> {
    let mut counts = vec![0u64; bins];
    for &object in objects {
        if let Some(bin) = bin_index(value_at(column, object)?, bins) {
            counts[bin] += 1;
        }
    }
    Ok(counts)
}

/// Logarithmic density tier: `ln(count) / 2 + 1`, truncated; 0 when empty.
pub fn density_level(count: u64) -> u8 {
    if count == 0 {
        0
    } else {
        ((count as f64).ln() / 2.0 + 1.0) as u8
    }
}

/// Grey-scale erosion with a 3×3 footprint; cells outside the grid read
/// as 0.
pub fn grey_erosion(grid: &LevelGrid) -> LevelGrid {
    let rows = grid.len();
    (0..rows)
        .map(|i| {
            let cols = grid[i].len();
            (0..cols)
                .map(|j| {
                    let mut min = u8::MAX;
                    for di in -1i64..=1 {
                        for dj in -1i64..=1 {
                            let (ni, nj) = (i as i64 + di, j as i64 + dj);
                            let cell = if ni < 0 || nj < 0 {
                                None
                            } else {
                                grid.get(ni as usize).and_then(|r| r.get(nj as usize))
                            };
                            min = min.min(cell.copied().unwrap_or(0));
                        }
                    }
                    min
                })
                .collect()
        })
        .collect()
}

/// Keep each level only where it differs from its erosion: the outline of
/// every level set, carrying the level value.
pub fn level_outlines(levels: &LevelGrid) -> LevelGrid {
    let eroded = grey_erosion(levels);
    levels
        .iter()
        .zip(&eroded)
        .map(|(row, eroded_row)| {
            row.iter()
                .zip(eroded_row)
                .map(|(&level, &low)| if level > low { level } else { 0 })
                .collect()
        })
        .collect()
}

pub fn transpose(grid: &LevelGrid) -> LevelGrid {
    let cols = grid.first().map_or(0, Vec::len);
    (0..cols)
        .map(|j| grid.iter().map(|row| row[j]).collect())
        .collect()
}

/// Contour outlines of the 2D density of (`x`, `y`) over `objects`.
/// Pairs with a non-finite coordinate are skipped.
pub fn contour_map(x: &[f64], y: &[f64], objects: &[ObjectId], bins: usize) -> Result<LevelGrid> {
    let top = (bins - 1) as f64;
    let mut counts = vec![vec![0u64; bins]; bins];
    for &object in objects {
        let (xv, yv) = (value_at(x, object)?, value_at(y, object)?);
        if !(xv.is_finite() && yv.is_finite()) {
            continue;
        }
        let xi = ((xv * top).max(0.0) as usize).min(bins - 1);
        let yi = ((yv * top).max(0.0) as usize).min(bins - 1);
        counts[xi][yi] += 1;
    }
    let levels: LevelGrid = counts
        .iter()
        .map(|row| row.iter().map(|&c| density_level(c)).collect())
        .collect();
    Ok(level_outlines(&levels))
}

fn check_bins(bins: usize) -> Result<()> {
    if bins == 0 {
        return Err(EngineError::malformed("bins", "must be at least 1"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Engine operations
// ---------------------------------------------------------------------------

impl Engine {
    /// Histogram of every image feature for every population of the
    /// classification defined by (`features`, `exemplars`).
    pub fn feature_histograms(
        &self,
        dataset: &str,
        features: &FeatureSet,
        exemplars: &ExemplarSet,
        bins: usize,
    ) -> Result<Arc<FeatureHistograms>> {
        check_bins(bins)?;
        let key = (self.class_key(dataset, features, exemplars)?, bins);
        self.caches.histograms.get_or_compute(key, || -> Result<FeatureHistograms> {
            let partition = self.clusters_as_map(dataset, features, exemplars)?;
            let image_features = self.image_features(dataset)?;
            let columns = self.scaled_columns(dataset, image_features.iter().map(String::as_str))?;

            let mut tasks: Vec<(&str, PopulationId)> = Vec::new();
            for feature in columns.keys() {
                tasks.extend(partition.keys().map(|&cluster| (feature.as_str(), cluster)));
            }
            info!("Compute feature histograms: {} tasks ({dataset})", tasks.len());

            let results = self.pool.install(|| {
                tasks
                    .par_iter()
                    .map(|&(feature, cluster)| -> Result<(&str, PopulationId, Histogram)> {
                        let counts = histogram(&columns[feature], &partition[&cluster], bins)?;
                        Ok((feature, cluster, counts))
                    })
                    .collect::<Result<Vec<_>>>()
            })?;

            let mut histograms = FeatureHistograms::new();
            for (feature, cluster, counts) in results {
                histograms
                    .entry(feature.to_string())
                    .or_default()
                    .insert(cluster, counts);
            }
            info!("Finish feature histograms ({dataset})");
            Ok(histograms)
        })
    }

    /// Contour maps for every pair of `features` and every population.
    /// Only pairs with `x < y` are computed; `(y, x)` is the transpose.
    pub fn contour_maps(
        &self,
        dataset: &str,
        features: &FeatureSet,
        exemplars: &ExemplarSet,
        bins: usize,
    ) -> Result<Arc<ContourMatrix>> {
        check_bins(bins)?;
        let key = (self.class_key(dataset, features, exemplars)?, bins);
        self.caches.contours.get_or_compute(key, || -> Result<ContourMatrix> {
            let partition = self.clusters_as_map(dataset, features, exemplars)?;
            let columns = self.scaled_columns(dataset, features.iter())?;

            let mut tasks: Vec<(&str, &str, PopulationId)> = Vec::new();
            for x in features.iter() {
                for y in features.iter().filter(|&y| x < y) {
                    tasks.extend(partition.keys().map(|&cluster| (x, y, cluster)));
                }
            }
            info!("Compute contour maps: {} tasks ({dataset})", tasks.len());

            let results = self.pool.install(|| {
                tasks
                    .par_iter()
                    .map(|&(x, y, cluster)| -> Result<(&str, &str, PopulationId, LevelGrid)> {
                        let grid = contour_map(&columns[x], &columns[y], &partition[&cluster], bins)?;
                        Ok((x, y, cluster, grid))
                    })
                    .collect::<Result<Vec<_>>>()
            })?;

            let mut matrix: ContourMatrix = features
                .iter()
                .map(|x| {
                    let inner: BTreeMap<String, BTreeMap<PopulationId, LevelGrid>> =
                        features.iter().map(|y| (y.to_string(), BTreeMap::new())).collect();
                    (x.to_string(), inner)
                })
                .collect();
            for (x, y, cluster, grid) in results {
                let flipped = transpose(&grid);
                if let Some(cell) = matrix.get_mut(y).and_then(|row| row.get_mut(x)) {
                    cell.insert(cluster, flipped);
                }
                if let Some(cell) = matrix.get_mut(x).and_then(|row| row.get_mut(y)) {
                    cell.insert(cluster, grid);
                }
            }
            info!("Finish contour maps ({dataset})");
            Ok(matrix)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::data::source::MemorySource;
    use crate::engine::test_support::{blobs_table, engine};
    use crate::error::ErrorKind;

    #[test]
    fn top_value_falls_in_last_bin() {
        assert_eq!(bin_index(1.0, 10), Some(9));
        assert_eq!(bin_index(0.0, 10), Some(0));
        assert_eq!(bin_index(0.999, 10), Some(9));
        assert_eq!(bin_index(0.5, 4), Some(2));
        assert_eq!(bin_index(f64::NAN, 4), None);
        assert_eq!(bin_index(0.7, 1), Some(0));
    }

    #[test]
    fn histogram_counts_every_object() {
        let column = [0.0, 0.25, 0.5, 1.0, 1.0, 0.75];
        let counts = histogram(&column, &[0, 1, 3, 4, 5], 4).unwrap();
        assert_eq!(counts, vec![1, 1, 0, 3]);
        assert!(histogram(&column, &[17], 4).is_err());
    }

    #[test]
    fn density_levels_are_log_tiers() {
        assert_eq!(density_level(0), 0);
        assert_eq!(density_level(1), 1);
        assert_eq!(density_level(7), 1);
        assert_eq!(density_level(8), 2);
        assert_eq!(density_level(1_000_000), 7);
    }

    #[test]
    fn erosion_keeps_only_the_outline() {
        let levels: LevelGrid = vec![
            vec![0, 0, 0, 0, 0],
            vec![0, 1, 1, 1, 0],
            vec![0, 1, 2, 1, 0],
            vec![0, 1, 1, 1, 0],
            vec![0, 0, 0, 0, 0],
        ];
        let eroded = grey_erosion(&levels);
        assert_eq!(eroded[2][2], 1);
        assert!(eroded[1].iter().all(|&v| v == 0));

        let outlines = level_outlines(&levels);
        assert_eq!(outlines[2][2], 2);
        assert_eq!(outlines[1][1], 1);
        assert_eq!(outlines[0][0], 0);
    }

    #[test]
    fn filled_grid_outline_is_its_border() {
        let levels: LevelGrid = vec![vec![3; 4]; 4];
        let outlines = level_outlines(&levels);
        assert_eq!(outlines[1][1], 0);
        assert_eq!(outlines[0][2], 3);
        assert_eq!(outlines[3][3], 3);
    }

    #[test]
    fn contour_map_bins_by_x_then_y() {
        let x = [0.0, 1.0];
        let y = [1.0, 1.0];
        let grid = contour_map(&x, &y, &[0, 1], 3).unwrap();
        assert_eq!(grid[0][2], 1);
        assert_eq!(grid[2][2], 1);
        assert_eq!(grid[2][0], 0);
    }

    /// The blobs dataset without its constant column.
    fn varied_engine() -> Engine {
        let mut table = blobs_table();
        table.features.retain(|f| f != "flat");
        table.columns.remove("flat");
        let source = MemorySource::new().with_dataset("blobs", table);
        let config = EngineConfig {
            worker_threads: 2,
            ..EngineConfig::default()
        };
        Engine::new(Arc::new(source), config).unwrap()
    }

    #[test]
    fn histograms_cover_every_cluster_member() {
        let engine = varied_engine();
        let exemplars: ExemplarSet = [(10, vec![0, 2]), (20, vec![1, 3])].into_iter().collect();
        let features: FeatureSet = ["size"].into_iter().collect();
        let histograms = engine.feature_histograms("blobs", &features, &exemplars, 8).unwrap();
        let partition = engine.clusters_as_map("blobs", &features, &exemplars).unwrap();

        // Every image feature, not only the classifier features.
        assert_eq!(histograms.keys().collect::<Vec<_>>(), vec!["shape", "size"]);
        for per_cluster in histograms.values() {
            for (cluster, counts) in per_cluster {
                assert_eq!(counts.len(), 8);
                assert_eq!(counts.iter().sum::<u64>() as usize, partition[cluster].len());
            }
        }
        // The maximum of a feature lands in the last bin.
        assert!(histograms["size"][&20][7] > 0);
    }

    #[test]
    fn degenerate_image_feature_fails_histograms() {
        let engine = engine();
        let exemplars: ExemplarSet = [(10, vec![0, 2]), (20, vec![1, 3])].into_iter().collect();
        let features: FeatureSet = ["size", "shape"].into_iter().collect();
        let err = engine.feature_histograms("blobs", &features, &exemplars, 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DegenerateFeature);
        assert_eq!(engine.stats().get("histograms").len, 0);
    }

    #[test]
    fn zero_bins_is_malformed() {
        let engine = engine();
        let err = engine
            .contour_maps("blobs", &FeatureSet::default(), &ExemplarSet::default(), 0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedParameter);
    }

    #[test]
    fn contour_pairs_are_transposes() {
        let engine = engine();
        let exemplars: ExemplarSet = [(10, vec![0, 2]), (20, vec![1, 3])].into_iter().collect();
        let features: FeatureSet = ["size", "shape"].into_iter().collect();
        let matrix = engine.contour_maps("blobs", &features, &exemplars, 6).unwrap();

        for x in features.iter() {
            for y in features.iter().filter(|&y| x != y) {
                for (cluster, grid) in &matrix[x][y] {
                    assert_eq!(&transpose(grid), &matrix[y][x][cluster]);
                }
                assert_eq!(matrix[x][y].len(), 2);
            }
            assert!(matrix[x][x].is_empty());
        }
    }
}

//! Read-only queries over a finished segmentation table

use crate::pipeline::{read_segmentation_csv, SegmentationRow};
use log::info;
use polars::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Optional restriction on segment, cluster and country. `None` means all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub segment: Option<String>,
    pub cluster: Option<i64>,
    pub country: Option<String>,
}

impl Filter {
    fn matches(&self, row: &SegmentationRow) -> bool {
        self.segment.as_ref().map_or(true, |s| *s == row.segment)
            && self.cluster.map_or(true, |c| row.cluster == Some(c))
            && self.country.as_ref().map_or(true, |c| *c == row.country)
    }
}

/// Headline figures for the filtered customers; averages are 0 when empty
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub avg_recency: f64,
    pub avg_frequency: f64,
    pub avg_monetary: f64,
}

/// Per-group means and totals
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary<K> {
    pub key: K,
    pub count: usize,
    pub mean_recency: f64,
    pub mean_frequency: f64,
    pub mean_monetary: f64,
    pub total_monetary: f64,
}

/// Average monetary value of one (r, f) score cell
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapCell {
    pub r: u8,
    pub f: u8,
    pub mean_monetary: f64,
    pub count: usize,
}

/// Number of monetary histogram bins the dashboard draws
pub const MONETARY_BINS: usize = 30;

/// One equal-width bucket of a histogram. Buckets are half-open except the
/// last, which includes its upper edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

/// Distinct values available for filtering, sorted
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterOptions {
    pub segments: Vec<String>,
    pub clusters: Vec<i64>,
    pub countries: Vec<String>,
}

#[derive(Default)]
struct Accumulator {
    count: usize,
    recency: f64,
    frequency: f64,
    monetary: f64,
}

impl Accumulator {
    fn push(&mut self, row: &SegmentationRow) {
        self.count += 1;
        self.recency += row.recency as f64;
        self.frequency += row.frequency as f64;
        self.monetary += row.monetary;
    }

    fn into_group<K>(self, key: K) -> GroupSummary<K> {
        let n = self.count as f64;
        GroupSummary {
            key,
            count: self.count,
            mean_recency: self.recency / n,
            mean_frequency: self.frequency / n,
            mean_monetary: self.monetary / n,
            total_monetary: self.monetary,
        }
    }
}

/// Immutable, cheaply cloneable handle to the output table.
#[derive(Debug, Clone)]
pub struct SegmentationView {
    rows: Arc<[SegmentationRow]>,
}

impl SegmentationView {
    pub fn from_rows(rows: Vec<SegmentationRow>) -> Self {
        Self { rows: rows.into() }
    }

    pub fn rows(&self) -> &[SegmentationRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn filtered<'a>(&'a self, filter: &'a Filter) -> impl Iterator<Item = &'a SegmentationRow> {
        self.rows.iter().filter(move |row| filter.matches(row))
    }

    /// Rows passing `filter`, in table order
    pub fn filtered_rows<'a>(&'a self, filter: &'a Filter) -> Vec<&'a SegmentationRow> {
        self.filtered(filter).collect()
    }

    pub fn summary(&self, filter: &Filter) -> Summary {
        let mut acc = Accumulator::default();
        self.filtered(filter).for_each(|row| acc.push(row));
        if acc.count == 0 {
            return Summary {
                count: 0,
                avg_recency: 0.0,
                avg_frequency: 0.0,
                avg_monetary: 0.0,
            };
        }
        let group = acc.into_group(());
        Summary {
            count: group.count,
            avg_recency: group.mean_recency,
            avg_frequency: group.mean_frequency,
            avg_monetary: group.mean_monetary,
        }
    }

    /// Customers per segment, largest first. The segment part of `filter`
    /// is ignored so every segment stays visible.
    pub fn segment_distribution(&self, filter: &Filter) -> Vec<(String, usize)> {
        let filter = Filter {
            segment: None,
            ..filter.clone()
        };
        let counts = count_by(self.filtered(&filter), |row| row.segment.clone());
        largest_first(counts)
    }

    /// Customers per cluster in cluster order; `None` counts unclustered
    /// rows. The cluster part of `filter` is ignored.
    pub fn cluster_distribution(&self, filter: &Filter) -> Vec<(Option<i64>, usize)> {
        let filter = Filter {
            cluster: None,
            ..filter.clone()
        };
        count_by(self.filtered(&filter), |row| row.cluster)
            .into_iter()
            .collect()
    }

    /// Customers per country, largest first. The country part of `filter`
    /// is ignored.
    pub fn country_distribution(&self, filter: &Filter) -> Vec<(String, usize)> {
        let filter = Filter {
            country: None,
            ..filter.clone()
        };
        let counts = count_by(self.filtered(&filter), |row| row.country.clone());
        largest_first(counts)
    }

    /// Mean monetary value for every populated (r, f) cell
    pub fn score_heatmap(&self, filter: &Filter) -> Vec<HeatmapCell> {
        let mut cells: BTreeMap<(u8, u8), Accumulator> = BTreeMap::new();
        for row in self.filtered(filter) {
            cells.entry((row.r, row.f)).or_default().push(row);
        }
        cells
            .into_iter()
            .map(|((r, f), acc)| HeatmapCell {
                r,
                f,
                mean_monetary: acc.monetary / acc.count as f64,
                count: acc.count,
            })
            .collect()
    }

    /// Bucket the filtered monetary values into `bins` equal-width bins
    /// spanning their range. A single distinct value gets a unit-wide range
    /// centered on it. No rows or zero bins give an empty histogram.
    pub fn monetary_histogram(&self, filter: &Filter, bins: usize) -> Vec<HistogramBin> {
        let values: Vec<f64> = self.filtered(filter).map(|row| row.monetary).collect();
        if bins == 0 || values.is_empty() {
            return Vec::new();
        }
        let (mut lo, mut hi) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if hi - lo <= 0.0 {
            lo -= 0.5;
            hi += 0.5;
        }
        let width = (hi - lo) / bins as f64;

        let mut histogram: Vec<HistogramBin> = (0..bins)
            .map(|idx| HistogramBin {
                lower: lo + idx as f64 * width,
                upper: if idx + 1 == bins { hi } else { lo + (idx + 1) as f64 * width },
                count: 0,
            })
            .collect();
        for value in values {
            let idx = (((value - lo) / width).floor() as usize).min(bins - 1);
            histogram[idx].count += 1;
        }
        histogram
    }

    pub fn segment_summary(&self) -> Vec<GroupSummary<String>> {
        let mut groups: BTreeMap<&str, Accumulator> = BTreeMap::new();
        for row in self.rows.iter() {
            groups.entry(row.segment.as_str()).or_default().push(row);
        }
        groups
            .into_iter()
            .map(|(segment, acc)| acc.into_group(segment.to_string()))
            .collect()
    }

    /// Per-cluster figures; rows without a cluster are left out
    pub fn cluster_summary(&self) -> Vec<GroupSummary<i64>> {
        let mut groups: BTreeMap<i64, Accumulator> = BTreeMap::new();
        for row in self.rows.iter() {
            if let Some(cluster) = row.cluster {
                groups.entry(cluster).or_default().push(row);
            }
        }
        groups
            .into_iter()
            .map(|(cluster, acc)| acc.into_group(cluster))
            .collect()
    }

    pub fn options(&self) -> FilterOptions {
        let segments: BTreeSet<&str> = self.rows.iter().map(|r| r.segment.as_str()).collect();
        let clusters: BTreeSet<i64> = self.rows.iter().filter_map(|r| r.cluster).collect();
        let countries: BTreeSet<&str> = self.rows.iter().map(|r| r.country.as_str()).collect();
        FilterOptions {
            segments: segments.into_iter().map(str::to_string).collect(),
            clusters: clusters.into_iter().collect(),
            countries: countries.into_iter().map(str::to_string).collect(),
        }
    }

    /// Write [`Self::segment_summary`] as CSV
    pub fn write_segment_summary_csv(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let path = path.as_ref();
        let summary = self.segment_summary();
        let mut df = DataFrame::new(vec![
            Series::new("segment", summary.iter().map(|g| g.key.as_str()).collect::<Vec<_>>()),
            Series::new("count", summary.iter().map(|g| g.count as u64).collect::<Vec<_>>()),
            Series::new("mean_recency", summary.iter().map(|g| g.mean_recency).collect::<Vec<_>>()),
            Series::new(
                "mean_frequency",
                summary.iter().map(|g| g.mean_frequency).collect::<Vec<_>>(),
            ),
            Series::new(
                "mean_monetary",
                summary.iter().map(|g| g.mean_monetary).collect::<Vec<_>>(),
            ),
            Series::new(
                "total_monetary",
                summary.iter().map(|g| g.total_monetary).collect::<Vec<_>>(),
            ),
        ])?;

        let mut file = File::create(path)?;
        CsvWriter::new(&mut file)
            .include_header(true)
            .finish(&mut df)?;
        info!("Segment summary saved to {}", path.display());
        Ok(())
    }
}

fn count_by<'a, K: Ord>(
    rows: impl Iterator<Item = &'a SegmentationRow>,
    key: impl Fn(&SegmentationRow) -> K,
) -> BTreeMap<K, usize> {
    let mut counts = BTreeMap::new();
    for row in rows {
        *counts.entry(key(row)).or_insert(0) += 1;
    }
    counts
}

fn largest_first<K>(counts: BTreeMap<K, usize>) -> Vec<(K, usize)> {
    let mut counts: Vec<_> = counts.into_iter().collect();
    // stable: equal counts stay in key order
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
}

/// A view bound to the file it was read from.
///
/// The view never changes under a reader; [`ViewHandle::reload`] swaps in a
/// freshly read table.
#[derive(Debug, Clone)]
pub struct ViewHandle {
    path: PathBuf,
    view: SegmentationView,
}

impl ViewHandle {
    pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let view = SegmentationView::from_rows(read_segmentation_csv(&path)?);
        info!("Loaded {} customers from {}", view.len(), path.display());
        Ok(Self { path, view })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn view(&self) -> SegmentationView {
        self.view.clone()
    }

    /// Re-read the source file. On error the current view is kept.
    pub fn reload(&mut self) -> crate::Result<()> {
        let rows = read_segmentation_csv(&self.path)?;
        self.view = SegmentationView::from_rows(rows);
        info!("Reloaded {} customers from {}", self.view.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::write_segmentation_csv;

    fn row(id: &str, country: &str, segment: &str, cluster: Option<i64>, monetary: f64) -> SegmentationRow {
        SegmentationRow {
            id: id.to_string(),
            country: country.to_string(),
            recency: 10,
            frequency: 2,
            monetary,
            r: 3,
            f: 2,
            m: 4,
            rfm_score: "324".to_string(),
            fm: 3,
            segment: segment.to_string(),
            cluster,
        }
    }

    fn sample_view() -> SegmentationView {
        SegmentationView::from_rows(vec![
            row("1", "UK", "champions", Some(0), 100.0),
            row("2", "UK", "champions", Some(1), 300.0),
            row("3", "DE", "lost", Some(1), 20.0),
            row("4", "DE", "lost", None, 40.0),
            row("5", "FR", "mystery", Some(-1), 0.0),
        ])
    }

    #[test]
    fn test_summary_with_filters() {
        let view = sample_view();
        let all = view.summary(&Filter::default());
        assert_eq!(all.count, 5);
        assert!((all.avg_monetary - 92.0).abs() < 1e-12);

        let uk = view.summary(&Filter {
            country: Some("UK".to_string()),
            ..Filter::default()
        });
        assert_eq!(uk.count, 2);
        assert!((uk.avg_monetary - 200.0).abs() < 1e-12);

        let none = view.summary(&Filter {
            segment: Some("at risk".to_string()),
            ..Filter::default()
        });
        assert_eq!(none.count, 0);
        assert_eq!(none.avg_monetary, 0.0);
    }

    #[test]
    fn test_distributions_ignore_their_own_dimension() {
        let view = sample_view();
        let filter = Filter {
            segment: Some("lost".to_string()),
            country: Some("DE".to_string()),
            ..Filter::default()
        };

        // country filter still applies, segment filter does not
        assert_eq!(view.segment_distribution(&filter), vec![("lost".to_string(), 2)]);
        assert_eq!(
            view.cluster_distribution(&filter),
            vec![(None, 1), (Some(1), 1)]
        );
        assert_eq!(
            view.country_distribution(&Filter::default()),
            vec![("DE".to_string(), 2), ("UK".to_string(), 2), ("FR".to_string(), 1)]
        );
    }

    #[test]
    fn test_group_summaries() {
        let view = sample_view();
        let segments = view.segment_summary();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].key, "champions");
        assert_eq!(segments[0].count, 2);
        assert!((segments[0].total_monetary - 400.0).abs() < 1e-12);

        let clusters = view.cluster_summary();
        let keys: Vec<i64> = clusters.iter().map(|g| g.key).collect();
        assert_eq!(keys, vec![-1, 0, 1]);
        assert_eq!(clusters[2].count, 2);
    }

    #[test]
    fn test_options_are_sorted_and_distinct() {
        let options = sample_view().options();
        assert_eq!(options.segments, vec!["champions", "lost", "mystery"]);
        assert_eq!(options.clusters, vec![-1, 0, 1]);
        assert_eq!(options.countries, vec!["DE", "FR", "UK"]);
    }

    #[test]
    fn test_heatmap_cells() {
        let cells = sample_view().score_heatmap(&Filter::default());
        assert_eq!(cells.len(), 1);
        assert_eq!((cells[0].r, cells[0].f, cells[0].count), (3, 2, 5));
    }

    #[test]
    fn test_filtered_rows_keep_table_order() {
        let view = sample_view();
        let ids = |filter: &Filter| -> Vec<String> {
            view.filtered_rows(filter).iter().map(|r| r.id.clone()).collect()
        };

        assert_eq!(ids(&Filter::default()).len(), 5);
        assert_eq!(
            ids(&Filter {
                segment: Some("lost".to_string()),
                country: Some("DE".to_string()),
                ..Filter::default()
            }),
            vec!["3", "4"]
        );
        assert_eq!(
            ids(&Filter {
                cluster: Some(1),
                ..Filter::default()
            }),
            vec!["2", "3"]
        );
        assert!(ids(&Filter {
            country: Some("US".to_string()),
            ..Filter::default()
        })
        .is_empty());
    }

    #[test]
    fn test_monetary_histogram() {
        let view = sample_view();
        let bins = view.monetary_histogram(&Filter::default(), 3);
        let counts: Vec<usize> = bins.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![3, 1, 1]);
        assert_eq!(bins[0].lower, 0.0);
        assert_eq!(bins[2].upper, 300.0);

        let uk = view.monetary_histogram(
            &Filter {
                country: Some("UK".to_string()),
                ..Filter::default()
            },
            2,
        );
        assert_eq!(uk.iter().map(|b| b.count).collect::<Vec<_>>(), vec![1, 1]);
        assert_eq!(uk[0].lower, 100.0);

        let single = view.monetary_histogram(
            &Filter {
                country: Some("FR".to_string()),
                ..Filter::default()
            },
            MONETARY_BINS,
        );
        assert_eq!(single.len(), MONETARY_BINS);
        assert_eq!(single.iter().map(|b| b.count).sum::<usize>(), 1);
        assert_eq!(single[0].lower, -0.5);
        assert_eq!(single[MONETARY_BINS - 1].upper, 0.5);

        assert!(view.monetary_histogram(&Filter::default(), 0).is_empty());
        assert!(SegmentationView::from_rows(Vec::new())
            .monetary_histogram(&Filter::default(), MONETARY_BINS)
            .is_empty());
    }

    #[test]
    fn test_handle_reload_picks_up_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segments.csv");
        write_segmentation_csv(&sample_view().rows()[..2], &path).unwrap();

        let mut handle = ViewHandle::open(&path).unwrap();
        let before = handle.view();
        assert_eq!(before.len(), 2);

        write_segmentation_csv(sample_view().rows(), &path).unwrap();
        handle.reload().unwrap();
        assert_eq!(handle.view().len(), 5);
        // existing views are unaffected by a reload
        assert_eq!(before.len(), 2);
    }

    #[test]
    fn test_write_segment_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        sample_view().write_segment_summary_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("segment,count,mean_recency,mean_frequency,mean_monetary,total_monetary")
        );
        assert_eq!(lines.count(), 3);
    }
}

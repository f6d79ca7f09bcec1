//! SVG charts over the segmentation table using Plotters

use crate::dashboard::{Filter, SegmentationView};
use crate::evaluate::TrialOutcome;
use crate::pipeline::SegmentationRow;
use log::info;
use ndarray::Array2;
use plotters::prelude::*;
use std::collections::BTreeMap;
use std::path::Path;

/// Color palette for different clusters
const CLUSTER_COLORS: [RGBColor; 6] = [
    RED,
    BLUE,
    GREEN,
    RGBColor(255, 165, 0),
    MAGENTA,
    CYAN,
];

/// Padded (min, max) of `values`, never an empty range
fn axis_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !min.is_finite() || !max.is_finite() {
        return (0.0, 1.0);
    }
    let pad = ((max - min) * 0.05).max(0.5);
    (min - pad, max + pad)
}

fn cluster_color(cluster: Option<i64>) -> RGBColor {
    match cluster {
        Some(id) if id >= 0 => CLUSTER_COLORS[id as usize % CLUSTER_COLORS.len()],
        // noise and unclustered rows
        _ => BLACK,
    }
}

/// Scatter of frequency against monetary value, colored by cluster
///
/// # Arguments
/// * `rows` - Output table rows
/// * `output_path` - Path of the SVG file to write
pub fn render_cluster_scatter(rows: &[SegmentationRow], output_path: impl AsRef<Path>) -> crate::Result<()> {
    let output_path = output_path.as_ref();
    let (x_min, x_max) = axis_range(rows.iter().map(|r| r.frequency as f64));
    let (y_min, y_max) = axis_range(rows.iter().map(|r| r.monetary));

    let root = SVGBackend::new(output_path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Customer Clusters: Frequency vs Monetary", ("sans-serif", 30))
        .margin(10)
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)?;

    chart
        .configure_mesh()
        .x_desc("Frequency")
        .y_desc("Monetary")
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    let mut by_cluster: BTreeMap<Option<i64>, Vec<(f64, f64)>> = BTreeMap::new();
    for row in rows {
        by_cluster
            .entry(row.cluster)
            .or_default()
            .push((row.frequency as f64, row.monetary));
    }

    for (cluster, points) in by_cluster {
        let color = cluster_color(cluster);
        let label = match cluster {
            Some(id) if id >= 0 => format!("Cluster {id}"),
            Some(_) => "Noise".to_string(),
            None => "Unclustered".to_string(),
        };
        chart
            .draw_series(
                points
                    .into_iter()
                    .map(move |point| Circle::new(point, 4, color.filled())),
            )?
            .label(label)
            .legend(move |(x, y)| Circle::new((x + 5, y), 4, color.filled()));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()?;
    info!("Cluster scatter saved to {}", output_path.display());
    Ok(())
}

/// Bar chart of customers per segment, largest first
pub fn render_segment_distribution(
    view: &SegmentationView,
    output_path: impl AsRef<Path>,
) -> crate::Result<()> {
    let output_path = output_path.as_ref();
    let counts = view.segment_distribution(&Filter::default());
    let max_count = counts.iter().map(|(_, c)| *c).max().unwrap_or(1) as f64;
    let n_bars = counts.len().max(1);

    let root = SVGBackend::new(output_path, (900, 500)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Customers per Segment", ("sans-serif", 30))
        .margin(10)
        .x_label_area_size(60)
        .y_label_area_size(50)
        .build_cartesian_2d(-0.5f64..(n_bars as f64 - 0.5), 0f64..(max_count * 1.1))?;

    let names: Vec<String> = counts.iter().map(|(segment, _)| segment.clone()).collect();
    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(n_bars)
        .x_label_formatter(&|x| {
            let idx = x.round();
            if idx >= 0.0 && (x - idx).abs() < 1e-6 {
                names.get(idx as usize).cloned().unwrap_or_default()
            } else {
                String::new()
            }
        })
        .y_desc("Number of Customers")
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    chart.draw_series(counts.iter().enumerate().map(|(idx, (_, count))| {
        let color = CLUSTER_COLORS[idx % CLUSTER_COLORS.len()];
        Rectangle::new(
            [(idx as f64 - 0.4, 0.0), (idx as f64 + 0.4, *count as f64)],
            color.filled(),
        )
    }))?;

    root.present()?;
    info!("Segment distribution saved to {}", output_path.display());
    Ok(())
}

/// Side-by-side 2x2 grid of clusterings on standardized recency against
/// standardized frequency, one panel per outcome (at most four).
///
/// Failed trials get an empty panel titled with the error.
pub fn render_model_comparison(
    features: &Array2<f64>,
    outcomes: &[TrialOutcome],
    output_path: impl AsRef<Path>,
) -> crate::Result<()> {
    let output_path = output_path.as_ref();
    if features.ncols() < 2 {
        anyhow::bail!(
            "comparison chart needs recency and frequency columns, got {}",
            features.ncols()
        );
    }
    let (x_min, x_max) = axis_range(features.column(0).iter().copied());
    let (y_min, y_max) = axis_range(features.column(1).iter().copied());

    let root = SVGBackend::new(output_path, (1200, 1000)).into_drawing_area();
    root.fill(&WHITE)?;

    for (area, outcome) in root.split_evenly((2, 2)).iter().zip(outcomes) {
        let result = match &outcome.result {
            Ok(result) => result,
            Err(e) => {
                area.titled(
                    &format!("{}: {}", outcome.algorithm_name, e),
                    ("sans-serif", 16),
                )?;
                continue;
            }
        };

        let mut chart = ChartBuilder::on(area)
            .caption(&outcome.algorithm_name, ("sans-serif", 20))
            .margin(10)
            .x_label_area_size(40)
            .y_label_area_size(50)
            .build_cartesian_2d(x_min..x_max, y_min..y_max)?;

        chart
            .configure_mesh()
            .x_desc("Recency (scaled)")
            .y_desc("Frequency (scaled)")
            .draw()?;

        chart.draw_series(features.rows().into_iter().zip(&result.labels).map(|(row, label)| {
            let color = cluster_color(Some(label.as_i64()));
            Circle::new((row[0], row[1]), 3, color.filled())
        }))?;
    }

    root.present()?;
    info!("Model comparison saved to {}", output_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_rows() -> Vec<SegmentationRow> {
        [
            ("1", 5u64, 500.0, "champions", Some(0)),
            ("2", 4, 420.0, "champions", Some(0)),
            ("3", 1, 20.0, "lost", Some(1)),
            ("4", 1, 35.0, "hibernating", Some(-1)),
            ("5", 2, 60.0, "at risk", None),
        ]
        .into_iter()
        .map(|(id, frequency, monetary, segment, cluster)| SegmentationRow {
            id: id.to_string(),
            country: "UK".to_string(),
            recency: 3,
            frequency,
            monetary,
            r: 3,
            f: 3,
            m: 3,
            rfm_score: "333".to_string(),
            fm: 3,
            segment: segment.to_string(),
            cluster,
        })
        .collect()
    }

    #[test]
    fn test_render_cluster_scatter() {
        let temp_dir = tempdir().unwrap();
        let output_path = temp_dir.path().join("clusters.svg");

        render_cluster_scatter(&create_test_rows(), &output_path).unwrap();
        let svg = std::fs::read_to_string(&output_path).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("circle"));
    }

    #[test]
    fn test_render_segment_distribution() {
        let temp_dir = tempdir().unwrap();
        let output_path = temp_dir.path().join("segments.svg");
        let view = SegmentationView::from_rows(create_test_rows());

        render_segment_distribution(&view, &output_path).unwrap();
        assert!(output_path.exists());
    }

    #[test]
    fn test_empty_table_still_renders() {
        let temp_dir = tempdir().unwrap();
        let scatter = temp_dir.path().join("empty.svg");
        let bars = temp_dir.path().join("empty_bars.svg");

        render_cluster_scatter(&[], &scatter).unwrap();
        render_segment_distribution(&SegmentationView::from_rows(Vec::new()), &bars).unwrap();
        assert!(scatter.exists());
        assert!(bars.exists());
    }

    #[test]
    fn test_render_model_comparison() {
        use crate::error::TrialError;
        use crate::evaluate::{ClusteringTrialResult, ValidityMetrics};
        use crate::model::ClusterLabel;
        use ndarray::array;

        let features = array![[-1.0, 0.5, 0.0], [-0.8, 0.7, 0.1], [1.2, -0.9, 0.0], [1.0, -1.1, 0.2]];
        let fitted = |name: &str, labels: Vec<ClusterLabel>| TrialOutcome {
            algorithm_name: name.to_string(),
            supports_noise: false,
            result: Ok(ClusteringTrialResult {
                algorithm_name: name.to_string(),
                labels,
                metrics: ValidityMetrics {
                    silhouette: 0.5,
                    calinski_harabasz: 10.0,
                    davies_bouldin: 0.5,
                },
                cluster_count: 2,
                noise_count: 0,
            }),
        };
        let pair = vec![
            ClusterLabel::Cluster(0),
            ClusterLabel::Cluster(0),
            ClusterLabel::Cluster(1),
            ClusterLabel::Noise,
        ];
        let outcomes = vec![
            fitted("K-Means (4 clusters)", pair.clone()),
            fitted("Gaussian Mixture (4)", pair.clone()),
            fitted("Agglomerative (4)", pair),
            TrialOutcome {
                algorithm_name: "DBSCAN (eps=0.8)".to_string(),
                supports_noise: true,
                result: Err(TrialError::DegenerateLabels {
                    n_labels: 1,
                    n_samples: 4,
                }),
            },
        ];

        let temp_dir = tempdir().unwrap();
        let output_path = temp_dir.path().join("comparison.svg");
        render_model_comparison(&features, &outcomes, &output_path).unwrap();

        let svg = std::fs::read_to_string(&output_path).unwrap();
        assert!(svg.contains("circle"));
        assert!(svg.contains("Agglomerative (4)"));
        assert!(svg.contains("DBSCAN (eps=0.8)"));

        let narrow = Array2::<f64>::zeros((3, 1));
        assert!(render_model_comparison(&narrow, &outcomes, &output_path).is_err());
    }

    #[test]
    fn test_axis_range_pads_constant_values() {
        assert_eq!(axis_range([3.0, 3.0].into_iter()), (2.5, 3.5));
        assert_eq!(axis_range(std::iter::empty()), (0.0, 1.0));
    }
}

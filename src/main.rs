//! SegmentForge: customer segmentation CLI using RFM scoring and clustering
//!
//! This is the main entrypoint that orchestrates the segmentation run, the
//! optional model comparison, chart rendering and single-customer prediction.

use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use segmentforge::pipeline::PipelineOutput;
use segmentforge::{viz, write_segmentation_csv, Args, ClusterLabel, Pipeline, SegmentationView};
use std::path::{Path, PathBuf};
use std::time::Instant;

fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    let pipeline = Pipeline::new(args.pipeline_config()?)?;

    // Check if in prediction mode
    if let Some(rfm_values) = args.parse_rfm_values()? {
        run_prediction_mode(&args, &pipeline, rfm_values)?;
    } else {
        run_full_pipeline(&args, &pipeline)?;
    }

    Ok(())
}

/// `clusters.svg` -> `clusters_segments.svg`
fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}{suffix}.svg"))
}

fn cluster_share(output: &PipelineOutput, cluster: usize) -> Option<(usize, f64)> {
    let size = output
        .cluster_sizes()
        .into_iter()
        .find(|(label, _)| *label == ClusterLabel::Cluster(cluster))
        .map(|(_, size)| size)?;
    Some((size, size as f64 / output.records.len() as f64 * 100.0))
}

/// Score a single customer against the fitted run
fn run_prediction_mode(args: &Args, pipeline: &Pipeline, rfm_values: (f64, f64, f64)) -> Result<()> {
    println!("=== Prediction Mode ===");
    println!(
        "Input RFM values: R={}, F={}, M={}",
        rfm_values.0, rfm_values.1, rfm_values.2
    );

    let start_time = Instant::now();
    let output = pipeline.run_file(&args.input)?;
    let Some(scorer) = output.scorer.as_ref() else {
        anyhow::bail!("No customers in {}; nothing to score against", args.input.display());
    };

    let prediction = scorer.score(rfm_values.0, rfm_values.1, rfm_values.2)?;
    let elapsed = start_time.elapsed();

    println!(
        "\n✓ Scores: R={} F={} M={} (FM={})",
        prediction.scores.r, prediction.scores.f, prediction.scores.m, prediction.scores.fm
    );
    println!("  Segment: {}", prediction.segment);
    println!("  Processing time: {:.2}s", elapsed.as_secs_f64());

    match prediction.cluster {
        Some(cluster) => {
            println!("\n✓ Predicted Cluster: {}", cluster);
            if let Some((size, percentage)) = cluster_share(&output, cluster) {
                println!("  Size: {} customers ({:.1}% of total)", size, percentage);
            }
            if let Some(centroid) = scorer.centroids().map(|c| c.row(cluster)) {
                println!(
                    "  Centroid (normalized): R={:.2}, F={:.2}, M={:.2}",
                    centroid[0], centroid[1], centroid[2]
                );
            }
        }
        None => println!("\nNo cluster model available for this dataset"),
    }

    Ok(())
}

/// Run the full segmentation pipeline and write every requested artifact
fn run_full_pipeline(args: &Args, pipeline: &Pipeline) -> Result<()> {
    println!("=== RFM Segmentation Pipeline ===\n");

    let start_time = Instant::now();
    let output = pipeline.run_file(&args.input)?;
    let report = &output.load_report;

    println!(
        "✓ Data loaded: {} of {} rows kept, {} customers",
        report.rows_kept, report.rows_read, report.unique_customers
    );
    if report.dropped_bad_timestamp + report.dropped_incomplete > 0 {
        println!(
            "  Dropped: {} bad dates, {} incomplete rows",
            report.dropped_bad_timestamp, report.dropped_incomplete
        );
    }
    if let (Some(first), Some(last)) = (report.first_timestamp, report.last_timestamp) {
        println!("  Date range: {} to {}", first, last);
    }

    let rows = output.rows();
    write_segmentation_csv(&rows, &args.output)?;
    println!("✓ Segmentation table saved to: {}", args.output.display());

    let view = SegmentationView::from_rows(rows);

    println!("\n=== Segment Summary ===");
    for group in view.segment_summary() {
        println!(
            "{:20} {:6} customers | R {:7.1} | F {:6.1} | M {:10.2}",
            group.key, group.count, group.mean_recency, group.mean_frequency, group.mean_monetary
        );
    }

    let cluster_sizes = output.cluster_sizes();
    if !cluster_sizes.is_empty() {
        println!("\n=== Cluster Statistics ===");
        for (label, size) in &cluster_sizes {
            let percentage = (*size as f64 / output.records.len() as f64) * 100.0;
            println!("Cluster {}: {} customers ({:.1}%)", label, size, percentage);
        }
    }

    if let Some(comparison) = &output.comparison {
        println!("\n=== Model Comparison ===");
        for ranked in &comparison.ranking {
            println!(
                "{:2}. {:28} composite {:.3}",
                ranked.rank, ranked.algorithm_name, ranked.composite
            );
        }
        println!(
            "Recommended: {}",
            comparison
                .recommended
                .as_deref()
                .unwrap_or("none (every trial failed)")
        );
        if let Some(path) = &args.report {
            comparison.write(path)?;
            println!("✓ Comparison report saved to: {}", path.display());
        }
    } else if args.report.is_some() {
        println!("\nNo comparison was run; pass --compare to produce a report");
    }

    if let Some(path) = &args.summary {
        view.write_segment_summary_csv(path)?;
        println!("✓ Segment summary saved to: {}", path.display());
    }

    if let Some(path) = &args.plot {
        viz::render_cluster_scatter(view.rows(), path)?;
        let segments_path = sibling_path(path, "_segments");
        viz::render_segment_distribution(&view, &segments_path)?;
        println!(
            "✓ Charts saved to: {} and {}",
            path.display(),
            segments_path.display()
        );
    }

    if let (Some(path), Some(features)) = (&args.plot, &output.features) {
        if output.comparison.is_some() {
            let comparison_path = sibling_path(path, "_comparison");
            viz::render_model_comparison(
                features,
                &pipeline.comparison_panels(&output),
                &comparison_path,
            )?;
            println!("✓ Model comparison chart saved to: {}", comparison_path.display());
        }
    }

    let total_time = start_time.elapsed();
    println!("\n=== Pipeline Complete ===");
    println!("Total processing time: {:.2}s", total_time.as_secs_f64());

    Ok(())
}

//! Integration tests for SegmentForge

use segmentforge::{
    read_segmentation_csv, write_segmentation_csv, ClusterSource, Filter, Pipeline,
    PipelineConfig, Segment, TrialSpec, ViewHandle,
};
use std::io::Write;
use tempfile::NamedTempFile;

const HEADER: &str = "Customer_ID,Sales_Amount,Quantity_Sold,Sale_Date,Region";

/// Create a test CSV file with the given data rows
fn create_csv(rows: &[String]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{}", HEADER).unwrap();
    for row in rows {
        writeln!(file, "{}", row).unwrap();
    }
    file
}

/// Two customers: A bought once for 500 two days before the reference
/// instant, B bought ten times for 5 each, the last one a day before it
fn two_customer_rows() -> Vec<String> {
    let mut rows: Vec<String> = (1..=10)
        .map(|day| format!("B,5.0,1,2024-03-{:02} 12:00:00,North", day))
        .collect();
    rows.push("A,500.0,2,2024-03-09 12:00:00,North".to_string());
    rows
}

/// Sixteen customers over two regions with spread out behaviour
fn mixed_rows() -> Vec<String> {
    let mut rows = Vec::new();
    for c in 0..16u32 {
        let region = if c % 2 == 0 { "North" } else { "South" };
        let visits = 1 + (c % 4) * 3;
        for v in 0..visits {
            let day = 1 + ((c * 7 + v * 3) % 28);
            let month = 1 + (c % 6);
            let amount = 10.0 + (c * c) as f64 * 3.5 + v as f64;
            rows.push(format!(
                "C{:03},{:.2},{},2023-{:02}-{:02},{}",
                c,
                amount,
                1 + v % 3,
                month,
                day,
                region
            ));
        }
    }
    rows
}

#[test]
fn test_two_customer_scenario() {
    let file = create_csv(&two_customer_rows());
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    let output = pipeline.run_file(file.path()).unwrap();
    let rows = output.rows();

    assert_eq!(rows.len(), 2);
    let a = rows.iter().find(|r| r.id == "A").unwrap();
    let b = rows.iter().find(|r| r.id == "B").unwrap();

    assert_eq!(a.recency, 2);
    assert_eq!(b.recency, 1);
    assert!(b.r > a.r);
    assert!(b.f > a.f);
    assert!((b.monetary - 50.0).abs() < 1e-9);
    assert!(Segment::from_label(&a.segment).is_classified());
    assert!(Segment::from_label(&b.segment).is_classified());
    assert!(rows.iter().all(|r| r.cluster.is_none()));
}

#[test]
fn test_empty_dataset_is_a_successful_run() {
    let file = create_csv(&[]);
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("segments.csv");

    let output = Pipeline::new(PipelineConfig::default())
        .unwrap()
        .run_file(file.path())
        .unwrap();
    assert!(output.records.is_empty());

    write_segmentation_csv(&output.rows(), &out).unwrap();
    assert!(read_segmentation_csv(&out).unwrap().is_empty());
}

#[test]
fn test_bad_timestamps_are_dropped_and_counted() {
    let mut rows = two_customer_rows();
    rows.push("C,20.0,1,31/31/2024,South".to_string());
    rows.push("C,25.0,1,,South".to_string());
    let file = create_csv(&rows);

    let output = Pipeline::new(PipelineConfig::default())
        .unwrap()
        .run_file(file.path())
        .unwrap();

    assert_eq!(output.load_report.rows_read, 13);
    assert_eq!(output.load_report.dropped_bad_timestamp, 2);
    assert_eq!(output.records.len(), 2);
}

#[test]
fn test_comparison_ranks_trials() {
    let file = create_csv(&mixed_rows());
    let config = PipelineConfig {
        compare: true,
        ..PipelineConfig::default()
    };
    let output = Pipeline::new(config).unwrap().run_file(file.path()).unwrap();
    let report = output.comparison.as_ref().unwrap();

    assert_eq!(report.trials.len(), TrialSpec::default_suite().len());
    let valid = report.trials.iter().filter(|t| t.error.is_none()).count();
    assert_eq!(report.ranking.len(), valid);
    assert!(valid > 0);
    assert_eq!(
        report.recommended.as_deref(),
        Some(report.ranking[0].algorithm_name.as_str())
    );
    for pair in report.ranking.windows(2) {
        assert!(pair[0].composite >= pair[1].composite);
    }

    let dir = tempfile::tempdir().unwrap();
    let json = dir.path().join("report.json");
    report.write(&json).unwrap();
    let parsed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&json).unwrap()).unwrap();
    assert_eq!(
        parsed["recommended"].as_str(),
        report.recommended.as_deref()
    );
}

#[test]
fn test_recommended_clusters_cover_every_customer() {
    let file = create_csv(&mixed_rows());
    let config = PipelineConfig {
        compare: true,
        cluster_source: ClusterSource::Recommended,
        ..PipelineConfig::default()
    };
    let output = Pipeline::new(config).unwrap().run_file(file.path()).unwrap();

    assert_eq!(output.records.len(), 16);
    assert!(output.records.iter().all(|r| r.cluster.is_some()));
}

#[test]
fn test_identical_runs_write_identical_files() {
    let file = create_csv(&mixed_rows());
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        compare: true,
        ..PipelineConfig::default()
    };

    let mut outputs = Vec::new();
    let mut reports = Vec::new();
    for run in 0..2 {
        let path = dir.path().join(format!("run{}.csv", run));
        let report_path = dir.path().join(format!("run{}.json", run));
        let output = Pipeline::new(config.clone())
            .unwrap()
            .run_file(file.path())
            .unwrap();
        write_segmentation_csv(&output.rows(), &path).unwrap();
        output.comparison.as_ref().unwrap().write(&report_path).unwrap();
        outputs.push(std::fs::read(&path).unwrap());
        reports.push(std::fs::read(&report_path).unwrap());
    }

    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(reports[0], reports[1]);
}

#[test]
fn test_dashboard_reads_pipeline_output() {
    let file = create_csv(&mixed_rows());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("segments.csv");

    let output = Pipeline::new(PipelineConfig::default())
        .unwrap()
        .run_file(file.path())
        .unwrap();
    write_segmentation_csv(&output.rows(), &path).unwrap();

    let handle = ViewHandle::open(&path).unwrap();
    let view = handle.view();
    assert_eq!(view.len(), output.records.len());
    for (read, written) in view.rows().iter().zip(output.rows()) {
        assert_eq!(read.id, written.id);
        assert_eq!(read.segment, written.segment);
        assert_eq!(read.cluster, written.cluster);
        assert!((read.monetary - written.monetary).abs() < 1e-6);
    }

    let north = view.summary(&Filter {
        country: Some("North".to_string()),
        ..Filter::default()
    });
    assert_eq!(north.count, 8);

    let options = view.options();
    assert_eq!(options.countries, vec!["North", "South"]);
    let total: usize = view
        .segment_distribution(&Filter::default())
        .iter()
        .map(|(_, count)| count)
        .sum();
    assert_eq!(total, 16);
}

#[test]
fn test_prediction_uses_run_boundaries() {
    let file = create_csv(&mixed_rows());
    let output = Pipeline::new(PipelineConfig::default())
        .unwrap()
        .run_file(file.path())
        .unwrap();
    let scorer = output.scorer.as_ref().unwrap();

    let prediction = scorer.score(10.0, 5.0, 250.0).unwrap();
    assert!(prediction.segment.is_classified());
    assert!(prediction.cluster.unwrap() < 4);
}

#[test]
fn test_missing_input_is_fatal() {
    let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
    assert!(pipeline.run_file("/no/such/transactions.csv").is_err());
}

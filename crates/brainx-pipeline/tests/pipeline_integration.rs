//! End-to-end runs of the orchestrator against the fake toolkit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use brainx_core::{
    exit, Modality, PipelineConfig, PipelineKind, PipelineStage, QualityPreset,
    RunContext, RunState, WorkerPool,
};
use brainx_pipeline::{Orchestrator, RunOutcome, StageStatus};
use brainx_toolkit::fakes::FakeToolkit;
use brainx_toolkit::{ToolKind, Toolkit};

struct Fixture {
    _dir: tempfile::TempDir,
    input: PathBuf,
    output: PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("dicom");
    std::fs::create_dir_all(input.join("series1")).unwrap();
    std::fs::write(input.join("series1/IM0001"), b"DICM").unwrap();
    std::fs::write(input.join("series1/IM0002"), b"DICM").unwrap();
    let output = dir.path().join("out");
    Fixture {
        input,
        output,
        _dir: dir,
    }
}

fn orchestrator(fake: &Arc<FakeToolkit>, config: PipelineConfig) -> Orchestrator {
    Orchestrator::new(config, Toolkit::shared(fake.clone())).with_pool(WorkerPool::available(4))
}

fn context(fx: &Fixture) -> RunContext {
    RunContext::new("sub01", &fx.input, &fx.output)
}

/// Relative path -> bytes for every file under the given module dirs.
fn snapshot(root: &Path, modules: &[&str]) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().to_string();
                out.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    for module in modules {
        walk(root, &root.join(module), &mut out);
    }
    out
}

/// Every file under the output root.
fn snapshot_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    snapshot(root, &[""])
}

fn resumable_stages() -> impl Iterator<Item = PipelineStage> {
    PipelineStage::ALL
        .into_iter()
        .filter(|s| *s >= PipelineStage::Preprocess)
}

fn status(outcome: &RunOutcome, stage: PipelineStage) -> StageStatus {
    outcome.report(stage).unwrap().status
}

#[tokio::test]
async fn test_full_run_produces_every_declared_output() {
    let fx = fixture();
    let fake = Arc::new(FakeToolkit::new());
    let mut ctx = context(&fx);

    let outcome = orchestrator(&fake, PipelineConfig::default()).run(&mut ctx).await;

    assert!(outcome.success(), "run failed: {:?}", outcome.failure);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.error_count, 0);
    assert_eq!(ctx.state(), RunState::Completed);
    for stage in PipelineStage::ALL {
        assert_eq!(status(&outcome, stage), StageStatus::Succeeded, "{stage}");
    }

    let out = &fx.output;
    for rel in [
        "metadata/scanner_params.json",
        "metadata/reference_space.json",
        "metadata/selected_scans.json",
        "bias_corrected/sub01_T1_n4.nii.gz",
        "bias_corrected/sub01_FLAIR_n4.nii.gz",
        "brain_extraction/sub01_FLAIR_brain_mask.nii.gz",
        "standardized/sub01_T1_std.nii.gz",
        "standardized/sub01_FLAIR_std.nii.gz",
        "registered/sub01_T1_reg.nii.gz",
        "registered/sub01_FLAIR_reg.nii.gz",
        "segmentation/brainstem/sub01_brainstem.nii.gz",
        "segmentation/pons/sub01_dorsal_pons.nii.gz",
        "validation/segmentation/sub01_segmentation.json",
        "hyperintensities/thresholds/sub01_FLAIR_thresh2.0.nii.gz",
        "hyperintensities/clusters/sub01_FLAIR_clusters3.0.tsv",
        "validation/hyperintensities/sub01_FLAIR_hyperintensities.json",
        "qc_visualizations/sub01_T1_brainstem.png",
        "reports/qc_manifest.json",
        "reports/cluster_dicom_trace.json",
        "summary/pipeline_summary.json",
        "summary/pipeline_summary.md",
    ] {
        assert!(out.join(rel).is_file(), "missing {rel}");
    }

    let scanner: serde_json::Value =
        serde_json::from_slice(&std::fs::read(out.join("metadata/scanner_params.json")).unwrap())
            .unwrap();
    assert_eq!(scanner["manufacturer"], "SIEMENS");
    assert_eq!(scanner["fieldStrength"], "3.0T");

    // the 4-voxel cluster is below the default minimum
    let table =
        std::fs::read_to_string(out.join("hyperintensities/clusters/sub01_FLAIR_clusters2.0.tsv"))
            .unwrap();
    assert_eq!(table.lines().count(), 2);
}

#[tokio::test]
async fn test_resume_reproduces_later_outputs() {
    let fx = fixture();
    let fake = Arc::new(FakeToolkit::new());
    let orch = orchestrator(&fake, PipelineConfig::default());
    let later = [
        "registered",
        "validation",
        "segmentation",
        "hyperintensities",
        "qc_visualizations",
        "reports",
        "summary",
    ];

    let first = orch.run(&mut context(&fx)).await;
    assert!(first.success(), "{:?}", first.failure);
    let before = snapshot(&fx.output, &later);
    let imports = fake.call_count(ToolKind::DicomConversion);

    let mut ctx = context(&fx).with_start_stage(PipelineStage::Registration);
    let resumed = orch.run(&mut ctx).await;

    assert!(resumed.success(), "{:?}", resumed.failure);
    for stage in [
        PipelineStage::Import,
        PipelineStage::Preprocess,
        PipelineStage::BrainExtraction,
    ] {
        assert_eq!(status(&resumed, stage), StageStatus::Rediscovered);
    }
    assert_eq!(fake.call_count(ToolKind::DicomConversion), imports);
    assert_eq!(snapshot(&fx.output, &later), before);
}

#[tokio::test]
async fn test_segmentation_start_without_registration_is_data_missing() {
    let fx = fixture();
    let fake = Arc::new(FakeToolkit::new());
    let mut ctx = context(&fx).with_start_stage(PipelineStage::Segmentation);

    let outcome = orchestrator(&fake, PipelineConfig::default()).run(&mut ctx).await;

    assert!(!outcome.success());
    assert_eq!(outcome.state, RunState::Failed);
    assert_eq!(outcome.exit_code(), exit::DATA_MISSING);
    assert_eq!(fake.call_count(ToolKind::Segmentation), 0);
    assert!(fake.calls().is_empty());
    assert_eq!(status(&outcome, PipelineStage::Segmentation), StageStatus::NotRun);
}

#[tokio::test]
async fn test_visualization_failure_is_counted_not_fatal() {
    let fx = fixture();
    let fake = Arc::new(FakeToolkit::new());
    fake.fail_on(ToolKind::QcRender, None);
    let mut ctx = context(&fx);

    let outcome = orchestrator(&fake, PipelineConfig::default()).run(&mut ctx).await;

    assert!(outcome.success(), "{:?}", outcome.failure);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.error_count, 1);
    assert_eq!(status(&outcome, PipelineStage::Visualization), StageStatus::Failed);
    assert_eq!(status(&outcome, PipelineStage::Tracking), StageStatus::Succeeded);
    assert!(fx.output.join("summary/pipeline_summary.json").is_file());
}

#[tokio::test]
async fn test_strict_stage_failure_stops_the_run() {
    let fx = fixture();
    let fake = Arc::new(FakeToolkit::new());
    fake.fail_on(ToolKind::BrainExtraction, Some("FLAIR"));
    let mut ctx = context(&fx);

    let outcome = orchestrator(&fake, PipelineConfig::default()).run(&mut ctx).await;

    assert_eq!(outcome.state, RunState::Failed);
    assert_eq!(outcome.exit_code(), ToolKind::BrainExtraction.exit_code());
    assert_eq!(status(&outcome, PipelineStage::BrainExtraction), StageStatus::Failed);
    assert_eq!(status(&outcome, PipelineStage::Registration), StageStatus::NotRun);
    assert_eq!(fake.call_count(ToolKind::Registration), 0);
}

#[tokio::test]
async fn test_basic_pipeline_skips_visualization() {
    let fx = fixture();
    let fake = Arc::new(FakeToolkit::new());
    let mut ctx = context(&fx)
        .with_pipeline(PipelineKind::Basic)
        .with_quality(QualityPreset::Low);

    let outcome = orchestrator(&fake, PipelineConfig::default()).run(&mut ctx).await;

    assert!(outcome.success(), "{:?}", outcome.failure);
    assert_eq!(status(&outcome, PipelineStage::Visualization), StageStatus::Skipped);
    assert_eq!(fake.call_count(ToolKind::QcRender), 0);
    assert!(!fx.output.join("reports/qc_manifest.json").exists());
}

#[tokio::test]
async fn test_two_analyzed_modalities_write_overlap_table() {
    let fx = fixture();
    let fake = Arc::new(FakeToolkit::new());
    let mut config = PipelineConfig::default();
    config.analysis.modalities = vec![Modality::Flair, Modality::T1];
    let mut ctx = context(&fx);

    let outcome = orchestrator(&fake, config).run(&mut ctx).await;
    assert!(outcome.success(), "{:?}", outcome.failure);

    let csv = std::fs::read_to_string(fx.output.join("hyperintensities/clusters/cluster_overlap.csv"))
        .unwrap();
    let rows: Vec<&str> = csv.lines().skip(1).collect();
    // the same 42-voxel cluster seen from each side
    assert_eq!(rows.len(), 2);
    assert!(rows[0].starts_with("FLAIR_2,FLAIR,42,"));
    assert!(rows[1].starts_with("T1_2,T1,42,"));
}

#[tokio::test]
async fn test_sequential_pool_matches_parallel_outputs() {
    let seq = fixture();
    let par = fixture();
    let modules = ["bias_corrected", "registered", "hyperintensities", "summary"];

    let fake = Arc::new(FakeToolkit::new());
    let outcome = Orchestrator::new(PipelineConfig::default(), Toolkit::shared(fake.clone()))
        .with_pool(WorkerPool::unavailable())
        .run(&mut context(&seq))
        .await;
    assert!(outcome.success(), "{:?}", outcome.failure);

    let outcome = orchestrator(&Arc::new(FakeToolkit::new()), PipelineConfig::default())
        .run(&mut context(&par))
        .await;
    assert!(outcome.success(), "{:?}", outcome.failure);

    assert_eq!(snapshot(&seq.output, &modules), snapshot(&par.output, &modules));
}

#[tokio::test]
async fn test_resume_from_any_stage_is_idempotent() {
    let fx = fixture();
    let fake = Arc::new(FakeToolkit::new());
    let orch = orchestrator(&fake, PipelineConfig::default());

    let first = orch.run(&mut context(&fx)).await;
    assert!(first.success(), "{:?}", first.failure);
    let baseline = snapshot_tree(&fx.output);

    for start in resumable_stages() {
        let mut ctx = context(&fx).with_start_stage(start);
        let resumed = orch.run(&mut ctx).await;

        assert!(resumed.success(), "resume at {start}: {:?}", resumed.failure);
        for stage in PipelineStage::ALL {
            let expected = if stage < start {
                StageStatus::Rediscovered
            } else {
                StageStatus::Succeeded
            };
            assert_eq!(status(&resumed, stage), expected, "resume at {start}: {stage}");
        }
        assert!(
            snapshot_tree(&fx.output) == baseline,
            "resume at {start} changed the output tree"
        );
    }
    assert_eq!(fake.call_count(ToolKind::DicomConversion), 1);
}

#[tokio::test]
async fn test_resume_on_empty_root_is_data_missing_at_every_stage() {
    for start in resumable_stages() {
        let fx = fixture();
        let fake = Arc::new(FakeToolkit::new());
        let mut ctx = context(&fx).with_start_stage(start);

        let outcome = orchestrator(&fake, PipelineConfig::default()).run(&mut ctx).await;

        assert_eq!(outcome.state, RunState::Failed, "{start}");
        assert_eq!(outcome.exit_code(), exit::DATA_MISSING, "{start}");
        assert!(fake.calls().is_empty(), "{start} invoked tools");
        assert_eq!(status(&outcome, start), StageStatus::NotRun, "{start}");
    }
}

#[tokio::test]
async fn test_rerun_import_discards_stale_conversions() {
    let fx = fixture();
    let stale = fx.output.join("extracted/OLD_T1_MPRAGE_9.nii.gz");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, vec![1u8; 4096]).unwrap();
    let fake = Arc::new(FakeToolkit::new());

    let outcome = orchestrator(&fake, PipelineConfig::default()).run(&mut context(&fx)).await;

    assert!(outcome.success(), "{:?}", outcome.failure);
    assert!(!stale.exists());
    let mut volumes: Vec<String> = std::fs::read_dir(fx.output.join("extracted"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|n| n.ends_with(".nii.gz"))
        .collect();
    volumes.sort();
    assert_eq!(volumes, vec!["T1_MPRAGE_SAG_2.nii.gz", "T2_SPACE_FLAIR_SAG_3.nii.gz"]);
}

#[tokio::test]
async fn test_brainstem_voxel_values_are_exported() {
    let fx = fixture();
    let fake = Arc::new(FakeToolkit::new());

    let outcome = orchestrator(&fake, PipelineConfig::default()).run(&mut context(&fx)).await;
    assert!(outcome.success(), "{:?}", outcome.failure);

    let values = std::fs::read_to_string(
        fx.output.join("validation/hyperintensities/sub01_FLAIR_brainstem_values.txt"),
    )
    .unwrap();
    // background zeros and NaN are dropped
    assert_eq!(values, "412.500000\n388.250000\n97.000000\n");

    let report: serde_json::Value = serde_json::from_slice(
        &std::fs::read(fx.output.join("validation/hyperintensities/sub01_FLAIR_hyperintensities.json"))
            .unwrap(),
    )
    .unwrap();
    assert_eq!(report["voxel_value_count"], 3);
    assert_eq!(
        report["voxel_values"],
        "validation/hyperintensities/sub01_FLAIR_brainstem_values.txt"
    );
}

#[tokio::test]
async fn test_clusters_are_traced_to_dicom_slices() {
    let fx = fixture();
    let fake = Arc::new(FakeToolkit::new());
    let geometry = [
        ("SeriesInstanceUID", "1.2.3"),
        ("SeriesDescription", "t2_space_flair_sag"),
        ("ImageOrientationPatient", "1\\0\\0\\0\\1\\0"),
        ("PixelSpacing", "1\\1"),
        ("Rows", "256"),
        ("Columns", "256"),
    ];
    for (file, instance, position) in [
        ("IM0001", "1", "-128\\-100\\-35"),
        ("IM0002", "2", "-128\\-100\\-32"),
    ] {
        let mut fields = geometry.to_vec();
        fields.push(("InstanceNumber", instance));
        fields.push(("ImagePositionPatient", position));
        fake.set_dicom_header(file, &fields);
    }

    let outcome = orchestrator(&fake, PipelineConfig::default()).run(&mut context(&fx)).await;
    assert!(outcome.success(), "{:?}", outcome.failure);

    let trace: serde_json::Value = serde_json::from_slice(
        &std::fs::read(fx.output.join("reports/cluster_dicom_trace.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(trace["subject"], "sub01");
    assert_eq!(trace["series"], 1);
    let entries = trace["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry["cluster"], "FLAIR_2");
    assert_eq!(entry["series_modality"], "FLAIR");
    assert_eq!(entry["dicom_file"], "series1/IM0001");
    assert_eq!(entry["slice_index"], 1);
    assert_eq!(entry["pixel"], serde_json::json!([126, 128]));
    assert!(trace["unmatched"].as_array().unwrap().is_empty());

    let summary = std::fs::read_to_string(fx.output.join("summary/pipeline_summary.json")).unwrap();
    assert!(summary.contains("reports/cluster_dicom_trace.json"));
}

#[tokio::test]
async fn test_headers_without_geometry_leave_clusters_unmatched() {
    let fx = fixture();
    let fake = Arc::new(FakeToolkit::new());

    let outcome = orchestrator(&fake, PipelineConfig::default()).run(&mut context(&fx)).await;
    assert!(outcome.success(), "{:?}", outcome.failure);

    let trace: serde_json::Value = serde_json::from_slice(
        &std::fs::read(fx.output.join("reports/cluster_dicom_trace.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(trace["series"], 0);
    assert!(trace["entries"].as_array().unwrap().is_empty());
    assert_eq!(trace["unmatched"], serde_json::json!(["FLAIR_2"]));
}

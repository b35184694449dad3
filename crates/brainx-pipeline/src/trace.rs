//! Cluster centres traced back to the DICOM slices they fall on.
//!
//! Cluster centres of gravity come from the analysis reports at the overlap
//! multiplier. Registered images live in the reference scan's scanner space,
//! so a centre only changes handedness (RAS to LPS) before it is located in
//! each acquired series.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use brainx_core::{
    dispatch, glob_in, relative_to, ArtifactKey, BrainxError, HaltPolicy, ItemStatus, Modality,
    ModalityMatcher, ModuleDir, Result,
};
use brainx_toolkit::parse::parse_cluster_table;
use brainx_toolkit::{Cluster, DicomHeader};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::env::StageEnv;
use crate::steps::{discover_dicom, HyperintensityReport};

pub const TRACE_FILE: &str = "cluster_dicom_trace";

/// Out-of-plane tolerance for a series with a single slice.
const SINGLE_SLICE_TOLERANCE_MM: f64 = 1.5;

type Vec3 = [f64; 3];

fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// NIfTI world coordinates (RAS) to DICOM patient coordinates (LPS).
pub fn ras_to_lps(p: Vec3) -> Vec3 {
    [-p[0], -p[1], p[2]]
}

/// Backslash-separated DICOM numbers.
fn numbers(raw: Option<&str>) -> Option<Vec<f64>> {
    raw?.split('\\')
        .map(|v| v.trim().parse::<f64>().ok())
        .collect()
}

fn vec3(values: &[f64]) -> Option<Vec3> {
    match values {
        [x, y, z] => Some([*x, *y, *z]),
        _ => None,
    }
}

/// Where one DICOM file sits in patient space.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceGeometry {
    pub file: PathBuf,
    pub series_uid: String,
    pub series_description: String,
    pub instance_number: Option<i64>,
    pub position: Vec3,
    pub row_dir: Vec3,
    pub col_dir: Vec3,
    /// Millimetres between rows, then between columns.
    pub pixel_spacing: Option<(f64, f64)>,
    /// Rows, then columns.
    pub shape: Option<(u32, u32)>,
}

impl SliceGeometry {
    /// `None` for files without a series UID. Missing orientation means
    /// axial, a missing position means the origin.
    pub fn from_header(file: &Path, header: &DicomHeader) -> Option<Self> {
        let series_uid = header.get("SeriesInstanceUID")?.to_string();
        let orientation = numbers(header.get("ImageOrientationPatient"))
            .filter(|v| v.len() == 6)
            .unwrap_or_else(|| vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let pixel_spacing = numbers(header.get("PixelSpacing")).and_then(|v| match v.as_slice() {
            [row, col] if *row > 0.0 && *col > 0.0 => Some((*row, *col)),
            _ => None,
        });
        let dim = |key: &str| header.get(key).and_then(|v| v.trim().parse::<u32>().ok());

        Some(Self {
            file: file.to_path_buf(),
            series_uid,
            series_description: header.get("SeriesDescription").unwrap_or("Unknown").to_string(),
            instance_number: header
                .get("InstanceNumber")
                .and_then(|v| v.trim().parse::<i64>().ok()),
            position: numbers(header.get("ImagePositionPatient"))
                .as_deref()
                .and_then(vec3)
                .unwrap_or([0.0; 3]),
            row_dir: vec3(&orientation[..3])?,
            col_dir: vec3(&orientation[3..])?,
            pixel_spacing,
            shape: dim("Rows").zip(dim("Columns")),
        })
    }
}

/// The slices of one series, in acquisition order.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesGeometry {
    pub uid: String,
    pub description: String,
    pub row_dir: Vec3,
    pub col_dir: Vec3,
    pub pixel_spacing: Option<(f64, f64)>,
    pub shape: Option<(u32, u32)>,
    pub slices: Vec<SliceGeometry>,
}

/// The slice a point falls on.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceHit {
    pub file: PathBuf,
    /// Instance number when the series has one, else the position in the
    /// stack.
    pub slice_index: i64,
    /// Column, then row.
    pub pixel: Option<[u32; 2]>,
}

impl SeriesGeometry {
    /// Slice normal pointing from the first slice to the last.
    fn normal(&self) -> Vec3 {
        let n = cross(self.row_dir, self.col_dir);
        match (self.slices.first(), self.slices.last()) {
            (Some(first), Some(last)) if dot(n, sub(last.position, first.position)) < 0.0 => {
                [-n[0], -n[1], -n[2]]
            }
            _ => n,
        }
    }

    /// The slice containing `point` (patient LPS millimetres), or `None` when
    /// it lies outside the field of view.
    pub fn locate(&self, point: Vec3) -> Option<SliceHit> {
        let first = self.slices.first()?;
        let normal = self.normal();
        let spacing = self
            .slices
            .get(1)
            .map(|second| dot(normal, sub(second.position, first.position)).abs())
            .filter(|s| *s > 1e-6);

        let t = dot(normal, sub(point, first.position));
        let (index, tolerance) = match spacing {
            Some(s) => ((t / s).round().clamp(0.0, (self.slices.len() - 1) as f64) as usize, s),
            None => (0, SINGLE_SLICE_TOLERANCE_MM),
        };
        let slice = &self.slices[index];
        let rel = sub(point, slice.position);
        if dot(normal, rel).abs() > tolerance {
            return None;
        }

        let x = dot(rel, self.row_dir);
        let y = dot(rel, self.col_dir);
        let pixel = match (self.pixel_spacing, self.shape) {
            (Some((row_mm, col_mm)), Some((rows, cols))) => {
                let width = col_mm * f64::from(cols.saturating_sub(1));
                let height = row_mm * f64::from(rows.saturating_sub(1));
                if x < 0.0 || x > width || y < 0.0 || y > height {
                    return None;
                }
                Some([(x / col_mm) as u32, (y / row_mm) as u32])
            }
            _ => None,
        };

        Some(SliceHit {
            file: slice.file.clone(),
            slice_index: slice.instance_number.unwrap_or(index as i64),
            pixel,
        })
    }
}

/// Group slices by series UID. Slices are ordered by instance number when
/// every slice has one, otherwise by position along the slice normal.
pub fn group_series(slices: Vec<SliceGeometry>) -> Vec<SeriesGeometry> {
    let mut by_uid: BTreeMap<String, Vec<SliceGeometry>> = BTreeMap::new();
    for slice in slices {
        by_uid.entry(slice.series_uid.clone()).or_default().push(slice);
    }

    by_uid
        .into_iter()
        .filter_map(|(uid, mut slices)| {
            let first = slices.first()?.clone();
            let mut series = SeriesGeometry {
                uid,
                description: first.series_description,
                row_dir: first.row_dir,
                col_dir: first.col_dir,
                pixel_spacing: slices.iter().find_map(|s| s.pixel_spacing),
                shape: slices.iter().find_map(|s| s.shape),
                slices: Vec::new(),
            };
            if slices.iter().all(|s| s.instance_number.is_some()) {
                slices.sort_by_key(|s| s.instance_number);
            } else {
                series.slices = slices.clone();
                let normal = series.normal();
                slices.sort_by(|a, b| dot(normal, a.position).total_cmp(&dot(normal, b.position)));
            }
            series.slices = slices;
            Some(series)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTrace {
    /// `<MODALITY>_<cluster index>`
    pub cluster: String,
    pub modality: Modality,
    pub cog_mm: Vec3,
    pub patient_lps: Vec3,
    pub series_modality: Modality,
    pub series_description: String,
    pub series_uid: String,
    /// Relative to the subject's input directory.
    pub dicom_file: PathBuf,
    pub slice_index: i64,
    pub pixel: Option<[u32; 2]>,
}

/// `reports/cluster_dicom_trace.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDicomTrace {
    pub subject: String,
    pub multiplier: f64,
    pub series: usize,
    pub entries: Vec<ClusterTrace>,
    /// Clusters no series covers.
    pub unmatched: Vec<String>,
}

impl ClusterDicomTrace {
    pub fn artifact() -> ArtifactKey {
        ArtifactKey::new(ModuleDir::Reports, TRACE_FILE).ext("json")
    }
}

/// Locate every cluster in every series.
pub fn trace_clusters(
    clusters: &[(Modality, Cluster)],
    series: &[(Modality, SeriesGeometry)],
    input_dir: &Path,
) -> (Vec<ClusterTrace>, Vec<String>) {
    let mut entries = Vec::new();
    let mut unmatched = Vec::new();
    for (modality, cluster) in clusters {
        let label = format!("{modality}_{}", cluster.index);
        let lps = ras_to_lps(cluster.cog_mm);
        let before = entries.len();
        for (series_modality, geometry) in series {
            if let Some(hit) = geometry.locate(lps) {
                entries.push(ClusterTrace {
                    cluster: label.clone(),
                    modality: *modality,
                    cog_mm: cluster.cog_mm,
                    patient_lps: lps,
                    series_modality: *series_modality,
                    series_description: geometry.description.clone(),
                    series_uid: geometry.uid.clone(),
                    dicom_file: relative_to(input_dir, &hit.file),
                    slice_index: hit.slice_index,
                    pixel: hit.pixel,
                });
            }
        }
        if entries.len() == before {
            unmatched.push(label);
        }
    }
    (entries, unmatched)
}

/// Clusters at `multiplier` from every hyperintensity report on disk.
async fn load_clusters(output_root: &Path, multiplier: f64) -> Result<Vec<(Modality, Cluster)>> {
    let dir = ModuleDir::ValidationHyperintensities.dir(output_root);
    let mut clusters = Vec::new();
    for path in glob_in(&dir, "*_hyperintensities.json")? {
        let report: HyperintensityReport = serde_json::from_slice(&tokio::fs::read(&path).await?)?;
        let Some(level) = report
            .levels
            .iter()
            .find(|l| (l.multiplier - multiplier).abs() < 1e-9)
        else {
            debug!(report = %path.display(), multiplier, "no level at the overlap multiplier");
            continue;
        };
        let table = tokio::fs::read_to_string(output_root.join(&level.cluster_table)).await?;
        clusters.extend(
            parse_cluster_table(&table)?
                .into_iter()
                .map(|c| (report.modality, c)),
        );
    }
    Ok(clusters)
}

/// Geometry of every readable DICOM file under the input directory.
async fn load_series(env: &StageEnv, matcher: &ModalityMatcher) -> Result<Vec<(Modality, SeriesGeometry)>> {
    let Some((_, files)) = discover_dicom(&env.input_dir, &env.config.import.dicom_patterns)? else {
        warn!(input = %env.input_dir.display(), "no DICOM files to trace clusters into");
        return Ok(Vec::new());
    };

    let reader = env.toolkit.dicom_headers.clone();
    let report = dispatch(
        env.batch("dicom_geometry", files).halt(HaltPolicy::BestEffort),
        &env.pool,
        move |file: PathBuf| {
            let reader = reader.clone();
            async move {
                let header = reader.read_header(&file).await?;
                Ok::<_, BrainxError>(SliceGeometry::from_header(&file, &header))
            }
        },
    )
    .await?;

    let mut slices = Vec::new();
    for item in report.items {
        match item.status {
            ItemStatus::Succeeded(Some(slice)) => slices.push(slice),
            ItemStatus::Succeeded(None) => debug!(file = %item.input.display(), "no series UID"),
            ItemStatus::Failed(e) => warn!(file = %item.input.display(), error = %e, "DICOM header unreadable"),
            ItemStatus::NotAttempted => {}
        }
    }

    Ok(group_series(slices)
        .into_iter()
        .filter_map(|series| {
            let modality = Modality::ALL
                .into_iter()
                .find(|m| matcher.matches(*m, &series.description));
            if modality.is_none() {
                debug!(series = %series.description, "series matches no modality");
            }
            modality.map(|m| (m, series))
        })
        .collect())
}

/// Trace the subject's clusters into its DICOM series.
pub async fn build(env: &StageEnv) -> Result<ClusterDicomTrace> {
    let multiplier = env.config.analysis.overlap_multiplier;
    let clusters = load_clusters(env.root(), multiplier).await?;
    let series = if clusters.is_empty() {
        Vec::new()
    } else {
        load_series(env, &env.config.modalities.compile()?).await?
    };
    let (entries, unmatched) = trace_clusters(&clusters, &series, &env.input_dir);
    info!(
        clusters = clusters.len(),
        series = series.len(),
        located = entries.len(),
        unmatched = unmatched.len(),
        "clusters traced to DICOM"
    );
    Ok(ClusterDicomTrace {
        subject: env.subject.clone(),
        multiplier,
        series: series.len(),
        entries,
        unmatched,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(pairs: &[(&str, &str)]) -> DicomHeader {
        DicomHeader {
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn axial(file: &str, instance: Option<&str>, z: f64) -> SliceGeometry {
        let position = format!("-128\\-100\\{z}");
        let mut pairs = vec![
            ("SeriesInstanceUID", "1.2.3"),
            ("SeriesDescription", "t2_space_flair"),
            ("ImagePositionPatient", position.as_str()),
            ("ImageOrientationPatient", "1\\0\\0\\0\\1\\0"),
            ("PixelSpacing", "1\\1"),
            ("Rows", "256"),
            ("Columns", "256"),
        ];
        if let Some(n) = instance {
            pairs.push(("InstanceNumber", n));
        }
        SliceGeometry::from_header(Path::new(file), &header(&pairs)).unwrap()
    }

    #[test]
    fn test_header_without_series_uid_is_skipped() {
        let h = header(&[("SeriesDescription", "t1_mprage")]);
        assert!(SliceGeometry::from_header(Path::new("IM1"), &h).is_none());
    }

    #[test]
    fn test_missing_orientation_defaults_to_axial() {
        let h = header(&[("SeriesInstanceUID", "9"), ("InstanceNumber", " 4 ")]);
        let slice = SliceGeometry::from_header(Path::new("IM1"), &h).unwrap();
        assert_eq!(slice.row_dir, [1.0, 0.0, 0.0]);
        assert_eq!(slice.col_dir, [0.0, 1.0, 0.0]);
        assert_eq!(slice.instance_number, Some(4));
        assert_eq!(slice.series_description, "Unknown");
        assert!(slice.pixel_spacing.is_none());
    }

    #[test]
    fn test_instance_numbers_order_the_stack() {
        let series = group_series(vec![
            axial("b", Some("2"), -35.0),
            axial("a", Some("1"), -32.0),
        ]);
        assert_eq!(series.len(), 1);
        let files: Vec<&Path> = series[0].slices.iter().map(|s| s.file.as_path()).collect();
        assert_eq!(files, vec![Path::new("a"), Path::new("b")]);
    }

    #[test]
    fn test_positions_order_the_stack_without_instance_numbers() {
        let series = group_series(vec![
            axial("bottom", Some("7"), -35.0),
            axial("top", None, -29.0),
            axial("middle", None, -32.0),
        ]);
        let files: Vec<&Path> = series[0].slices.iter().map(|s| s.file.as_path()).collect();
        assert_eq!(files, vec![Path::new("bottom"), Path::new("middle"), Path::new("top")]);
    }

    #[test]
    fn test_locate_picks_nearest_slice_and_pixel() {
        let series = &group_series(vec![
            axial("IM0001", Some("1"), -35.0),
            axial("IM0002", Some("2"), -32.0),
        ])[0];

        let hit = series.locate([-1.5, 28.0, -34.0]).unwrap();
        assert_eq!(hit.file, PathBuf::from("IM0001"));
        assert_eq!(hit.slice_index, 1);
        assert_eq!(hit.pixel, Some([126, 128]));

        let hit = series.locate([0.0, 0.0, -32.5]).unwrap();
        assert_eq!(hit.file, PathBuf::from("IM0002"));
        assert_eq!(hit.pixel, Some([128, 100]));
    }

    #[test]
    fn test_points_outside_the_field_of_view_are_not_located() {
        let series = &group_series(vec![
            axial("IM0001", Some("1"), -35.0),
            axial("IM0002", Some("2"), -32.0),
        ])[0];
        // beyond the last slice
        assert!(series.locate([0.0, 0.0, -20.0]).is_none());
        // off the side of the image
        assert!(series.locate([200.0, 0.0, -35.0]).is_none());
    }

    #[test]
    fn test_unmatched_clusters_are_listed() {
        let series = group_series(vec![
            axial("/in/s1/IM0001", Some("1"), -35.0),
            axial("/in/s1/IM0002", Some("2"), -32.0),
        ]);
        let series: Vec<(Modality, SeriesGeometry)> =
            series.into_iter().map(|s| (Modality::Flair, s)).collect();
        let clusters = vec![
            (
                Modality::Flair,
                Cluster {
                    index: 2,
                    voxels: 42,
                    max_intensity: 1.0,
                    cog_mm: [1.5, -28.0, -34.0],
                },
            ),
            (
                Modality::T1,
                Cluster {
                    index: 1,
                    voxels: 9,
                    max_intensity: 1.0,
                    cog_mm: [0.0, 0.0, 60.0],
                },
            ),
        ];

        let (entries, unmatched) = trace_clusters(&clusters, &series, Path::new("/in"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cluster, "FLAIR_2");
        assert_eq!(entries[0].patient_lps, [-1.5, 28.0, -34.0]);
        assert_eq!(entries[0].dicom_file, PathBuf::from("s1/IM0001"));
        assert_eq!(unmatched, vec!["T1_1"]);
    }
}

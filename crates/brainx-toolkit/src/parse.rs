//! Parsers for the text reports printed by the command-line imaging tools.
//!
//! Nothing outside this crate sees these formats.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ToolError, ToolResult};
use crate::interfaces::{Cluster, DicomHeader, ImageHeader, ImageStats, ToolKind};

/// Parse `fslinfo` key/value output.
///
/// ```text
/// data_type      FLOAT32
/// dim1           176
/// pixdim1        1.000000
/// ```
pub fn parse_image_info(text: &str) -> ToolResult<ImageHeader> {
    let mut fields = BTreeMap::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            fields.insert(key.to_string(), value.to_string());
        }
    }

    let int = |key: &str| -> ToolResult<u32> {
        let raw = fields
            .get(key)
            .ok_or_else(|| ToolError::parse(ToolKind::ImageInfo, format!("missing {key}")))?;
        raw.parse::<u32>()
            .map_err(|_| ToolError::parse(ToolKind::ImageInfo, format!("{key}={raw}")))
    };
    let float = |key: &str| -> ToolResult<f64> {
        let raw = fields
            .get(key)
            .ok_or_else(|| ToolError::parse(ToolKind::ImageInfo, format!("missing {key}")))?;
        raw.parse::<f64>()
            .map_err(|_| ToolError::parse(ToolKind::ImageInfo, format!("{key}={raw}")))
    };

    Ok(ImageHeader {
        dims: [int("dim1")?, int("dim2")?, int("dim3")?],
        pixdim: [float("pixdim1")?, float("pixdim2")?, float("pixdim3")?],
        datatype: fields
            .get("data_type")
            .cloned()
            .unwrap_or_else(|| "UNKNOWN".to_string()),
    })
}

/// Parse `fslstats <img> -V -R -M -S`: `voxels volume min max mean sd`.
pub fn parse_image_stats(text: &str) -> ToolResult<ImageStats> {
    let values: Vec<f64> = text
        .split_whitespace()
        .map(|t| {
            t.parse::<f64>()
                .map_err(|_| ToolError::parse(ToolKind::ImageStats, format!("token {t:?}")))
        })
        .collect::<ToolResult<_>>()?;

    if values.len() < 6 {
        return Err(ToolError::parse(
            ToolKind::ImageStats,
            format!("expected 6 values, got {}", values.len()),
        ));
    }

    Ok(ImageStats {
        voxels: values[0].max(0.0) as u64,
        volume_mm3: values[1],
        min: values[2],
        max: values[3],
        mean: values[4],
        std_dev: values[5],
    })
}

/// Parse `fslcc` output; the correlation is the last token of the last line.
pub fn parse_correlation(text: &str) -> ToolResult<f64> {
    let token = text
        .lines()
        .rev()
        .find_map(|line| line.split_whitespace().last())
        .ok_or_else(|| ToolError::parse(ToolKind::Similarity, "empty output"))?;
    token
        .parse::<f64>()
        .map_err(|_| ToolError::parse(ToolKind::Similarity, format!("token {token:?}")))
}

/// Parse `fslmeants --showall --transpose`: one voxel per line, the
/// intensity is the last column.
pub fn parse_voxel_values(text: &str) -> ToolResult<Vec<f64>> {
    text.lines()
        .filter_map(|line| line.split_whitespace().last())
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|_| ToolError::parse(ToolKind::ImageStats, format!("voxel value {token:?}")))
        })
        .collect()
}

/// Parse the tab-separated table printed by `cluster --mm`.
///
/// Columns are located by header name so extra columns are tolerated.
pub fn parse_cluster_table(text: &str) -> ToolResult<Vec<Cluster>> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = match lines.next() {
        Some(h) => h,
        None => return Ok(Vec::new()),
    };
    let columns: Vec<&str> = header.split('\t').map(str::trim).collect();
    let column = |name: &str| -> ToolResult<usize> {
        columns
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| ToolError::parse(ToolKind::LesionAnalysis, format!("no column {name:?}")))
    };

    let index_col = column("Cluster Index")?;
    let voxels_col = column("Voxels")?;
    let max_col = column("MAX")?;
    let cog_cols = [column("COG X (mm)")?, column("COG Y (mm)")?, column("COG Z (mm)")?];

    let mut clusters = Vec::new();
    for line in lines {
        let cells: Vec<&str> = line.split('\t').map(str::trim).collect();
        let cell = |i: usize| -> ToolResult<f64> {
            let raw = cells.get(i).ok_or_else(|| {
                ToolError::parse(ToolKind::LesionAnalysis, format!("short row {line:?}"))
            })?;
            raw.parse::<f64>()
                .map_err(|_| ToolError::parse(ToolKind::LesionAnalysis, format!("cell {raw:?}")))
        };
        clusters.push(Cluster {
            index: cell(index_col)? as u32,
            voxels: cell(voxels_col)? as u64,
            max_intensity: cell(max_col)?,
            cog_mm: [cell(cog_cols[0])?, cell(cog_cols[1])?, cell(cog_cols[2])?],
        });
    }
    Ok(clusters)
}

/// Render clusters back into the `cluster` table layout.
pub fn render_cluster_table(clusters: &[Cluster]) -> String {
    let mut out = String::from("Cluster Index\tVoxels\tMAX\tCOG X (mm)\tCOG Y (mm)\tCOG Z (mm)\n");
    for c in clusters {
        out.push_str(&format!(
            "{}\t{}\t{}\t{:.2}\t{:.2}\t{:.2}\n",
            c.index, c.voxels, c.max_intensity, c.cog_mm[0], c.cog_mm[1], c.cog_mm[2]
        ));
    }
    out
}

static DCMDUMP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\(([0-9a-fA-F]{4}),([0-9a-fA-F]{4})\)\s+(\w\w)\s+(.*?)\s+#\s*\d+,\s*\d+\s+(\w+)\s*$")
        .expect("valid dcmdump regex")
});

/// Parse `dcmdump` output into keyword -> value.
///
/// String values are printed in brackets; `(no value available)` becomes an
/// empty string. Multi-valued strings keep their backslash separators.
pub fn parse_dicom_dump(text: &str) -> DicomHeader {
    let mut fields = BTreeMap::new();
    for line in text.lines() {
        let Some(caps) = DCMDUMP_LINE.captures(line) else {
            continue;
        };
        let raw = caps[4].trim();
        let value = if raw.starts_with('(') && raw.ends_with(')') {
            String::new()
        } else {
            raw.trim_start_matches('[').trim_end_matches(']').trim().to_string()
        };
        fields.entry(caps[5].to_string()).or_insert(value);
    }
    DicomHeader { fields }
}

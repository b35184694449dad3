//! Cross-modality cluster overlap.
//!
//! Two clusters from different modalities overlap when their centres of
//! gravity are within a distance. The overlapping voxel count is estimated
//! as the smaller of the two cluster sizes.

use brainx_core::Modality;
use brainx_toolkit::Cluster;

pub const OVERLAP_FILE: &str = "cluster_overlap";

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOverlap {
    pub modality: Modality,
    pub cluster: Cluster,
    pub other_modality: Modality,
    pub other_cluster: u32,
    pub distance_mm: f64,
    pub overlap_voxels: u64,
    /// Share of `cluster` covered, in percent.
    pub overlap_percent: f64,
}

fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Every ordered pair of clusters from different modalities within
/// `max_distance_mm`, in input order.
pub fn find_overlaps(clusters: &[(Modality, Vec<Cluster>)], max_distance_mm: f64) -> Vec<ClusterOverlap> {
    let mut out = Vec::new();
    for (modality, own) in clusters {
        for cluster in own {
            for (other_modality, others) in clusters {
                if other_modality == modality {
                    continue;
                }
                for other in others {
                    let d = distance(&cluster.cog_mm, &other.cog_mm);
                    if d > max_distance_mm {
                        continue;
                    }
                    let overlap_voxels = cluster.voxels.min(other.voxels);
                    let overlap_percent = if cluster.voxels == 0 {
                        0.0
                    } else {
                        overlap_voxels as f64 / cluster.voxels as f64 * 100.0
                    };
                    out.push(ClusterOverlap {
                        modality: *modality,
                        cluster: cluster.clone(),
                        other_modality: *other_modality,
                        other_cluster: other.index,
                        distance_mm: d,
                        overlap_voxels,
                        overlap_percent,
                    });
                }
            }
        }
    }
    out
}

pub fn render_csv(overlaps: &[ClusterOverlap]) -> String {
    let mut out = String::from(
        "cluster,modality,voxels,cog_x_mm,cog_y_mm,cog_z_mm,other_cluster,other_modality,distance_mm,overlap_voxels,overlap_percent\n",
    );
    for o in overlaps {
        out.push_str(&format!(
            "{m}_{i},{m},{v},{x:.2},{y:.2},{z:.2},{om}_{oi},{om},{d:.2},{ov},{p:.1}\n",
            m = o.modality.tag(),
            i = o.cluster.index,
            v = o.cluster.voxels,
            x = o.cluster.cog_mm[0],
            y = o.cluster.cog_mm[1],
            z = o.cluster.cog_mm[2],
            om = o.other_modality.tag(),
            oi = o.other_cluster,
            d = o.distance_mm,
            ov = o.overlap_voxels,
            p = o.overlap_percent,
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(index: u32, voxels: u64, cog_mm: [f64; 3]) -> Cluster {
        Cluster {
            index,
            voxels,
            max_intensity: 1.0,
            cog_mm,
        }
    }

    #[test]
    fn test_overlap_within_distance_only() {
        let input = vec![
            (Modality::Flair, vec![cluster(1, 40, [0.0, 0.0, 0.0])]),
            (
                Modality::T2,
                vec![cluster(1, 10, [3.0, 4.0, 0.0]), cluster(2, 50, [30.0, 0.0, 0.0])],
            ),
        ];
        let overlaps = find_overlaps(&input, 10.0);
        assert_eq!(overlaps.len(), 2);

        let first = &overlaps[0];
        assert_eq!(first.modality, Modality::Flair);
        assert_eq!(first.other_cluster, 1);
        assert_eq!(first.distance_mm, 5.0);
        assert_eq!(first.overlap_voxels, 10);
        assert_eq!(first.overlap_percent, 25.0);

        let second = &overlaps[1];
        assert_eq!(second.modality, Modality::T2);
        assert_eq!(second.overlap_percent, 100.0);
    }

    #[test]
    fn test_same_modality_never_overlaps() {
        let input = vec![(
            Modality::Flair,
            vec![cluster(1, 20, [0.0; 3]), cluster(2, 20, [0.0; 3])],
        )];
        assert!(find_overlaps(&input, 10.0).is_empty());
    }

    #[test]
    fn test_csv_rows() {
        let input = vec![
            (Modality::Flair, vec![cluster(3, 12, [1.0, 2.0, 3.0])]),
            (Modality::T2, vec![cluster(7, 24, [1.0, 2.0, 3.0])]),
        ];
        let csv = render_csv(&find_overlaps(&input, 10.0));
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "FLAIR_3,FLAIR,12,1.00,2.00,3.00,T2_7,T2,0.00,12,100.0");
        assert_eq!(lines[2], "T2_7,T2,24,1.00,2.00,3.00,FLAIR_3,FLAIR,0.00,12,50.0");
    }
}

//! Reference space selection.
//!
//! Picks the best file per modality from `extracted/` and decides which
//! modality's grid anchors the run. The decision is made once, persisted by
//! the calling stage, and never re-derived.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use brainx_toolkit::{ImageInfoProbe, ImageStatsProbe, StatsQuery, ToolResult};
use tracing::{debug, info, warn};

use crate::artifact::{glob_in, relative_to, ModuleDir};
use crate::domain::candidate::{AcquisitionInfo, ScanCandidate};
use crate::domain::decision::{ReferenceDecision, ReferenceStrategy, ScanSelection, SelectedScan};
use crate::domain::error::{BrainxError, Result};
use crate::domain::modality::{Modality, ModalityMatcher, ModalityRole};
use crate::obs;
use crate::scoring::{contrast_proxy, ScoringPolicy};

/// Fraction of the maximum intensity below which voxels are background.
const FOREGROUND_FRACTION: f64 = 0.1;

/// The winning file for one modality.
#[derive(Debug, Clone, PartialEq)]
pub struct Chosen {
    pub modality: Modality,
    pub path: PathBuf,
    /// Metadata, when it was loaded.
    pub candidate: Option<ScanCandidate>,
    /// `None` for the single-candidate shortcut.
    pub score: Option<f64>,
    pub candidates: usize,
}

/// Everything stage 2 persists about input selection.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionOutcome {
    pub selection: ScanSelection,
    pub decision: ReferenceDecision,
    pub chosen: Vec<Chosen>,
}

impl SelectionOutcome {
    pub fn chosen(&self, modality: Modality) -> Option<&Chosen> {
        self.chosen.iter().find(|c| c.modality == modality)
    }
}

pub struct ReferenceSelector {
    info: Arc<dyn ImageInfoProbe>,
    stats: Arc<dyn ImageStatsProbe>,
    policy: ScoringPolicy,
    matcher: ModalityMatcher,
}

impl ReferenceSelector {
    pub fn new(
        info: Arc<dyn ImageInfoProbe>,
        stats: Arc<dyn ImageStatsProbe>,
        policy: ScoringPolicy,
        matcher: ModalityMatcher,
    ) -> Self {
        Self {
            info,
            stats,
            policy,
            matcher,
        }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Volumetric files in `dir` whose name matches `modality`, lexically.
    pub fn enumerate(&self, dir: &Path, modality: Modality) -> Result<Vec<PathBuf>> {
        let mut files = glob_in(dir, "*.nii.gz")?;
        files.extend(glob_in(dir, "*.nii")?);
        files.retain(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| self.matcher.matches(modality, name))
        });
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Header, size and sidecar metadata, without intensity statistics.
    async fn header_candidate(&self, path: &Path, modality: Modality) -> ToolResult<ScanCandidate> {
        let header = self.info.header(path).await?;
        let size_bytes = tokio::fs::metadata(path).await?.len();
        let acquisition = AcquisitionInfo::load_for(path);
        Ok(ScanCandidate {
            path: path.to_path_buf(),
            modality,
            voxel_mm: header.pixdim,
            dims: header.dims,
            size_bytes,
            acquisition: acquisition.acquisition,
            dimensionality: acquisition.dimensionality,
            contrast: None,
        })
    }

    /// Full candidate metadata; the contrast proxy is measured for the
    /// primary anatomical modality only.
    pub async fn load_candidate(&self, path: &Path, modality: Modality) -> ToolResult<ScanCandidate> {
        let mut candidate = self.header_candidate(path, modality).await?;
        if modality.role() == ModalityRole::PrimaryAnatomical {
            match self.measure_contrast(path).await {
                Ok(proxy) => candidate.contrast = proxy,
                Err(e) => debug!(path = %path.display(), error = %e, "contrast proxy unavailable"),
            }
        }
        Ok(candidate)
    }

    async fn measure_contrast(&self, path: &Path) -> ToolResult<Option<f64>> {
        let whole = self.stats.stats(&StatsQuery::new(path)).await?;
        let floor = FOREGROUND_FRACTION * whole.max;

        let foreground = self
            .stats
            .stats(&StatsQuery::new(path).window(Some(floor), None))
            .await?;
        let upper = self
            .stats
            .stats(&StatsQuery::new(path).window(Some(foreground.mean), None))
            .await?;
        let lower = self
            .stats
            .stats(&StatsQuery::new(path).window(Some(floor), Some(foreground.mean)))
            .await?;

        Ok(contrast_proxy(foreground.std_dev, upper.mean, lower.mean))
    }

    /// Pick the best of `files` for `modality`.
    ///
    /// A single file is taken without scoring. With several, unreadable
    /// candidates are dropped with a warning; if none remain the data is
    /// corrupt. Exact ties go to the first file in lexical order.
    pub async fn select_best(
        &self,
        modality: Modality,
        files: &[PathBuf],
        primary: Option<&ScanCandidate>,
    ) -> Result<Option<Chosen>> {
        let Some(first) = files.first() else {
            return Ok(None);
        };

        if files.len() == 1 {
            let candidate = match self.header_candidate(first, modality).await {
                Ok(c) => {
                    info!(
                        modality = %modality,
                        file = %first.display(),
                        voxel_mm = ?c.voxel_mm,
                        dims = ?c.dims,
                        size_bytes = c.size_bytes,
                        "single candidate selected"
                    );
                    Some(c)
                }
                Err(e) => {
                    debug!(modality = %modality, file = %first.display(), error = %e, "metadata probe failed for single candidate");
                    None
                }
            };
            return Ok(Some(Chosen {
                modality,
                path: first.clone(),
                candidate,
                score: None,
                candidates: 1,
            }));
        }

        let mut best: Option<(ScanCandidate, f64)> = None;
        for path in files {
            let candidate = match self.load_candidate(path, modality).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(modality = %modality, file = %path.display(), error = %e, "excluding unreadable candidate");
                    continue;
                }
            };
            let score = match modality.role() {
                ModalityRole::PrimaryAnatomical => self.policy.score(&candidate).total(),
                _ => self.policy.secondary_score(&candidate, primary),
            };
            debug!(modality = %modality, file = %path.display(), score, "candidate scored");

            let better = best.as_ref().map_or(true, |(_, top)| score > *top);
            if better {
                best = Some((candidate, score));
            }
        }

        let (candidate, score) = best.ok_or_else(|| {
            BrainxError::DataCorrupt(format!(
                "none of the {} {modality} candidates could be read",
                files.len()
            ))
        })?;
        info!(modality = %modality, file = %candidate.path.display(), score, candidates = files.len(), "best candidate selected");
        Ok(Some(Chosen {
            modality,
            path: candidate.path.clone(),
            candidate: Some(candidate),
            score: Some(score),
            candidates: files.len(),
        }))
    }

    /// Decide which of the two required modalities anchors the grid.
    pub async fn decide_reference(
        &self,
        strategy: ReferenceStrategy,
        output_root: &Path,
        primary: &Chosen,
        fluid: &Chosen,
    ) -> ReferenceDecision {
        let decision = |chosen: &Chosen, rationale: String| ReferenceDecision {
            modality: chosen.modality,
            file: relative_to(output_root, &chosen.path),
            strategy,
            rationale,
        };

        match strategy {
            ReferenceStrategy::AlwaysPrimary => {
                return decision(primary, "strategy always-primary".to_string())
            }
            ReferenceStrategy::AlwaysSecondary => {
                return decision(fluid, "strategy always-secondary".to_string())
            }
            ReferenceStrategy::Adaptive => {}
        }

        let (a, b) = match (self.metadata(primary).await, self.metadata(fluid).await) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return decision(
                    primary,
                    "metadata unavailable; defaulting to primary anatomical".to_string(),
                )
            }
        };

        let (a_pref, b_pref) = (a.is_direct_3d_isotropic(), b.is_direct_3d_isotropic());
        if a_pref != b_pref {
            let winner = if a_pref { primary } else { fluid };
            return decision(
                winner,
                format!(
                    "{} is the only directly acquired 3-D isotropic series",
                    winner.modality
                ),
            );
        }

        let (va, vb) = (a.voxel_volume(), b.voxel_volume());
        if (va - vb).abs() > 1e-9 && va.is_finite() && vb.is_finite() {
            let (winner, small, large) = if va < vb { (primary, va, vb) } else { (fluid, vb, va) };
            return decision(
                winner,
                format!(
                    "{} has the smaller voxel volume ({small:.3} mm3 vs {large:.3} mm3)",
                    winner.modality
                ),
            );
        }

        decision(
            primary,
            "equivalent grids; primary anatomical preferred".to_string(),
        )
    }

    async fn metadata(&self, chosen: &Chosen) -> Option<ScanCandidate> {
        if let Some(c) = &chosen.candidate {
            return Some(c.clone());
        }
        self.header_candidate(&chosen.path, chosen.modality).await.ok()
    }

    /// Select every modality present in `extracted/` and decide the reference.
    pub async fn select_scans(
        &self,
        output_root: &Path,
        strategy: ReferenceStrategy,
    ) -> Result<SelectionOutcome> {
        let extracted = ModuleDir::Extracted.dir(output_root);

        let t1_files = self.enumerate(&extracted, Modality::T1)?;
        let flair_files = self.enumerate(&extracted, Modality::Flair)?;
        for (modality, files) in [(Modality::T1, &t1_files), (Modality::Flair, &flair_files)] {
            if files.is_empty() {
                return Err(BrainxError::DataMissing(format!(
                    "required input missing: no {modality} images in {}",
                    extracted.display()
                )));
            }
        }

        let primary = self
            .select_best(Modality::T1, &t1_files, None)
            .await?
            .ok_or_else(|| BrainxError::DataMissing("required input missing: T1".into()))?;
        let primary_meta = self.metadata(&primary).await;

        let fluid = self
            .select_best(Modality::Flair, &flair_files, primary_meta.as_ref())
            .await?
            .ok_or_else(|| BrainxError::DataMissing("required input missing: FLAIR".into()))?;

        let mut chosen = vec![primary.clone(), fluid.clone()];
        for modality in [Modality::T2, Modality::Swi, Modality::Dwi] {
            let files = self.enumerate(&extracted, modality)?;
            match self.select_best(modality, &files, primary_meta.as_ref()).await {
                Ok(Some(c)) => chosen.push(c),
                Ok(None) => debug!(modality = %modality, "optional modality not present"),
                Err(e) => warn!(modality = %modality, error = %e, "omitting optional modality"),
            }
        }

        let decision = self
            .decide_reference(strategy, output_root, &primary, &fluid)
            .await;
        obs::emit_reference_decided(
            decision.modality.tag(),
            &decision.file.to_string_lossy(),
            &decision.strategy.to_string(),
            &decision.rationale,
        );

        let mut selection = ScanSelection::default();
        for c in &chosen {
            selection.scans.insert(
                c.modality,
                SelectedScan {
                    file: relative_to(output_root, &c.path),
                    score: c.score,
                    candidates: c.candidates,
                },
            );
        }

        Ok(SelectionOutcome {
            selection,
            decision,
            chosen,
        })
    }
}

//! Imaging modalities and the file-name patterns that identify them.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::error::{BrainxError, Result};

/// Role a modality plays in reference selection and scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModalityRole {
    /// High-resolution anatomical scan (T1).
    PrimaryAnatomical,
    /// Fluid-attenuated scan used for hyperintensity analysis (FLAIR).
    FluidSensitive,
    /// Optional extra series processed when present.
    Supplementary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Modality {
    #[serde(rename = "T1")]
    T1,
    #[serde(rename = "FLAIR")]
    Flair,
    #[serde(rename = "T2")]
    T2,
    #[serde(rename = "SWI")]
    Swi,
    #[serde(rename = "DWI")]
    Dwi,
}

impl Modality {
    pub const ALL: [Modality; 5] = [
        Modality::T1,
        Modality::Flair,
        Modality::T2,
        Modality::Swi,
        Modality::Dwi,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Modality::T1 => "T1",
            Modality::Flair => "FLAIR",
            Modality::T2 => "T2",
            Modality::Swi => "SWI",
            Modality::Dwi => "DWI",
        }
    }

    pub fn role(&self) -> ModalityRole {
        match self {
            Modality::T1 => ModalityRole::PrimaryAnatomical,
            Modality::Flair => ModalityRole::FluidSensitive,
            Modality::T2 | Modality::Swi | Modality::Dwi => ModalityRole::Supplementary,
        }
    }

    /// Runs fail when a required modality has no candidates.
    pub fn is_required(&self) -> bool {
        !matches!(self.role(), ModalityRole::Supplementary)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Modality {
    type Err = BrainxError;

    fn from_str(s: &str) -> Result<Self> {
        Modality::ALL
            .into_iter()
            .find(|m| m.tag().eq_ignore_ascii_case(s))
            .ok_or_else(|| BrainxError::InvalidArgument(format!("unknown modality {s:?}")))
    }
}

/// File-name regular expressions for one modality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModalityPattern {
    pub include: String,
    #[serde(default)]
    pub exclude: Option<String>,
}

impl ModalityPattern {
    fn new(include: &str, exclude: Option<&str>) -> Self {
        Self {
            include: include.to_string(),
            exclude: exclude.map(str::to_string),
        }
    }
}

/// `[modalities]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModalityPatterns {
    pub t1: ModalityPattern,
    pub flair: ModalityPattern,
    pub t2: ModalityPattern,
    pub swi: ModalityPattern,
    pub dwi: ModalityPattern,
}

impl Default for ModalityPatterns {
    fn default() -> Self {
        Self {
            t1: ModalityPattern::new(r"(?i)(t1|mprage|spgr)", Some(r"(?i)flair")),
            flair: ModalityPattern::new(r"(?i)flair", None),
            t2: ModalityPattern::new(r"(?i)(^|[_\-])t2([_\-.]|$)", Some(r"(?i)flair")),
            swi: ModalityPattern::new(r"(?i)(swi|susc)", None),
            dwi: ModalityPattern::new(r"(?i)(dwi|dti|diff)", Some(r"(?i)(_adc|_fa)")),
        }
    }
}

impl ModalityPatterns {
    pub fn get(&self, modality: Modality) -> &ModalityPattern {
        match modality {
            Modality::T1 => &self.t1,
            Modality::Flair => &self.flair,
            Modality::T2 => &self.t2,
            Modality::Swi => &self.swi,
            Modality::Dwi => &self.dwi,
        }
    }

    /// Compile every pattern; an unparsable one is an invalid argument.
    pub fn compile(&self) -> Result<ModalityMatcher> {
        let compile = |m: Modality, src: &str| {
            Regex::new(src).map_err(|e| {
                BrainxError::InvalidArgument(format!("modality pattern for {m} is invalid: {e}"))
            })
        };
        let mut rules = Vec::with_capacity(Modality::ALL.len());
        for modality in Modality::ALL {
            let pattern = self.get(modality);
            let include = compile(modality, &pattern.include)?;
            let exclude = match &pattern.exclude {
                Some(src) => Some(compile(modality, src)?),
                None => None,
            };
            rules.push((modality, include, exclude));
        }
        Ok(ModalityMatcher { rules })
    }
}

/// Compiled [`ModalityPatterns`].
#[derive(Debug, Clone)]
pub struct ModalityMatcher {
    rules: Vec<(Modality, Regex, Option<Regex>)>,
}

impl ModalityMatcher {
    pub fn matches(&self, modality: Modality, file_name: &str) -> bool {
        self.rules
            .iter()
            .find(|(m, _, _)| *m == modality)
            .is_some_and(|(_, include, exclude)| {
                include.is_match(file_name)
                    && !exclude.as_ref().is_some_and(|ex| ex.is_match(file_name))
            })
    }
}

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AbiError;

/// Input resolution class of a grid-data payload. Drives the download URL,
/// the registration reference volume, and the output resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionTier {
    Um100,
    Um25,
}

impl ResolutionTier {
    /// Source resolution in micrometers, as the API expects it.
    pub fn source_um(self) -> u32 {
        match self {
            ResolutionTier::Um100 => 100,
            ResolutionTier::Um25 => 25,
        }
    }

    /// Output resolution after registration into the reference space.
    pub fn target_um(self) -> u32 {
        match self {
            ResolutionTier::Um100 => 200,
            ResolutionTier::Um25 => 40,
        }
    }
}

impl fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}um", self.source_um())
    }
}

impl FromStr for ResolutionTier {
    type Err = AbiError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().trim_end_matches("um") {
            "100" => Ok(ResolutionTier::Um100),
            "25" => Ok(ResolutionTier::Um25),
            _ => Err(AbiError::InvalidResolution(value.to_string())),
        }
    }
}

/// Primary injection structure of one experiment, as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedStructure {
    pub acronym: String,
    pub safe_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_quality: Option<String>,
}

/// Structured record extracted from one SectionDataSet XML document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentMetadata {
    pub dataset_id: u64,
    pub seed: SeedStructure,
    pub expression_name: String,
}

static CRE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9A-Za-z]+)(?:-IRES2?)?-Cre").unwrap());

impl ExperimentMetadata {
    /// Expression marker acronym, if the specimen name follows the
    /// `<acronym>[-IRES]-Cre...` driver-line convention. Names without a
    /// usable marker are excluded from BIDS organization but kept on disk.
    pub fn expression_marker(&self) -> Option<String> {
        CRE_PATTERN
            .captures(&self.expression_name)
            .map(|caps| caps[1].to_string())
    }
}

/// Strip everything that is not allowed in a BIDS entity label.
pub fn bids_label(value: &str) -> String {
    value.chars().filter(|ch| ch.is_ascii_alphanumeric()).collect()
}

/// Directory name for a structure safe-name: spaces become underscores and
/// path separators are dropped. Case is preserved; the organizer's p-split
/// keys on the capitalized `Primary` prefix.
pub fn structure_dir_name(safe_name: &str) -> String {
    safe_name.trim().replace(' ', "_").replace(['/', '\\'], "")
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn metadata_with_name(name: &str) -> ExperimentMetadata {
        ExperimentMetadata {
            dataset_id: 1,
            seed: SeedStructure {
                acronym: "MOp".to_string(),
                safe_name: "Primary motor area".to_string(),
                injection_method: None,
                injection_quality: None,
            },
            expression_name: name.to_string(),
        }
    }

    #[test]
    fn parse_resolution_tier() {
        let tier: ResolutionTier = "100".parse().unwrap();
        assert_eq!(tier, ResolutionTier::Um100);
        assert_eq!(tier.target_um(), 200);

        let tier: ResolutionTier = "25um".parse().unwrap();
        assert_eq!(tier, ResolutionTier::Um25);
        assert_eq!(tier.target_um(), 40);

        let err = "40".parse::<ResolutionTier>().unwrap_err();
        assert_matches!(err, AbiError::InvalidResolution(_));
    }

    #[test]
    fn expression_marker_plain_cre() {
        let meta = metadata_with_name("Rbp4-Cre_KL100-2637");
        assert_eq!(meta.expression_marker().as_deref(), Some("Rbp4"));
    }

    #[test]
    fn expression_marker_ires_cre() {
        let meta = metadata_with_name("Slc17a7-IRES2-Cre-393");
        assert_eq!(meta.expression_marker().as_deref(), Some("Slc17a7"));
    }

    #[test]
    fn expression_marker_absent_for_wild_type() {
        let meta = metadata_with_name("C57BL/6J-126862");
        assert_eq!(meta.expression_marker(), None);
    }

    #[test]
    fn bids_label_strips_punctuation() {
        assert_eq!(bids_label("SSp-ll"), "SSpll");
        assert_eq!(bids_label("MOp"), "MOp");
    }

    #[test]
    fn structure_dir_name_keeps_case() {
        assert_eq!(
            structure_dir_name("Primary motor area"),
            "Primary_motor_area"
        );
        assert_eq!(
            structure_dir_name("Anterior cingulate area"),
            "Anterior_cingulate_area"
        );
    }
}

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{EnumIter, EnumString};

use crate::error::PipelineError;

/// Feature types found in the type column of a features file.
#[derive(
    Clone, Copy, Debug, Deserialize, EnumString, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize,
)]
pub enum FeatureType {
    #[strum(serialize = "Gene Expression")]
    #[strum(serialize = "gene_expression")]
    Gene,
    #[strum(serialize = "Antibody Capture")]
    #[strum(serialize = "antibody_capture")]
    Antibody,
    #[strum(serialize = "Antigen Capture")]
    #[strum(serialize = "antigen_capture")]
    Antigen,
    #[strum(serialize = "Multiplexing Capture")]
    #[strum(serialize = "multiplexing_capture")]
    Multiplexing,
    #[strum(serialize = "CRISPR Guide Capture")]
    #[strum(serialize = "crispr_guide_capture")]
    Crispr,
    #[strum(serialize = "Custom")]
    #[strum(serialize = "custom")]
    Custom,
}

impl FeatureType {
    /// Return a space-separated string representation of this feature type.
    pub fn as_str(&self) -> &'static str {
        #[allow(clippy::enum_glob_use)]
        use FeatureType::*;
        match self {
            Antibody => "Antibody Capture",
            Antigen => "Antigen Capture",
            Crispr => "CRISPR Guide Capture",
            Custom => "Custom",
            Gene => "Gene Expression",
            Multiplexing => "Multiplexing Capture",
        }
    }

    /// Return an underscore-separated lowercase string representation of this feature type.
    pub fn lc(&self) -> &'static str {
        #[allow(clippy::enum_glob_use)]
        use FeatureType::*;
        match self {
            Gene => "gene_expression",
            Antibody => "antibody_capture",
            Antigen => "antigen_capture",
            Multiplexing => "multiplexing_capture",
            Crispr => "crispr_guide_capture",
            Custom => "custom",
        }
    }

    /// The modality this feature type is analyzed as by default.
    pub fn default_modality(&self) -> Option<Modality> {
        match self {
            FeatureType::Gene => Some(Modality::Rna),
            FeatureType::Antibody => Some(Modality::Adt),
            FeatureType::Crispr => Some(Modality::Crispr),
            FeatureType::Antigen | FeatureType::Multiplexing | FeatureType::Custom => None,
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}

/// An analyzed modality. Every per-modality step belongs to exactly one.
#[derive(
    Clone, Copy, Debug, Deserialize, EnumIter, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize,
)]
pub enum Modality {
    #[serde(rename = "RNA")]
    Rna,
    #[serde(rename = "ADT")]
    Adt,
    #[serde(rename = "CRISPR")]
    Crispr,
}

impl Modality {
    /// All modalities in pipeline order.
    pub const ALL: [Modality; 3] = [Modality::Rna, Modality::Adt, Modality::Crispr];

    /// Name used for persisted groups and matrix keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Rna => "RNA",
            Modality::Adt => "ADT",
            Modality::Crispr => "CRISPR",
        }
    }

    /// Prefix of the per-modality step names.
    pub fn lc(&self) -> &'static str {
        match self {
            Modality::Rna => "rna",
            Modality::Adt => "adt",
            Modality::Crispr => "crispr",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Modality {
    type Err = PipelineError;

    /// The unnamed default modality is RNA.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" | "RNA" | "rna" => Modality::Rna,
            "ADT" | "adt" => Modality::Adt,
            "CRISPR" | "crispr" => Modality::Crispr,
            _ => return Err(PipelineError::reference(format!("unknown modality {s:?}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_type_aliases() {
        assert_eq!(
            FeatureType::from_str("Gene Expression").unwrap(),
            FeatureType::Gene
        );
        assert_eq!(
            FeatureType::from_str("antibody_capture").unwrap(),
            FeatureType::Antibody
        );
        assert!(FeatureType::from_str("Peaks").is_err());
        assert_eq!(FeatureType::Crispr.to_string(), "CRISPR Guide Capture");
    }

    #[test]
    fn test_modality_names() {
        assert_eq!(Modality::from_str("").unwrap(), Modality::Rna);
        assert_eq!(Modality::from_str("ADT").unwrap(), Modality::Adt);
        assert!(matches!(
            Modality::from_str("ATAC"),
            Err(PipelineError::Reference(_))
        ));
        assert_eq!(
            FeatureType::Antibody.default_modality(),
            Some(Modality::Adt)
        );
        assert_eq!(FeatureType::Custom.default_modality(), None);
    }
}

//! Entity types known to the registry and the static shape of their tables.
//!
//! Every entity type that can appear in a Mapping Specification, a run
//! configuration, or the persistence store is a variant of [`EntityType`].
//! The per-type [`TableSpec`] describes what the local store enforces on
//! write: non-null columns, foreign keys into parent tables, and unique
//! field sets.

use std::{fmt, str::FromStr};

use anyhow::anyhow;
use heck::ToSnakeCase;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityType {
    Investigator,
    Study,
    StudyFile,
    Family,
    Participant,
    FamilyRelationship,
    Diagnosis,
    Phenotype,
    Outcome,
    Demographic,
    Biospecimen,
    SequencingCenter,
    SequencingExperiment,
    GenomicFile,
}

/// Load order used when a run configuration does not list its entities.
pub const DEFAULT_ENTITY_TYPES: &[EntityType] = &[
    EntityType::Investigator,
    EntityType::Study,
    EntityType::StudyFile,
    EntityType::Family,
    EntityType::Participant,
    EntityType::FamilyRelationship,
    EntityType::Diagnosis,
    EntityType::Phenotype,
    EntityType::Outcome,
    EntityType::Biospecimen,
    EntityType::SequencingExperiment,
    EntityType::GenomicFile,
];

impl EntityType {
    pub const ALL: &'static [EntityType] = &[
        EntityType::Investigator,
        EntityType::Study,
        EntityType::StudyFile,
        EntityType::Family,
        EntityType::Participant,
        EntityType::FamilyRelationship,
        EntityType::Diagnosis,
        EntityType::Phenotype,
        EntityType::Outcome,
        EntityType::Demographic,
        EntityType::Biospecimen,
        EntityType::SequencingCenter,
        EntityType::SequencingExperiment,
        EntityType::GenomicFile,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Investigator => "investigator",
            EntityType::Study => "study",
            EntityType::StudyFile => "study_file",
            EntityType::Family => "family",
            EntityType::Participant => "participant",
            EntityType::FamilyRelationship => "family_relationship",
            EntityType::Diagnosis => "diagnosis",
            EntityType::Phenotype => "phenotype",
            EntityType::Outcome => "outcome",
            EntityType::Demographic => "demographic",
            EntityType::Biospecimen => "biospecimen",
            EntityType::SequencingCenter => "sequencing_center",
            EntityType::SequencingExperiment => "sequencing_experiment",
            EntityType::GenomicFile => "genomic_file",
        }
    }

    /// Two-letter prefix of generated ids for this type.
    pub fn id_prefix(self) -> &'static str {
        match self {
            EntityType::Investigator => "IG",
            EntityType::Study => "SD",
            EntityType::StudyFile => "SF",
            EntityType::Family => "FM",
            EntityType::Participant => "PT",
            EntityType::FamilyRelationship => "FR",
            EntityType::Diagnosis => "DG",
            EntityType::Phenotype => "PH",
            EntityType::Outcome => "OC",
            EntityType::Demographic => "DM",
            EntityType::Biospecimen => "BS",
            EntityType::SequencingCenter => "SC",
            EntityType::SequencingExperiment => "SE",
            EntityType::GenomicFile => "GF",
        }
    }

    pub fn table(self) -> TableSpec {
        use EntityType::*;
        match self {
            Investigator | Family | SequencingCenter => TableSpec::default(),
            Study => TableSpec {
                not_null: &["external_id"],
                foreign_keys: STUDY_KEYS,
                unique: &[],
            },
            StudyFile => TableSpec {
                foreign_keys: STUDY_FILE_KEYS,
                ..TableSpec::default()
            },
            Participant => TableSpec {
                foreign_keys: PARTICIPANT_KEYS,
                ..TableSpec::default()
            },
            FamilyRelationship => TableSpec {
                not_null: &["participant1_to_participant2_relation"],
                foreign_keys: FAMILY_RELATIONSHIP_KEYS,
                unique: &[&[
                    "participant1_id",
                    "participant2_id",
                    "participant1_to_participant2_relation",
                    "participant2_to_participant1_relation",
                ]],
            },
            Diagnosis | Phenotype | Outcome | Demographic => TableSpec {
                foreign_keys: PARTICIPANT_CHILD_KEYS,
                ..TableSpec::default()
            },
            Biospecimen => TableSpec {
                not_null: &["analyte_type"],
                foreign_keys: BIOSPECIMEN_KEYS,
                unique: &[],
            },
            SequencingExperiment => TableSpec {
                not_null: &["external_id"],
                foreign_keys: SEQUENCING_EXPERIMENT_KEYS,
                unique: &[],
            },
            GenomicFile => TableSpec {
                foreign_keys: GENOMIC_FILE_KEYS,
                ..TableSpec::default()
            },
        }
    }
}

const STUDY_KEYS: &[ForeignKey] = &[ForeignKey::optional(
    "investigator_id",
    EntityType::Investigator,
)];
const STUDY_FILE_KEYS: &[ForeignKey] = &[ForeignKey::required("study_id", EntityType::Study)];
const PARTICIPANT_KEYS: &[ForeignKey] = &[
    ForeignKey::required("study_id", EntityType::Study),
    ForeignKey::optional("family_id", EntityType::Family),
];
const FAMILY_RELATIONSHIP_KEYS: &[ForeignKey] = &[
    ForeignKey::required("participant1_id", EntityType::Participant),
    ForeignKey::required("participant2_id", EntityType::Participant),
];
const PARTICIPANT_CHILD_KEYS: &[ForeignKey] = &[ForeignKey::required(
    "participant_id",
    EntityType::Participant,
)];
const BIOSPECIMEN_KEYS: &[ForeignKey] = &[
    ForeignKey::required("participant_id", EntityType::Participant),
    ForeignKey::optional("sequencing_center_id", EntityType::SequencingCenter),
];
const SEQUENCING_EXPERIMENT_KEYS: &[ForeignKey] = &[ForeignKey::optional(
    "sequencing_center_id",
    EntityType::SequencingCenter,
)];
const GENOMIC_FILE_KEYS: &[ForeignKey] = &[
    ForeignKey::optional("biospecimen_id", EntityType::Biospecimen),
    ForeignKey::optional("sequencing_experiment_id", EntityType::SequencingExperiment),
];

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_snake_case();
        EntityType::ALL
            .iter()
            .copied()
            .find(|ty| ty.as_str() == normalized)
            .ok_or_else(|| anyhow!("Unknown entity type '{value}'"))
    }
}

impl Serialize for EntityType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        EntityType::from_str(&token).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub field: &'static str,
    pub parent: EntityType,
    pub nullable: bool,
}

impl ForeignKey {
    const fn required(field: &'static str, parent: EntityType) -> Self {
        Self {
            field,
            parent,
            nullable: false,
        }
    }

    const fn optional(field: &'static str, parent: EntityType) -> Self {
        Self {
            field,
            parent,
            nullable: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TableSpec {
    pub not_null: &'static [&'static str],
    pub foreign_keys: &'static [ForeignKey],
    pub unique: &'static [&'static [&'static str]],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_snake_and_camel_names() {
        assert_eq!("genomic_file".parse::<EntityType>().unwrap(), EntityType::GenomicFile);
        assert_eq!("StudyFile".parse::<EntityType>().unwrap(), EntityType::StudyFile);
        assert!("sample".parse::<EntityType>().is_err());
    }

    #[test]
    fn default_order_puts_parents_first() {
        let position = |ty| DEFAULT_ENTITY_TYPES.iter().position(|t| *t == ty).unwrap();
        for ty in DEFAULT_ENTITY_TYPES {
            for fk in ty.table().foreign_keys {
                if DEFAULT_ENTITY_TYPES.contains(&fk.parent) {
                    assert!(position(fk.parent) < position(*ty), "{ty} before {}", fk.parent);
                }
            }
        }
    }
}

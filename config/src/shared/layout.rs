use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Built-in deployment profiles with differing source and destination defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentProfile {
    /// Metadb-style deployment reading `folio_source_record.records_lb`.
    #[default]
    Metadb,
    /// LDP-style deployment reading `public.srs_records`.
    Ldp,
}

/// Fully resolved names of the source relations and the projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLayout {
    pub records_schema: String,
    pub records_table: String,
    pub content_schema: String,
    pub content_table: String,
    pub id_column: String,
    pub matched_id_column: String,
    pub external_hrid_column: String,
    pub state_column: String,
    pub content_column: String,
    pub target_schema: String,
    pub target_table: String,
}

impl TableLayout {
    /// Returns the default layout of a [`DeploymentProfile`].
    pub fn for_profile(profile: DeploymentProfile) -> TableLayout {
        match profile {
            DeploymentProfile::Metadb => TableLayout {
                records_schema: "folio_source_record".to_string(),
                records_table: "records_lb".to_string(),
                content_schema: "folio_source_record".to_string(),
                content_table: "marc_records_lb".to_string(),
                id_column: "id".to_string(),
                matched_id_column: "matched_id".to_string(),
                external_hrid_column: "external_hrid".to_string(),
                state_column: "state".to_string(),
                content_column: "content".to_string(),
                target_schema: "folio_source_record".to_string(),
                target_table: "marc__t".to_string(),
            },
            DeploymentProfile::Ldp => TableLayout {
                records_schema: "public".to_string(),
                records_table: "srs_records".to_string(),
                content_schema: "public".to_string(),
                content_table: "srs_marc".to_string(),
                id_column: "id".to_string(),
                matched_id_column: "matched_id".to_string(),
                external_hrid_column: "external_hrid".to_string(),
                state_column: "state".to_string(),
                content_column: "data".to_string(),
                target_schema: "public".to_string(),
                target_table: "srs_marctab".to_string(),
            },
        }
    }

    /// Checks that every resolved name is non-empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let names = [
            ("records_schema", &self.records_schema),
            ("records_table", &self.records_table),
            ("content_schema", &self.content_schema),
            ("content_table", &self.content_table),
            ("id_column", &self.id_column),
            ("matched_id_column", &self.matched_id_column),
            ("external_hrid_column", &self.external_hrid_column),
            ("state_column", &self.state_column),
            ("content_column", &self.content_column),
            ("target_schema", &self.target_schema),
            ("target_table", &self.target_table),
        ];

        for (field, value) in names {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyLayoutName(field));
            }
        }

        Ok(())
    }
}

/// Optional per-deployment overrides applied on top of a profile's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutOverrides {
    pub records_schema: Option<String>,
    pub records_table: Option<String>,
    pub content_schema: Option<String>,
    pub content_table: Option<String>,
    pub id_column: Option<String>,
    pub matched_id_column: Option<String>,
    pub external_hrid_column: Option<String>,
    pub state_column: Option<String>,
    pub content_column: Option<String>,
    pub target_schema: Option<String>,
    pub target_table: Option<String>,
}

/// Layout section of the syncer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default)]
    pub profile: DeploymentProfile,
    #[serde(default)]
    pub overrides: LayoutOverrides,
}

impl LayoutConfig {
    /// Resolves the profile defaults and applies the overrides.
    pub fn resolve(&self) -> TableLayout {
        let mut layout = TableLayout::for_profile(self.profile);
        let overrides = self.overrides.clone();

        let pairs = [
            (&mut layout.records_schema, overrides.records_schema),
            (&mut layout.records_table, overrides.records_table),
            (&mut layout.content_schema, overrides.content_schema),
            (&mut layout.content_table, overrides.content_table),
            (&mut layout.id_column, overrides.id_column),
            (&mut layout.matched_id_column, overrides.matched_id_column),
            (&mut layout.external_hrid_column, overrides.external_hrid_column),
            (&mut layout.state_column, overrides.state_column),
            (&mut layout.content_column, overrides.content_column),
            (&mut layout.target_schema, overrides.target_schema),
            (&mut layout.target_table, overrides.target_table),
        ];

        for (slot, value) in pairs {
            if let Some(value) = value {
                *slot = value;
            }
        }

        layout
    }
}

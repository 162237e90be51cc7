use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resolution of a raw ADO team label to a team.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamMapping {
    pub ado_team: String,
    pub team_id: Uuid,
    /// `None` when the mapped team has since been deleted.
    pub team_name: Option<String>,
}

/// Resolution of a raw ADO application label to an application group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppMapping {
    pub ado_app: String,
    pub group_id: Uuid,
    pub group_name: Option<String>,
}

/// Set or clear a team mapping. A `None` target removes the mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertTeamMappingInput {
    pub ado_team: String,
    pub team_id: Option<Uuid>,
}

/// Set or clear an application mapping. A `None` target removes the mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertAppMappingInput {
    pub ado_app: String,
    pub group_id: Option<Uuid>,
}

/// Row counts of a bulk feature upsert.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
}

/// Effort of all stored features in one (year, iteration).
///
/// Features whose period cannot be parsed are grouped under `None`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeriodEffort {
    pub year: Option<i32>,
    pub iteration: Option<u32>,
    pub pi_key: Option<String>,
    pub feature_count: usize,
    pub total_effort: f64,
}

/// Effort of all stored features carrying one raw team label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamEffort {
    pub team_raw: Option<String>,
    pub feature_count: usize,
    pub total_effort: f64,
    pub mapped: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetAdoInput {
    #[serde(default)]
    pub include_mappings: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResetSummary {
    pub features_deleted: usize,
    pub mappings_deleted: usize,
}

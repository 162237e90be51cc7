use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A delivery team and its staffing composition.
///
/// `team_fte` is the headcount the fixed period cost is based on. The three
/// role FTEs split effort-driven cost between internal delivery staff and the
/// two contractor types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub program_id: Option<Uuid>,
    pub product_owner: Option<String>,
    pub team_fte: f64,
    pub delivery_fte: f64,
    pub contractor_cs_fte: f64,
    pub contractor_c_fte: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a team. FTEs default to 0 and must not be negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTeamInput {
    pub name: String,
    pub program_id: Option<Uuid>,
    pub product_owner: Option<String>,
    #[serde(default)]
    pub team_fte: f64,
    #[serde(default)]
    pub delivery_fte: f64,
    #[serde(default)]
    pub contractor_cs_fte: f64,
    #[serde(default)]
    pub contractor_c_fte: f64,
}

impl CreateTeamInput {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program_id: None,
            product_owner: None,
            team_fte: 0.0,
            delivery_fte: 0.0,
            contractor_cs_fte: 0.0,
            contractor_c_fte: 0.0,
        }
    }
}

/// Input for updating a team. All fields are optional for partial updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTeamInput {
    pub name: Option<String>,
    /// `Some(None)` detaches the team from its program.
    #[serde(default, deserialize_with = "super::present", skip_serializing_if = "Option::is_none")]
    pub program_id: Option<Option<Uuid>>,
    pub product_owner: Option<String>,
    pub team_fte: Option<f64>,
    pub delivery_fte: Option<f64>,
    pub contractor_cs_fte: Option<f64>,
    pub contractor_c_fte: Option<f64>,
}

/// Annual cost rates of a team.
///
/// `xom_rate` prices internal FTEs (both `team_fte` and `delivery_fte`); the
/// contractor rates price their respective role FTEs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamRate {
    pub team_id: Uuid,
    pub team_name: String,
    pub xom_rate: f64,
    pub contractor_cs_rate: f64,
    pub contractor_c_rate: f64,
    pub updated_at: DateTime<Utc>,
}

/// Insert-or-replace input for a team's rates. Missing rates are stored as 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpsertTeamRateInput {
    pub xom_rate: Option<f64>,
    pub contractor_cs_rate: Option<f64>,
    pub contractor_c_rate: Option<f64>,
}

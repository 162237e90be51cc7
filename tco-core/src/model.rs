use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::period::PeriodKey;

/// Staffing composition and annual rates of one team.
///
/// All quantities are non-negative; missing values are carried as 0 so a team
/// without rates simply costs nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamCostProfile {
    pub team_id: Uuid,
    pub team_name: String,
    pub program_id: Option<Uuid>,
    pub team_fte: f64,
    pub delivery_fte: f64,
    pub contractor_cs_fte: f64,
    pub contractor_c_fte: f64,
    /// Annual cost per internal FTE. Applies to `team_fte` and `delivery_fte`.
    pub xom_rate: f64,
    pub contractor_cs_rate: f64,
    pub contractor_c_rate: f64,
}

impl TeamCostProfile {
    /// A profile with every quantity at zero.
    pub fn empty(team_id: Uuid, team_name: impl Into<String>) -> Self {
        Self {
            team_id,
            team_name: team_name.into(),
            program_id: None,
            team_fte: 0.0,
            delivery_fte: 0.0,
            contractor_cs_fte: 0.0,
            contractor_c_fte: 0.0,
            xom_rate: 0.0,
            contractor_cs_rate: 0.0,
            contractor_c_rate: 0.0,
        }
    }

    /// Sum of the three role FTEs used to split effort-driven cost.
    pub fn role_denominator(&self) -> f64 {
        self.delivery_fte + self.contractor_cs_fte + self.contractor_c_fte
    }
}

/// One ADO feature as imported, before any mapping or parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub feature_id: String,
    pub title: Option<String>,
    pub state: Option<String>,
    pub team_raw: Option<String>,
    pub app_name_raw: Option<String>,
    /// Kept as `None` for display; sums treat it as 0.
    pub effort_points: Option<f64>,
    pub iteration_path: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub changed_at: Option<NaiveDateTime>,
    /// Explicit year column from the export, when present.
    pub ado_year: Option<i32>,
}

impl FeatureRecord {
    pub fn new(feature_id: impl Into<String>) -> Self {
        Self {
            feature_id: feature_id.into(),
            title: None,
            state: None,
            team_raw: None,
            app_name_raw: None,
            effort_points: None,
            iteration_path: None,
            created_at: None,
            changed_at: None,
            ado_year: None,
        }
    }

    pub fn effort(&self) -> f64 {
        self.effort_points.unwrap_or(0.0)
    }
}

/// How the fixed team cost of a period is split across its cohort.
///
/// - `Proportional`: by effort points, falling back to an even split when the
///   cohort carries no effort at all
/// - `Even`: always `fixed_cost / feature_count`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    #[default]
    Proportional,
    Even,
}

impl AllocationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proportional => "proportional",
            Self::Even => "even",
        }
    }
}

impl fmt::Display for AllocationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown allocation policy '{0}' (expected 'proportional' or 'even')")]
pub struct UnknownPolicy(pub String);

impl FromStr for AllocationPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proportional" => Ok(Self::Proportional),
            "even" => Ok(Self::Even),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

/// Per-feature cost row, the output of the allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCost {
    pub feature_id: String,
    pub title: Option<String>,
    pub state: Option<String>,
    pub team_raw: Option<String>,
    pub team_id: Uuid,
    pub team_name: String,
    /// Program of the owning team.
    pub program_id: Option<Uuid>,
    pub app_name_raw: Option<String>,
    pub app_group_id: Option<Uuid>,
    pub effort_points: Option<f64>,
    pub iteration_path: Option<String>,
    pub ado_year: Option<i32>,
    pub iteration_num: Option<u32>,
    /// `2025-I1`, present only when both year and iteration resolved.
    pub pi_key: Option<String>,
    /// Share of the team's fixed period cost. `None` when the feature has no period.
    pub team_cost_per_pi: Option<f64>,
    pub delivery_cost_per_pi: f64,
    pub contractor_cs_cost_per_pi: f64,
    pub contractor_c_cost_per_pi: f64,
}

impl FeatureCost {
    pub fn period(&self) -> Option<PeriodKey> {
        match (self.ado_year, self.iteration_num) {
            (Some(year), Some(iteration)) => Some(PeriodKey::new(year, iteration)),
            _ => None,
        }
    }

    /// Fixed share plus the three role components.
    pub fn total_cost(&self) -> f64 {
        self.team_cost_per_pi.unwrap_or(0.0)
            + self.delivery_cost_per_pi
            + self.contractor_cs_cost_per_pi
            + self.contractor_c_cost_per_pi
    }
}

/// Why a feature could not be attached to a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedReason {
    /// The feature carries no team label.
    MissingTeam,
    /// The team label has no mapping row.
    NoMapping,
    /// The mapping points at a team that does not exist.
    UnknownTeam,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmappedFeature {
    pub feature_id: String,
    pub title: Option<String>,
    pub team_raw: Option<String>,
    pub app_name_raw: Option<String>,
    pub effort_points: Option<f64>,
    pub iteration_path: Option<String>,
    pub reason: UnmappedReason,
}

/// Totals for one (team, year, iteration) cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortSummary {
    pub team_id: Uuid,
    pub team_name: String,
    pub year: i32,
    pub iteration: u32,
    pub pi_key: String,
    pub feature_count: usize,
    pub total_effort_points: f64,
    pub fixed_period_cost: f64,
    /// Sum of the members' fixed-cost shares; equals `fixed_period_cost`.
    pub allocated_fixed_cost: f64,
    pub delivery_cost: f64,
    pub contractor_cs_cost: f64,
    pub contractor_c_cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationReport {
    pub policy: AllocationPolicy,
    pub features: Vec<FeatureCost>,
    pub cohorts: Vec<CohortSummary>,
    pub unmapped: Vec<UnmappedFeature>,
}

impl AllocationReport {
    pub fn feature(&self, feature_id: &str) -> Option<&FeatureCost> {
        self.features.iter().find(|f| f.feature_id == feature_id)
    }

    pub fn cohort(&self, team_id: Uuid, period: PeriodKey) -> Option<&CohortSummary> {
        self.cohorts.iter().find(|c| {
            c.team_id == team_id && c.year == period.year && c.iteration == period.iteration
        })
    }
}

/// Selects feature cost rows for [`cost_components`](crate::cost_components).
///
/// Every non-empty list restricts the rows to the listed values; an empty
/// list matches everything. Rows without a resolved year or iteration only
/// pass when the corresponding list is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentFilter {
    #[serde(default)]
    pub years: Vec<i32>,
    #[serde(default)]
    pub iterations: Vec<u32>,
    #[serde(default)]
    pub program_ids: Vec<Uuid>,
    #[serde(default)]
    pub team_ids: Vec<Uuid>,
    #[serde(default)]
    pub group_ids: Vec<Uuid>,
}

impl ComponentFilter {
    pub fn matches(&self, row: &FeatureCost) -> bool {
        fn allows<T: PartialEq>(list: &[T], value: Option<&T>) -> bool {
            list.is_empty() || value.is_some_and(|v| list.contains(v))
        }

        allows(&self.years, row.ado_year.as_ref())
            && allows(&self.iterations, row.iteration_num.as_ref())
            && allows(&self.program_ids, row.program_id.as_ref())
            && allows(&self.team_ids, Some(&row.team_id))
            && allows(&self.group_ids, row.app_group_id.as_ref())
    }
}

/// Effort and cost components summed at (year, iteration, program, team, group) grain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostComponents {
    pub year: Option<i32>,
    pub iteration: Option<u32>,
    pub program_id: Option<Uuid>,
    pub team_id: Uuid,
    pub team_name: String,
    pub group_id: Option<Uuid>,
    pub feature_count: usize,
    pub effort_points: f64,
    pub team_cost_per_pi: f64,
    pub delivery_cost_per_pi: f64,
    pub contractor_cs_cost_per_pi: f64,
    pub contractor_c_cost_per_pi: f64,
}

impl CostComponents {
    pub fn total_cost(&self) -> f64 {
        self.team_cost_per_pi
            + self.delivery_cost_per_pi
            + self.contractor_cs_cost_per_pi
            + self.contractor_c_cost_per_pi
    }
}

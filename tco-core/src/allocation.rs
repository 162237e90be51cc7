//! Team cost allocation across ADO features.
//!
//! Two independent figures are produced for every mapped feature:
//!
//! - a share of the team's fixed per-iteration cost, distributed over the
//!   cohort of features sharing (team, year, iteration) so that the shares add
//!   back up to the fixed cost
//! - three effort-driven role costs (delivery, contractor CS, contractor C)
//!   which scale linearly with the feature's own effort and are not normalized

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::*;
use crate::period::{parse_iteration_number, parse_year, PeriodKey};

/// Iterations per year; the fixed cost of one iteration is a quarter of the annual cost.
pub const ITERATIONS_PER_YEAR: f64 = 4.0;

/// Raw ADO labels resolved to canonical identifiers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelMappings {
    /// ADO team label → team id.
    pub teams: HashMap<String, Uuid>,
    /// ADO application label → application group id.
    pub apps: HashMap<String, Uuid>,
}

impl LabelMappings {
    pub fn with_team(mut self, label: impl Into<String>, team_id: Uuid) -> Self {
        self.teams.insert(label.into(), team_id);
        self
    }

    pub fn with_app(mut self, label: impl Into<String>, group_id: Uuid) -> Self {
        self.apps.insert(label.into(), group_id);
        self
    }
}

/// Effort-driven cost components of one feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleCosts {
    pub delivery: f64,
    pub contractor_cs: f64,
    pub contractor_c: f64,
}

impl RoleCosts {
    pub fn total(&self) -> f64 {
        self.delivery + self.contractor_cs + self.contractor_c
    }
}

/// Baseline staffing cost of a team for one iteration: `team_fte * xom_rate / 4`.
pub fn fixed_period_cost(team: &TeamCostProfile) -> f64 {
    team.team_fte * team.xom_rate / ITERATIONS_PER_YEAR
}

/// Split `fixed_cost` across a cohort given each member's effort points.
///
/// Returns one share per input, in order. An empty cohort yields no shares.
pub fn allocate_fixed_cost(
    fixed_cost: f64,
    efforts: &[Option<f64>],
    policy: AllocationPolicy,
) -> Vec<f64> {
    if efforts.is_empty() {
        return Vec::new();
    }

    let even_share = fixed_cost / efforts.len() as f64;
    match policy {
        AllocationPolicy::Even => vec![even_share; efforts.len()],
        AllocationPolicy::Proportional => {
            let total: f64 = efforts.iter().map(|e| e.unwrap_or(0.0)).sum();
            if total > 0.0 {
                efforts
                    .iter()
                    .map(|e| fixed_cost * (e.unwrap_or(0.0) / total))
                    .collect()
            } else {
                vec![even_share; efforts.len()]
            }
        }
    }
}

/// Role costs for a feature with `effort_points` on `team`.
///
/// Each role gets `(role_fte / denom) * effort * role_rate`, where delivery is
/// billed at the internal `xom_rate`. A team without role FTEs costs nothing.
pub fn role_costs(team: &TeamCostProfile, effort_points: Option<f64>) -> RoleCosts {
    let denom = team.role_denominator();
    if denom <= 0.0 {
        return RoleCosts::default();
    }

    let effort = effort_points.unwrap_or(0.0);
    RoleCosts {
        delivery: team.delivery_fte / denom * effort * team.xom_rate,
        contractor_cs: team.contractor_cs_fte / denom * effort * team.contractor_cs_rate,
        contractor_c: team.contractor_c_fte / denom * effort * team.contractor_c_rate,
    }
}

/// Resolve the team a feature belongs to.
pub fn resolve_team<'a>(
    feature: &FeatureRecord,
    mappings: &LabelMappings,
    teams: &'a HashMap<Uuid, &'a TeamCostProfile>,
) -> Result<&'a TeamCostProfile, UnmappedReason> {
    let label = feature
        .team_raw
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(UnmappedReason::MissingTeam)?;
    let team_id = mappings
        .teams
        .get(label)
        .ok_or(UnmappedReason::NoMapping)?;
    teams
        .get(team_id)
        .copied()
        .ok_or(UnmappedReason::UnknownTeam)
}

/// Run the full allocation over the current state of teams, features and mappings.
pub fn allocate(
    teams: &[TeamCostProfile],
    features: &[FeatureRecord],
    mappings: &LabelMappings,
    policy: AllocationPolicy,
) -> AllocationReport {
    let teams_by_id: HashMap<Uuid, &TeamCostProfile> =
        teams.iter().map(|t| (t.team_id, t)).collect();

    let mut rows: Vec<FeatureCost> = Vec::with_capacity(features.len());
    let mut unmapped = Vec::new();
    let mut cohorts: BTreeMap<(Uuid, PeriodKey), Vec<usize>> = BTreeMap::new();

    for feature in features {
        let team = match resolve_team(feature, mappings, &teams_by_id) {
            Ok(team) => team,
            Err(reason) => {
                unmapped.push(UnmappedFeature {
                    feature_id: feature.feature_id.clone(),
                    title: feature.title.clone(),
                    team_raw: feature.team_raw.clone(),
                    app_name_raw: feature.app_name_raw.clone(),
                    effort_points: feature.effort_points,
                    iteration_path: feature.iteration_path.clone(),
                    reason,
                });
                continue;
            }
        };

        let path = feature.iteration_path.as_deref();
        let year = parse_year(feature.ado_year, path, feature.changed_at, feature.created_at);
        let iteration = path.and_then(parse_iteration_number);
        let period = year.zip(iteration).map(|(y, i)| PeriodKey::new(y, i));

        let roles = role_costs(team, feature.effort_points);
        let app_group_id = feature
            .app_name_raw
            .as_deref()
            .map(str::trim)
            .and_then(|label| mappings.apps.get(label))
            .copied();

        if let Some(period) = period {
            cohorts
                .entry((team.team_id, period))
                .or_default()
                .push(rows.len());
        }

        rows.push(FeatureCost {
            feature_id: feature.feature_id.clone(),
            title: feature.title.clone(),
            state: feature.state.clone(),
            team_raw: feature.team_raw.clone(),
            team_id: team.team_id,
            team_name: team.team_name.clone(),
            program_id: team.program_id,
            app_name_raw: feature.app_name_raw.clone(),
            app_group_id,
            effort_points: feature.effort_points,
            iteration_path: feature.iteration_path.clone(),
            ado_year: year,
            iteration_num: iteration,
            pi_key: period.map(|p| p.label()),
            team_cost_per_pi: None,
            delivery_cost_per_pi: roles.delivery,
            contractor_cs_cost_per_pi: roles.contractor_cs,
            contractor_c_cost_per_pi: roles.contractor_c,
        });
    }

    let mut summaries = Vec::with_capacity(cohorts.len());
    for ((team_id, period), members) in cohorts {
        let team = teams_by_id[&team_id];
        let fixed = fixed_period_cost(team);
        let efforts: Vec<Option<f64>> = members.iter().map(|&i| rows[i].effort_points).collect();
        let shares = allocate_fixed_cost(fixed, &efforts, policy);

        for (&i, share) in members.iter().zip(&shares) {
            rows[i].team_cost_per_pi = Some(*share);
        }

        let member_rows = members.iter().map(|&i| &rows[i]);
        let mut summary = CohortSummary {
            team_id,
            team_name: team.team_name.clone(),
            year: period.year,
            iteration: period.iteration,
            pi_key: period.label(),
            feature_count: members.len(),
            total_effort_points: efforts.iter().map(|e| e.unwrap_or(0.0)).sum(),
            fixed_period_cost: fixed,
            allocated_fixed_cost: shares.iter().sum(),
            delivery_cost: 0.0,
            contractor_cs_cost: 0.0,
            contractor_c_cost: 0.0,
        };
        for row in member_rows {
            summary.delivery_cost += row.delivery_cost_per_pi;
            summary.contractor_cs_cost += row.contractor_cs_cost_per_pi;
            summary.contractor_c_cost += row.contractor_c_cost_per_pi;
        }
        summaries.push(summary);
    }

    summaries.sort_by(|a, b| {
        a.team_name
            .cmp(&b.team_name)
            .then(a.year.cmp(&b.year))
            .then(a.iteration.cmp(&b.iteration))
    });

    AllocationReport {
        policy,
        features: rows,
        cohorts: summaries,
        unmapped,
    }
}

type ComponentKey = (Option<i32>, Option<u32>, Option<Uuid>, Uuid, Option<Uuid>);

/// Sum the cost rows passing `filter` per (year, iteration, program, team, group).
///
/// Rows come back ordered by year, iteration, team name and group.
pub fn cost_components(features: &[FeatureCost], filter: &ComponentFilter) -> Vec<CostComponents> {
    let mut groups: BTreeMap<ComponentKey, CostComponents> = BTreeMap::new();

    for row in features.iter().filter(|row| filter.matches(row)) {
        let key = (
            row.ado_year,
            row.iteration_num,
            row.program_id,
            row.team_id,
            row.app_group_id,
        );
        let entry = groups.entry(key).or_insert_with(|| CostComponents {
            year: row.ado_year,
            iteration: row.iteration_num,
            program_id: row.program_id,
            team_id: row.team_id,
            team_name: row.team_name.clone(),
            group_id: row.app_group_id,
            feature_count: 0,
            effort_points: 0.0,
            team_cost_per_pi: 0.0,
            delivery_cost_per_pi: 0.0,
            contractor_cs_cost_per_pi: 0.0,
            contractor_c_cost_per_pi: 0.0,
        });
        entry.feature_count += 1;
        entry.effort_points += row.effort_points.unwrap_or(0.0);
        entry.team_cost_per_pi += row.team_cost_per_pi.unwrap_or(0.0);
        entry.delivery_cost_per_pi += row.delivery_cost_per_pi;
        entry.contractor_cs_cost_per_pi += row.contractor_cs_cost_per_pi;
        entry.contractor_c_cost_per_pi += row.contractor_c_cost_per_pi;
    }

    let mut rows: Vec<CostComponents> = groups.into_values().collect();
    rows.sort_by(|a, b| {
        a.year
            .cmp(&b.year)
            .then(a.iteration.cmp(&b.iteration))
            .then(a.team_name.cmp(&b.team_name))
            .then(a.group_id.cmp(&b.group_id))
    });
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-6 * b.abs().max(1.0)
    }

    #[test]
    fn fixed_cost_is_a_quarter_of_annual() {
        let mut team = TeamCostProfile::empty(Uuid::nil(), "X");
        team.team_fte = 4.0;
        team.xom_rate = 100_000.0;
        assert_eq!(fixed_period_cost(&team), 100_000.0);
    }

    #[test]
    fn proportional_split_follows_effort() {
        let shares = allocate_fixed_cost(
            100.0,
            &[Some(3.0), Some(1.0)],
            AllocationPolicy::Proportional,
        );
        assert_eq!(shares, vec![75.0, 25.0]);
    }

    #[test]
    fn proportional_split_treats_null_as_zero() {
        let shares = allocate_fixed_cost(
            90.0,
            &[Some(2.0), None, Some(1.0)],
            AllocationPolicy::Proportional,
        );
        assert!(approx(shares[0], 60.0));
        assert_eq!(shares[1], 0.0);
        assert!(approx(shares[2], 30.0));
    }

    #[test]
    fn zero_effort_cohort_splits_evenly() {
        let shares = allocate_fixed_cost(
            90.0,
            &[None, Some(0.0), None],
            AllocationPolicy::Proportional,
        );
        assert_eq!(shares, vec![30.0, 30.0, 30.0]);
    }

    #[test]
    fn even_policy_ignores_effort() {
        let shares = allocate_fixed_cost(100.0, &[Some(3.0), Some(1.0)], AllocationPolicy::Even);
        assert_eq!(shares, vec![50.0, 50.0]);
    }

    #[test]
    fn empty_cohort_allocates_nothing() {
        assert!(allocate_fixed_cost(100.0, &[], AllocationPolicy::Proportional).is_empty());
    }

    #[test]
    fn role_costs_zero_denominator() {
        let mut team = TeamCostProfile::empty(Uuid::nil(), "X");
        team.xom_rate = 100.0;
        team.contractor_cs_rate = 80.0;
        assert_eq!(role_costs(&team, Some(5.0)), RoleCosts::default());
    }

    fn cost_row(
        feature_id: &str,
        team: &TeamCostProfile,
        iteration: u32,
        effort: f64,
    ) -> FeatureCost {
        FeatureCost {
            feature_id: feature_id.to_string(),
            title: None,
            state: None,
            team_raw: Some(team.team_name.clone()),
            team_id: team.team_id,
            team_name: team.team_name.clone(),
            program_id: team.program_id,
            app_name_raw: None,
            app_group_id: None,
            effort_points: Some(effort),
            iteration_path: None,
            ado_year: Some(2025),
            iteration_num: Some(iteration),
            pi_key: Some(PeriodKey::new(2025, iteration).label()),
            team_cost_per_pi: Some(effort * 10.0),
            delivery_cost_per_pi: effort,
            contractor_cs_cost_per_pi: 0.0,
            contractor_c_cost_per_pi: 0.0,
        }
    }

    #[test]
    fn components_sum_per_grain() {
        let mut team = TeamCostProfile::empty(Uuid::new_v4(), "Alpha");
        team.program_id = Some(Uuid::new_v4());
        let rows = vec![
            cost_row("1", &team, 1, 2.0),
            cost_row("2", &team, 1, 3.0),
            cost_row("3", &team, 2, 4.0),
        ];

        let components = cost_components(&rows, &ComponentFilter::default());

        assert_eq!(components.len(), 2);
        assert_eq!(components[0].iteration, Some(1));
        assert_eq!(components[0].feature_count, 2);
        assert_eq!(components[0].effort_points, 5.0);
        assert_eq!(components[0].team_cost_per_pi, 50.0);
        assert_eq!(components[0].program_id, team.program_id);
        assert_eq!(components[1].total_cost(), 44.0);
    }

    #[test]
    fn components_respect_filters() {
        let alpha = TeamCostProfile::empty(Uuid::new_v4(), "Alpha");
        let beta = TeamCostProfile::empty(Uuid::new_v4(), "Beta");
        let mut unperiod = cost_row("3", &alpha, 1, 1.0);
        unperiod.iteration_num = None;
        let rows = vec![cost_row("1", &alpha, 1, 2.0), cost_row("2", &beta, 1, 3.0), unperiod];

        let by_team = ComponentFilter {
            team_ids: vec![beta.team_id],
            ..Default::default()
        };
        let components = cost_components(&rows, &by_team);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].team_name, "Beta");

        let by_iteration = ComponentFilter {
            iterations: vec![1],
            ..Default::default()
        };
        let components = cost_components(&rows, &by_iteration);
        assert_eq!(components.iter().map(|c| c.feature_count).sum::<usize>(), 2);
    }

    #[test]
    fn unmapped_reasons() {
        let team = TeamCostProfile::empty(Uuid::new_v4(), "Alpha");
        let teams: HashMap<Uuid, &TeamCostProfile> = [(team.team_id, &team)].into_iter().collect();
        let mappings = LabelMappings::default()
            .with_team("Alpha ADO", team.team_id)
            .with_team("Ghost", Uuid::new_v4());

        let mut f = FeatureRecord::new("1");
        assert_eq!(resolve_team(&f, &mappings, &teams).unwrap_err(), UnmappedReason::MissingTeam);
        f.team_raw = Some("Beta".into());
        assert_eq!(resolve_team(&f, &mappings, &teams).unwrap_err(), UnmappedReason::NoMapping);
        f.team_raw = Some("Ghost".into());
        assert_eq!(resolve_team(&f, &mappings, &teams).unwrap_err(), UnmappedReason::UnknownTeam);
        f.team_raw = Some(" Alpha ADO ".into());
        assert_eq!(resolve_team(&f, &mappings, &teams).unwrap().team_name, "Alpha");
    }
}

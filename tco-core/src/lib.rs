//! Cost allocation model for TCO reporting.
//!
//! # Core Concepts
//!
//! - [`TeamCostProfile`]: a team's FTE composition and annual rates.
//! - [`FeatureRecord`]: an imported ADO feature with free-text team and iteration labels.
//! - [`PeriodKey`]: (year, iteration) parsed from those labels.
//! - **Cohort**: all features of one team in one period. The team's fixed
//!   period cost is split across the cohort according to an [`AllocationPolicy`].
//!
//! Everything here is pure and synchronous; [`allocate`] maps
//! (teams, features, mappings) to an [`AllocationReport`].

pub mod allocation;
pub mod model;
pub mod period;

pub use allocation::{
    allocate, allocate_fixed_cost, cost_components, fixed_period_cost, role_costs, LabelMappings,
    RoleCosts, ITERATIONS_PER_YEAR,
};
pub use model::*;
pub use period::{
    parse_calendar_year, parse_fiscal_year, parse_iteration_number, parse_year, resolve_period,
    PeriodKey,
};

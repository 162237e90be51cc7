mod schema;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tco_core::{
    allocate, cost_components, parse_iteration_number, parse_year, AllocationPolicy,
    AllocationReport, ComponentFilter, CostComponents, FeatureRecord, LabelMappings, PeriodKey,
    TeamCostProfile,
};
use uuid::Uuid;

use crate::error::TcoError;
use crate::models::*;

const TEAM_COLUMNS: &str = "id, name, program_id, product_owner, team_fte, delivery_fte, \
     contractor_cs_fte, contractor_c_fte, created_at, updated_at";

const GROUP_COLUMNS: &str =
    "id, name, team_id, program_id, default_vendor_id, owner, created_at, updated_at";

const APPLICATION_COLUMNS: &str =
    "id, name, group_id, vendor_id, add_info, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, application_id, team_id, group_id, fiscal_year, renewal_date, \
     amount, amount_next_year, status, invoice_type, contract_active, cost_center, notes, \
     rollover_batch_id, rolled_over_from_year, created_at, updated_at";

const FEATURE_COLUMNS: &str = "feature_id, title, state, team_raw, app_name_raw, effort_points, \
     iteration_path, created_at, changed_at, ado_year";

const FEATURE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// `tco.db` in the platform data directory.
    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "tco")
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        Ok(dirs.data_dir().join("tco.db"))
    }

    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_path()?)
    }

    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        schema::run_migrations(&conn)
    }

    // ============================================================
    // Program operations
    // ============================================================

    pub fn get_all_programs(&self) -> Result<Vec<Program>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, name, owner, fte, created_at, updated_at FROM programs ORDER BY name",
        )?;

        let programs = stmt
            .query_map([], program_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(programs)
    }

    pub fn get_program(&self, id: Uuid) -> Result<Option<Program>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let program = conn
            .query_row(
                "SELECT id, name, owner, fte, created_at, updated_at FROM programs WHERE id = ?",
                [id.to_string()],
                program_from_row,
            )
            .optional()?;
        Ok(program)
    }

    pub fn create_program(&self, input: CreateProgramInput) -> Result<Program> {
        let name = require_name(&input.name, "Program")?;
        require_non_negative(input.fte, "fte")?;

        let conn = self.conn.lock().expect("database lock poisoned");
        ensure_unique_name(&conn, "programs", &name, None, "Program")?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO programs (id, name, owner, fte, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                &name,
                &input.owner,
                input.fte,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(Program {
            id,
            name,
            owner: input.owner,
            fte: input.fte,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn update_program(&self, id: Uuid, input: UpdateProgramInput) -> Result<Option<Program>> {
        let Some(existing) = self.get_program(id)? else {
            return Ok(None);
        };

        let name = match input.name {
            Some(name) => require_name(&name, "Program")?,
            None => existing.name,
        };
        let fte = input.fte.unwrap_or(existing.fte);
        require_non_negative(fte, "fte")?;
        let owner = input.owner.or(existing.owner);

        let conn = self.conn.lock().expect("database lock poisoned");
        ensure_unique_name(&conn, "programs", &name, Some(id), "Program")?;

        let now = Utc::now();
        conn.execute(
            "UPDATE programs SET name = ?, owner = ?, fte = ?, updated_at = ? WHERE id = ?",
            (&name, &owner, fte, now.to_rfc3339(), id.to_string()),
        )?;

        Ok(Some(Program {
            id,
            name,
            owner,
            fte,
            created_at: existing.created_at,
            updated_at: now,
        }))
    }

    /// Refuses while any team belongs to the program.
    pub fn delete_program(&self, id: Uuid) -> Result<bool> {
        let Some(program) = self.get_program(id)? else {
            return Ok(false);
        };

        let conn = self.conn.lock().expect("database lock poisoned");
        let teams = count_references(&conn, "SELECT COUNT(*) FROM teams WHERE program_id = ?", id)?;
        if teams > 0 {
            return Err(TcoError::in_use(
                format!("Program '{}'", program.name),
                format!("{} team(s)", teams),
            )
            .into());
        }

        let rows = conn.execute("DELETE FROM programs WHERE id = ?", [id.to_string()])?;
        Ok(rows > 0)
    }

    // ============================================================
    // Team operations
    // ============================================================

    pub fn get_all_teams(&self) -> Result<Vec<Team>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!("SELECT {} FROM teams ORDER BY name", TEAM_COLUMNS))?;

        let teams = stmt
            .query_map([], team_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(teams)
    }

    pub fn get_team(&self, id: Uuid) -> Result<Option<Team>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let team = conn
            .query_row(
                &format!("SELECT {} FROM teams WHERE id = ?", TEAM_COLUMNS),
                [id.to_string()],
                team_from_row,
            )
            .optional()?;
        Ok(team)
    }

    pub fn create_team(&self, input: CreateTeamInput) -> Result<Team> {
        let name = require_name(&input.name, "Team")?;
        require_non_negative(input.team_fte, "team_fte")?;
        require_non_negative(input.delivery_fte, "delivery_fte")?;
        require_non_negative(input.contractor_cs_fte, "contractor_cs_fte")?;
        require_non_negative(input.contractor_c_fte, "contractor_c_fte")?;

        let conn = self.conn.lock().expect("database lock poisoned");
        ensure_unique_name(&conn, "teams", &name, None, "Team")?;
        if let Some(program_id) = input.program_id {
            ensure_exists(&conn, "programs", program_id, "Program")?;
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO teams (id, name, program_id, product_owner, team_fte, delivery_fte,
                                contractor_cs_fte, contractor_c_fte, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                &name,
                input.program_id.map(|u| u.to_string()),
                &input.product_owner,
                input.team_fte,
                input.delivery_fte,
                input.contractor_cs_fte,
                input.contractor_c_fte,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(Team {
            id,
            name,
            program_id: input.program_id,
            product_owner: input.product_owner,
            team_fte: input.team_fte,
            delivery_fte: input.delivery_fte,
            contractor_cs_fte: input.contractor_cs_fte,
            contractor_c_fte: input.contractor_c_fte,
            created_at: now,
            updated_at: now,
        })
    }

    /// Partial update. A changed program is propagated to the team's application groups.
    pub fn update_team(&self, id: Uuid, input: UpdateTeamInput) -> Result<Option<Team>> {
        let Some(existing) = self.get_team(id)? else {
            return Ok(None);
        };

        let name = match input.name {
            Some(name) => require_name(&name, "Team")?,
            None => existing.name,
        };
        let team = Team {
            id,
            name,
            program_id: input.program_id.unwrap_or(existing.program_id),
            product_owner: input.product_owner.or(existing.product_owner),
            team_fte: input.team_fte.unwrap_or(existing.team_fte),
            delivery_fte: input.delivery_fte.unwrap_or(existing.delivery_fte),
            contractor_cs_fte: input.contractor_cs_fte.unwrap_or(existing.contractor_cs_fte),
            contractor_c_fte: input.contractor_c_fte.unwrap_or(existing.contractor_c_fte),
            created_at: existing.created_at,
            updated_at: Utc::now(),
        };
        require_non_negative(team.team_fte, "team_fte")?;
        require_non_negative(team.delivery_fte, "delivery_fte")?;
        require_non_negative(team.contractor_cs_fte, "contractor_cs_fte")?;
        require_non_negative(team.contractor_c_fte, "contractor_c_fte")?;

        let mut conn = self.conn.lock().expect("database lock poisoned");
        ensure_unique_name(&conn, "teams", &team.name, Some(id), "Team")?;
        if let Some(program_id) = team.program_id {
            ensure_exists(&conn, "programs", program_id, "Program")?;
        }

        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE teams SET name = ?, program_id = ?, product_owner = ?, team_fte = ?,
                    delivery_fte = ?, contractor_cs_fte = ?, contractor_c_fte = ?, updated_at = ?
             WHERE id = ?",
            (
                &team.name,
                team.program_id.map(|u| u.to_string()),
                &team.product_owner,
                team.team_fte,
                team.delivery_fte,
                team.contractor_cs_fte,
                team.contractor_c_fte,
                team.updated_at.to_rfc3339(),
                id.to_string(),
            ),
        )?;
        tx.execute(
            "UPDATE application_groups SET program_id = ? WHERE team_id = ?",
            (team.program_id.map(|u| u.to_string()), id.to_string()),
        )?;
        tx.commit()?;

        Ok(Some(team))
    }

    /// Refuses while application groups or invoices reference the team.
    pub fn delete_team(&self, id: Uuid) -> Result<bool> {
        let Some(team) = self.get_team(id)? else {
            return Ok(false);
        };

        let conn = self.conn.lock().expect("database lock poisoned");
        let entity = format!("Team '{}'", team.name);
        let groups = count_references(
            &conn,
            "SELECT COUNT(*) FROM application_groups WHERE team_id = ?",
            id,
        )?;
        if groups > 0 {
            return Err(TcoError::in_use(entity, format!("{} application group(s)", groups)).into());
        }
        let invoices =
            count_references(&conn, "SELECT COUNT(*) FROM invoices WHERE team_id = ?", id)?;
        if invoices > 0 {
            return Err(TcoError::in_use(entity, format!("{} invoice(s)", invoices)).into());
        }

        let rows = conn.execute("DELETE FROM teams WHERE id = ?", [id.to_string()])?;
        Ok(rows > 0)
    }

    // ============================================================
    // Team rate operations
    // ============================================================

    pub fn get_team_rates(&self) -> Result<Vec<TeamRate>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT r.team_id, t.name, r.xom_rate, r.contractor_cs_rate, r.contractor_c_rate, r.updated_at
             FROM team_rates r JOIN teams t ON t.id = r.team_id
             ORDER BY t.name",
        )?;

        let rates = stmt
            .query_map([], team_rate_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rates)
    }

    pub fn get_team_rate(&self, team_id: Uuid) -> Result<Option<TeamRate>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rate = conn
            .query_row(
                "SELECT r.team_id, t.name, r.xom_rate, r.contractor_cs_rate, r.contractor_c_rate, r.updated_at
                 FROM team_rates r JOIN teams t ON t.id = r.team_id
                 WHERE r.team_id = ?",
                [team_id.to_string()],
                team_rate_from_row,
            )
            .optional()?;
        Ok(rate)
    }

    /// Insert or replace a team's rates. Returns `None` if the team does not exist.
    pub fn upsert_team_rate(
        &self,
        team_id: Uuid,
        input: UpsertTeamRateInput,
    ) -> Result<Option<TeamRate>> {
        let Some(team) = self.get_team(team_id)? else {
            return Ok(None);
        };

        let xom_rate = input.xom_rate.unwrap_or(0.0);
        let contractor_cs_rate = input.contractor_cs_rate.unwrap_or(0.0);
        let contractor_c_rate = input.contractor_c_rate.unwrap_or(0.0);
        require_non_negative(xom_rate, "xom_rate")?;
        require_non_negative(contractor_cs_rate, "contractor_cs_rate")?;
        require_non_negative(contractor_c_rate, "contractor_c_rate")?;

        let conn = self.conn.lock().expect("database lock poisoned");
        let now = Utc::now();
        conn.execute(
            "INSERT INTO team_rates (team_id, xom_rate, contractor_cs_rate, contractor_c_rate, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(team_id) DO UPDATE SET
                xom_rate = excluded.xom_rate,
                contractor_cs_rate = excluded.contractor_cs_rate,
                contractor_c_rate = excluded.contractor_c_rate,
                updated_at = excluded.updated_at",
            (
                team_id.to_string(),
                xom_rate,
                contractor_cs_rate,
                contractor_c_rate,
                now.to_rfc3339(),
            ),
        )?;

        Ok(Some(TeamRate {
            team_id,
            team_name: team.name,
            xom_rate,
            contractor_cs_rate,
            contractor_c_rate,
            updated_at: now,
        }))
    }

    // ============================================================
    // Vendor operations
    // ============================================================

    pub fn get_all_vendors(&self) -> Result<Vec<Vendor>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare("SELECT id, name, created_at FROM vendors ORDER BY name")?;

        let vendors = stmt
            .query_map([], vendor_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(vendors)
    }

    pub fn get_vendor(&self, id: Uuid) -> Result<Option<Vendor>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let vendor = conn
            .query_row(
                "SELECT id, name, created_at FROM vendors WHERE id = ?",
                [id.to_string()],
                vendor_from_row,
            )
            .optional()?;
        Ok(vendor)
    }

    pub fn create_vendor(&self, input: CreateVendorInput) -> Result<Vendor> {
        let name = require_name(&input.name, "Vendor")?;

        let conn = self.conn.lock().expect("database lock poisoned");
        ensure_unique_name(&conn, "vendors", &name, None, "Vendor")?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO vendors (id, name, created_at) VALUES (?, ?, ?)",
            (id.to_string(), &name, now.to_rfc3339()),
        )?;

        Ok(Vendor {
            id,
            name,
            created_at: now,
        })
    }

    pub fn update_vendor(&self, id: Uuid, input: UpdateVendorInput) -> Result<Option<Vendor>> {
        let Some(existing) = self.get_vendor(id)? else {
            return Ok(None);
        };
        let Some(name) = input.name else {
            return Ok(Some(existing));
        };
        let name = require_name(&name, "Vendor")?;

        let conn = self.conn.lock().expect("database lock poisoned");
        ensure_unique_name(&conn, "vendors", &name, Some(id), "Vendor")?;
        conn.execute(
            "UPDATE vendors SET name = ? WHERE id = ?",
            (&name, id.to_string()),
        )?;

        Ok(Some(Vendor { name, ..existing }))
    }

    /// Refuses while an application or application group references the vendor.
    pub fn delete_vendor(&self, id: Uuid) -> Result<bool> {
        let Some(vendor) = self.get_vendor(id)? else {
            return Ok(false);
        };

        let conn = self.conn.lock().expect("database lock poisoned");
        let entity = format!("Vendor '{}'", vendor.name);
        let applications = count_references(
            &conn,
            "SELECT COUNT(*) FROM applications WHERE vendor_id = ?",
            id,
        )?;
        if applications > 0 {
            return Err(TcoError::in_use(entity, format!("{} application(s)", applications)).into());
        }
        let groups = count_references(
            &conn,
            "SELECT COUNT(*) FROM application_groups WHERE default_vendor_id = ?",
            id,
        )?;
        if groups > 0 {
            return Err(TcoError::in_use(entity, format!("{} application group(s)", groups)).into());
        }

        let rows = conn.execute("DELETE FROM vendors WHERE id = ?", [id.to_string()])?;
        Ok(rows > 0)
    }

    // ============================================================
    // Application group operations
    // ============================================================

    pub fn get_all_application_groups(&self) -> Result<Vec<ApplicationGroup>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM application_groups ORDER BY name",
            GROUP_COLUMNS
        ))?;

        let groups = stmt
            .query_map([], group_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(groups)
    }

    pub fn get_application_group(&self, id: Uuid) -> Result<Option<ApplicationGroup>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let group = conn
            .query_row(
                &format!("SELECT {} FROM application_groups WHERE id = ?", GROUP_COLUMNS),
                [id.to_string()],
                group_from_row,
            )
            .optional()?;
        Ok(group)
    }

    pub fn create_application_group(
        &self,
        input: CreateApplicationGroupInput,
    ) -> Result<ApplicationGroup> {
        let name = require_name(&input.name, "Application group")?;

        let conn = self.conn.lock().expect("database lock poisoned");
        ensure_unique_name(&conn, "application_groups", &name, None, "Application group")?;
        let program_id = owning_program(&conn, input.team_id)?;
        if let Some(vendor_id) = input.default_vendor_id {
            ensure_exists(&conn, "vendors", vendor_id, "Vendor")?;
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO application_groups (id, name, team_id, program_id, default_vendor_id, owner,
                                             created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                &name,
                input.team_id.map(|u| u.to_string()),
                program_id.map(|u| u.to_string()),
                input.default_vendor_id.map(|u| u.to_string()),
                &input.owner,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(ApplicationGroup {
            id,
            name,
            team_id: input.team_id,
            program_id,
            default_vendor_id: input.default_vendor_id,
            owner: input.owner,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn update_application_group(
        &self,
        id: Uuid,
        input: UpdateApplicationGroupInput,
    ) -> Result<Option<ApplicationGroup>> {
        let Some(existing) = self.get_application_group(id)? else {
            return Ok(None);
        };

        let name = match input.name {
            Some(name) => require_name(&name, "Application group")?,
            None => existing.name,
        };
        let team_id = input.team_id.unwrap_or(existing.team_id);
        let default_vendor_id = input.default_vendor_id.unwrap_or(existing.default_vendor_id);
        let owner = input.owner.or(existing.owner);

        let conn = self.conn.lock().expect("database lock poisoned");
        ensure_unique_name(&conn, "application_groups", &name, Some(id), "Application group")?;
        let program_id = owning_program(&conn, team_id)?;
        if let Some(vendor_id) = default_vendor_id {
            ensure_exists(&conn, "vendors", vendor_id, "Vendor")?;
        }

        let now = Utc::now();
        conn.execute(
            "UPDATE application_groups
             SET name = ?, team_id = ?, program_id = ?, default_vendor_id = ?, owner = ?, updated_at = ?
             WHERE id = ?",
            (
                &name,
                team_id.map(|u| u.to_string()),
                program_id.map(|u| u.to_string()),
                default_vendor_id.map(|u| u.to_string()),
                &owner,
                now.to_rfc3339(),
                id.to_string(),
            ),
        )?;

        Ok(Some(ApplicationGroup {
            id,
            name,
            team_id,
            program_id,
            default_vendor_id,
            owner,
            created_at: existing.created_at,
            updated_at: now,
        }))
    }

    /// Refuses while the group still has applications.
    pub fn delete_application_group(&self, id: Uuid) -> Result<bool> {
        let Some(group) = self.get_application_group(id)? else {
            return Ok(false);
        };

        let conn = self.conn.lock().expect("database lock poisoned");
        let applications = count_references(
            &conn,
            "SELECT COUNT(*) FROM applications WHERE group_id = ?",
            id,
        )?;
        if applications > 0 {
            return Err(TcoError::in_use(
                format!("Application group '{}'", group.name),
                format!("{} application(s)", applications),
            )
            .into());
        }

        let rows = conn.execute("DELETE FROM application_groups WHERE id = ?", [id.to_string()])?;
        Ok(rows > 0)
    }

    // ============================================================
    // Application operations
    // ============================================================

    pub fn get_all_applications(&self) -> Result<Vec<Application>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM applications ORDER BY name",
            APPLICATION_COLUMNS
        ))?;

        let applications = stmt
            .query_map([], application_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(applications)
    }

    pub fn get_application(&self, id: Uuid) -> Result<Option<Application>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let application = conn
            .query_row(
                &format!("SELECT {} FROM applications WHERE id = ?", APPLICATION_COLUMNS),
                [id.to_string()],
                application_from_row,
            )
            .optional()?;
        Ok(application)
    }

    pub fn create_application(&self, input: CreateApplicationInput) -> Result<Application> {
        let name = require_name(&input.name, "Application")?;
        let group = match input.group_id {
            Some(group_id) => Some(
                self.get_application_group(group_id)?
                    .ok_or_else(|| TcoError::validation("Application group does not exist"))?,
            ),
            None => None,
        };
        let vendor_id = input
            .vendor_id
            .or_else(|| group.as_ref().and_then(|g| g.default_vendor_id));

        let conn = self.conn.lock().expect("database lock poisoned");
        ensure_unique_name(&conn, "applications", &name, None, "Application")?;
        if let Some(vendor_id) = vendor_id {
            ensure_exists(&conn, "vendors", vendor_id, "Vendor")?;
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO applications (id, name, group_id, vendor_id, add_info, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                &name,
                input.group_id.map(|u| u.to_string()),
                vendor_id.map(|u| u.to_string()),
                &input.add_info,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(Application {
            id,
            name,
            group_id: input.group_id,
            vendor_id,
            add_info: input.add_info,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn update_application(
        &self,
        id: Uuid,
        input: UpdateApplicationInput,
    ) -> Result<Option<Application>> {
        let Some(existing) = self.get_application(id)? else {
            return Ok(None);
        };

        let name = match input.name {
            Some(name) => require_name(&name, "Application")?,
            None => existing.name,
        };
        let group_id = input.group_id.unwrap_or(existing.group_id);
        let vendor_id = input.vendor_id.unwrap_or(existing.vendor_id);
        let add_info = input.add_info.or(existing.add_info);

        let conn = self.conn.lock().expect("database lock poisoned");
        ensure_unique_name(&conn, "applications", &name, Some(id), "Application")?;
        if let Some(group_id) = group_id {
            ensure_exists(&conn, "application_groups", group_id, "Application group")?;
        }
        if let Some(vendor_id) = vendor_id {
            ensure_exists(&conn, "vendors", vendor_id, "Vendor")?;
        }

        let now = Utc::now();
        conn.execute(
            "UPDATE applications SET name = ?, group_id = ?, vendor_id = ?, add_info = ?, updated_at = ?
             WHERE id = ?",
            (
                &name,
                group_id.map(|u| u.to_string()),
                vendor_id.map(|u| u.to_string()),
                &add_info,
                now.to_rfc3339(),
                id.to_string(),
            ),
        )?;

        Ok(Some(Application {
            id,
            name,
            group_id,
            vendor_id,
            add_info,
            created_at: existing.created_at,
            updated_at: now,
        }))
    }

    /// Refuses while invoices are booked against the application.
    pub fn delete_application(&self, id: Uuid) -> Result<bool> {
        let Some(application) = self.get_application(id)? else {
            return Ok(false);
        };

        let conn = self.conn.lock().expect("database lock poisoned");
        let invoices = count_references(
            &conn,
            "SELECT COUNT(*) FROM invoices WHERE application_id = ?",
            id,
        )?;
        if invoices > 0 {
            return Err(TcoError::in_use(
                format!("Application '{}'", application.name),
                format!("{} invoice(s)", invoices),
            )
            .into());
        }

        let rows = conn.execute("DELETE FROM applications WHERE id = ?", [id.to_string()])?;
        Ok(rows > 0)
    }

    // ============================================================
    // Invoice operations
    // ============================================================

    /// Invoices matching every set filter, latest renewal and largest amount first.
    pub fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>> {
        let conn = self.conn.lock().expect("database lock poisoned");

        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(year) = filter.fiscal_year {
            conditions.push("fiscal_year = ?");
            params.push(Box::new(year));
        }
        if let Some(team_id) = filter.team_id {
            conditions.push("team_id = ?");
            params.push(Box::new(team_id.to_string()));
        }
        if let Some(group_id) = filter.group_id {
            conditions.push("group_id = ?");
            params.push(Box::new(group_id.to_string()));
        }
        if let Some(application_id) = filter.application_id {
            conditions.push("application_id = ?");
            params.push(Box::new(application_id.to_string()));
        }
        if let Some(vendor_id) = filter.vendor_id {
            conditions.push("application_id IN (SELECT id FROM applications WHERE vendor_id = ?)");
            params.push(Box::new(vendor_id.to_string()));
        }
        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM invoices {} ORDER BY renewal_date DESC, amount DESC",
            INVOICE_COLUMNS, where_clause
        );

        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let invoices = stmt
            .query_map(params_ref.as_slice(), invoice_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(invoices)
    }

    pub fn get_invoice(&self, id: Uuid) -> Result<Option<Invoice>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let invoice = conn
            .query_row(
                &format!("SELECT {} FROM invoices WHERE id = ?", INVOICE_COLUMNS),
                [id.to_string()],
                invoice_from_row,
            )
            .optional()?;
        Ok(invoice)
    }

    pub fn create_invoice(&self, input: CreateInvoiceInput) -> Result<Invoice> {
        require_finite(input.amount, "amount")?;
        if let Some(next) = input.amount_next_year {
            require_finite(next, "amount_next_year")?;
        }
        let application = self
            .get_application(input.application_id)?
            .ok_or_else(|| TcoError::validation("Application does not exist"))?;

        let conn = self.conn.lock().expect("database lock poisoned");
        ensure_exists(&conn, "teams", input.team_id, "Team")?;

        let invoice_type = input.invoice_type.unwrap_or_default();
        if invoice_type == InvoiceType::Recurring
            && recurring_invoice_exists(
                &conn,
                input.application_id,
                input.team_id,
                input.fiscal_year,
                None,
            )?
        {
            return Err(recurring_conflict(&application.name, input.fiscal_year).into());
        }

        let now = Utc::now();
        let invoice = Invoice {
            id: Uuid::new_v4(),
            application_id: input.application_id,
            team_id: input.team_id,
            group_id: input.group_id.or(application.group_id),
            fiscal_year: input.fiscal_year,
            renewal_date: input.renewal_date,
            amount: input.amount,
            amount_next_year: input.amount_next_year,
            status: input.status.unwrap_or_default(),
            invoice_type,
            contract_active: input.contract_active.unwrap_or(true),
            cost_center: input.cost_center,
            notes: input.notes,
            rollover_batch_id: None,
            rolled_over_from_year: None,
            created_at: now,
            updated_at: now,
        };
        insert_invoice(&conn, &invoice)?;

        Ok(invoice)
    }

    pub fn update_invoice(&self, id: Uuid, input: UpdateInvoiceInput) -> Result<Option<Invoice>> {
        let Some(existing) = self.get_invoice(id)? else {
            return Ok(None);
        };

        let invoice = Invoice {
            fiscal_year: input.fiscal_year.unwrap_or(existing.fiscal_year),
            renewal_date: input.renewal_date.or(existing.renewal_date),
            amount: input.amount.unwrap_or(existing.amount),
            amount_next_year: input.amount_next_year.or(existing.amount_next_year),
            status: input.status.unwrap_or(existing.status),
            invoice_type: input.invoice_type.unwrap_or(existing.invoice_type),
            contract_active: input.contract_active.unwrap_or(existing.contract_active),
            cost_center: input.cost_center.or(existing.cost_center),
            notes: input.notes.or(existing.notes),
            updated_at: Utc::now(),
            ..existing
        };
        require_finite(invoice.amount, "amount")?;

        let conn = self.conn.lock().expect("database lock poisoned");
        if invoice.invoice_type == InvoiceType::Recurring
            && recurring_invoice_exists(
                &conn,
                invoice.application_id,
                invoice.team_id,
                invoice.fiscal_year,
                Some(id),
            )?
        {
            let name: String = conn.query_row(
                "SELECT name FROM applications WHERE id = ?",
                [invoice.application_id.to_string()],
                |row| row.get(0),
            )?;
            return Err(recurring_conflict(&name, invoice.fiscal_year).into());
        }

        conn.execute(
            "UPDATE invoices SET fiscal_year = ?, renewal_date = ?, amount = ?, amount_next_year = ?,
                    status = ?, invoice_type = ?, contract_active = ?, cost_center = ?, notes = ?,
                    updated_at = ?
             WHERE id = ?",
            params![
                invoice.fiscal_year,
                invoice.renewal_date.map(|d| d.to_string()),
                invoice.amount,
                invoice.amount_next_year,
                invoice.status.as_str(),
                invoice.invoice_type.as_str(),
                invoice.contract_active,
                invoice.cost_center,
                invoice.notes,
                invoice.updated_at.to_rfc3339(),
                id.to_string(),
            ],
        )?;

        Ok(Some(invoice))
    }

    pub fn delete_invoice(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute("DELETE FROM invoices WHERE id = ?", [id.to_string()])?;
        Ok(rows > 0)
    }

    // ============================================================
    // Rollover operations
    // ============================================================

    /// Copy every recurring invoice of `from_year` into `to_year` as a planned invoice.
    ///
    /// The new amount is `amount_next_year` when set, else `amount`; renewal
    /// dates move by the year delta. Rows whose target year already holds a
    /// recurring invoice for the same application and team are skipped. All
    /// inserted rows share one batch id, which is logged for rollback.
    pub fn rollover_invoices(&self, input: RolloverInput) -> Result<RolloverResult> {
        if input.from_year == input.to_year {
            return Err(TcoError::validation("Rollover source and target year must differ").into());
        }

        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let sources = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM invoices
                 WHERE fiscal_year = ? AND invoice_type = 'recurring'
                 ORDER BY created_at",
                INVOICE_COLUMNS
            ))?;
            let rows = stmt
                .query_map([input.from_year], invoice_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let batch_id = Uuid::new_v4();
        let now = Utc::now();
        let year_delta = input.to_year - input.from_year;
        let mut inserted = 0;
        let mut skipped = 0;

        for source in sources {
            if recurring_invoice_exists(
                &tx,
                source.application_id,
                source.team_id,
                input.to_year,
                None,
            )? {
                skipped += 1;
                continue;
            }

            let planned = Invoice {
                id: Uuid::new_v4(),
                fiscal_year: input.to_year,
                renewal_date: source.renewal_date.map(|d| shift_years(d, year_delta)),
                amount: source.amount_next_year.unwrap_or(source.amount),
                status: InvoiceStatus::Planned,
                invoice_type: InvoiceType::Recurring,
                rollover_batch_id: Some(batch_id),
                rolled_over_from_year: Some(input.from_year),
                created_at: now,
                updated_at: now,
                ..source
            };
            insert_invoice(&tx, &planned)?;
            inserted += 1;
        }

        tx.execute(
            "INSERT INTO rollover_log (batch_id, from_year, to_year, rows_inserted, created_by, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                batch_id.to_string(),
                input.from_year,
                input.to_year,
                inserted as i64,
                &input.created_by,
                now.to_rfc3339(),
            ),
        )?;
        tx.commit()?;

        tracing::info!(
            %batch_id,
            from_year = input.from_year,
            to_year = input.to_year,
            inserted,
            skipped,
            "Rolled over recurring invoices"
        );

        Ok(RolloverResult {
            batch_id,
            from_year: input.from_year,
            to_year: input.to_year,
            inserted,
            skipped,
        })
    }

    /// Delete every invoice of a rollover batch together with its log entry.
    pub fn rollback_rollover(&self, batch_id: Uuid) -> Result<RollbackResult> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let logged: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM rollover_log WHERE batch_id = ?)",
            [batch_id.to_string()],
            |row| row.get(0),
        )?;
        if !logged {
            return Err(TcoError::not_found(format!("Rollover batch {}", batch_id)).into());
        }

        let deleted = tx.execute(
            "DELETE FROM invoices WHERE rollover_batch_id = ?",
            [batch_id.to_string()],
        )?;
        tx.execute(
            "DELETE FROM rollover_log WHERE batch_id = ?",
            [batch_id.to_string()],
        )?;
        tx.commit()?;

        tracing::info!(%batch_id, deleted, "Rolled back rollover batch");
        Ok(RollbackResult { batch_id, deleted })
    }

    pub fn get_rollover_log(&self) -> Result<Vec<RolloverLogEntry>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT batch_id, from_year, to_year, rows_inserted, created_by, created_at
             FROM rollover_log ORDER BY created_at DESC",
        )?;

        let entries = stmt
            .query_map([], |row| {
                Ok(RolloverLogEntry {
                    batch_id: parse_uuid(row.get(0)?),
                    from_year: row.get(1)?,
                    to_year: row.get(2)?,
                    rows_inserted: row.get::<_, i64>(3)? as usize,
                    created_by: row.get(4)?,
                    created_at: parse_datetime(row.get(5)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    // ============================================================
    // ADO feature operations
    // ============================================================

    /// Insert or replace features by id in a single transaction. Last write wins.
    pub fn upsert_ado_features(&self, features: &[FeatureRecord]) -> Result<UpsertSummary> {
        if let Some(blank) = features.iter().find(|f| f.feature_id.trim().is_empty()) {
            return Err(TcoError::validation(format!(
                "Feature without an id (title: {})",
                blank.title.as_deref().unwrap_or("-")
            ))
            .into());
        }
        for feature in features {
            if let Some(effort) = feature.effort_points {
                let field = format!("Effort of feature {}", feature.feature_id.trim());
                require_non_negative(effort, &field)?;
            }
        }

        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut summary = UpsertSummary::default();

        for feature in features {
            let feature_id = feature.feature_id.trim();
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM ado_features WHERE feature_id = ?)",
                [feature_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO ado_features (feature_id, title, state, team_raw, app_name_raw, effort_points,
                                           iteration_path, created_at, changed_at, ado_year, loaded_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(feature_id) DO UPDATE SET
                    title = excluded.title,
                    state = excluded.state,
                    team_raw = excluded.team_raw,
                    app_name_raw = excluded.app_name_raw,
                    effort_points = excluded.effort_points,
                    iteration_path = excluded.iteration_path,
                    created_at = excluded.created_at,
                    changed_at = excluded.changed_at,
                    ado_year = excluded.ado_year,
                    loaded_at = excluded.loaded_at",
                (
                    feature_id,
                    &feature.title,
                    &feature.state,
                    &feature.team_raw,
                    &feature.app_name_raw,
                    feature.effort_points,
                    &feature.iteration_path,
                    feature.created_at.map(format_feature_timestamp),
                    feature.changed_at.map(format_feature_timestamp),
                    feature.ado_year,
                    &now,
                ),
            )?;

            if exists {
                summary.updated += 1;
            } else {
                summary.inserted += 1;
            }
        }

        tx.commit()?;
        tracing::info!(
            inserted = summary.inserted,
            updated = summary.updated,
            "Upserted ADO features"
        );
        Ok(summary)
    }

    pub fn get_ado_features(&self) -> Result<Vec<FeatureRecord>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM ado_features ORDER BY feature_id",
            FEATURE_COLUMNS
        ))?;

        let features = stmt
            .query_map([], feature_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(features)
    }

    pub fn get_ado_feature(&self, feature_id: &str) -> Result<Option<FeatureRecord>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let feature = conn
            .query_row(
                &format!("SELECT {} FROM ado_features WHERE feature_id = ?", FEATURE_COLUMNS),
                [feature_id],
                feature_from_row,
            )
            .optional()?;
        Ok(feature)
    }

    /// Distinct trimmed raw team labels across all stored features.
    pub fn distinct_team_labels(&self) -> Result<Vec<String>> {
        self.query_labels(
            "SELECT DISTINCT TRIM(team_raw) FROM ado_features
             WHERE team_raw IS NOT NULL AND TRIM(team_raw) != ''
             ORDER BY 1",
        )
    }

    pub fn distinct_app_labels(&self) -> Result<Vec<String>> {
        self.query_labels(
            "SELECT DISTINCT TRIM(app_name_raw) FROM ado_features
             WHERE app_name_raw IS NOT NULL AND TRIM(app_name_raw) != ''
             ORDER BY 1",
        )
    }

    /// Raw team labels without a mapping row.
    pub fn unmapped_team_labels(&self) -> Result<Vec<String>> {
        self.query_labels(
            "SELECT DISTINCT TRIM(team_raw) FROM ado_features
             WHERE team_raw IS NOT NULL AND TRIM(team_raw) != ''
               AND TRIM(team_raw) NOT IN (SELECT ado_team FROM map_ado_team)
             ORDER BY 1",
        )
    }

    pub fn unmapped_app_labels(&self) -> Result<Vec<String>> {
        self.query_labels(
            "SELECT DISTINCT TRIM(app_name_raw) FROM ado_features
             WHERE app_name_raw IS NOT NULL AND TRIM(app_name_raw) != ''
               AND TRIM(app_name_raw) NOT IN (SELECT ado_app FROM map_ado_app)
             ORDER BY 1",
        )
    }

    fn query_labels(&self, sql: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(sql)?;
        let labels = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(labels)
    }

    /// Feature count and effort per parsed (year, iteration).
    pub fn effort_by_period(&self) -> Result<Vec<PeriodEffort>> {
        let features = self.get_ado_features()?;

        let mut buckets: BTreeMap<(Option<i32>, Option<u32>), (usize, f64)> = BTreeMap::new();
        for feature in &features {
            let path = feature.iteration_path.as_deref();
            let year = parse_year(feature.ado_year, path, feature.changed_at, feature.created_at);
            let iteration = path.and_then(parse_iteration_number);
            let bucket = buckets.entry((year, iteration)).or_default();
            bucket.0 += 1;
            bucket.1 += feature.effort();
        }

        Ok(buckets
            .into_iter()
            .map(|((year, iteration), (feature_count, total_effort))| PeriodEffort {
                year,
                iteration,
                pi_key: year
                    .zip(iteration)
                    .map(|(y, i)| PeriodKey::new(y, i).label()),
                feature_count,
                total_effort,
            })
            .collect())
    }

    /// Feature count and effort per raw team label, flagged by whether a mapping exists.
    pub fn effort_by_team(&self) -> Result<Vec<TeamEffort>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT NULLIF(TRIM(f.team_raw), '') AS label, COUNT(*), COALESCE(SUM(f.effort_points), 0),
                    MAX(m.ado_team IS NOT NULL)
             FROM ado_features f
             LEFT JOIN map_ado_team m ON m.ado_team = TRIM(f.team_raw)
             GROUP BY label
             ORDER BY label",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(TeamEffort {
                    team_raw: row.get(0)?,
                    feature_count: row.get::<_, i64>(1)? as usize,
                    total_effort: row.get(2)?,
                    mapped: row.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Delete all stored features and, optionally, every label mapping.
    pub fn reset_ado(&self, include_mappings: bool) -> Result<ResetSummary> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let features_deleted = tx.execute("DELETE FROM ado_features", [])?;
        let mappings_deleted = if include_mappings {
            tx.execute("DELETE FROM map_ado_team", [])? + tx.execute("DELETE FROM map_ado_app", [])?
        } else {
            0
        };
        tx.commit()?;

        tracing::warn!(features_deleted, mappings_deleted, "ADO data reset");
        Ok(ResetSummary {
            features_deleted,
            mappings_deleted,
        })
    }

    // ============================================================
    // Mapping operations
    // ============================================================

    pub fn get_team_mappings(&self) -> Result<Vec<TeamMapping>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT m.ado_team, m.team_id, t.name
             FROM map_ado_team m LEFT JOIN teams t ON t.id = m.team_id
             ORDER BY m.ado_team",
        )?;

        let mappings = stmt
            .query_map([], |row| {
                Ok(TeamMapping {
                    ado_team: row.get(0)?,
                    team_id: parse_uuid(row.get(1)?),
                    team_name: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(mappings)
    }

    pub fn get_app_mappings(&self) -> Result<Vec<AppMapping>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT m.ado_app, m.group_id, g.name
             FROM map_ado_app m LEFT JOIN application_groups g ON g.id = m.group_id
             ORDER BY m.ado_app",
        )?;

        let mappings = stmt
            .query_map([], |row| {
                Ok(AppMapping {
                    ado_app: row.get(0)?,
                    group_id: parse_uuid(row.get(1)?),
                    group_name: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(mappings)
    }

    /// Point a raw team label at a team, or remove the mapping when `team_id` is `None`.
    ///
    /// Returns the stored mapping, or `None` after a removal.
    pub fn upsert_team_mapping(
        &self,
        input: UpsertTeamMappingInput,
    ) -> Result<Option<TeamMapping>> {
        let label = require_label(&input.ado_team)?;

        let Some(team_id) = input.team_id else {
            let conn = self.conn.lock().expect("database lock poisoned");
            conn.execute("DELETE FROM map_ado_team WHERE ado_team = ?", [&label])?;
            return Ok(None);
        };

        let team = self
            .get_team(team_id)?
            .ok_or_else(|| TcoError::validation(format!("Team {} does not exist", team_id)))?;

        let conn = self.conn.lock().expect("database lock poisoned");
        conn.execute(
            "INSERT INTO map_ado_team (ado_team, team_id, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(ado_team) DO UPDATE SET
                team_id = excluded.team_id,
                updated_at = excluded.updated_at",
            (&label, team_id.to_string(), Utc::now().to_rfc3339()),
        )?;

        Ok(Some(TeamMapping {
            ado_team: label,
            team_id,
            team_name: Some(team.name),
        }))
    }

    /// Point a raw application label at a group, or remove the mapping when `group_id` is `None`.
    pub fn upsert_app_mapping(&self, input: UpsertAppMappingInput) -> Result<Option<AppMapping>> {
        let label = require_label(&input.ado_app)?;

        let Some(group_id) = input.group_id else {
            let conn = self.conn.lock().expect("database lock poisoned");
            conn.execute("DELETE FROM map_ado_app WHERE ado_app = ?", [&label])?;
            return Ok(None);
        };

        let group = self.get_application_group(group_id)?.ok_or_else(|| {
            TcoError::validation(format!("Application group {} does not exist", group_id))
        })?;

        let conn = self.conn.lock().expect("database lock poisoned");
        conn.execute(
            "INSERT INTO map_ado_app (ado_app, group_id, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(ado_app) DO UPDATE SET
                group_id = excluded.group_id,
                updated_at = excluded.updated_at",
            (&label, group_id.to_string(), Utc::now().to_rfc3339()),
        )?;

        Ok(Some(AppMapping {
            ado_app: label,
            group_id,
            group_name: Some(group.name),
        }))
    }

    // ============================================================
    // Cost operations
    // ============================================================

    /// Every team with its FTEs and rates. Teams without a rate row cost nothing.
    pub fn load_cost_profiles(&self) -> Result<Vec<TeamCostProfile>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT t.id, t.name, t.program_id, t.team_fte, t.delivery_fte, t.contractor_cs_fte,
                    t.contractor_c_fte, COALESCE(r.xom_rate, 0), COALESCE(r.contractor_cs_rate, 0),
                    COALESCE(r.contractor_c_rate, 0)
             FROM teams t LEFT JOIN team_rates r ON r.team_id = t.id
             ORDER BY t.name",
        )?;

        let profiles = stmt
            .query_map([], |row| {
                Ok(TeamCostProfile {
                    team_id: parse_uuid(row.get(0)?),
                    team_name: row.get(1)?,
                    program_id: row.get::<_, Option<String>>(2)?.map(parse_uuid),
                    team_fte: row.get(3)?,
                    delivery_fte: row.get(4)?,
                    contractor_cs_fte: row.get(5)?,
                    contractor_c_fte: row.get(6)?,
                    xom_rate: row.get(7)?,
                    contractor_cs_rate: row.get(8)?,
                    contractor_c_rate: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(profiles)
    }

    pub fn load_label_mappings(&self) -> Result<LabelMappings> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut mappings = LabelMappings::default();

        let mut stmt = conn.prepare("SELECT ado_team, team_id FROM map_ado_team")?;
        let teams = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, parse_uuid(row.get(1)?)))
        })?;
        for entry in teams {
            let (label, team_id) = entry?;
            mappings.teams.insert(label, team_id);
        }

        let mut stmt = conn.prepare("SELECT ado_app, group_id FROM map_ado_app")?;
        let apps = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, parse_uuid(row.get(1)?)))
        })?;
        for entry in apps {
            let (label, group_id) = entry?;
            mappings.apps.insert(label, group_id);
        }

        Ok(mappings)
    }

    /// Run the cost allocation over the current contents of the store.
    pub fn compute_allocation(&self, policy: AllocationPolicy) -> Result<AllocationReport> {
        let teams = self.load_cost_profiles()?;
        let features = self.get_ado_features()?;
        let mappings = self.load_label_mappings()?;

        let report = allocate(&teams, &features, &mappings, policy);
        tracing::debug!(
            %policy,
            features = report.features.len(),
            cohorts = report.cohorts.len(),
            unmapped = report.unmapped.len(),
            "Computed cost allocation"
        );
        Ok(report)
    }

    /// Allocation summed per (year, iteration, program, team, group), restricted by `filter`.
    pub fn cost_components(
        &self,
        policy: AllocationPolicy,
        filter: &ComponentFilter,
    ) -> Result<Vec<CostComponents>> {
        let report = self.compute_allocation(policy)?;
        Ok(cost_components(&report.features, filter))
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

// ============================================================
// Validation helpers
// ============================================================

fn require_name(name: &str, what: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(TcoError::validation(format!("{} name is required", what)).into());
    }
    Ok(name.to_string())
}

fn require_label(label: &str) -> Result<String> {
    let label = label.trim();
    if label.is_empty() {
        return Err(TcoError::validation("Mapping label is required").into());
    }
    Ok(label.to_string())
}

fn require_finite(value: f64, field: &str) -> Result<()> {
    if !value.is_finite() {
        return Err(TcoError::validation(format!("{} must be a number", field)).into());
    }
    Ok(())
}

fn require_non_negative(value: f64, field: &str) -> Result<()> {
    require_finite(value, field)?;
    if value < 0.0 {
        return Err(TcoError::validation(format!("{} must not be negative", field)).into());
    }
    Ok(())
}

/// Case-insensitive name uniqueness within `table`, ignoring the row `exclude`.
fn ensure_unique_name(
    conn: &Connection,
    table: &str,
    name: &str,
    exclude: Option<Uuid>,
    what: &str,
) -> Result<()> {
    let taken: bool = conn.query_row(
        &format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE lower(name) = lower(?) AND id != ?)",
            table
        ),
        (name, exclude.map(|u| u.to_string()).unwrap_or_default()),
        |row| row.get(0),
    )?;
    if taken {
        return Err(TcoError::conflict(format!("{} '{}' already exists", what, name)).into());
    }
    Ok(())
}

fn ensure_exists(conn: &Connection, table: &str, id: Uuid, what: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?)", table),
        [id.to_string()],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(TcoError::validation(format!("{} {} does not exist", what, id)).into());
    }
    Ok(())
}

fn count_references(conn: &Connection, sql: &str, id: Uuid) -> Result<i64> {
    Ok(conn.query_row(sql, [id.to_string()], |row| row.get(0))?)
}

/// Program of the owning team, validating that the team exists.
fn owning_program(conn: &Connection, team_id: Option<Uuid>) -> Result<Option<Uuid>> {
    let Some(team_id) = team_id else {
        return Ok(None);
    };
    let program: Option<Option<String>> = conn
        .query_row(
            "SELECT program_id FROM teams WHERE id = ?",
            [team_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match program {
        Some(program_id) => Ok(program_id.map(parse_uuid)),
        None => Err(TcoError::validation(format!("Team {} does not exist", team_id)).into()),
    }
}

fn recurring_invoice_exists(
    conn: &Connection,
    application_id: Uuid,
    team_id: Uuid,
    fiscal_year: i32,
    exclude: Option<Uuid>,
) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM invoices
                       WHERE application_id = ? AND team_id = ? AND fiscal_year = ?
                         AND invoice_type = 'recurring' AND id != ?)",
        (
            application_id.to_string(),
            team_id.to_string(),
            fiscal_year,
            exclude.map(|u| u.to_string()).unwrap_or_default(),
        ),
        |row| row.get(0),
    )?)
}

fn recurring_conflict(application: &str, fiscal_year: i32) -> TcoError {
    TcoError::conflict(format!(
        "A recurring invoice for '{}' already exists in fiscal year {}",
        application, fiscal_year
    ))
}

fn insert_invoice(conn: &Connection, invoice: &Invoice) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO invoices ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            INVOICE_COLUMNS
        ),
        params![
            invoice.id.to_string(),
            invoice.application_id.to_string(),
            invoice.team_id.to_string(),
            invoice.group_id.map(|u| u.to_string()),
            invoice.fiscal_year,
            invoice.renewal_date.map(|d| d.to_string()),
            invoice.amount,
            invoice.amount_next_year,
            invoice.status.as_str(),
            invoice.invoice_type.as_str(),
            invoice.contract_active,
            invoice.cost_center,
            invoice.notes,
            invoice.rollover_batch_id.map(|u| u.to_string()),
            invoice.rolled_over_from_year,
            invoice.created_at.to_rfc3339(),
            invoice.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Same month and day `years` later; 29 February becomes 28 February in non-leap years.
fn shift_years(date: NaiveDate, years: i32) -> NaiveDate {
    let year = date.year() + years;
    date.with_year(year)
        .or_else(|| NaiveDate::from_ymd_opt(year, date.month(), 28))
        .unwrap_or(date)
}

// ============================================================
// Row mapping
// ============================================================

fn program_from_row(row: &Row) -> rusqlite::Result<Program> {
    Ok(Program {
        id: parse_uuid(row.get(0)?),
        name: row.get(1)?,
        owner: row.get(2)?,
        fte: row.get(3)?,
        created_at: parse_datetime(row.get(4)?),
        updated_at: parse_datetime(row.get(5)?),
    })
}

fn team_from_row(row: &Row) -> rusqlite::Result<Team> {
    Ok(Team {
        id: parse_uuid(row.get(0)?),
        name: row.get(1)?,
        program_id: row.get::<_, Option<String>>(2)?.map(parse_uuid),
        product_owner: row.get(3)?,
        team_fte: row.get(4)?,
        delivery_fte: row.get(5)?,
        contractor_cs_fte: row.get(6)?,
        contractor_c_fte: row.get(7)?,
        created_at: parse_datetime(row.get(8)?),
        updated_at: parse_datetime(row.get(9)?),
    })
}

fn team_rate_from_row(row: &Row) -> rusqlite::Result<TeamRate> {
    Ok(TeamRate {
        team_id: parse_uuid(row.get(0)?),
        team_name: row.get(1)?,
        xom_rate: row.get(2)?,
        contractor_cs_rate: row.get(3)?,
        contractor_c_rate: row.get(4)?,
        updated_at: parse_datetime(row.get(5)?),
    })
}

fn vendor_from_row(row: &Row) -> rusqlite::Result<Vendor> {
    Ok(Vendor {
        id: parse_uuid(row.get(0)?),
        name: row.get(1)?,
        created_at: parse_datetime(row.get(2)?),
    })
}

fn group_from_row(row: &Row) -> rusqlite::Result<ApplicationGroup> {
    Ok(ApplicationGroup {
        id: parse_uuid(row.get(0)?),
        name: row.get(1)?,
        team_id: row.get::<_, Option<String>>(2)?.map(parse_uuid),
        program_id: row.get::<_, Option<String>>(3)?.map(parse_uuid),
        default_vendor_id: row.get::<_, Option<String>>(4)?.map(parse_uuid),
        owner: row.get(5)?,
        created_at: parse_datetime(row.get(6)?),
        updated_at: parse_datetime(row.get(7)?),
    })
}

fn application_from_row(row: &Row) -> rusqlite::Result<Application> {
    Ok(Application {
        id: parse_uuid(row.get(0)?),
        name: row.get(1)?,
        group_id: row.get::<_, Option<String>>(2)?.map(parse_uuid),
        vendor_id: row.get::<_, Option<String>>(3)?.map(parse_uuid),
        add_info: row.get(4)?,
        created_at: parse_datetime(row.get(5)?),
        updated_at: parse_datetime(row.get(6)?),
    })
}

fn invoice_from_row(row: &Row) -> rusqlite::Result<Invoice> {
    Ok(Invoice {
        id: parse_uuid(row.get(0)?),
        application_id: parse_uuid(row.get(1)?),
        team_id: parse_uuid(row.get(2)?),
        group_id: row.get::<_, Option<String>>(3)?.map(parse_uuid),
        fiscal_year: row.get(4)?,
        renewal_date: row.get::<_, Option<String>>(5)?.and_then(parse_date),
        amount: row.get(6)?,
        amount_next_year: row.get(7)?,
        status: InvoiceStatus::from_str(&row.get::<_, String>(8)?).unwrap_or_default(),
        invoice_type: InvoiceType::from_str(&row.get::<_, String>(9)?).unwrap_or_default(),
        contract_active: row.get(10)?,
        cost_center: row.get(11)?,
        notes: row.get(12)?,
        rollover_batch_id: row.get::<_, Option<String>>(13)?.map(parse_uuid),
        rolled_over_from_year: row.get(14)?,
        created_at: parse_datetime(row.get(15)?),
        updated_at: parse_datetime(row.get(16)?),
    })
}

fn feature_from_row(row: &Row) -> rusqlite::Result<FeatureRecord> {
    Ok(FeatureRecord {
        feature_id: row.get(0)?,
        title: row.get(1)?,
        state: row.get(2)?,
        team_raw: row.get(3)?,
        app_name_raw: row.get(4)?,
        effort_points: row.get(5)?,
        iteration_path: row.get(6)?,
        created_at: row.get::<_, Option<String>>(7)?.and_then(parse_feature_timestamp),
        changed_at: row.get::<_, Option<String>>(8)?.and_then(parse_feature_timestamp),
        ado_year: row.get(9)?,
    })
}

fn parse_uuid(s: String) -> Uuid {
    Uuid::parse_str(&s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_datetime(s: String) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_date(s: String) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()
}

fn format_feature_timestamp(ts: NaiveDateTime) -> String {
    ts.format(FEATURE_TIMESTAMP_FORMAT).to_string()
}

fn parse_feature_timestamp(s: String) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(&s, FEATURE_TIMESTAMP_FORMAT).ok()
}

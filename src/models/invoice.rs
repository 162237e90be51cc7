use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A cost line booked against an application for one fiscal year.
///
/// At most one `Recurring` invoice may exist per (application, team, fiscal
/// year). Rows created by a rollover carry the batch id and the year they
/// were copied from, so a whole batch can be rolled back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub application_id: Uuid,
    pub team_id: Uuid,
    pub group_id: Option<Uuid>,
    pub fiscal_year: i32,
    pub renewal_date: Option<NaiveDate>,
    pub amount: f64,
    /// Expected amount for the following fiscal year, used by rollover.
    pub amount_next_year: Option<f64>,
    pub status: InvoiceStatus,
    pub invoice_type: InvoiceType,
    pub contract_active: bool,
    pub cost_center: Option<String>,
    pub notes: Option<String>,
    pub rollover_batch_id: Option<Uuid>,
    pub rolled_over_from_year: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    #[default]
    Planned,
    Completed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "planned" => Some(Self::Planned),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
    #[default]
    Recurring,
    OneTime,
}

impl InvoiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recurring => "recurring",
            Self::OneTime => "one_time",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "recurring" => Some(Self::Recurring),
            "one_time" => Some(Self::OneTime),
            _ => None,
        }
    }
}

/// Input for booking an invoice. `group_id` defaults to the application's group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInvoiceInput {
    pub application_id: Uuid,
    pub team_id: Uuid,
    pub group_id: Option<Uuid>,
    pub fiscal_year: i32,
    pub renewal_date: Option<NaiveDate>,
    pub amount: f64,
    pub amount_next_year: Option<f64>,
    pub status: Option<InvoiceStatus>,
    pub invoice_type: Option<InvoiceType>,
    pub contract_active: Option<bool>,
    pub cost_center: Option<String>,
    pub notes: Option<String>,
}

/// Input for updating an invoice. All fields are optional for partial updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInvoiceInput {
    pub fiscal_year: Option<i32>,
    pub renewal_date: Option<NaiveDate>,
    pub amount: Option<f64>,
    pub amount_next_year: Option<f64>,
    pub status: Option<InvoiceStatus>,
    pub invoice_type: Option<InvoiceType>,
    pub contract_active: Option<bool>,
    pub cost_center: Option<String>,
    pub notes: Option<String>,
}

/// Filters for listing invoices. Unset fields do not filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceFilter {
    pub fiscal_year: Option<i32>,
    pub team_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub application_id: Option<Uuid>,
    pub vendor_id: Option<Uuid>,
    pub status: Option<InvoiceStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloverInput {
    pub from_year: i32,
    pub to_year: i32,
    pub created_by: Option<String>,
}

/// Outcome of one rollover batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloverResult {
    pub batch_id: Uuid,
    pub from_year: i32,
    pub to_year: i32,
    pub inserted: usize,
    /// Source rows whose target year already had a recurring invoice.
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloverLogEntry {
    pub batch_id: Uuid,
    pub from_year: i32,
    pub to_year: i32,
    pub rows_inserted: usize,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    pub batch_id: Uuid,
    pub deleted: usize,
}

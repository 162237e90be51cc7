use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A family of applications owned by one team.
///
/// `program_id` is copied from the owning team on every write so that spend
/// can be rolled up by program without a join through teams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationGroup {
    pub id: Uuid,
    pub name: String,
    pub team_id: Option<Uuid>,
    pub program_id: Option<Uuid>,
    pub default_vendor_id: Option<Uuid>,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateApplicationGroupInput {
    pub name: String,
    pub team_id: Option<Uuid>,
    pub default_vendor_id: Option<Uuid>,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateApplicationGroupInput {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "super::present", skip_serializing_if = "Option::is_none")]
    pub team_id: Option<Option<Uuid>>,
    #[serde(default, deserialize_with = "super::present", skip_serializing_if = "Option::is_none")]
    pub default_vendor_id: Option<Option<Uuid>>,
    pub owner: Option<String>,
}

/// A deployed application instance. Invoices are booked against applications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub name: String,
    pub group_id: Option<Uuid>,
    pub vendor_id: Option<Uuid>,
    /// Free-form site or instance information.
    pub add_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an application. `vendor_id` defaults to the group's default vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateApplicationInput {
    pub name: String,
    pub group_id: Option<Uuid>,
    pub vendor_id: Option<Uuid>,
    pub add_info: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateApplicationInput {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "super::present", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Option<Uuid>>,
    #[serde(default, deserialize_with = "super::present", skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<Option<Uuid>>,
    pub add_info: Option<String>,
}

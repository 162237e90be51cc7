use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A portfolio of teams. Names are unique ignoring case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub id: Uuid,
    pub name: String,
    pub owner: Option<String>,
    pub fte: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProgramInput {
    pub name: String,
    pub owner: Option<String>,
    #[serde(default)]
    pub fte: f64,
}

/// Input for updating a program. All fields are optional for partial updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProgramInput {
    pub name: Option<String>,
    pub owner: Option<String>,
    pub fte: Option<f64>,
}

//! TCO tracking service: reference data, invoices, ADO feature effort and
//! the cost allocation that ties them together.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod models;

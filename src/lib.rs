//! Garden planner: growing areas, plant lists and a local cache of plants
//! found through the Trefle plant database.

pub mod actions;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod forms;
pub mod models;
pub mod provider;
pub mod routes;
pub mod schema;

pub use error::{Error, Result};

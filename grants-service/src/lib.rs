//! Grants Service - exactly-once storage of OAuth2 authorization grants.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;

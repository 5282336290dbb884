//! Venue booking with conflict-checked approvals, served over the
//! PostgreSQL wire protocol.

pub mod auth;
pub mod config;
pub mod engine;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod seed;
pub mod sql;
pub mod store;
pub mod tls;
pub mod wal;
pub mod wire;

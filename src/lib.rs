pub mod auth;
pub mod authz;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod limits;
pub mod merge;
pub mod model;
pub mod observability;
pub mod sql;
pub mod view;
pub mod wal;
pub mod wire;

pub mod types;
pub mod outcome;
pub mod config;
pub mod error;
pub mod stats;
pub mod database;
pub mod data_ops;
pub mod index_ops;
pub(crate) mod state;

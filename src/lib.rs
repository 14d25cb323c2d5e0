pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod geoip;
pub mod notify;
pub mod observability;
pub mod policy;
pub mod quota;
pub mod service;
pub mod validation;

mod state;

pub use config::*;
pub use state::*;

pub mod api;
pub mod catalog;
pub mod config;
pub mod durable;
pub mod ephemeral;
pub mod error;
pub mod fetch;
pub mod models;
pub mod observability;
pub mod promote;
pub mod query;
pub mod service;

pub use error::{ApiError, Result};
pub use service::TableService;

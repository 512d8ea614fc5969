pub mod ast;
pub mod config;
pub mod criteria;
pub mod db;
pub mod error;
pub mod persister;
pub mod repository;

pub use error::{QueryError, Result};

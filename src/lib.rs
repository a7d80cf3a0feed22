pub mod app;
pub mod chat;
pub mod error;
pub mod memory;
pub mod models;
pub mod platform;
pub mod storage;

pub use error::{Error, Result};

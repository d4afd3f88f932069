pub mod db;
pub mod log;
pub mod repository;

pub use db::*;
pub use log::*;
pub use repository::*;

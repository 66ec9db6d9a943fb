//! Warehouse storage backends.

pub mod sqlite;

pub use sqlite::SqliteWarehouse;

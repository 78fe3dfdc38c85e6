pub mod postgres_store;
mod repository;
pub mod sqlite_store;
pub mod store;

pub use repository::{open_store, Stores};
pub use store::{BackupStore, DatabaseInfo, DatabaseRegistry, SiteInfo, SiteRegistry};

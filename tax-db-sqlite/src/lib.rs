//! SQLite backend for the tax engine's store contracts.

pub mod decimal;
pub mod factory;
pub mod repository;

pub use factory::SqliteRepositoryFactory;
pub use repository::SqliteRepository;

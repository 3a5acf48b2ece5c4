pub mod factory;
pub mod memory;
pub mod repository;

pub use factory::{DbConfig, MemoryRepositoryFactory, RepositoryFactory, RepositoryRegistry};
pub use memory::MemoryRepository;
pub use repository::{
    RepositoryError, TaxAssignmentStore, TaxGroupStore, TaxRateStore, TaxRepository, TaxStore,
};

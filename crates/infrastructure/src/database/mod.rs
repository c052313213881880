pub mod manager;
pub mod mapping;
pub mod schema;

pub use manager::DatabaseManager;
pub use mapping::MappingHelpers;

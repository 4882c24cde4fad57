pub mod database;
pub mod state_repository;

pub use database::Database;
pub use state_repository::SqliteStateRepository;

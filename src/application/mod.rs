pub mod data_handler;
pub mod engine;
pub mod exit_engine;
pub mod housekeeper;
pub mod orders;
pub mod reconciler;
pub mod risk;
pub mod strategy;

pub use engine::Engine;

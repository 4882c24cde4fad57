pub mod errors;
pub mod events;
pub mod ids;
pub mod ports;
pub mod repositories;
pub mod session;
pub mod symbols;
pub mod types;

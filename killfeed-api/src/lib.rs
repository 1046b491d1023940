pub mod api;
pub mod config;
pub mod delivery;
pub mod endpoints;
pub mod router;
pub mod session;

pub mod catalog;
pub mod config;
pub mod io;
pub mod speakers;
pub mod state;
pub mod store;

pub mod manager;
pub mod runner;
pub mod state;

pub mod bot;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod marker;
pub mod platform;
pub mod protocol;
pub mod question;
pub mod session;
pub mod store;

pub extern crate actix_web;

pub mod config;
pub mod connection;
pub mod connection_registry;
pub mod handlers;
pub mod server;
pub mod session;
pub mod session_file;
pub mod session_worker;

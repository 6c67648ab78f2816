pub mod constants;
pub mod connection;
pub mod manager;
pub mod protocol;
pub mod radio;
pub mod service;
pub mod session;
pub mod types;

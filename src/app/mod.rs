pub mod cli;
pub mod odometer;
pub mod runner;

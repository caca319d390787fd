pub mod agent;
pub mod api;
pub mod bag;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;

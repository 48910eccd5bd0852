pub mod checkpoint;
pub mod config;
pub mod error;
pub mod hub;
pub mod subscriber;

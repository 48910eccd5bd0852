pub mod channels;
pub mod config;
pub mod content;
pub mod error;
pub mod fanout;
pub mod identity;
pub mod scrape;
pub mod store;
pub mod transform;
pub mod types;
pub mod worker;

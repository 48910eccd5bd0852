pub mod metrics;
pub mod pgqueue;
pub mod protocol;
pub mod retry;

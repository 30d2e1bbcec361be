pub mod retry;

pub use retry::{decide, RetryConfig, RetryDecision};

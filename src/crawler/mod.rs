pub mod collector;
pub mod coordinator;
pub mod filter;
pub mod rate_limit;
pub mod retry;
pub mod targets;
pub mod task;

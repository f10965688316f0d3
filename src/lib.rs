//! Gatehouse - Admission Control and Request Queueing
//!
//! This crate protects a downstream operation from excess load. Requests are
//! admitted while the rate limit allows, deferred into a bounded queue when it
//! does not, and rejected once the queue is full. Deferred callers receive a
//! Retry-After hint that grows with their own retries and with system load.

pub mod backoff;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod provider;
pub mod queue;
pub mod ratelimit;
pub mod tasks;

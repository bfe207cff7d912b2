//! Resilience helpers for storage backends.

pub mod retry;

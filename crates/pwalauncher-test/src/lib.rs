//! Test harness for the pwalauncher gateway.
//!
//! [`TestGateway`] boots the real binary against a generated configuration
//! and a throwaway `wwwroot`, then exposes request helpers.

#[cfg(test)]
pub mod cli;
pub mod gateway;

pub use gateway::{TestError, TestGateway};

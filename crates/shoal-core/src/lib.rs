//! Core shared types for shoal.
//!
//! This crate is intentionally small: the error taxonomy every other crate
//! reports through, the process exit codes of the top-level entry points, and
//! a couple of path helpers the globber and selector share.

pub mod exit;
pub mod path;

mod error;

pub use error::{Error, Result};

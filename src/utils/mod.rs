//! Small shared utilities.

pub mod canonical;

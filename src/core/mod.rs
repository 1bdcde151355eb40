//! Core domain models for expipe
//!
//! This module defines actions, the subjects they act on, and the
//! experiment configuration format.

pub mod action;
pub mod config;
pub mod subject;

pub use action::*;
pub use subject::Subject;

//! Foundation module - Core utilities and types
//!
//! This module provides the ambient utilities the renderer builds on:
//! - Math types and camera helpers
//! - Logging bootstrap

pub mod math;
pub mod logging;

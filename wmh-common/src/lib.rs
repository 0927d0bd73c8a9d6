//! # WMH Common Library
//!
//! Shared vocabulary for the WMH segmentation pipeline:
//! - Error taxonomy
//! - Run configuration
//! - Placeholder path templates and the PathResolver
//! - Derivatives naming grammar
//! - Masterfile records and codec
//! - Subject/session discovery and provenance sidecar

pub mod config;
pub mod discovery;
pub mod error;
pub mod manifest;
pub mod naming;
pub mod resolver;
pub mod template;
pub mod version;

pub use error::{Error, Result};
pub use naming::{BidsKey, Stage};
pub use template::{Bindings, PathTemplate};

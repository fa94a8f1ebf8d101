//! Background job handlers
//!
//! - Library scanning and catalogue reconciliation
//! - Audio embedding generation

pub mod audio;
pub mod embedding_generation;
pub mod library_scan;
pub mod metadata;
pub mod spectral;

//! pgmajor - PostgreSQL major version management for Kubernetes clusters
//!
//! Moves the data directory of a managed PostgreSQL cluster back to an older major
//! version. The [`reconciler`] notices that the declared image is older than the
//! data and schedules a Job on the primary's volume; inside that Job the
//! [`executor`] dumps the data with the old binaries, reinitializes the directory
//! with the new ones and restores the dump.

pub mod config;
pub mod crd;
pub mod executor;
pub mod process;
pub mod reconciler;
pub mod utils;
pub mod version;

//! Restore side of the backup service.
//!
//! The [`untar`] module extracts the tar archives (and split archive sets)
//! produced by application backups into a restore sandbox.

pub mod untar;

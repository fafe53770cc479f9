//! Compile-time configuration shared by every driver crate.
//!
//! Runtime knobs (iteration counts, verbosity) are taken from the command line
//! by the applications; everything here is fixed at build time.

#![no_std]

pub mod memory;
pub mod nic;

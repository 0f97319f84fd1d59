//! Text surgery on Swift sources.
//!
//! [`engine`] inserts annotations at oracle-reported sites; [`cleanup`] runs
//! the whole-file passes that follow.

pub mod cleanup;
pub mod engine;

pub use cleanup::{cleanup, fix_optionals, CleanupOptions};
pub use engine::{apply_site_patches, Patch};

//! Filesystem helpers.

pub mod ignore;

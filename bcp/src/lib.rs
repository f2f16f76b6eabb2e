//! Library part of the `bcp` command line tool.

pub mod listing;
pub mod location;

//! Everbug library
//!
//! A file-based issue tracker whose records are meant to live in a
//! version-controlled tree. The pieces that keep such a store consistent
//! under uncoordinated textual merges live here: the merge-tolerant record
//! codec ([`mapfile`]), threaded comments ([`comment`]) and tag-encoded
//! issue dependencies ([`depend`]). The `eb` binary is a thin wrapper.

pub mod comment;
pub mod config;
pub mod depend;
pub mod editor;
pub mod format;
pub mod logging;
pub mod mapfile;
pub mod select;
pub mod storage;
pub mod tracker;
pub mod types;

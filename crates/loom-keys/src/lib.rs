//! Loom Keys - branch addressing for the dialogue tree
//!
//! A key names one line of a branching scene:
//!
//! ```text
//! scene_id-path
//!     demo-ab3a2_C
//!     ^^^^ ^^^^^^^
//!     |    |- path segments: letters, run-length runs (`3a`), commands (`2_`)
//!     |- normalized ASCII scene id
//! ```
//!
//! Provides:
//! - [`validate`], [`compress`], [`compress_display`], [`expand`], [`split`]
//! - [`KeyOp`] / [`BranchKey`] for walking a path as edit operations
//! - [`normalize_scene_id`] for turning user-supplied titles into scene ids
//!
//! # Example
//!
//! ```rust
//! use loom_keys::{compress, expand, BranchKey, KeyOp};
//!
//! assert_eq!(compress("demo-aaab"), "demo-3ab");
//! assert_eq!(expand("demo-3ab").unwrap(), "demo-aaab");
//!
//! let key = BranchKey::parse("demo-2a1_").unwrap();
//! assert_eq!(key.scene_id(), "demo");
//! assert_eq!(key.ops().unwrap(), vec![KeyOp::Continue('a'), KeyOp::Continue('a'), KeyOp::Cut(1)]);
//! ```

#![warn(unreachable_pub)]

pub mod codec;
pub mod error;
pub mod ops;
pub mod scene_id;

pub use codec::{
    compress, compress_display, expand, is_command, split, split_scene, validate, CUT, INSERT,
    MAX_RUN_LENGTH, REGENERATE,
};
pub use error::KeyError;
pub use ops::{BranchKey, KeyOp};
pub use scene_id::normalize_scene_id;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

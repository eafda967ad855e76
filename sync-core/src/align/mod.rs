//! Transcript-to-text alignment: fuzzy window search and anchor calculus.

pub mod anchors;
pub mod fuzzy;

pub use anchors::{Anchor, merge_anchors, position_at, select_anchors};
pub use fuzzy::{Fragment, WindowIndex, align_fragments};

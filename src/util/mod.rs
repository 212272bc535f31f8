//! Small text utilities shared across the crawl/normalize pipeline.

mod text;

pub use text::strip_control_chars;

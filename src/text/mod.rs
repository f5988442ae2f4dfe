//! Text Processing Module
//!
//! - [`numerals`]: Item indexes and targets in Arabic, Chinese and English numerals
//! - [`template`]: `{{variable}}` interpolation and variable binding
//! - [`response`]: Tolerant parsing of generation responses

pub mod numerals;
pub mod response;
pub mod template;

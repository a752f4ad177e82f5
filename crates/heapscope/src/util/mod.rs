//! Utility Module
//!
//! Small building blocks shared by the walk and search code.

pub mod alignment;
pub mod index_vec;

pub use alignment::Alignment;
pub use index_vec::{Idx, IndexVec};

//! Small shared utilities.

pub mod byteorder;

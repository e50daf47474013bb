//! Base types for the ndr named-data repository: hierarchical names and the data
//! objects stored under them.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod data;
pub mod name;
pub mod tlv;

pub use self::data::Data;
pub use self::name::{Component, Name, NameError};

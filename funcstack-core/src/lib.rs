//! Core types shared by the funcstack crates
//!
//! Error codes and their HTTP rendering, plus request identifiers.

pub mod error;
pub mod request_id;

pub use error::{escape_html, ErrorCode, ErrorFormat, FunctionsError};
pub use request_id::{RequestId, REQUEST_ID_HEADER};

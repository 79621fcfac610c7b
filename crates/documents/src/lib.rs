//! Stock documents domain module.
//!
//! Income and expense documents, their numbering and the
//! `draft -> posted -> cancelled` state machine. Stock effects of posting live
//! in the infra posting engine; this crate only guards transitions.

pub mod document;
pub mod filter;
pub mod number;
pub mod status;

pub use document::{
    Document, DocumentError, DocumentItem, DocumentParts, DraftUpdate, NewDocument,
    NewDocumentItem, MAX_COMMENT_LEN,
};
pub use filter::DocumentFilter;
pub use number::DocumentNumber;
pub use status::{DocumentStatus, DocumentType};

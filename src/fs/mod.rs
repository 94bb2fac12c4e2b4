//! Flash filesystem of the module, reached over OBEX.
//!
//! - [`FileMeta`] / [`FileContent`]: entries and downloaded files
//! - [`FileManager`]: navigation, transfers, deletes, space queries
//! - [`ProgressEvent`]: transfer progress notifications

mod listing;
mod manager;
mod meta;
mod transfer;

pub use listing::{parse_listing, FOLDER_LISTING_TYPE};
pub use manager::{BoxFuture, FileManager};
pub use meta::{FileContent, FileMeta, ROOT_DRIVE};
pub use transfer::{Operation, ProgressEvent};

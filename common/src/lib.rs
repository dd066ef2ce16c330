//! Core of `xcp`: a parallel cross-backend copy engine over local
//! filesystems, S3-compatible object stores and V3IO containers.

pub mod backend;
pub mod copy;
pub mod filter;
pub mod list;
pub mod local;
pub mod location;
pub mod s3;
pub mod timespec;
pub mod v3io;

#[cfg(test)]
pub(crate) mod testutils;

pub use backend::{
    new_client, Error, FileDetails, FileMeta, FsClient, FsWriter, ListDirTask, ListSummary,
    Reader,
};
pub use copy::{copy_dir, CopySettings, CopySummary};
pub use filter::is_match;
pub use list::{list_dir, DirList};
pub use location::{parse_location, Kind, PathParams};
pub use timespec::parse_time;

//! # Transfer Engine
//!
//! Chunked, resumable downloads and uploads against the Alipan open
//! platform.
//!
//! ## Overview
//!
//! - [`Downloader`] turns a remote file into a [`Task`] that fetches 2 MiB
//!   byte ranges through a signed URL into `<name>.download` and renames it
//!   into place.
//! - [`Uploader`] registers a local file (with rapid-upload hashing) and PUTs
//!   its parts to per-part signed URLs.
//! - Both share one [`TransferContext`]: the chunk pool, the raw transport
//!   for signed URLs and the callback context observers run on.
//!
//! Signed URLs that expire mid-transfer are refetched and the transfer
//! resumes with only the chunks still missing.
//!
//! ## Example
//!
//! ```ignore
//! let task = downloader.build_download(&drive_id, &file_id, None).await?;
//! task.add_state_observer(|state| println!("{state:?}"));
//! task.start();
//! ```

pub mod api;
pub mod chunk;
pub mod digest;
pub mod download;
pub mod engine;
pub mod error;
pub mod registry;
pub mod task;
pub mod upload;

pub use api::{ApiClient, ApiScope, RawScope};
pub use chunk::{Chunk, MAX_CHUNK_COUNT, MAX_CHUNK_SIZE};
pub use download::{Downloader, DEFAULT_EXPIRE_SEC};
pub use engine::TransferContext;
pub use error::{Result, TransferError};
pub use registry::{DownloadKey, UploadKey};
pub use task::{ObserverId, PartUrlLease, SignedUrlLease, Task, TaskState};
pub use upload::{CheckNameMode, Uploader};

//! Resumable segmented file transfer engine.
//!
//! A transfer is split into fixed-size units that move independently with
//! bounded concurrency and are finalized exactly once when every unit is
//! accounted for. Interrupted transfers resume: downloads reuse per-unit temp
//! files on disk, uploads reuse parts the remote store already acknowledged.
//!
//! The engine talks to transports through narrow seams: [`download::RangeFetcher`]
//! for byte-range sources (an HTTP implementation ships in [`http`]; FTP
//! REST+RETR fits the same contract) and [`upload::MultipartStore`] for
//! object-storage multipart sessions.

pub mod context;
pub mod download;
pub mod error;
pub mod gate;
pub mod http;
pub mod integrity;
pub mod models;
pub mod planner;
pub mod progress;
pub mod segments;
pub mod upload;
pub mod worker;

/// Convenient re-exports of the common types.
pub mod prelude {
    pub use crate::download::{ByteStream, Downloader, RangeFetcher};
    pub use crate::error::{BoxError, TransferError};
    pub use crate::gate::PauseGate;
    pub use crate::http::{HttpRangeFetcher, RemoteFileInfo};
    pub use crate::models::{
        FileDescriptor, RemotePart, TransferConfig, TransferState, TransferUnit,
    };
    pub use crate::progress::ProgressUpdate;
    pub use crate::upload::{CompletedUpload, MultipartStore, Uploader};
}

pub mod config;
pub mod tus;
pub mod utils;

pub use config::ClientConfig;
pub use tus::{
    TusClient,
    TusError,
    Result,
    UploadDelegate,
    UploadEvent,
    UploadId,
    UploadRecord,
    UploadStatus,
};

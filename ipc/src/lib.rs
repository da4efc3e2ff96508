pub mod channel;
pub mod message;
pub mod shmem;

pub use channel::{Blob, BlobChannel, ChannelError, TAG_BATCH_DONE};
pub use message::{
    BatchExecutor, BatchOutcome, ExecStats, ExecutionRequest, ExecutionResult, Failure,
    FailureKind, ProtocolError,
};
pub use shmem::ShmRegion;

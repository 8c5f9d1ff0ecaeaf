pub mod batch_response;
pub mod batch_save;
pub mod buffer_pool;
pub mod pipeline;
pub mod query;
pub mod request_builder;
pub mod response_handler;
pub mod save;

pub use batch_response::{BatchResponseIter, BatchSource};
pub use batch_save::BatchSaveResult;
pub use buffer_pool::BufferPool;
pub use pipeline::{ContextSettings, OperationRequest, Pipeline, SaveProgress};
pub use save::SaveResult;

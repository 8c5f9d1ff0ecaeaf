pub mod batch_reader;
pub mod batch_writer;
pub mod json;

pub use batch_reader::{BatchItem, BatchOperationResponse, BatchReader, BatchReaderState};
pub use batch_writer::{BatchOperation, BatchWriter};
pub use json::{JsonMaterializer, ResponseMaterializer};

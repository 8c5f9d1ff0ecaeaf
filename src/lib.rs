pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;
pub mod transport;
pub mod wire;

// Export the client facade
pub use api::DataServiceContext;

pub use config::ClientConfig;
pub use error::{ClientError, DataServiceClientError, DataServiceRequestError, Result, TransportError};

// Export pipeline types callers hold on to
pub use logic::{BatchResponseIter, SaveProgress};

// Export all model types
pub use model::*;

// Export store types
pub use store::EntityTracker;

pub use transport::{HttpTransport, Transport};

// HTTP primitives used throughout the public API
pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
pub use wire::{JsonMaterializer, ResponseMaterializer};

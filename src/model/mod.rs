pub mod common;
pub mod descriptor;
pub mod entity;
pub mod events;
pub mod link;
pub mod metadata;
pub mod request;
pub mod response;
pub mod stream;

pub use common::*;
pub use descriptor::*;
pub use entity::*;
pub use events::*;
pub use link::*;
pub use metadata::*;
pub use request::{header_str, DataServiceRequest, HttpRequest, HttpResponse};
pub use response::*;
pub use stream::*;

use http::{HeaderMap, Method, StatusCode};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

use crate::model::descriptor::Descriptor;

/// A request the pipeline is about to build or send. Handlers may change the
/// URI and headers while the request is being built, and the headers before
/// it is sent.
#[derive(Debug, Clone)]
pub struct RequestEventArgs {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub descriptor: Option<Descriptor>,
    pub is_batch_part: bool,
}

/// A response the pipeline received. For failed changeset operations the
/// descriptor is withheld.
#[derive(Debug, Clone)]
pub struct ResponseEventArgs {
    pub status_code: StatusCode,
    pub headers: HeaderMap,
    pub descriptor: Option<Descriptor>,
    pub is_batch_part: bool,
}

pub type RequestHandler = Arc<dyn Fn(&mut RequestEventArgs) + Send + Sync>;
pub type ResponseHandler = Arc<dyn Fn(&ResponseEventArgs) + Send + Sync>;

/// Extension points fired by the save and query pipelines.
#[derive(Default)]
pub struct ContextEvents {
    building_request: RwLock<Vec<RequestHandler>>,
    sending_request: RwLock<Vec<RequestHandler>>,
    receiving_response: RwLock<Vec<ResponseHandler>>,
}

impl fmt::Debug for ContextEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextEvents")
            .field("building_request", &self.building_request.read().len())
            .field("sending_request", &self.sending_request.read().len())
            .field("receiving_response", &self.receiving_response.read().len())
            .finish()
    }
}

impl ContextEvents {
    pub fn on_building_request(&self, handler: RequestHandler) {
        self.building_request.write().push(handler);
    }

    pub fn on_sending_request(&self, handler: RequestHandler) {
        self.sending_request.write().push(handler);
    }

    pub fn on_receiving_response(&self, handler: ResponseHandler) {
        self.receiving_response.write().push(handler);
    }

    // Handlers run on a snapshot so they may register further handlers.
    pub fn fire_building_request(&self, args: &mut RequestEventArgs) {
        let handlers = self.building_request.read().clone();
        for handler in handlers {
            handler(args);
        }
    }

    pub fn fire_sending_request(&self, args: &mut RequestEventArgs) {
        let handlers = self.sending_request.read().clone();
        for handler in handlers {
            handler(args);
        }
    }

    pub fn fire_receiving_response(&self, args: &ResponseEventArgs) {
        let handlers = self.receiving_response.read().clone();
        for handler in handlers {
            handler(args);
        }
    }
}

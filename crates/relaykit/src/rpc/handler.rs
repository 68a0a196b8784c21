//! Inbound method table

use std::{collections::HashMap, future::Future, sync::Arc};

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};

/// Handler result, `Err` is sent back to the caller as a remote error message
pub type HandlerResult = Result<Bytes, String>;

/// Type-erased request handler
pub type BoxHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Method name to handler map, shared by every peer of a server
#[derive(Default)]
pub struct Handlers {
    map: spin::RwLock<HashMap<String, BoxHandler>>,
}

impl Handlers {
    pub fn new() -> Handlers {
        Handlers::default()
    }

    /// Registers `handler` for `method`, replacing any previous one
    pub fn register<M, F, Fut>(&self, method: M, handler: F)
    where
        M: Into<String>,
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: BoxHandler = Arc::new(move |body: Bytes| -> BoxFuture<'static, HandlerResult> { Box::pin(handler(body)) });
        self.map.write().insert(method.into(), handler);
    }

    /// Registers a handler taking and returning JSON documents
    pub fn register_json<M, Req, Rsp, F, Fut>(&self, method: M, handler: F)
    where
        M: Into<String>,
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp, String>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, move |body: Bytes| {
            let handler = handler.clone();
            async move {
                let req: Req = serde_json::from_slice(&body).map_err(|err| format!("invalid arguments: {err}"))?;
                let rsp = handler(req).await?;
                serde_json::to_vec(&rsp)
                    .map(Bytes::from)
                    .map_err(|err| format!("unserializable result: {err}"))
            }
        });
    }

    pub fn get(&self, method: &str) -> Option<BoxHandler> {
        self.map.read().get(method).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.map.read().contains_key(method)
    }
}

//! Module server
//!
//! Answers add/remove/request/list messages from connected clients on top of
//! a [`ModuleStore`] and pushes hot reload notifications to every other
//! connection when modules are added or removed.

use futures::future::try_join_all;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::module::ipc::protocol::{
    Notification, Operation, ResponseMessage, ServerRequest, MAX_FRAME_LENGTH, NOTIFY_ADD,
    NOTIFY_REMOVE,
};
use crate::module::registry::ModuleRef;
use crate::module::store::{Artifact, ModuleStore};
use crate::module::traits::{ModuleError, ModuleKind};

/// Connection identifier, unique for the server's lifetime
pub type ConnectionId = u64;

const NOTIFICATION_CAPACITY: usize = 256;

/// A serialized notification and the connection that caused it
#[derive(Debug, Clone)]
struct Broadcast {
    origin: Option<ConnectionId>,
    frame: String,
}

/// Outcome of materializing one module for a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedModule {
    pub key: String,
    pub has_client: bool,
}

impl AddedModule {
    fn to_value(&self, kind: ModuleKind) -> Value {
        let mut object = Map::new();
        object.insert(kind.field().to_string(), Value::String(self.key.clone()));
        object.insert("hasClient".to_string(), Value::Bool(self.has_client));
        Value::Object(object)
    }
}

/// Request handler shared by every connection
pub struct ModuleServer {
    store: Arc<ModuleStore>,
    notifications: broadcast::Sender<Broadcast>,
    next_connection: AtomicU64,
}

impl ModuleServer {
    pub fn new(store: Arc<ModuleStore>) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Arc::new(Self {
            store,
            notifications,
            next_connection: AtomicU64::new(1),
        })
    }

    pub fn store(&self) -> &Arc<ModuleStore> {
        &self.store
    }

    /// Accept connections until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ModuleError> {
        info!("Module server listening on {:?}", listener.local_addr().ok());

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
                    debug!(connection, %peer, "Connection open");
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream, connection).await;
                        debug!(connection, "Connection closed");
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, connection: ConnectionId) {
        let _ = stream.set_nodelay(true);
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
        let (mut sink, mut frames) = framed.split();

        // Single writer; responses and notifications are funnelled through it
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    warn!(connection, "Failed to write frame: {}", e);
                    break;
                }
            }
        });

        let mut notifications = self.notifications.subscribe();

        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => {
                        let server = Arc::clone(&self);
                        let tx = outgoing_tx.clone();
                        tokio::spawn(async move {
                            if let Some(response) = server.handle_frame(&frame, connection).await {
                                let _ = tx.send(response);
                            }
                        });
                    }
                    Some(Err(e)) => {
                        warn!(connection, "Failed to read frame: {}", e);
                        break;
                    }
                    None => break,
                },
                notice = notifications.recv() => match notice {
                    Ok(notice) if notice.origin != Some(connection) => {
                        if outgoing_tx.send(notice.frame).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(connection, skipped, "Connection fell behind on notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        drop(outgoing_tx);
        writer.abort();
    }

    /// Handle one frame; returns the serialized response, if one is owed
    pub async fn handle_frame(&self, frame: &str, connection: ConnectionId) -> Option<String> {
        let request = match ServerRequest::parse(frame) {
            Ok(Some(request)) => request,
            Ok(None) => {
                warn!(connection, "Dropping message without id");
                return None;
            }
            Err(e) => {
                warn!(connection, "Dropping unparseable message: {}", e);
                return None;
            }
        };

        let id = request.id.clone();
        let response = match Operation::parse(&request.name) {
            None => {
                debug!(connection, name = %request.name, "Unknown message type");
                ResponseMessage::error(id, "invalid message type")
            }
            Some(operation) => match self.dispatch(operation, &request.args, Some(connection)).await {
                Ok(result) => ResponseMessage::success(id, result),
                Err(e) => {
                    debug!(connection, "Request failed: {}", e);
                    ResponseMessage::error(id, e.to_string())
                }
            },
        };

        match serde_json::to_string(&response) {
            Ok(text) => Some(text),
            Err(e) => {
                error!("Failed to serialize response: {}", e);
                None
            }
        }
    }

    async fn dispatch(
        &self,
        operation: Operation,
        args: &Value,
        origin: Option<ConnectionId>,
    ) -> Result<Value, ModuleError> {
        let kind = operation.kind();
        let force = args.get("force").and_then(Value::as_bool).unwrap_or(false);

        match operation {
            Operation::Add(_) => {
                let module = module_arg(args, kind)?;
                let added = self.add_module_from(&module, kind, force, origin).await?;
                Ok(added.to_value(kind))
            }
            Operation::Remove(_) => {
                let module = module_arg(args, kind)?;
                self.remove_module_from(&module, kind, origin).await?;
                Ok(Value::Null)
            }
            Operation::Request(_) => {
                let modules = modules_arg(args, kind)?;
                let hotload = args.get("hotload").and_then(Value::as_bool).unwrap_or(false);
                let added = self
                    .request_modules_from(&modules, kind, force, hotload, origin)
                    .await?;
                Ok(Value::Array(added.iter().map(|a| a.to_value(kind)).collect()))
            }
            Operation::List(_) => {
                let names = self.store.list_artifacts(kind).await?;
                Ok(json!(names))
            }
        }
    }

    /// Materialize `module` and announce it to every connected client
    pub async fn add_module(
        &self,
        module: &ModuleRef,
        kind: ModuleKind,
        force: bool,
    ) -> Result<AddedModule, ModuleError> {
        self.add_module_from(module, kind, force, None).await
    }

    /// Remove `module` and announce it to every connected client
    pub async fn remove_module(
        &self,
        module: &ModuleRef,
        kind: ModuleKind,
    ) -> Result<(), ModuleError> {
        self.remove_module_from(module, kind, None).await
    }

    async fn add_module_from(
        &self,
        module: &ModuleRef,
        kind: ModuleKind,
        force: bool,
        origin: Option<ConnectionId>,
    ) -> Result<AddedModule, ModuleError> {
        let artifact = self.materialize(module, kind, force).await?;
        let added = added_module(module, &artifact);
        self.notify(NOTIFY_ADD, kind, &added.key, origin);
        Ok(added)
    }

    async fn remove_module_from(
        &self,
        module: &ModuleRef,
        kind: ModuleKind,
        origin: Option<ConnectionId>,
    ) -> Result<(), ModuleError> {
        self.store.remove_materialized(module, kind).await?;
        self.notify(NOTIFY_REMOVE, kind, module.key().as_str(), origin);
        Ok(())
    }

    async fn request_modules_from(
        &self,
        modules: &[ModuleRef],
        kind: ModuleKind,
        force: bool,
        hotload: bool,
        origin: Option<ConnectionId>,
    ) -> Result<Vec<AddedModule>, ModuleError> {
        let artifacts = try_join_all(
            modules
                .iter()
                .map(|module| self.materialize(module, kind, force)),
        )
        .await?;

        let added: Vec<AddedModule> = modules
            .iter()
            .zip(&artifacts)
            .map(|(module, artifact)| added_module(module, artifact))
            .collect();

        if hotload {
            for module in &added {
                self.notify(NOTIFY_ADD, kind, &module.key, origin);
            }
        }

        Ok(added)
    }

    async fn materialize(
        &self,
        module: &ModuleRef,
        kind: ModuleKind,
        force: bool,
    ) -> Result<Artifact, ModuleError> {
        if force {
            self.store.remove_materialized(module, kind).await?;
        }
        self.store.ensure_materialized(module, kind).await
    }

    fn notify(&self, message_type: &str, kind: ModuleKind, key: &str, origin: Option<ConnectionId>) {
        let notification = Notification::module(message_type, kind, key);
        match serde_json::to_string(&notification) {
            Ok(frame) => {
                debug!(message_type, %kind, module = key, "Broadcasting notification");
                // No receivers just means no clients are connected
                let _ = self.notifications.send(Broadcast { origin, frame });
            }
            Err(e) => error!("Failed to serialize notification: {}", e),
        }
    }
}

fn added_module(module: &ModuleRef, artifact: &Artifact) -> AddedModule {
    AddedModule {
        key: module.key().to_string(),
        has_client: artifact.has_client,
    }
}

fn module_arg(args: &Value, kind: ModuleKind) -> Result<ModuleRef, ModuleError> {
    let value = args
        .get(kind.field())
        .ok_or_else(|| ModuleError::Validation(format!("missing {} field", kind.field())))?;
    ModuleRef::from_value(value)
}

fn modules_arg(args: &Value, kind: ModuleKind) -> Result<Vec<ModuleRef>, ModuleError> {
    let values = args
        .get(kind.collection())
        .and_then(Value::as_array)
        .ok_or_else(|| ModuleError::Validation(format!("{} must be a list", kind.collection())))?;
    values.iter().map(ModuleRef::from_value).collect()
}

//! Message routing between registered endpoints.
//!
//! The relay keeps just enough route state to deliver control messages to
//! the other party of a call: one entry per call id, created on
//! `call:initiate` and dropped on reject, end, or disconnect. Session
//! descriptions and ICE candidates are forwarded without inspection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parley_common::{
    CallId, CallKind, ClientMessage, Endpoint, EndpointId, ErrorCode, ServerMessage,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::directory::EndpointRegistry;

/// Who is on either end of a call.
#[derive(Debug, Clone)]
struct CallRoute {
    caller: EndpointId,
    callee: EndpointId,
    kind: CallKind,
}

impl CallRoute {
    fn involves(&self, id: &EndpointId) -> bool {
        &self.caller == id || &self.callee == id
    }

    fn other(&self, id: &EndpointId) -> &EndpointId {
        if &self.caller == id {
            &self.callee
        } else {
            &self.caller
        }
    }
}

#[derive(Default)]
struct RouteTable {
    calls: HashMap<CallId, CallRoute>,
    sharers: HashSet<EndpointId>,
}

/// Thread-safe relay handle. Cheap to clone; one per connection task.
#[derive(Clone, Default)]
pub struct Relay {
    registry: EndpointRegistry,
    routes: Arc<RwLock<RouteTable>>,
}

impl Relay {
    pub fn new(registry: EndpointRegistry) -> Self {
        Self {
            registry,
            routes: Arc::new(RwLock::new(RouteTable::default())),
        }
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Register a new endpoint under a fresh id and greet it.
    pub async fn connect(&self, username: &str, tx: mpsc::Sender<ServerMessage>) -> Endpoint {
        loop {
            match self
                .registry
                .register(EndpointId::new(), username, tx.clone())
                .await
            {
                Ok(endpoint) => {
                    info!(endpoint = %endpoint.id, username, "Endpoint registered");
                    self.deliver(
                        &endpoint.id,
                        ServerMessage::Welcome {
                            endpoint_id: endpoint.id.clone(),
                        },
                    )
                    .await;
                    return endpoint;
                }
                // A uuid collision; draw another id.
                Err(_) => continue,
            }
        }
    }

    /// Parse and route one raw text frame. Malformed frames are answered
    /// with an error event and dropped.
    pub async fn handle_text(&self, from: &EndpointId, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(from, msg).await,
            Err(e) => {
                warn!(endpoint = %from, error = %e, "Malformed envelope");
                self.deliver(
                    from,
                    ServerMessage::error(ErrorCode::MalformedEnvelope, e.to_string()),
                )
                .await;
            }
        }
    }

    /// Route one parsed message from `from`.
    pub async fn handle(&self, from: &EndpointId, msg: ClientMessage) {
        let msg = match msg.into_negotiation() {
            Ok((namespace, target, step)) => {
                if self.registry.resolve(&target).await.is_none() {
                    self.reply_error(from, ErrorCode::UserNotFound, "target not connected", None)
                        .await;
                    return;
                }
                self.deliver(&target, namespace.delivery(from.clone(), step))
                    .await;
                return;
            }
            Err(control) => control,
        };

        match msg {
            ClientMessage::Hello { .. } => {
                debug!(endpoint = %from, "Ignoring repeated hello");
            }
            ClientMessage::CallInitiate {
                call_id,
                target_id,
                kind,
            } => self.initiate(from, call_id, target_id, kind).await,
            ClientMessage::CallAccept { call_id } => {
                let Some(route) = self.callee_route(from, &call_id, false).await else {
                    return;
                };
                info!(call_id = %call_id, "Call accepted");
                self.deliver(
                    &route.caller,
                    ServerMessage::CallAccepted {
                        call_id,
                        from: from.clone(),
                    },
                )
                .await;
            }
            ClientMessage::CallReject { call_id, reason } => {
                let Some(route) = self.callee_route(from, &call_id, true).await else {
                    return;
                };
                info!(call_id = %call_id, ?reason, "Call rejected");
                self.deliver(
                    &route.caller,
                    ServerMessage::CallRejected {
                        call_id,
                        from: from.clone(),
                        reason,
                    },
                )
                .await;
            }
            ClientMessage::CallEnd { call_id } => {
                let route = {
                    let mut routes = self.routes.write().await;
                    let involved = routes
                        .calls
                        .get(&call_id)
                        .is_some_and(|route| route.involves(from));
                    if involved {
                        routes.calls.remove(&call_id)
                    } else {
                        None
                    }
                };
                // Both sides may hang up at once; the second end is a no-op.
                let Some(route) = route else {
                    debug!(call_id = %call_id, endpoint = %from, "End for unknown call");
                    return;
                };
                info!(call_id = %call_id, kind = ?route.kind, "Call ended");
                self.deliver(
                    route.other(from),
                    ServerMessage::CallEnded {
                        call_id: Some(call_id),
                        from: from.clone(),
                    },
                )
                .await;
            }
            ClientMessage::ScreenShareStart => {
                let Some(me) = self.registry.resolve(from).await else {
                    return;
                };
                self.routes.write().await.sharers.insert(from.clone());
                info!(endpoint = %from, username = %me.username, "Screen share started");
                self.broadcast(
                    from,
                    ServerMessage::ScreenShareStarted {
                        user_id: me.id,
                        username: me.username,
                    },
                )
                .await;
            }
            ClientMessage::ScreenShareStop => {
                self.routes.write().await.sharers.remove(from);
                info!(endpoint = %from, "Screen share stopped");
                self.broadcast(
                    from,
                    ServerMessage::ScreenShareStopped {
                        user_id: from.clone(),
                    },
                )
                .await;
            }
            ClientMessage::ScreenShareJoin { target_id } => {
                if !self.routes.read().await.sharers.contains(&target_id) {
                    self.reply_error(
                        from,
                        ErrorCode::InvalidTarget,
                        "target is not sharing a screen",
                        None,
                    )
                    .await;
                    return;
                }
                let Some(me) = self.registry.resolve(from).await else {
                    return;
                };
                self.deliver(
                    &target_id,
                    ServerMessage::ScreenShareViewerJoined {
                        from: me.id,
                        username: me.username,
                    },
                )
                .await;
            }
            // Negotiation variants were handled above.
            other => {
                debug!(endpoint = %from, ?other, "Unroutable message");
            }
        }
    }

    /// Forget an endpoint and tell everyone who still has state with it.
    pub async fn disconnect(&self, id: &EndpointId) {
        if let Some(age) = self.registry.unregister(id).await {
            info!(endpoint = %id, connected_secs = age.as_secs(), "Endpoint unregistered");
        }

        let orphaned: Vec<(CallId, CallRoute)> = {
            let mut routes = self.routes.write().await;
            routes.sharers.remove(id);
            let ids: Vec<CallId> = routes
                .calls
                .iter()
                .filter(|(_, r)| r.involves(id))
                .map(|(call_id, _)| call_id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|call_id| {
                    routes
                        .calls
                        .remove(&call_id)
                        .map(|route| (call_id, route))
                })
                .collect()
        };

        for (call_id, route) in orphaned {
            info!(call_id = %call_id, endpoint = %id, "Ending call for disconnected endpoint");
            self.deliver(
                route.other(id),
                ServerMessage::CallEnded {
                    call_id: Some(call_id),
                    from: id.clone(),
                },
            )
            .await;
        }

        self.broadcast(
            id,
            ServerMessage::ScreenShareStopped {
                user_id: id.clone(),
            },
        )
        .await;
    }

    /// Number of calls the relay currently routes.
    pub async fn active_calls(&self) -> usize {
        self.routes.read().await.calls.len()
    }

    async fn initiate(&self, from: &EndpointId, call_id: CallId, target: EndpointId, kind: CallKind) {
        if &target == from {
            self.reply_error(from, ErrorCode::InvalidTarget, "cannot call yourself", Some(call_id))
                .await;
            return;
        }
        let Some(caller) = self.registry.resolve(from).await else {
            return;
        };
        let Some(callee) = self.registry.resolve(&target).await else {
            self.reply_error(from, ErrorCode::UserNotFound, "User not found", Some(call_id))
                .await;
            return;
        };

        {
            let mut routes = self.routes.write().await;
            if routes.calls.contains_key(&call_id) {
                drop(routes);
                self.reply_error(
                    from,
                    ErrorCode::MalformedEnvelope,
                    "call id already in use",
                    Some(call_id),
                )
                .await;
                return;
            }
            routes.calls.insert(
                call_id.clone(),
                CallRoute {
                    caller: caller.id.clone(),
                    callee: callee.id.clone(),
                    kind,
                },
            );
        }

        info!(
            call_id = %call_id,
            caller = %caller.username,
            callee = %callee.username,
            ?kind,
            "Call initiated"
        );
        self.deliver(
            &callee.id,
            ServerMessage::CallIncoming {
                call_id,
                caller,
                kind,
            },
        )
        .await;
    }

    /// Look up a call that `from` must be the callee of, optionally removing
    /// it. Replies with an error when it is not.
    async fn callee_route(&self, from: &EndpointId, call_id: &CallId, remove: bool) -> Option<CallRoute> {
        let result = {
            let mut routes = self.routes.write().await;
            let result = match routes.calls.get(call_id) {
                None => Err(ErrorCode::UnknownCall),
                Some(route) if &route.callee != from => Err(ErrorCode::NotParticipant),
                Some(route) => Ok(route.clone()),
            };
            if remove && result.is_ok() {
                routes.calls.remove(call_id);
            }
            result
        };

        match result {
            Ok(route) => Some(route),
            Err(code) => {
                let message = match code {
                    ErrorCode::UnknownCall => "unknown call",
                    _ => "not the callee of this call",
                };
                self.reply_error(from, code, message, Some(call_id.clone()))
                    .await;
                None
            }
        }
    }

    async fn reply_error(
        &self,
        to: &EndpointId,
        code: ErrorCode,
        message: &str,
        call_id: Option<CallId>,
    ) {
        debug!(endpoint = %to, ?code, message, "Replying with error");
        self.deliver(
            to,
            ServerMessage::Error {
                code,
                message: message.to_string(),
                call_id,
            },
        )
        .await;
    }

    async fn broadcast(&self, from: &EndpointId, msg: ServerMessage) {
        for (id, tx) in self.registry.others(from).await {
            Self::push(&id, &tx, msg.clone());
        }
    }

    async fn deliver(&self, to: &EndpointId, msg: ServerMessage) {
        match self.registry.sender(to).await {
            Some(tx) => Self::push(to, &tx, msg),
            None => debug!(endpoint = %to, "Dropping message for unknown endpoint"),
        }
    }

    /// Non-blocking enqueue: a slow endpoint must not stall the sender's task.
    fn push(to: &EndpointId, tx: &mpsc::Sender<ServerMessage>, msg: ServerMessage) {
        match tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(endpoint = %to, "Delivery queue full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(endpoint = %to, "Delivery queue closed");
            }
        }
    }
}

//! Command handling against the in-memory node registry.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};

use crate::events::{EventBus, EventCallback, Unsubscribe};
use crate::models::{
    ApiCommand, ArgError, CommandArgs, CommandMessage, EventType, NodeData, NodeId,
    ServerDiagnostics, ServerInfo,
};
use crate::storage::Storage;
use crate::websocket::CommandHandler;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("missing required parameter: {0}")]
    MissingArgument(&'static str),
    #[error("invalid {0}: {1}")]
    InvalidArgument(&'static str, String),
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CommandError {
    /// Value of `error_code` in the error result.
    pub fn code(&self) -> i64 {
        match self {
            CommandError::MissingArgument(_) | CommandError::InvalidArgument(..) => 400,
            CommandError::UnknownCommand(_) | CommandError::NodeNotFound(_) => 404,
            CommandError::Internal(_) => 500,
        }
    }
}

fn node_id_arg(args: &CommandArgs) -> Result<NodeId, CommandError> {
    args.int("node_id").map_err(|e| match e {
        ArgError::Missing => CommandError::MissingArgument("node_id"),
        ArgError::Invalid(why) => CommandError::InvalidArgument("node_id", why),
    })
}

fn to_value<T: Serialize>(v: &T) -> Result<Value, CommandError> {
    serde_json::to_value(v).map_err(|e| CommandError::Internal(e.into()))
}

/// Server core: node registry, event bus and the command set.
pub struct Dispatcher {
    storage: Arc<dyn Storage>,
    events: EventBus,
    nodes: RwLock<HashMap<NodeId, NodeData>>,
    info: ServerInfo,
}

impl Dispatcher {
    pub fn new(storage: Arc<dyn Storage>, events: EventBus, info: ServerInfo) -> Self {
        Self {
            storage,
            events,
            nodes: RwLock::new(HashMap::new()),
            info,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn server_info(&self) -> ServerInfo {
        self.info.clone()
    }

    /// Replace the in-memory registry with the nodes held by storage.
    pub fn load_nodes(&self) -> usize {
        let loaded = self.storage.get_nodes();
        let count = loaded.len();
        let mut nodes = self.nodes.write();
        nodes.clear();
        nodes.extend(loaded.into_iter().map(|n| (n.node_id, n)));
        log::info!("loaded {} nodes from storage", count);
        count
    }

    /// Snapshot of all nodes, ordered by id.
    pub fn nodes(&self) -> Vec<NodeData> {
        let mut nodes: Vec<NodeData> = self.nodes.read().values().cloned().collect();
        nodes.sort_by_key(|n| n.node_id);
        nodes
    }

    pub fn node(&self, node_id: NodeId) -> Option<NodeData> {
        self.nodes.read().get(&node_id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn diagnostics(&self) -> ServerDiagnostics {
        ServerDiagnostics {
            info: self.server_info(),
            nodes: self.nodes(),
            events: Vec::new(),
        }
    }

    fn publish<T: Serialize>(&self, event: EventType, data: &T) {
        match serde_json::to_value(data) {
            Ok(v) => self.events.publish(event, v),
            Err(e) => log::error!("failed to encode {} payload: {}", event, e),
        }
    }

    /// Add or replace a node. The in-memory registry keeps the change even
    /// when persisting it fails.
    pub fn save_node(&self, node: NodeData) -> Result<()> {
        let existed = self
            .nodes
            .write()
            .insert(node.node_id, node.clone())
            .is_some();
        let saved = self.storage.save_node(&node);
        if let Err(e) = &saved {
            log::error!("failed to persist node {}: {:#}", node.node_id, e);
        }
        let event = if existed {
            EventType::NodeUpdated
        } else {
            EventType::NodeAdded
        };
        self.publish(event, &node);
        saved
    }

    pub fn delete_node(&self, node_id: NodeId) -> Result<(), CommandError> {
        if self.nodes.write().remove(&node_id).is_none() {
            return Err(CommandError::NodeNotFound(node_id));
        }
        let deleted = self.storage.delete_node(node_id);
        if let Err(e) = &deleted {
            log::error!("failed to delete node {} from storage: {:#}", node_id, e);
        }
        self.publish(EventType::NodeRemoved, &node_id);
        deleted.map_err(CommandError::Internal)
    }

    fn get_node(&self, args: &CommandArgs) -> Result<Value, CommandError> {
        let node_id = node_id_arg(args)?;
        let node = self.node(node_id).ok_or(CommandError::NodeNotFound(node_id))?;
        to_value(&node)
    }

    /// Only checks the registry; there is no transport to the device.
    fn ping_node(&self, args: &CommandArgs) -> Result<Value, CommandError> {
        let node_id = node_id_arg(args)?;
        if !self.nodes.read().contains_key(&node_id) {
            return Err(CommandError::NodeNotFound(node_id));
        }
        Ok(json!({ "reachable": true }))
    }

    pub fn handle_command(&self, cmd: &CommandMessage) -> Result<Value, CommandError> {
        log::debug!("handling command {} ({})", cmd.command, cmd.message_id);
        let args = cmd.args();
        match ApiCommand::parse(&cmd.command) {
            Some(ApiCommand::ServerInfo) => to_value(&self.info),
            Some(ApiCommand::GetNodes) | Some(ApiCommand::StartListening) => {
                to_value(&self.nodes())
            }
            Some(ApiCommand::GetNode) => self.get_node(&args),
            Some(ApiCommand::Diagnostics) => to_value(&self.diagnostics()),
            Some(ApiCommand::PingNode) => self.ping_node(&args),
            _ => Err(CommandError::UnknownCommand(cmd.command.clone())),
        }
    }
}

impl CommandHandler for Dispatcher {
    fn handle_command(&self, cmd: &CommandMessage) -> Result<Value, CommandError> {
        Dispatcher::handle_command(self, cmd)
    }

    fn subscribe(&self, callback: EventCallback) -> Unsubscribe {
        self.events.subscribe(callback)
    }

    fn server_info(&self) -> ServerInfo {
        Dispatcher::server_info(self)
    }
}

//! Data exchanged with clients and persisted to storage.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type NodeId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NodeAdded,
    NodeUpdated,
    NodeRemoved,
    NodeEvent,
    AttributeUpdated,
    ServerShutdown,
    ServerInfoUpdated,
    EndpointAdded,
    EndpointRemoved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NodeAdded => "node_added",
            EventType::NodeUpdated => "node_updated",
            EventType::NodeRemoved => "node_removed",
            EventType::NodeEvent => "node_event",
            EventType::AttributeUpdated => "attribute_updated",
            EventType::ServerShutdown => "server_shutdown",
            EventType::ServerInfoUpdated => "server_info_updated",
            EventType::EndpointAdded => "endpoint_added",
            EventType::EndpointRemoved => "endpoint_removed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every command name of the client API. Only some are served; see
/// [crate::server::Dispatcher::handle_command].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiCommand {
    StartListening,
    Diagnostics,
    ServerInfo,
    GetNodes,
    GetNode,
    CommissionWithCode,
    CommissionOnNetwork,
    SetWifiCredentials,
    SetThreadDataset,
    OpenCommissioningWindow,
    Discover,
    InterviewNode,
    DeviceCommand,
    RemoveNode,
    GetVendorNames,
    ReadAttribute,
    WriteAttribute,
    PingNode,
    GetNodeIpAddresses,
    ImportTestNode,
    CheckNodeUpdate,
    UpdateNode,
    SetDefaultFabricLabel,
    SetAclEntry,
    SetNodeBinding,
}

impl ApiCommand {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "start_listening" => Self::StartListening,
            "diagnostics" => Self::Diagnostics,
            "server_info" => Self::ServerInfo,
            "get_nodes" => Self::GetNodes,
            "get_node" => Self::GetNode,
            "commission_with_code" => Self::CommissionWithCode,
            "commission_on_network" => Self::CommissionOnNetwork,
            "set_wifi_credentials" => Self::SetWifiCredentials,
            "set_thread_dataset" => Self::SetThreadDataset,
            "open_commissioning_window" => Self::OpenCommissioningWindow,
            "discover" => Self::Discover,
            "interview_node" => Self::InterviewNode,
            "device_command" => Self::DeviceCommand,
            "remove_node" => Self::RemoveNode,
            "get_vendor_names" => Self::GetVendorNames,
            "read_attribute" => Self::ReadAttribute,
            "write_attribute" => Self::WriteAttribute,
            "ping_node" => Self::PingNode,
            "get_node_ip_addresses" => Self::GetNodeIpAddresses,
            "import_test_node" => Self::ImportTestNode,
            "check_node_update" => Self::CheckNodeUpdate,
            "update_node" => Self::UpdateNode,
            "set_default_fabric_label" => Self::SetDefaultFabricLabel,
            "set_acl_entry" => Self::SetAclEntry,
            "set_node_binding" => Self::SetNodeBinding,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorInfo {
    pub vendor_id: i64,
    pub vendor_name: String,
    pub company_legal_name: String,
    pub company_preferred_name: String,
    pub vendor_landing_page_url: String,
    pub creator: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSubscription {
    pub endpoint_id: Option<i64>,
    pub cluster_id: Option<i64>,
    pub attribute_id: Option<i64>,
}

/// Matter node as stored on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub node_id: NodeId,
    pub date_commissioned: DateTime<Utc>,
    pub last_interview: DateTime<Utc>,
    pub interview_version: i64,
    pub available: bool,
    pub is_bridge: bool,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    #[serde(default)]
    pub attribute_subscriptions: Vec<AttributeSubscription>,
}

impl NodeData {
    /// Fresh node commissioned now, with no attributes.
    pub fn new(node_id: NodeId) -> Self {
        let now = Utc::now();
        Self {
            node_id,
            date_commissioned: now,
            last_interview: now,
            interview_version: 0,
            available: false,
            is_bridge: false,
            attributes: HashMap::new(),
            attribute_subscriptions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub fabric_id: i64,
    pub compressed_fabric_id: i64,
    pub schema_version: i64,
    pub min_supported_schema_version: i64,
    pub sdk_version: String,
    pub wifi_credentials_set: bool,
    pub thread_credentials_set: bool,
    pub bluetooth_enabled: bool,
}

pub const SCHEMA_VERSION: i64 = 11;
pub const MIN_SUPPORTED_SCHEMA_VERSION: i64 = 1;

impl ServerInfo {
    pub fn new(fabric_id: i64) -> Self {
        Self {
            fabric_id,
            compressed_fabric_id: fabric_id,
            schema_version: SCHEMA_VERSION,
            min_supported_schema_version: MIN_SUPPORTED_SCHEMA_VERSION,
            sdk_version: format!("{}-{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            wifi_credentials_set: false,
            thread_credentials_set: false,
            bluetooth_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDiagnostics {
    pub info: ServerInfo,
    pub nodes: Vec<NodeData>,
    pub events: Vec<Value>,
}

/// Argument bag of a command with permissive coercion helpers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandArgs(pub Map<String, Value>);

/// Why an argument could not be coerced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgError {
    Missing,
    Invalid(String),
}

impl CommandArgs {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Integer argument given as a JSON number or a numeric string.
    /// Fractional numbers are truncated; strings must be plain integers.
    pub fn int(&self, key: &str) -> Result<i64, ArgError> {
        match self.0.get(key) {
            None => Err(ArgError::Missing),
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Ok(i)
                } else if let Some(f) = n.as_f64() {
                    if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                        Ok(f as i64)
                    } else {
                        Err(ArgError::Invalid(format!("{} out of range", n)))
                    }
                } else {
                    Err(ArgError::Invalid(format!("{} out of range", n)))
                }
            }
            Some(Value::String(s)) => s
                .parse::<i64>()
                .map_err(|_| ArgError::Invalid(format!("expected number, got {:?}", s))),
            Some(_) => Err(ArgError::Invalid("unsupported type".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub message_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<CommandArgs>,
}

impl CommandMessage {
    pub fn new(command: &str) -> Self {
        Self {
            message_id: generate_message_id(),
            command: command.to_owned(),
            args: None,
        }
    }

    pub fn args(&self) -> CommandArgs {
        self.args.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultMessage {
    Success {
        message_id: String,
        result: Value,
    },
    Error {
        message_id: String,
        error_code: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

impl ResultMessage {
    pub fn message_id(&self) -> &str {
        match self {
            ResultMessage::Success { message_id, .. } => message_id,
            ResultMessage::Error { message_id, .. } => message_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: EventType,
    pub data: Value,
}

pub fn generate_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

//! Node, vendor and settings persistence in JSON files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::models::{NodeData, NodeId, VendorInfo};

const NODES_FILE: &str = "nodes.json";
const VENDORS_FILE: &str = "vendors.json";
const SETTINGS_FILE: &str = "settings.json";

/// Persistence used by the server. Getters return owned copies.
pub trait Storage: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn sync(&self) -> Result<()>;

    fn get_node(&self, node_id: NodeId) -> Option<NodeData>;
    fn get_nodes(&self) -> Vec<NodeData>;
    fn save_node(&self, node: &NodeData) -> Result<()>;
    fn delete_node(&self, node_id: NodeId) -> Result<()>;

    fn get_vendor(&self, vendor_id: i64) -> Option<VendorInfo>;
    fn get_vendors(&self) -> Vec<VendorInfo>;
    fn save_vendor(&self, vendor: &VendorInfo) -> Result<()>;

    fn get_setting(&self, key: &str) -> Option<Value>;
    fn save_setting(&self, key: &str, value: Value) -> Result<()>;
    fn delete_setting(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
struct Data {
    nodes: BTreeMap<NodeId, NodeData>,
    vendors: BTreeMap<i64, VendorInfo>,
    settings: BTreeMap<String, Value>,
}

pub struct JsonStorage {
    base: PathBuf,
    data: RwLock<Data>,
}

fn load_json_file<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(e).context(format!("reading {}", path.display())),
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&data).context(format!("parsing {}", path.display()))
}

/// Write `value` next to `path` and rename it into place.
fn save_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, data).context(format!("writing {}", tmp.display()))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e).context(format!("renaming {} into place", tmp.display()));
    }
    Ok(())
}

impl JsonStorage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            data: RwLock::new(Data::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.base
    }

    fn file(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }

    fn save_nodes(&self, data: &Data) -> Result<()> {
        save_json_file(&self.file(NODES_FILE), &data.nodes)
    }

    fn save_vendors(&self, data: &Data) -> Result<()> {
        save_json_file(&self.file(VENDORS_FILE), &data.vendors)
    }

    fn save_settings(&self, data: &Data) -> Result<()> {
        save_json_file(&self.file(SETTINGS_FILE), &data.settings)
    }

    fn sync_locked(&self, data: &Data) -> Result<()> {
        self.save_nodes(data).context("saving nodes")?;
        self.save_vendors(data).context("saving vendors")?;
        self.save_settings(data).context("saving settings")?;
        Ok(())
    }

    /// Copy the data files into a timestamped `backup_*` directory.
    /// Returns the directory created.
    pub fn backup(&self) -> Result<PathBuf> {
        let _guard = self.data.read();
        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
        let dir = self.base.join(format!("backup_{}", stamp));
        std::fs::create_dir_all(&dir).context(format!("creating {}", dir.display()))?;
        for name in [NODES_FILE, VENDORS_FILE, SETTINGS_FILE] {
            let src = self.file(name);
            if !src.exists() {
                continue;
            }
            if let Err(e) = std::fs::copy(&src, dir.join(name)) {
                log::warn!("failed to back up {}: {}", name, e);
            }
        }
        log::info!("data backup created in {}", dir.display());
        Ok(dir)
    }
}

impl Storage for JsonStorage {
    fn start(&self) -> Result<()> {
        let mut data = self.data.write();
        std::fs::create_dir_all(&self.base)
            .context(format!("creating storage directory {}", self.base.display()))?;

        match load_json_file(&self.file(NODES_FILE)) {
            Ok(nodes) => data.nodes = nodes,
            Err(e) => log::warn!("failed to load nodes: {:#}", e),
        }
        match load_json_file(&self.file(VENDORS_FILE)) {
            Ok(vendors) => data.vendors = vendors,
            Err(e) => log::warn!("failed to load vendors: {:#}", e),
        }
        match load_json_file(&self.file(SETTINGS_FILE)) {
            Ok(settings) => data.settings = settings,
            Err(e) => log::warn!("failed to load settings: {:#}", e),
        }

        log::info!(
            "json storage started in {} ({} nodes, {} vendors)",
            self.base.display(),
            data.nodes.len(),
            data.vendors.len()
        );
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let data = self.data.write();
        self.sync_locked(&data).context("syncing storage on stop")?;
        log::info!("json storage stopped");
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let data = self.data.write();
        self.sync_locked(&data)
    }

    fn get_node(&self, node_id: NodeId) -> Option<NodeData> {
        self.data.read().nodes.get(&node_id).cloned()
    }

    fn get_nodes(&self) -> Vec<NodeData> {
        self.data.read().nodes.values().cloned().collect()
    }

    fn save_node(&self, node: &NodeData) -> Result<()> {
        let mut data = self.data.write();
        data.nodes.insert(node.node_id, node.clone());
        self.save_nodes(&data)
    }

    fn delete_node(&self, node_id: NodeId) -> Result<()> {
        let mut data = self.data.write();
        data.nodes.remove(&node_id);
        self.save_nodes(&data)
    }

    fn get_vendor(&self, vendor_id: i64) -> Option<VendorInfo> {
        self.data.read().vendors.get(&vendor_id).cloned()
    }

    fn get_vendors(&self) -> Vec<VendorInfo> {
        self.data.read().vendors.values().cloned().collect()
    }

    fn save_vendor(&self, vendor: &VendorInfo) -> Result<()> {
        let mut data = self.data.write();
        data.vendors.insert(vendor.vendor_id, vendor.clone());
        self.save_vendors(&data)
    }

    fn get_setting(&self, key: &str) -> Option<Value> {
        self.data.read().settings.get(key).cloned()
    }

    fn save_setting(&self, key: &str, value: Value) -> Result<()> {
        let mut data = self.data.write();
        data.settings.insert(key.to_owned(), value);
        self.save_settings(&data)
    }

    fn delete_setting(&self, key: &str) -> Result<()> {
        let mut data = self.data.write();
        data.settings.remove(key);
        self.save_settings(&data)
    }
}

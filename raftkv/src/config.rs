use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::sync::Mutex;

static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub id: u64,
    pub addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    pub id: u64,
    pub addr: String,
    pub metrics_addr: String,
    pub base_path: String,
    pub snapshot_threshold: u64,
    pub node_list: Vec<NodeConfig>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            id: 1,
            addr: "0.0.0.0:4001".to_string(),
            metrics_addr: "0.0.0.0:4011".to_string(),
            base_path: "raftkv-data".to_string(),
            snapshot_threshold: 8 * 1024 * 1024,
            node_list: Vec::new(),
        }
    }

    pub fn from_toml(path: &str) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        let config: RuntimeConfig = match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        *instance().lock().unwrap() = config.clone();
        Some(config)
    }

    pub fn peer_addr(&self, id: u64) -> Option<String> {
        self.node_list
            .iter()
            .find(|node| node.id == id)
            .map(|node| node.addr.clone())
    }
}

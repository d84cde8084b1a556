use config::{Config, File, FileFormat};
use ethers::types::{Address, H256};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::Path;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::events::EventKind;
use crate::utils::address_to_string;

#[derive(Debug, Deserialize, Clone)]
pub struct AppSettings {
    /// Stored with every chain stat; a change invalidates all extracted data.
    #[serde(default = "default_app_version")]
    pub version: String,
    /// Nodes with weight <= min_weight are hidden from the graph.
    #[serde(default)]
    pub min_weight: u32,
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            version: default_app_version(),
            min_weight: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionSettings {
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    /// Upper bound on a single eth_getLogs window before bisection. `None` queries the full range.
    #[serde(default)]
    pub max_block_span: Option<u64>,
    #[serde(default = "default_graphql_page_size")]
    pub graphql_page_size: usize,
    /// Chains extracted in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_rpc_timeout_secs() -> u64 {
    30
}
fn default_graphql_page_size() -> usize {
    1000
}
fn default_concurrency() -> usize {
    4
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            rpc_timeout_secs: default_rpc_timeout_secs(),
            max_block_span: None,
            graphql_page_size: default_graphql_page_size(),
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[default]
    #[serde(rename = "pretty")]
    Pretty,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    /// Without a url the binary falls back to the in-memory stores.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Per-chain connection, contract and signature parameters.
///
/// Immutable once loaded. Unknown keys (UI-only fields) are kept in `extra` so a descriptor
/// serialises back unchanged. Descriptors loaded through [`Settings`] arrive with lowercased
/// keys, since the `config` loader folds key case; JSON descriptors keep theirs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_events_path: Option<String>,
    #[serde(default)]
    pub start_block: u64,
    pub token_contract_address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_contract_address: Option<Address>,
    #[serde(
        default,
        deserialize_with = "deserialize_signature_map",
        serialize_with = "serialize_signature_map"
    )]
    pub event_signatures: HashMap<EventKind, String>,
    /// Indexer token-type filter (e.g. `ERC-20`) for chains whose indexer mixes token standards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graphql_token_type: Option<String>,
    /// Test chains are listed for the UI but never extracted.
    #[serde(default)]
    pub test: bool,
    /// Explorer template containing `{address}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_url: Option<String>,
    /// Explorer template containing `{transactionHash}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_url: Option<String>,
    /// UI-only fields. Keys are lowercase when read from a `Config.toml`, so UI fields there
    /// should be snake_case.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn deserialize_signature_map<'de, D>(deserializer: D) -> Result<HashMap<EventKind, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = HashMap::<String, String>::deserialize(deserializer)?;
    parse_signature_map(raw).map_err(de::Error::custom)
}

fn serialize_signature_map<S>(map: &HashMap<EventKind, String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let ordered: std::collections::BTreeMap<&str, &String> =
        map.iter().map(|(kind, sig)| (kind.as_str(), sig)).collect();
    ordered.serialize(serializer)
}

/// Parses `{ "MINT": "Minted(...)", .. }`. Key case is ignored since config sources lowercase keys.
pub fn parse_signature_map(
    raw: HashMap<String, String>,
) -> Result<HashMap<EventKind, String>, ConfigError> {
    let mut map = HashMap::with_capacity(raw.len());
    for (key, signature) in raw {
        let kind = EventKind::from_str(&key)
            .map_err(|_| ConfigError::InvalidSignatureMap(format!("unknown event kind '{}'", key)))?;
        if kind == EventKind::Unknown {
            return Err(ConfigError::InvalidSignatureMap(
                "UNKNOWN cannot carry a signature".to_string(),
            ));
        }
        let signature = normalize_signature(&signature);
        if signature.is_empty() || !signature.contains('(') || !signature.ends_with(')') {
            return Err(ConfigError::InvalidSignatureMap(format!(
                "{}: '{}' is not an event signature",
                kind, signature
            )));
        }
        map.insert(kind, signature);
    }
    Ok(map)
}

fn normalize_signature(signature: &str) -> String {
    signature.chars().filter(|c| !c.is_whitespace()).collect()
}

impl ChainConfig {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            name: String::new(),
            rpc_url: None,
            graph_url: None,
            local_events_path: None,
            start_block: 0,
            token_contract_address: Address::zero(),
            bridge_contract_address: None,
            event_signatures: HashMap::new(),
            graphql_token_type: None,
            test: false,
            address_url: None,
            tx_url: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    pub fn with_graph_url(mut self, url: impl Into<String>) -> Self {
        self.graph_url = Some(url.into());
        self
    }

    pub fn with_local_events_path(mut self, path: impl Into<String>) -> Self {
        self.local_events_path = Some(path.into());
        self
    }

    pub fn with_start_block(mut self, block: u64) -> Self {
        self.start_block = block;
        self
    }

    pub fn with_token_contract(mut self, address: Address) -> Self {
        self.token_contract_address = address;
        self
    }

    pub fn with_bridge_contract(mut self, address: Address) -> Self {
        self.bridge_contract_address = Some(address);
        self
    }

    pub fn with_event_signatures(mut self, signatures: HashMap<EventKind, String>) -> Self {
        self.event_signatures = signatures
            .into_iter()
            .map(|(kind, sig)| (kind, normalize_signature(&sig)))
            .collect();
        self
    }

    pub fn with_graphql_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.graphql_token_type = Some(token_type.into());
        self
    }

    pub fn with_test(mut self, test: bool) -> Self {
        self.test = test;
        self
    }

    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("chain-{}", self.chain_id)
        } else {
            self.name.clone()
        }
    }

    /// Kind mapped to `signature`, or [`EventKind::Unknown`] when the map has no entry for it.
    pub fn kind_for_signature(&self, signature: &str) -> EventKind {
        let wanted = normalize_signature(signature);
        self.event_signatures
            .iter()
            .filter(|(_, sig)| **sig == wanted)
            .map(|(kind, _)| *kind)
            .min()
            .unwrap_or(EventKind::Unknown)
    }

    pub fn signature_for(&self, kind: EventKind) -> Option<&str> {
        self.event_signatures.get(&kind).map(String::as_str)
    }

    pub fn address_link(&self, address: &Address) -> Option<String> {
        self.address_url
            .as_ref()
            .map(|template| template.replace("{address}", &address_to_string(address)))
    }

    pub fn tx_link(&self, transaction_hash: &H256) -> Option<String> {
        self.tx_url
            .as_ref()
            .map(|template| template.replace("{transactionHash}", &format!("{:?}", transaction_hash)))
    }

    /// Checks the fields each configured source needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let chain_id = self.chain_id;
        for (field, value) in [("rpc_url", &self.rpc_url), ("graph_url", &self.graph_url)] {
            if let Some(value) = value {
                url::Url::parse(value).map_err(|_| ConfigError::InvalidValue {
                    chain_id,
                    field,
                    value: value.clone(),
                })?;
            }
        }
        if let Some(path) = &self.local_events_path {
            if path.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    chain_id,
                    field: "local_events_path",
                    value: path.clone(),
                });
            }
        }
        let has_bridge_signature = EventKind::BRIDGE_KINDS
            .iter()
            .any(|kind| self.event_signatures.contains_key(kind));
        if has_bridge_signature && self.bridge_contract_address.is_none() {
            return Err(ConfigError::MissingField {
                chain_id,
                field: "bridge_contract_address",
            });
        }
        if self.rpc_url.is_some() && self.token_contract_address == Address::zero() {
            return Err(ConfigError::MissingField {
                chain_id,
                field: "token_contract_address",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub app: AppSettings,
    #[serde(default)]
    pub extraction: ExtractionSettings,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

impl Settings {
    pub fn new() -> anyhow::Result<Self> {
        Self::from_path("Config.toml")
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let s = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?;
        Self::finish(s.try_deserialize()?)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        let s = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Self::finish(s.try_deserialize()?)
    }

    fn finish(mut settings: Self) -> anyhow::Result<Self> {
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(version) = env::var("TOKEN_FLOW_APP_VERSION") {
            if !version.trim().is_empty() {
                self.app.version = version.trim().to_string();
            }
        }
        if let Ok(raw) = env::var("TOKEN_FLOW_MIN_WEIGHT") {
            match raw.trim().parse() {
                Ok(weight) => self.app.min_weight = weight,
                Err(e) => eprintln!("Failed to parse TOKEN_FLOW_MIN_WEIGHT '{}': {}", raw, e),
            }
        }
        if let Ok(url) = env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                self.database.url = Some(url.trim().to_string());
            }
        }
        if let Ok(raw) = env::var("TOKEN_FLOW_RPC_TIMEOUT_SECS") {
            match raw.trim().parse() {
                Ok(secs) => self.extraction.rpc_timeout_secs = secs,
                Err(e) => eprintln!("Failed to parse TOKEN_FLOW_RPC_TIMEOUT_SECS '{}': {}", raw, e),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(ConfigError::DuplicateChain(chain.chain_id));
            }
        }
        Ok(())
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}

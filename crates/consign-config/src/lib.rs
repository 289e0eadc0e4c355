//! Configuration file handling for consign.
//!
//! Settings live in a `.consign.toml` file, usually at the root of the
//! warehouse project and discovered by walking up from the working
//! directory. Each `[accounts.<name>]` table describes one carrier account;
//! [`Config::account`] validates a table into an immutable
//! [`CarrierAccount`].
//!
//! ```toml
//! [state]
//! dir = ".consign"
//! lock_timeout = "1h"
//!
//! [accounts.seur-main]
//! offline = true
//! min_reference = 4900000
//! max_reference = 4920999
//! recipient_email = "manifests@carrier.example"
//! sender_email = "dispatch@warehouse.example"
//!
//! [accounts.seur-main.credentials]
//! ci = "1234"
//! ccc = "5678"
//!
//! [accounts.seur-main.relay]
//! kind = "http"
//! url = "https://mail.example/send"
//! timeout = "30s"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use consign_mail::RelayConfig;
use consign_types::ReferenceRange;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file name
pub const CONFIG_FILE: &str = ".consign.toml";

/// Default state directory, relative to the config file
pub const DEFAULT_STATE_DIR: &str = ".consign";

/// Product code sent to the carrier when an account does not set one.
pub const DEFAULT_PRODUCT: &str = "2";

/// Counter used for references when an account does not name one.
pub const DEFAULT_SEQUENCE_ID: &str = "carrier.reference";

/// Get the config file path for a directory
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Complete consign configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountConfig>,
}

/// Where state is kept and how long a job lock may be held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
    /// Job locks older than this are treated as abandoned
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub lock_timeout: Duration,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(3600)
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            lock_timeout: default_lock_timeout(),
        }
    }
}

/// Raw `[accounts.<name>]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub min_reference: u64,
    #[serde(default)]
    pub max_reference: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_prefix: Option<String>,
    #[serde(default = "default_transport")]
    pub transport: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carriage_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<String>,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayConfig>,
}

fn default_transport() -> u8 {
    1
}

/// Carrier back-office credentials. Only `ci`, `vat` and `ccc` reach the
/// manifest; the rest are carried for the live API client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub vat: String,
    #[serde(default)]
    pub franchise: String,
    #[serde(default)]
    pub seurid: String,
    #[serde(default)]
    pub ci: String,
    #[serde(default)]
    pub ccc: String,
}

/// Why an account table could not be turned into a [`CarrierAccount`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("unknown carrier account '{0}'")]
    Unknown(String),

    #[error("account '{account}': invalid reference range {min}..={max}")]
    InvalidRange { account: String, min: u64, max: u64 },

    #[error("account '{0}': recipient_email is required")]
    MissingRecipient(String),

    #[error("account '{0}': sender_email is required")]
    MissingSender(String),

    #[error("account '{account}': transport code {transport} is not a single digit")]
    InvalidTransport { account: String, transport: u8 },
}

impl Config {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account_names(&self) -> impl Iterator<Item = &str> {
        self.accounts.keys().map(String::as_str)
    }

    /// Resolve and validate the account called `name`.
    pub fn account(&self, name: &str) -> Result<CarrierAccount, AccountError> {
        let raw = self
            .accounts
            .get(name)
            .ok_or_else(|| AccountError::Unknown(name.to_string()))?;

        if raw.min_reference > raw.max_reference {
            return Err(AccountError::InvalidRange {
                account: name.to_string(),
                min: raw.min_reference,
                max: raw.max_reference,
            });
        }
        if raw.transport > 9 {
            return Err(AccountError::InvalidTransport {
                account: name.to_string(),
                transport: raw.transport,
            });
        }
        let recipient = non_empty(&raw.recipient_email)
            .ok_or_else(|| AccountError::MissingRecipient(name.to_string()))?;
        let sender = non_empty(&raw.sender_email)
            .ok_or_else(|| AccountError::MissingSender(name.to_string()))?;

        let mut account = CarrierAccount::new(
            name,
            ReferenceRange::new(raw.min_reference, raw.max_reference),
        )
        .with_offline(raw.offline)
        .with_emails(recipient, non_empty(&raw.backup_email), sender)
        .with_transport(raw.transport)
        .with_credentials(raw.credentials.clone());

        if let Some(prefix) = non_empty(&raw.filename_prefix) {
            account = account.with_filename_prefix(prefix);
        }
        if let Some(service) = non_empty(&raw.default_service) {
            account = account.with_default_service(service);
        }
        if let Some(product) = non_empty(&raw.product) {
            account = account.with_product(product);
        }
        if let Some(key) = non_empty(&raw.carriage_key) {
            account = account.with_carriage_key(key);
        }
        if let Some(id) = non_empty(&raw.sequence_id) {
            account = account.with_sequence_id(id);
        }
        if let Some(relay) = &raw.relay {
            account = account.with_relay(relay.clone());
        }
        Ok(account)
    }

    /// State directory, resolved against `base` when relative.
    pub fn state_dir(&self, base: &Path) -> PathBuf {
        if self.state.dir.is_absolute() {
            self.state.dir.clone()
        } else {
            base.join(&self.state.dir)
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// A validated carrier account. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct CarrierAccount {
    name: String,
    offline: bool,
    range: ReferenceRange,
    recipient_email: String,
    backup_email: Option<String>,
    sender_email: String,
    filename_prefix: String,
    transport: u8,
    default_service: Option<String>,
    product: String,
    carriage_key: Option<String>,
    sequence_id: String,
    credentials: Credentials,
    relay: Option<RelayConfig>,
}

impl CarrierAccount {
    /// Offline account with the given reference range and defaults elsewhere.
    pub fn new(name: &str, range: ReferenceRange) -> Self {
        Self {
            name: name.to_string(),
            offline: true,
            range,
            recipient_email: String::new(),
            backup_email: None,
            sender_email: String::new(),
            filename_prefix: name.to_string(),
            transport: default_transport(),
            default_service: None,
            product: DEFAULT_PRODUCT.to_string(),
            carriage_key: None,
            sequence_id: DEFAULT_SEQUENCE_ID.to_string(),
            credentials: Credentials::default(),
            relay: None,
        }
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn with_emails(mut self, recipient: &str, backup: Option<&str>, sender: &str) -> Self {
        self.recipient_email = recipient.to_string();
        self.backup_email = backup.map(str::to_string);
        self.sender_email = sender.to_string();
        self
    }

    pub fn with_filename_prefix(mut self, prefix: &str) -> Self {
        self.filename_prefix = prefix.to_string();
        self
    }

    pub fn with_transport(mut self, transport: u8) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_default_service(mut self, service: &str) -> Self {
        self.default_service = Some(service.to_string());
        self
    }

    pub fn with_product(mut self, product: &str) -> Self {
        self.product = product.to_string();
        self
    }

    pub fn with_carriage_key(mut self, key: &str) -> Self {
        self.carriage_key = Some(key.to_string());
        self
    }

    pub fn with_sequence_id(mut self, id: &str) -> Self {
        self.sequence_id = id.to_string();
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn range(&self) -> ReferenceRange {
        self.range
    }

    pub fn recipient_email(&self) -> &str {
        &self.recipient_email
    }

    pub fn backup_email(&self) -> Option<&str> {
        self.backup_email.as_deref()
    }

    /// Recipient followed by the backup address, if any.
    pub fn recipients(&self) -> Vec<String> {
        let mut to = vec![self.recipient_email.clone()];
        if let Some(backup) = &self.backup_email
            && backup != &self.recipient_email
        {
            to.push(backup.clone());
        }
        to
    }

    pub fn sender_email(&self) -> &str {
        &self.sender_email
    }

    pub fn filename_prefix(&self) -> &str {
        &self.filename_prefix
    }

    pub fn transport(&self) -> u8 {
        self.transport
    }

    pub fn default_service(&self) -> Option<&str> {
        self.default_service.as_deref()
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn carriage_key(&self) -> Option<&str> {
        self.carriage_key.as_deref()
    }

    pub fn sequence_id(&self) -> &str {
        &self.sequence_id
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn relay(&self) -> Option<&RelayConfig> {
        self.relay.as_ref()
    }
}

/// Parse configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).context("failed to parse consign config")
}

/// Load configuration from a directory
pub fn load_config(dir: &Path) -> Result<Config> {
    load_config_from_file(&config_path(dir))
}

/// Load configuration from a specific file path
pub fn load_config_from_file(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Find configuration file by walking up the directory tree
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir;

    loop {
        let config_file = current.join(CONFIG_FILE);
        if config_file.exists() {
            return Some(config_file);
        }

        match current.parent() {
            Some(parent) => current = parent,
            None => return None,
        }
    }
}

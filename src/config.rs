//! Configuration for the store and the in-memory metric table
//!
//! All settings are plain serde structs with defaults, validated once at
//! startup; anything invalid aborts initialization rather than surfacing
//! later as a runtime surprise.

use crate::chunk::format::span_is_registered;
use crate::{Error, Result, MONTH_SEC};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the driver picks a coordinator host per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HostSelectionPolicy {
    RoundRobin,
    HostPoolSimple,
    HostPoolEpsilonGreedy,
    TokenAwareRoundRobin,
    TokenAwareHostPoolSimple,
    TokenAwareHostPoolEpsilonGreedy,
}

impl HostSelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostSelectionPolicy::RoundRobin => "roundrobin",
            HostSelectionPolicy::HostPoolSimple => "hostpool-simple",
            HostSelectionPolicy::HostPoolEpsilonGreedy => "hostpool-epsilon-greedy",
            HostSelectionPolicy::TokenAwareRoundRobin => "tokenaware,roundrobin",
            HostSelectionPolicy::TokenAwareHostPoolSimple => "tokenaware,hostpool-simple",
            HostSelectionPolicy::TokenAwareHostPoolEpsilonGreedy => {
                "tokenaware,hostpool-epsilon-greedy"
            }
        }
    }
}

impl std::str::FromStr for HostSelectionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "roundrobin" => Ok(HostSelectionPolicy::RoundRobin),
            "hostpool-simple" => Ok(HostSelectionPolicy::HostPoolSimple),
            "hostpool-epsilon-greedy" => Ok(HostSelectionPolicy::HostPoolEpsilonGreedy),
            "tokenaware,roundrobin" => Ok(HostSelectionPolicy::TokenAwareRoundRobin),
            "tokenaware,hostpool-simple" => Ok(HostSelectionPolicy::TokenAwareHostPoolSimple),
            "tokenaware,hostpool-epsilon-greedy" => {
                Ok(HostSelectionPolicy::TokenAwareHostPoolEpsilonGreedy)
            }
            other => Err(Error::Config(format!(
                "unknown host selection policy '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for HostSelectionPolicy {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<HostSelectionPolicy> for String {
    fn from(policy: HostSelectionPolicy) -> String {
        policy.as_str().to_owned()
    }
}

/// Cassandra store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Contact points, `host:port`
    pub addrs: Vec<String>,
    pub keyspace: String,
    /// Consistency level name, e.g. `one`, `quorum`
    pub consistency: String,
    /// Per-request deadline in milliseconds, also the connect timeout
    pub timeout_ms: u64,
    /// CQL protocol version the deployment expects (3 or 4)
    pub cql_protocol_version: u8,
    /// Driver-level retry count per statement
    pub retries: u32,
    /// Skip resolving the full ring from the contact points
    pub disable_initial_host_lookup: bool,
    /// Number of write shards, one worker each
    pub write_concurrency: usize,
    /// Bound of each write shard's queue
    pub write_queue_size: usize,
    /// Number of read workers
    pub read_concurrency: usize,
    /// Bound of the shared read queue
    pub read_queue_size: usize,
    /// Reads that waited longer than this are failed without executing
    pub omit_read_timeout_secs: u64,
    /// Divisor applied to the TTL pre-factor when sizing compaction windows
    pub window_factor: u32,
    /// JSON file holding `schema_keyspace` and `schema_table` templates
    pub schema_file: Option<PathBuf>,
    /// Create the keyspace and tables at startup instead of requiring them
    pub create_keyspace: bool,
    pub ssl: bool,
    pub ca_path: Option<PathBuf>,
    pub host_verification: bool,
    pub auth: bool,
    pub username: String,
    pub password: String,
    pub host_selection_policy: HostSelectionPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            addrs: vec!["localhost:9042".to_owned()],
            keyspace: "granary".to_owned(),
            consistency: "one".to_owned(),
            timeout_ms: 1000,
            cql_protocol_version: 4,
            retries: 0,
            disable_initial_host_lookup: false,
            write_concurrency: 10,
            write_queue_size: 100_000,
            read_concurrency: 20,
            read_queue_size: 200_000,
            omit_read_timeout_secs: 60,
            window_factor: 20,
            schema_file: None,
            create_keyspace: true,
            ssl: false,
            ca_path: None,
            host_verification: true,
            auth: false,
            username: String::new(),
            password: String::new(),
            host_selection_policy: HostSelectionPolicy::TokenAwareHostPoolEpsilonGreedy,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.addrs.is_empty() {
            return Err(Error::Config("at least one contact point required".into()));
        }
        if self.keyspace.is_empty() {
            return Err(Error::Config("keyspace must not be empty".into()));
        }
        if self.write_concurrency == 0 {
            return Err(Error::Config("write_concurrency must be at least 1".into()));
        }
        if self.read_concurrency == 0 {
            return Err(Error::Config("read_concurrency must be at least 1".into()));
        }
        if self.write_queue_size == 0 || self.read_queue_size == 0 {
            return Err(Error::Config("queue sizes must be at least 1".into()));
        }
        if self.window_factor == 0 {
            return Err(Error::Config("window_factor must be at least 1".into()));
        }
        if !matches!(self.cql_protocol_version, 3 | 4) {
            return Err(Error::Config(format!(
                "unsupported cql protocol version {}",
                self.cql_protocol_version
            )));
        }
        if self.auth && self.username.is_empty() {
            return Err(Error::Config("auth enabled but no username given".into()));
        }
        if self.ssl && self.ca_path.is_none() {
            return Err(Error::Config("ssl enabled but no ca_path given".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn omit_read_timeout(&self) -> Duration {
        Duration::from_secs(self.omit_read_timeout_secs)
    }
}

/// Retention and in-memory ring configuration for one retention class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Seconds persisted chunks live in the store
    pub ttl: u32,
    /// Chunk width in seconds; must be a registered span
    pub chunk_span: u32,
    /// Ring capacity: how many recent chunks stay in memory per metric
    pub num_chunks: usize,
    /// Seconds without appends before the reaper seals an open chunk
    pub chunk_max_stale: u32,
    /// Seconds without appends before a metric is dropped from memory
    pub metric_max_stale: u32,
    /// Seconds between reaper runs
    pub gc_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ttl: 60 * 60 * 24 * 35,
            chunk_span: 600,
            num_chunks: 5,
            chunk_max_stale: 3600,
            metric_max_stale: 21600,
            gc_interval_secs: 3600,
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<()> {
        if !span_is_registered(self.chunk_span) {
            return Err(Error::Config(format!(
                "chunk_span {} is not a registered span",
                self.chunk_span
            )));
        }
        debug_assert_eq!(MONTH_SEC % self.chunk_span, 0);
        if self.num_chunks == 0 {
            return Err(Error::Config("num_chunks must be at least 1".into()));
        }
        if self.ttl == 0 {
            return Err(Error::Config("ttl must be at least 1 second".into()));
        }
        if self.gc_interval_secs == 0 {
            return Err(Error::Config("gc_interval must be at least 1 second".into()));
        }
        if self.chunk_max_stale >= self.metric_max_stale {
            return Err(Error::Config(
                "metric_max_stale must exceed chunk_max_stale".into(),
            ));
        }
        Ok(())
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

const DEFAULT_SCHEMA_KEYSPACE: &str = "CREATE KEYSPACE IF NOT EXISTS {keyspace} \
    WITH replication = {'class': 'SimpleStrategy', 'replication_factor': 1} \
    AND durable_writes = true";

const DEFAULT_SCHEMA_TABLE: &str = "CREATE TABLE IF NOT EXISTS {keyspace}.{table} (\
    key ascii, \
    ts int, \
    data blob, \
    PRIMARY KEY (key, ts)\
) WITH COMPACT STORAGE \
    AND CLUSTERING ORDER BY (ts DESC) \
    AND compaction = {'class': 'org.apache.cassandra.db.compaction.DateTieredCompactionStrategy', \
        'timestamp_resolution': 'SECONDS', \
        'max_window_size_seconds': {window_secs}} \
    AND compression = {'sstable_compression': 'org.apache.cassandra.io.compress.LZ4Compressor'} \
    AND read_repair_chance = 0.0 \
    AND dclocal_read_repair_chance = 0";

/// CQL templates used to create (or describe) the keyspace and the per-TTL
/// tables. Placeholders: `{keyspace}`, `{table}`, `{window}` (hours),
/// `{window_secs}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaTemplates {
    pub schema_keyspace: String,
    pub schema_table: String,
}

impl Default for SchemaTemplates {
    fn default() -> Self {
        Self {
            schema_keyspace: DEFAULT_SCHEMA_KEYSPACE.to_owned(),
            schema_table: DEFAULT_SCHEMA_TABLE.to_owned(),
        }
    }
}

impl SchemaTemplates {
    /// Loads templates from a JSON file with `schema_keyspace` and
    /// `schema_table` keys.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read schema file {path:?}: {e}")))?;
        let templates: SchemaTemplates = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse schema file {path:?}: {e}")))?;
        templates.validate()?;
        Ok(templates)
    }

    /// Loads from `schema_file` when set, built-in templates otherwise.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match &config.schema_file {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.schema_keyspace.contains("{keyspace}") {
            return Err(Error::Config(
                "schema_keyspace template is missing the {keyspace} placeholder".into(),
            ));
        }
        if !self.schema_table.contains("{table}") {
            return Err(Error::Config(
                "schema_table template is missing the {table} placeholder".into(),
            ));
        }
        Ok(())
    }

    pub fn render_keyspace(&self, keyspace: &str) -> String {
        self.schema_keyspace.replace("{keyspace}", keyspace)
    }

    pub fn render_table(&self, keyspace: &str, table: &str, window_hours: u32) -> String {
        self.schema_table
            .replace("{keyspace}", keyspace)
            .replace("{table}", table)
            .replace("{window}", &window_hours.to_string())
            .replace("{window_secs}", &(window_hours * 3600).to_string())
    }
}

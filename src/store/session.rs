//! CQL session seam
//!
//! The store talks to its backend through [`ChunkSession`], so the
//! production Cassandra/Scylla session and the in-memory development
//! session are interchangeable. [`CqlChunkSession`] owns cluster
//! connection, schema bootstrap, and statement execution.

use crate::config::{HostSelectionPolicy, SchemaTemplates, StoreConfig};
use crate::store::ttl::TtlTables;
use crate::{Error, Result};
use async_trait::async_trait;
use scylla::load_balancing::{DefaultPolicy, LatencyAwarenessBuilder, LoadBalancingPolicy};
use scylla::statement::Consistency;
use scylla::transport::ExecutionProfile;
use scylla::{Session, SessionBuilder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One stored chunk row: the chunk's `t0` and its framed bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRow {
    pub ts: u32,
    pub data: Vec<u8>,
}

/// Backend session the store's workers execute against. Implementations
/// must be safe for concurrent use from many workers.
#[async_trait]
pub trait ChunkSession: Send + Sync {
    /// Inserts one framed chunk under `row_key` with the given TTL.
    async fn insert_chunk(
        &self,
        table: &str,
        ttl: u32,
        row_key: &str,
        t0: u32,
        data: &[u8],
    ) -> Result<()>;

    /// Returns all rows in `row_keys` with `ts < end`, in backend order.
    async fn select_chunks(&self, table: &str, row_keys: &[String], end: u32)
        -> Result<Vec<ChunkRow>>;
}

/// Cassandra-backed session.
pub struct CqlChunkSession {
    session: Session,
}

impl CqlChunkSession {
    /// Connects to the cluster, ensures (or verifies) the keyspace and the
    /// per-TTL tables, and switches into the keyspace.
    pub async fn connect(config: &StoreConfig, tables: &TtlTables) -> Result<Self> {
        config.validate()?;
        let templates = SchemaTemplates::from_config(config)?;

        let profile = ExecutionProfile::builder()
            .consistency(parse_consistency(&config.consistency)?)
            .request_timeout(Some(config.timeout()))
            .load_balancing_policy(build_policy(config.host_selection_policy))
            .build();

        let mut builder = SessionBuilder::new()
            .known_nodes(&config.addrs)
            .connection_timeout(config.timeout())
            .default_execution_profile_handle(profile.into_handle());

        if config.auth {
            builder = builder.user(&config.username, &config.password);
        }
        builder = configure_tls(builder, config)?;

        let session = builder
            .build()
            .await
            .map_err(|e| Error::Storage(format!("failed to create session: {e}")))?;

        ensure_schema(&session, config, tables, &templates).await?;

        session
            .use_keyspace(&config.keyspace, false)
            .await
            .map_err(|e| Error::Storage(format!("cannot use keyspace {}: {e}", config.keyspace)))?;

        info!(keyspace = %config.keyspace, "cassandra session ready");
        Ok(Self { session })
    }
}

#[async_trait]
impl ChunkSession for CqlChunkSession {
    async fn insert_chunk(
        &self,
        table: &str,
        ttl: u32,
        row_key: &str,
        t0: u32,
        data: &[u8],
    ) -> Result<()> {
        let cql = format!("INSERT INTO {table} (key, ts, data) VALUES (?, ?, ?) USING TTL {ttl}");
        self.session
            .query_unpaged(cql, (row_key, t0 as i32, data.to_vec()))
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    async fn select_chunks(
        &self,
        table: &str,
        row_keys: &[String],
        end: u32,
    ) -> Result<Vec<ChunkRow>> {
        // paging with both an IN restriction and the DESC clustering order
        // is not supported server-side; fetch and let the caller sort
        let cql = format!("SELECT ts, data FROM {table} WHERE key IN ? AND ts < ?");
        let result = self
            .session
            .query_unpaged(cql, (row_keys.to_vec(), end as i32))
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let rows_result = result
            .into_rows_result()
            .map_err(|e| Error::Storage(e.to_string()))?;

        let mut rows = Vec::new();
        for row in rows_result
            .rows::<(i32, Vec<u8>)>()
            .map_err(|e| Error::Storage(e.to_string()))?
        {
            let (ts, data) = row.map_err(|e| Error::Storage(e.to_string()))?;
            rows.push(ChunkRow {
                ts: ts as u32,
                data,
            });
        }
        Ok(rows)
    }
}

fn parse_consistency(name: &str) -> Result<Consistency> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "any" => Consistency::Any,
        "one" => Consistency::One,
        "two" => Consistency::Two,
        "three" => Consistency::Three,
        "quorum" => Consistency::Quorum,
        "all" => Consistency::All,
        "local_quorum" => Consistency::LocalQuorum,
        "each_quorum" => Consistency::EachQuorum,
        "local_one" => Consistency::LocalOne,
        other => {
            return Err(Error::Config(format!(
                "unknown consistency level '{other}'"
            )))
        }
    })
}

/// Maps the configured host selection policy onto the driver's policy
/// builder. The hostpool variants ask for per-host performance tracking,
/// which the driver expresses as latency awareness.
fn build_policy(policy: HostSelectionPolicy) -> Arc<dyn LoadBalancingPolicy> {
    let mut builder = DefaultPolicy::builder().permit_dc_failover(true);
    builder = match policy {
        HostSelectionPolicy::RoundRobin | HostSelectionPolicy::HostPoolSimple => {
            builder.token_aware(false)
        }
        HostSelectionPolicy::HostPoolEpsilonGreedy => builder
            .token_aware(false)
            .latency_awareness(LatencyAwarenessBuilder::default()),
        HostSelectionPolicy::TokenAwareRoundRobin
        | HostSelectionPolicy::TokenAwareHostPoolSimple => builder.token_aware(true),
        HostSelectionPolicy::TokenAwareHostPoolEpsilonGreedy => builder
            .token_aware(true)
            .latency_awareness(LatencyAwarenessBuilder::default()),
    };
    builder.build()
}

#[cfg(feature = "ssl")]
fn configure_tls(builder: SessionBuilder, config: &StoreConfig) -> Result<SessionBuilder> {
    use openssl::ssl::{SslContextBuilder, SslMethod, SslVerifyMode};

    if !config.ssl {
        return Ok(builder);
    }
    let ca_path = config
        .ca_path
        .as_ref()
        .ok_or_else(|| Error::Config("ssl enabled but no ca_path given".into()))?;
    let mut ctx = SslContextBuilder::new(SslMethod::tls())
        .map_err(|e| Error::Config(format!("cannot initialize tls: {e}")))?;
    ctx.set_ca_file(ca_path)
        .map_err(|e| Error::Config(format!("cannot load ca file {ca_path:?}: {e}")))?;
    ctx.set_verify(if config.host_verification {
        SslVerifyMode::PEER
    } else {
        SslVerifyMode::NONE
    });
    Ok(builder.ssl_context(Some(ctx.build())))
}

#[cfg(not(feature = "ssl"))]
fn configure_tls(builder: SessionBuilder, config: &StoreConfig) -> Result<SessionBuilder> {
    if config.ssl {
        return Err(Error::Config(
            "ssl requested but this build carries no tls support (enable the `ssl` feature)".into(),
        ));
    }
    Ok(builder)
}

async fn ensure_schema(
    session: &Session,
    config: &StoreConfig,
    tables: &TtlTables,
    templates: &SchemaTemplates,
) -> Result<()> {
    if config.create_keyspace {
        info!(keyspace = %config.keyspace, "ensuring keyspace exists");
        session
            .query_unpaged(templates.render_keyspace(&config.keyspace), ())
            .await
            .map_err(|e| Error::Storage(format!("keyspace creation failed: {e}")))?;

        for table in tables.values() {
            info!(table = %table.name, window = table.window_size, "ensuring table exists");
            session
                .query_unpaged(
                    templates.render_table(&config.keyspace, &table.name, table.window_size),
                    (),
                )
                .await
                .map_err(|e| Error::Storage(format!("creation of {} failed: {e}", table.name)))?;
        }
        return Ok(());
    }

    // verification-only mode: poll for the keyspace and every table before
    // giving up on startup
    const ATTEMPTS: u32 = 5;
    for attempt in 1..=ATTEMPTS {
        session
            .refresh_metadata()
            .await
            .map_err(|e| Error::Storage(format!("metadata refresh failed: {e}")))?;
        let cluster = session.get_cluster_data();

        let missing = match cluster.get_keyspace_info().get(&config.keyspace) {
            None => Some(config.keyspace.clone()),
            Some(keyspace) => tables
                .values()
                .find(|t| !keyspace.tables.contains_key(&t.name))
                .map(|t| t.name.clone()),
        };

        match missing {
            None => return Ok(()),
            Some(name) => {
                warn!(missing = %name, attempt, "schema not present yet");
                if attempt == ATTEMPTS {
                    return Err(Error::Storage(format!(
                        "keyspace or table {name} not found after {ATTEMPTS} attempts"
                    )));
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
    unreachable!("poll loop returns on its last attempt")
}

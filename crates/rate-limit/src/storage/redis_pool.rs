//! Pooled multiplexed Redis connections.

use std::sync::atomic::{AtomicUsize, Ordering};

use deadpool::managed::{self, Metrics};
use redis::{Client, RedisError, RedisResult, aio::MultiplexedConnection};

use config::{RedisConfig, RedisTlsConfig};

/// Redis connection pool.
pub(super) type Pool = deadpool::managed::Pool<Manager>;

/// Creates and health-checks multiplexed connections for the pool.
#[derive(Debug)]
pub(super) struct Manager {
    client: Client,
    ping_number: AtomicUsize,
}

impl Manager {
    fn new(config: &RedisConfig) -> RedisResult<Self> {
        let tls = config.tls.as_ref().filter(|tls| tls.enabled);

        let client = match tls {
            Some(tls) => Client::build_with_tls(config.url.as_str(), build_tls_certificates(tls)?)?,
            None => Client::open(config.url.as_str())?,
        };

        Ok(Self {
            client,
            ping_number: AtomicUsize::new(0),
        })
    }
}

impl managed::Manager for Manager {
    type Type = MultiplexedConnection;
    type Error = RedisError;

    async fn create(&self) -> Result<MultiplexedConnection, Self::Error> {
        self.client.get_multiplexed_async_connection().await
    }

    async fn recycle(&self, conn: &mut MultiplexedConnection, _: &Metrics) -> managed::RecycleResult<Self::Error> {
        let ping_number = self.ping_number.fetch_add(1, Ordering::Relaxed).to_string();

        let (n,) = redis::Pipeline::with_capacity(2)
            .cmd("UNWATCH")
            .ignore()
            .cmd("PING")
            .arg(&ping_number)
            .query_async::<(String,)>(conn)
            .await?;

        if n == ping_number {
            Ok(())
        } else {
            Err(managed::RecycleError::message("Invalid PING response"))
        }
    }
}

fn read_file(path: &str, what: &'static str) -> RedisResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| RedisError::from((redis::ErrorKind::IoError, what, format!("{path}: {e}"))))
}

/// Loads the certificates referenced by the TLS configuration.
fn build_tls_certificates(config: &RedisTlsConfig) -> RedisResult<redis::TlsCertificates> {
    let client_tls = match (&config.client_cert_path, &config.client_key_path) {
        (Some(cert_path), Some(key_path)) => Some(redis::ClientTlsConfig {
            client_cert: read_file(cert_path, "Failed to read client certificate")?,
            client_key: read_file(key_path, "Failed to read client key")?,
        }),
        _ => None,
    };

    let root_cert = match &config.ca_cert_path {
        Some(ca_path) => Some(read_file(ca_path, "Failed to read CA certificate")?),
        None => None,
    };

    if config.insecure.unwrap_or(false) && root_cert.is_none() {
        log::warn!("Redis TLS is marked insecure but no CA certificate is configured, using system roots");
    }

    Ok(redis::TlsCertificates { client_tls, root_cert })
}

/// Create a Redis connection pool from configuration.
pub(super) fn create_pool(config: &RedisConfig) -> RedisResult<Pool> {
    let manager = Manager::new(config)?;

    let mut pool_config = deadpool::managed::PoolConfig::default();

    if let Some(max_size) = config.pool.max_size {
        pool_config.max_size = max_size;
    }

    if let Some(timeout_create) = config.pool.timeout_create {
        pool_config.timeouts.create = Some(timeout_create);
    }

    if let Some(timeout_wait) = config.pool.timeout_wait {
        pool_config.timeouts.wait = Some(timeout_wait);
    }

    if let Some(timeout_recycle) = config.pool.timeout_recycle {
        pool_config.timeouts.recycle = Some(timeout_recycle);
    }

    Pool::builder(manager)
        .config(pool_config)
        .runtime(deadpool::Runtime::Tokio1)
        .build()
        .map_err(|e| RedisError::from((redis::ErrorKind::IoError, "Failed to create pool", e.to_string())))
}

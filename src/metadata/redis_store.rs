//! Redis-backed hash store.

use std::collections::BTreeMap;

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::debug;

use super::{HashStore, MetadataError, StoreFuture};

/// Port used when the configuration does not name one.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Hash store kept in a Redis hash.
///
/// The multiplexed connection is cheap to clone, so every operation works on
/// its own handle.
#[derive(Clone)]
pub struct RedisHashStore {
    connection: MultiplexedConnection,
}

impl RedisHashStore {
    /// Connects to `redis://<host>:<port>/<database>`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Unavailable`] when the server cannot be
    /// reached.
    pub async fn connect(host: &str, port: u16, database: u16) -> Result<Self, MetadataError> {
        let url = format!("redis://{host}:{port}/{database}");
        debug!(%url, "connecting to metadata store");
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { connection })
    }
}

impl std::fmt::Debug for RedisHashStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisHashStore").finish_non_exhaustive()
    }
}

impl From<redis::RedisError> for MetadataError {
    fn from(value: redis::RedisError) -> Self {
        Self::Unavailable {
            message: value.to_string(),
        }
    }
}

impl HashStore for RedisHashStore {
    fn entries<'a>(&'a self, container: &'a str) -> StoreFuture<'a, Vec<(String, String)>> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            let fields: BTreeMap<String, String> = connection.hgetall(container).await?;
            Ok(fields.into_iter().collect())
        })
    }

    fn get<'a>(&'a self, container: &'a str, field: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            let value: Option<String> = connection.hget(container, field).await?;
            Ok(value)
        })
    }

    fn set<'a>(
        &'a self,
        container: &'a str,
        field: &'a str,
        value: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            connection
                .hset::<_, _, _, ()>(container, field, value)
                .await?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, container: &'a str, field: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            let removed: i64 = connection.hdel(container, field).await?;
            Ok(removed > 0)
        })
    }
}

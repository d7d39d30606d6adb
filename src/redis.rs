use crate::datastore::{full_key, Datastore};
use crate::error::{LimiterError, LimiterResult};
use parking_lot::Mutex;
use redis::{Client, Connection, RedisResult};
use std::time::Duration;
use tracing::debug;

/// Datastore backed by plain Redis counters, one `INCRBY` key per window.
pub struct RedisDatastore {
    client: Client,
    connection: Mutex<Option<Connection>>,
    ttl: Duration,
}

impl RedisDatastore {
    /// `ttl` bounds how long a window's counter outlives it; twice the
    /// window size is enough.
    pub fn new(redis_url: &str, ttl: Duration) -> LimiterResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| LimiterError::Redis(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Runs `f` on the cached connection, connecting first if needed.
    ///
    /// The connection is dropped after a failed command so the next call
    /// starts from a fresh one.
    fn with_connection<T, F>(&self, f: F) -> LimiterResult<T>
    where
        F: FnOnce(&mut Connection) -> RedisResult<T>,
    {
        let mut connection_guard = self.connection.lock();

        if connection_guard.is_none() {
            let conn = self
                .client
                .get_connection()
                .map_err(|e| LimiterError::Redis(format!("Failed to connect to Redis: {}", e)))?;
            *connection_guard = Some(conn);
        }

        let Some(conn) = connection_guard.as_mut() else {
            return Err(LimiterError::Redis("No Redis connection available".into()));
        };

        match f(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!(error = %e, "dropping Redis connection after failed command");
                *connection_guard = None;
                Err(e.into())
            }
        }
    }
}

impl Datastore for RedisDatastore {
    fn add(&self, key: &str, start: i64, delta: i64) -> LimiterResult<i64> {
        let k = full_key(key, start);
        let ttl_ms = self.ttl.as_millis().max(1) as u64;

        self.with_connection(|conn| {
            let count: i64 = redis::cmd("INCRBY").arg(&k).arg(delta).query(conn)?;

            // Expiry is best effort; the counter is already updated.
            let _: RedisResult<i64> = redis::cmd("PEXPIRE").arg(&k).arg(ttl_ms).query(conn);

            Ok(count)
        })
    }

    fn get(&self, key: &str, start: i64) -> LimiterResult<i64> {
        let k = full_key(key, start);

        self.with_connection(|conn| {
            let count: Option<i64> = redis::cmd("GET").arg(&k).query(conn)?;
            Ok(count.unwrap_or(0))
        })
    }

    fn ping(&self) -> LimiterResult<()> {
        self.with_connection(|conn| redis::cmd("PING").query::<String>(conn))
            .map(|_| ())
    }
}

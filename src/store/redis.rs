//! Redis/valkey [`RemoteStore`] driver.
//!
//! Uses one synchronous connection guarded by a mutex and reopened after a
//! failure. Compound operations run as Lua scripts so they stay atomic on
//! the server. Per-field TTL uses `HPEXPIRE` (Redis 7.4+ / valkey 9+), probed
//! once at connect time.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use redis::{Client, Connection, Script};
use tracing::{debug, warn};

use super::{redact_url, ExpiryHook, RemoteStore, SubscriptionId};
use crate::constants::store_keys;
use crate::error::{CacheError, CacheResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const PUT_SCRIPT: &str = r#"
local old = redis.call('HGET', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
if ARGV[3] ~= '' then
  redis.call('HPEXPIRE', KEYS[1], ARGV[3], 'FIELDS', 1, ARGV[1])
end
return old
"#;

const PUT_IF_ABSENT_SCRIPT: &str = r#"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 1 then
  if ARGV[3] ~= '' then
    redis.call('HPEXPIRE', KEYS[1], ARGV[3], 'FIELDS', 1, ARGV[1])
  end
  return false
end
return redis.call('HGET', KEYS[1], ARGV[1])
"#;

const REMOVE_SCRIPT: &str = r#"
local old = redis.call('HGET', KEYS[1], ARGV[1])
if old then
  redis.call('HDEL', KEYS[1], ARGV[1])
end
return old
"#;

const REMOVE_IF_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
  return redis.call('HDEL', KEYS[1], ARGV[1])
end
return 0
"#;

const REPLACE_IF_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
  redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
  return 1
end
return 0
"#;

const LOCK_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 or redis.call('HEXISTS', KEYS[1], ARGV[2]) == 1 then
  redis.call('HINCRBY', KEYS[1], ARGV[2], 1)
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  return 1
end
return 0
"#;

const UNLOCK_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
  return 0
end
if redis.call('HINCRBY', KEYS[1], ARGV[1], -1) <= 0 then
  redis.call('DEL', KEYS[1])
end
return 1
"#;

const EXTEND_LOCK_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[2]) == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  return 1
end
return 0
"#;

const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1]) or '0'
if current == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

struct Scripts {
    put: Script,
    put_if_absent: Script,
    remove: Script,
    remove_if: Script,
    replace_if: Script,
    lock: Script,
    unlock: Script,
    extend_lock: Script,
    compare_and_set: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            put: Script::new(PUT_SCRIPT),
            put_if_absent: Script::new(PUT_IF_ABSENT_SCRIPT),
            remove: Script::new(REMOVE_SCRIPT),
            remove_if: Script::new(REMOVE_IF_SCRIPT),
            replace_if: Script::new(REPLACE_IF_SCRIPT),
            lock: Script::new(LOCK_SCRIPT),
            unlock: Script::new(UNLOCK_SCRIPT),
            extend_lock: Script::new(EXTEND_LOCK_SCRIPT),
            compare_and_set: Script::new(COMPARE_AND_SET_SCRIPT),
        }
    }
}

/// Redis-backed shared store
pub struct RedisStore {
    client: Client,
    connection: Mutex<Option<Connection>>,
    scripts: Scripts,
    url: String,
    field_expiration: bool,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.url)
            .field("field_expiration", &self.field_expiration)
            .finish()
    }
}

fn unavailable(operation: &str, error: redis::RedisError) -> CacheError {
    CacheError::backend_unavailable(format!("Redis {operation} failed: {error}"))
}

fn ttl_arg(ttl: Option<Duration>) -> String {
    ttl.map(|d| d.as_millis().max(1).to_string())
        .unwrap_or_default()
}

fn map_key(map: &str) -> String {
    format!("{}{}", store_keys::MAP_PREFIX, map)
}

impl RedisStore {
    /// Connect and probe server capabilities
    pub fn connect(url: &str) -> CacheResult<Self> {
        let redacted = redact_url(url);
        let client = Client::open(url).map_err(|e| {
            CacheError::configuration(format!("Invalid redis url '{redacted}': {e}"))
        })?;

        let mut connection = client
            .get_connection_with_timeout(CONNECT_TIMEOUT)
            .map_err(|e| unavailable("connect", e))?;
        let field_expiration = probe_field_expiration(&mut connection)?;

        debug!(
            url = %redacted,
            field_expiration = field_expiration,
            "Redis store connected"
        );

        Ok(Self {
            client,
            connection: Mutex::new(Some(connection)),
            scripts: Scripts::new(),
            url: redacted,
            field_expiration,
        })
    }

    /// Run `op` on the shared connection, reconnecting first if a previous
    /// call broke it
    fn with_connection<T>(
        &self,
        operation: &str,
        op: impl FnOnce(&mut Connection) -> redis::RedisResult<T>,
    ) -> CacheResult<T> {
        let mut slot = self.connection.lock();
        if slot.is_none() {
            let fresh = self
                .client
                .get_connection_with_timeout(CONNECT_TIMEOUT)
                .map_err(|e| unavailable("reconnect", e))?;
            *slot = Some(fresh);
        }
        let Some(connection) = slot.as_mut() else {
            return Err(CacheError::backend_unavailable("Redis connection missing"));
        };

        match op(connection) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() || e.is_timeout() {
                    warn!(url = %self.url, error = %e, "Dropping broken redis connection");
                    *slot = None;
                }
                Err(unavailable(operation, e))
            }
        }
    }
}

fn probe_field_expiration(connection: &mut Connection) -> CacheResult<bool> {
    let info: Vec<redis::Value> = redis::cmd("COMMAND")
        .arg("INFO")
        .arg("HPEXPIRE")
        .query(connection)
        .map_err(|e| unavailable("COMMAND INFO", e))?;
    Ok(matches!(info.first(), Some(entry) if *entry != redis::Value::Nil))
}

impl RemoteStore for RedisStore {
    fn driver_name(&self) -> &'static str {
        "redis"
    }

    fn ping(&self) -> CacheResult<()> {
        let pong: String = self.with_connection("PING", |c| redis::cmd("PING").query(c))?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(CacheError::backend_unavailable(format!(
                "Unexpected PING reply '{pong}'"
            )))
        }
    }

    fn supports_field_expiration(&self) -> bool {
        self.field_expiration
    }

    fn supports_expiry_notifications(&self) -> bool {
        false
    }

    fn map_get(&self, map: &str, field: &str) -> CacheResult<Option<String>> {
        self.with_connection("HGET", |c| {
            redis::cmd("HGET").arg(map_key(map)).arg(field).query(c)
        })
    }

    fn map_put(
        &self,
        map: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<Option<String>> {
        self.with_connection("HSET", |c| {
            self.scripts
                .put
                .key(map_key(map))
                .arg(field)
                .arg(value)
                .arg(ttl_arg(ttl))
                .invoke(c)
        })
    }

    fn map_put_if_absent(
        &self,
        map: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<Option<String>> {
        self.with_connection("HSETNX", |c| {
            self.scripts
                .put_if_absent
                .key(map_key(map))
                .arg(field)
                .arg(value)
                .arg(ttl_arg(ttl))
                .invoke(c)
        })
    }

    fn map_remove(&self, map: &str, field: &str) -> CacheResult<Option<String>> {
        self.with_connection("HDEL", |c| {
            self.scripts.remove.key(map_key(map)).arg(field).invoke(c)
        })
    }

    fn map_remove_if(&self, map: &str, field: &str, expected: &str) -> CacheResult<bool> {
        let removed: i64 = self.with_connection("HDEL", |c| {
            self.scripts
                .remove_if
                .key(map_key(map))
                .arg(field)
                .arg(expected)
                .invoke(c)
        })?;
        Ok(removed > 0)
    }

    fn map_replace_if(
        &self,
        map: &str,
        field: &str,
        expected: &str,
        value: &str,
    ) -> CacheResult<bool> {
        let replaced: i64 = self.with_connection("HSET", |c| {
            self.scripts
                .replace_if
                .key(map_key(map))
                .arg(field)
                .arg(expected)
                .arg(value)
                .invoke(c)
        })?;
        Ok(replaced > 0)
    }

    fn map_entries(&self, map: &str) -> CacheResult<Vec<(String, String)>> {
        let entries: HashMap<String, String> = self.with_connection("HGETALL", |c| {
            redis::cmd("HGETALL").arg(map_key(map)).query(c)
        })?;
        Ok(entries.into_iter().collect())
    }

    fn map_len(&self, map: &str) -> CacheResult<u64> {
        self.with_connection("HLEN", |c| redis::cmd("HLEN").arg(map_key(map)).query(c))
    }

    fn subscribe_expired(&self, map: &str, _hook: ExpiryHook) -> Option<SubscriptionId> {
        debug!(map = %map, "Redis driver cannot observe field expirations");
        None
    }

    fn unsubscribe(&self, _id: SubscriptionId) {}

    fn purge_expired(&self) -> CacheResult<u64> {
        // The server reaps expired fields itself
        Ok(0)
    }

    fn try_lock(&self, name: &str, owner: &str, lease: Duration) -> CacheResult<bool> {
        let acquired: i64 = self.with_connection("lock", |c| {
            self.scripts
                .lock
                .key(name)
                .arg(lease.as_millis().max(1).to_string())
                .arg(owner)
                .invoke(c)
        })?;
        Ok(acquired == 1)
    }

    fn unlock(&self, name: &str, owner: &str) -> CacheResult<bool> {
        let released: i64 = self.with_connection("unlock", |c| {
            self.scripts.unlock.key(name).arg(owner).invoke(c)
        })?;
        Ok(released == 1)
    }

    fn extend_lock(&self, name: &str, owner: &str, lease: Duration) -> CacheResult<bool> {
        let extended: i64 = self.with_connection("extend lock", |c| {
            self.scripts
                .extend_lock
                .key(name)
                .arg(lease.as_millis().max(1).to_string())
                .arg(owner)
                .invoke(c)
        })?;
        Ok(extended == 1)
    }

    fn counter_get(&self, name: &str) -> CacheResult<i64> {
        let value: Option<i64> =
            self.with_connection("GET", |c| redis::cmd("GET").arg(name).query(c))?;
        Ok(value.unwrap_or(0))
    }

    fn counter_set(&self, name: &str, value: i64) -> CacheResult<()> {
        self.with_connection("SET", |c| redis::cmd("SET").arg(name).arg(value).query(c))
    }

    fn counter_add(&self, name: &str, delta: i64) -> CacheResult<i64> {
        self.with_connection("INCRBY", |c| {
            redis::cmd("INCRBY").arg(name).arg(delta).query(c)
        })
        .map_err(|e| match e {
            CacheError::BackendUnavailable(msg) if msg.contains("overflow") => {
                CacheError::counter_overflow(name, delta)
            }
            other => other,
        })
    }

    fn counter_get_and_set(&self, name: &str, value: i64) -> CacheResult<i64> {
        let previous: Option<i64> = self.with_connection("GETSET", |c| {
            redis::cmd("GETSET").arg(name).arg(value).query(c)
        })?;
        Ok(previous.unwrap_or(0))
    }

    fn counter_compare_and_set(&self, name: &str, expect: i64, update: i64) -> CacheResult<bool> {
        let swapped: i64 = self.with_connection("compare-and-set", |c| {
            self.scripts
                .compare_and_set
                .key(name)
                .arg(expect.to_string())
                .arg(update.to_string())
                .invoke(c)
        })?;
        Ok(swapped == 1)
    }
}

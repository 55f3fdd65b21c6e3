//! A thin client for the coordination service, exposing only the list and
//! keyed-lock operations the queue and lease registry need. A mock backed
//! by process memory is provided for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

use crate::lease::LeaseOutcome;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("connection failed with: {0}")]
    ConnectionError(redis::RedisError),
    #[error("{command} command failed with: {error}")]
    CommandError {
        command: String,
        error: redis::RedisError,
    },
}

pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

fn command_error(command: &str) -> impl FnOnce(redis::RedisError) -> CoordinationError + '_ {
    move |error| CoordinationError::CommandError {
        command: command.to_owned(),
        error,
    }
}

/// The coordination operations used by the work queue and lease registry.
///
/// The compare-and-* operations MUST be atomic on the server: a lease may
/// only be extended or deleted by its owner, and checking ownership
/// client-side before mutating would reintroduce the race the lease
/// exists to prevent.
#[async_trait]
pub trait Client: Send + Sync {
    async fn push_front(&self, list: &str, value: &str) -> CoordinationResult<()>;

    /// Pop from the tail of `list`, blocking up to `timeout`. `None` on timeout.
    async fn blocking_pop_back(
        &self,
        list: &str,
        timeout: Duration,
    ) -> CoordinationResult<Option<String>>;

    async fn list_length(&self, list: &str) -> CoordinationResult<u64>;

    async fn list_contents(&self, list: &str) -> CoordinationResult<Vec<String>>;

    /// Set `key` to `value` with expiry `ttl` iff the key does not exist.
    /// Returns whether the key was set.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> CoordinationResult<bool>;

    async fn key_exists(&self, key: &str) -> CoordinationResult<bool>;

    /// Refresh the expiry of `key` to `ttl` iff its value equals `expected`.
    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> CoordinationResult<LeaseOutcome>;

    /// Delete `key` iff its value equals `expected`.
    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> CoordinationResult<LeaseOutcome>;
}

const COMPARE_AND_EXTEND_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
  return -1
end
if current ~= ARGV[1] then
  return 0
end
redis.call('EXPIRE', KEYS[1], ARGV[2])
return 1
"#;

const COMPARE_AND_DELETE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
  return -1
end
if current ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

fn script_outcome(code: i64) -> LeaseOutcome {
    match code {
        -1 => LeaseOutcome::NotFound,
        0 => LeaseOutcome::NotOwner,
        _ => LeaseOutcome::Ok,
    }
}

pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub fn new(addr: &str) -> CoordinationResult<RedisClient> {
        let client = redis::Client::open(addr).map_err(CoordinationError::ConnectionError)?;

        Ok(RedisClient { client })
    }

    async fn connection(&self) -> CoordinationResult<redis::aio::Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(CoordinationError::ConnectionError)
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn push_front(&self, list: &str, value: &str) -> CoordinationResult<()> {
        let mut conn = self.connection().await?;
        conn.lpush(list, value)
            .await
            .map_err(command_error("LPUSH"))
    }

    async fn blocking_pop_back(
        &self,
        list: &str,
        timeout: Duration,
    ) -> CoordinationResult<Option<String>> {
        let mut conn = self.connection().await?;
        // BRPOP's timeout resolution is one second; zero means block forever.
        let timeout_secs = timeout.as_secs().max(1) as f64;
        let popped: Option<(String, String)> = conn
            .brpop(list, timeout_secs)
            .await
            .map_err(command_error("BRPOP"))?;

        Ok(popped.map(|(_, value)| value))
    }

    async fn list_length(&self, list: &str) -> CoordinationResult<u64> {
        let mut conn = self.connection().await?;
        conn.llen(list).await.map_err(command_error("LLEN"))
    }

    async fn list_contents(&self, list: &str) -> CoordinationResult<Vec<String>> {
        let mut conn = self.connection().await?;
        conn.lrange(list, 0, -1)
            .await
            .map_err(command_error("LRANGE"))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> CoordinationResult<bool> {
        let mut conn = self.connection().await?;
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(command_error("SET NX EX"))?;

        Ok(set.is_some())
    }

    async fn key_exists(&self, key: &str) -> CoordinationResult<bool> {
        let mut conn = self.connection().await?;
        conn.exists(key).await.map_err(command_error("EXISTS"))
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> CoordinationResult<LeaseOutcome> {
        let mut conn = self.connection().await?;
        let code: i64 = redis::Script::new(COMPARE_AND_EXTEND_SCRIPT)
            .key(key)
            .arg(expected)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(command_error("EVALSHA compare-and-extend"))?;

        Ok(script_outcome(code))
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> CoordinationResult<LeaseOutcome> {
        let mut conn = self.connection().await?;
        let code: i64 = redis::Script::new(COMPARE_AND_DELETE_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error("EVALSHA compare-and-delete"))?;

        Ok(script_outcome(code))
    }
}

#[derive(Default)]
struct MockState {
    lists: HashMap<String, VecDeque<String>>,
    keys: HashMap<String, (String, Option<Instant>)>,
}

impl MockState {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.keys
            .retain(|_, (_, expiry)| expiry.map_or(true, |at| at > now));
    }
}

/// In-memory stand-in for the coordination service. All operations take a
/// single process-wide lock, so the atomicity of the compare-and-*
/// operations matches the server-evaluated scripts they replace.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    state: Arc<Mutex<MockState>>,
}

impl MockRedisClient {
    pub fn new() -> MockRedisClient {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("poisoned MockRedisClient mutex")
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn push_front(&self, list: &str, value: &str) -> CoordinationResult<()> {
        self.lock()
            .lists
            .entry(list.to_owned())
            .or_default()
            .push_front(value.to_owned());
        Ok(())
    }

    async fn blocking_pop_back(
        &self,
        list: &str,
        timeout: Duration,
    ) -> CoordinationResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self
                .lock()
                .lists
                .get_mut(list)
                .and_then(|values| values.pop_back())
            {
                return Ok(Some(value));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn list_length(&self, list: &str) -> CoordinationResult<u64> {
        Ok(self.lock().lists.get(list).map_or(0, |v| v.len() as u64))
    }

    async fn list_contents(&self, list: &str) -> CoordinationResult<Vec<String>> {
        Ok(self
            .lock()
            .lists
            .get(list)
            .map(|values| values.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> CoordinationResult<bool> {
        let mut state = self.lock();
        state.purge_expired();
        if state.keys.contains_key(key) {
            return Ok(false);
        }
        state.keys.insert(
            key.to_owned(),
            (value.to_owned(), Some(Instant::now() + ttl)),
        );
        Ok(true)
    }

    async fn key_exists(&self, key: &str) -> CoordinationResult<bool> {
        let mut state = self.lock();
        state.purge_expired();
        Ok(state.keys.contains_key(key))
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> CoordinationResult<LeaseOutcome> {
        let mut state = self.lock();
        state.purge_expired();
        match state.keys.get_mut(key) {
            None => Ok(LeaseOutcome::NotFound),
            Some((value, _)) if value != expected => Ok(LeaseOutcome::NotOwner),
            Some((_, expiry)) => {
                *expiry = Some(Instant::now() + ttl);
                Ok(LeaseOutcome::Ok)
            }
        }
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> CoordinationResult<LeaseOutcome> {
        let mut state = self.lock();
        state.purge_expired();
        match state.keys.get(key) {
            None => Ok(LeaseOutcome::NotFound),
            Some((value, _)) if value != expected => Ok(LeaseOutcome::NotOwner),
            Some(_) => {
                state.keys.remove(key);
                Ok(LeaseOutcome::Ok)
            }
        }
    }
}

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex as StdMutex;

/// External append-only log plus the shared dedup set it backs.
///
/// Concrete implementations are a Redis-backed store (the expected production
/// substrate) and an in-memory store used by tests so the rest
/// of the pipeline never needs a live Redis instance to be exercised.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Appends `payload` to the stream at `stream_key`, trimming it to
    /// approximately `max_len_approx` entries. Returns the assigned LSN.
    async fn append(&self, stream_key: &str, payload: &str, max_len_approx: usize) -> Result<String>;

    async fn stream_len(&self, stream_key: &str) -> Result<u64>;

    /// Reads up to `count` of the most recent entries from `stream_key`, in
    /// insertion order, as `(lsn, payload)` pairs. Downstream consumers are
    /// expected to checkpoint by LSN and read forward from it themselves;
    /// this is the read-back surface the pipeline itself needs for tests and
    /// operational inspection.
    async fn read(&self, stream_key: &str, count: usize) -> Result<Vec<(String, String)>>;

    /// `true` if `url` is a member of the shared seen-set at `set_key`.
    async fn is_member(&self, set_key: &str, url: &str) -> Result<bool>;

    /// Adds `url` to the shared seen-set and its first-seen retention index.
    async fn mark_seen(&self, set_key: &str, index_key: &str, url: &str, first_seen_unix: i64) -> Result<()>;

    async fn seen_count(&self, set_key: &str) -> Result<u64>;

    /// Removes entries from the seen-set whose first-seen score is older than
    /// `older_than_unix`. Returns the number of entries evicted.
    async fn sweep_seen(&self, set_key: &str, index_key: &str, older_than_unix: i64) -> Result<u64>;

    /// Records `url` in the open-issues index at `index_key`, so the
    /// staleness checker can later sample it without re-deriving it from the
    /// discovery stream.
    async fn track_open_issue(&self, index_key: &str, url: &str, payload: &str) -> Result<()>;

    /// Removes `url` from the open-issues index, once it is known closed.
    async fn untrack_open_issue(&self, index_key: &str, url: &str) -> Result<()>;

    /// Reads a bounded, unordered batch of up to `count` entries from the
    /// open-issues index as `(url, payload)` pairs.
    async fn sample_open_issues(&self, index_key: &str, count: usize) -> Result<Vec<(String, String)>>;
}

/// Redis-backed [`DurableLog`].
///
/// Uses `XADD ... MAXLEN ~` for the stream (matching the source's
/// `pipe.xadd(..., maxlen=MAX_STREAM_LEN, approximate=True)`) and a plain set
/// plus a companion sorted set (scored by first-seen unix timestamp) for the
/// dedup index, mirroring the Redis patterns used throughout the pack's own
/// infrastructure crate (`redis::aio::ConnectionManager`, `redis::pipe()`).
pub struct RedisLog {
    conn: ConnectionManager,
}

impl RedisLog {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(PipelineError::from)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(PipelineError::from)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl DurableLog for RedisLog {
    async fn append(&self, stream_key: &str, payload: &str, max_len_approx: usize) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(max_len_approx)
            .arg("*")
            .arg("data")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(PipelineError::from)?;
        Ok(id)
    }

    async fn stream_len(&self, stream_key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(stream_key).await.map_err(PipelineError::from)?;
        Ok(len)
    }

    async fn read(&self, stream_key: &str, count: usize) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(stream_key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(PipelineError::from)?;
        let mut entries: Vec<(String, String)> = reply
            .ids
            .into_iter()
            .map(|id| {
                let payload = id
                    .map
                    .get("data")
                    .and_then(|v| redis::from_redis_value::<String>(v).ok())
                    .unwrap_or_default();
                (id.id, payload)
            })
            .collect();
        entries.reverse();
        Ok(entries)
    }

    async fn is_member(&self, set_key: &str, url: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let present: bool = conn.sismember(set_key, url).await.map_err(PipelineError::from)?;
        Ok(present)
    }

    async fn mark_seen(&self, set_key: &str, index_key: &str, url: &str, first_seen_unix: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.sadd(set_key, url).ignore();
        pipe.zadd(index_key, url, first_seen_unix).ignore();
        pipe.query_async::<()>(&mut conn).await.map_err(PipelineError::from)?;
        Ok(())
    }

    async fn seen_count(&self, set_key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let n: u64 = conn.scard(set_key).await.map_err(PipelineError::from)?;
        Ok(n)
    }

    async fn sweep_seen(&self, set_key: &str, index_key: &str, older_than_unix: i64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let stale: Vec<String> = conn
            .zrangebyscore(index_key, "-inf", older_than_unix)
            .await
            .map_err(PipelineError::from)?;
        if stale.is_empty() {
            return Ok(0);
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for url in &stale {
            pipe.srem(set_key, url).ignore();
        }
        pipe.zrembyscore(index_key, "-inf", older_than_unix).ignore();
        pipe.query_async::<()>(&mut conn).await.map_err(PipelineError::from)?;
        Ok(stale.len() as u64)
    }

    async fn track_open_issue(&self, index_key: &str, url: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(index_key, url, payload).await.map_err(PipelineError::from)?;
        Ok(())
    }

    async fn untrack_open_issue(&self, index_key: &str, url: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(index_key, url).await.map_err(PipelineError::from)?;
        Ok(())
    }

    async fn sample_open_issues(&self, index_key: &str, count: usize) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = redis::cmd("HRANDFIELD")
            .arg(index_key)
            .arg(count)
            .arg("WITHVALUES")
            .query_async(&mut conn)
            .await
            .map_err(PipelineError::from)?;
        Ok(flat.chunks(2).filter_map(|pair| match pair {
            [url, payload] => Some((url.clone(), payload.clone())),
            _ => None,
        }).collect())
    }
}

/// In-memory [`DurableLog`] used by tests and by `--dry-run` style exercises.
/// Not durable across restarts; exists purely so the pipeline's logic can be
/// exercised without a live Redis instance.
#[derive(Default)]
pub struct InMemoryLog {
    streams: StdMutex<std::collections::HashMap<String, VecDeque<(String, String)>>>,
    sets: StdMutex<std::collections::HashMap<String, HashSet<String>>>,
    index: StdMutex<std::collections::HashMap<String, Vec<(String, i64)>>>,
    open_issues: StdMutex<std::collections::HashMap<String, std::collections::BTreeMap<String, String>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/debug helper: returns a snapshot of the named stream's payloads,
    /// oldest first.
    pub fn snapshot(&self, stream_key: &str) -> Vec<String> {
        self.streams
            .lock()
            .unwrap()
            .get(stream_key)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|(_, payload)| payload)
            .collect()
    }
}

#[async_trait]
impl DurableLog for InMemoryLog {
    async fn append(&self, stream_key: &str, payload: &str, max_len_approx: usize) -> Result<String> {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let lsn = format!("{id}-0");
        let mut streams = self.streams.lock().unwrap();
        let entry = streams.entry(stream_key.to_string()).or_default();
        entry.push_back((lsn.clone(), payload.to_string()));
        while entry.len() > max_len_approx {
            entry.pop_front();
        }
        Ok(lsn)
    }

    async fn stream_len(&self, stream_key: &str) -> Result<u64> {
        Ok(self
            .streams
            .lock()
            .unwrap()
            .get(stream_key)
            .map(|d| d.len() as u64)
            .unwrap_or(0))
    }

    async fn read(&self, stream_key: &str, count: usize) -> Result<Vec<(String, String)>> {
        let streams = self.streams.lock().unwrap();
        let entry = streams.get(stream_key);
        Ok(match entry {
            Some(d) => d.iter().rev().take(count).rev().cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn is_member(&self, set_key: &str, url: &str) -> Result<bool> {
        Ok(self
            .sets
            .lock()
            .unwrap()
            .get(set_key)
            .map(|s| s.contains(url))
            .unwrap_or(false))
    }

    async fn mark_seen(&self, set_key: &str, index_key: &str, url: &str, first_seen_unix: i64) -> Result<()> {
        self.sets
            .lock()
            .unwrap()
            .entry(set_key.to_string())
            .or_default()
            .insert(url.to_string());
        let mut index = self.index.lock().unwrap();
        let entries = index.entry(index_key.to_string()).or_default();
        if !entries.iter().any(|(u, _)| u == url) {
            entries.push((url.to_string(), first_seen_unix));
        }
        Ok(())
    }

    async fn seen_count(&self, set_key: &str) -> Result<u64> {
        Ok(self
            .sets
            .lock()
            .unwrap()
            .get(set_key)
            .map(|s| s.len() as u64)
            .unwrap_or(0))
    }

    async fn sweep_seen(&self, set_key: &str, index_key: &str, older_than_unix: i64) -> Result<u64> {
        let mut index = self.index.lock().unwrap();
        let entries = index.entry(index_key.to_string()).or_default();
        let (stale, fresh): (Vec<_>, Vec<_>) = entries.drain(..).partition(|(_, ts)| *ts < older_than_unix);
        *entries = fresh;
        if !stale.is_empty() {
            let mut sets = self.sets.lock().unwrap();
            if let Some(set) = sets.get_mut(set_key) {
                for (url, _) in &stale {
                    set.remove(url);
                }
            }
        }
        Ok(stale.len() as u64)
    }

    async fn track_open_issue(&self, index_key: &str, url: &str, payload: &str) -> Result<()> {
        self.open_issues
            .lock()
            .unwrap()
            .entry(index_key.to_string())
            .or_default()
            .insert(url.to_string(), payload.to_string());
        Ok(())
    }

    async fn untrack_open_issue(&self, index_key: &str, url: &str) -> Result<()> {
        if let Some(index) = self.open_issues.lock().unwrap().get_mut(index_key) {
            index.remove(url);
        }
        Ok(())
    }

    async fn sample_open_issues(&self, index_key: &str, count: usize) -> Result<Vec<(String, String)>> {
        Ok(self
            .open_issues
            .lock()
            .unwrap()
            .get(index_key)
            .map(|index| index.iter().take(count).map(|(u, p)| (u.clone(), p.clone())).collect())
            .unwrap_or_default())
    }
}

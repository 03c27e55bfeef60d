//! Redis Streams broker backend
//!
//! Each queue is a stream read through a consumer group. A delivered entry
//! stays in the group's pending entries list until it is acknowledged, and
//! its idle time acts as the lease: entries idle for longer than the lease
//! are claimed by the next consumer that asks for messages.
//!
//! The lock token of a delivery is the pair (entry id, delivery count). Lease
//! operations run as Lua scripts that first check the entry is still pending
//! for this consumer with the same delivery count and an unexpired lease.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisResult, Script};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::message::{MessageQueue, QueueMessage, ReceivedMessage};
use crate::retry::{retry_when_throttled, ThrottlePolicy};

/// How long a single `XREADGROUP` blocks waiting for new entries
const READ_BLOCK_MS: usize = 200;

/// Field holding the message body in each stream entry
const BODY_FIELD: &str = "body";

/// Fails with 0 unless ARGV[3] is pending for consumer ARGV[2] with delivery
/// count ARGV[4] and idle for less than ARGV[5] milliseconds.
const LEASE_CHECK: &str = r"
local entry = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[3], ARGV[3], 1, ARGV[2])[1]
if not entry or tonumber(entry[3]) >= tonumber(ARGV[5]) or tonumber(entry[4]) ~= tonumber(ARGV[4]) then
  return 0
end
";

const RENEW_BODY: &str = r"
redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[2], 0, ARGV[3], 'JUSTID')
return 1
";

const RETURN_BODY: &str = r"
redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[2], 0, ARGV[3], 'IDLE', ARGV[5], 'JUSTID')
return 1
";

const DELETE_BODY: &str = r"
redis.call('XACK', KEYS[1], ARGV[1], ARGV[3])
redis.call('XDEL', KEYS[1], ARGV[3])
return 1
";

/// Claims up to ARGV[4] entries idle for at least ARGV[3] milliseconds and
/// returns them as {id, delivery count, body}. Follows the XAUTOCLAIM cursor
/// until the whole pending list was scanned or the batch is full. Entries
/// without a body are acknowledged and skipped.
const RECLAIM_SCRIPT: &str = r"
local wanted = tonumber(ARGV[4])
local cursor = '0-0'
local result = {}
repeat
  local claimed = redis.call('XAUTOCLAIM', KEYS[1], ARGV[1], ARGV[2], ARGV[3], cursor, 'COUNT', wanted - #result)
  cursor = claimed[1]
  for _, entry in ipairs(claimed[2]) do
    local id = entry[1]
    local fields = entry[2]
    local body = false
    if type(fields) == 'table' then
      for i = 1, #fields, 2 do
        if fields[i] == ARGV[5] then
          body = fields[i + 1]
        end
      end
    end
    if body then
      local pending = redis.call('XPENDING', KEYS[1], ARGV[1], id, id, 1)
      local deliveries = 1
      if pending[1] then
        deliveries = pending[1][4]
      end
      table.insert(result, {id, deliveries, body})
    else
      redis.call('XACK', KEYS[1], ARGV[1], id)
    end
  end
until cursor == '0-0' or #result >= wanted
return result
";

struct Scripts {
    reclaim: Script,
    renew: Script,
    release: Script,
    delete: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            reclaim: Script::new(RECLAIM_SCRIPT),
            renew: Script::new(&format!("{LEASE_CHECK}{RENEW_BODY}")),
            release: Script::new(&format!("{LEASE_CHECK}{RETURN_BODY}")),
            delete: Script::new(&format!("{LEASE_CHECK}{DELETE_BODY}")),
        }
    }
}

struct RedisStreamInner {
    name: String,
    group: String,
    consumer: String,
    lease: Duration,
    lease_ms: u64,
    policy: ThrottlePolicy,
    client: Client,
    manager: ConnectionManager,
    readers: Mutex<Vec<MultiplexedConnection>>,
    scripts: Scripts,
}

impl RedisStreamInner {
    async fn reclaim(&self, count: usize) -> QueueResult<Vec<(String, u64, String)>> {
        let mut conn = self.manager.clone();
        let entries = self
            .scripts
            .reclaim
            .key(&self.name)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.lease_ms)
            .arg(count)
            .arg(BODY_FIELD)
            .invoke_async(&mut conn)
            .await?;
        Ok(entries)
    }

    async fn checkout_reader(&self) -> QueueResult<MultiplexedConnection> {
        if let Some(conn) = self.readers.lock().await.pop() {
            return Ok(conn);
        }
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn read_new(&self, count: usize) -> QueueResult<Vec<(String, u64, String)>> {
        let mut conn = self.checkout_reader().await?;

        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count)
            .block(READ_BLOCK_MS);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.name], &[">"], &options)
            .await?;

        self.readers.lock().await.push(conn);

        let mut entries = Vec::new();
        for stream_id in reply.into_iter().flat_map(|reply| reply.keys).flat_map(|key| key.ids) {
            if let Some(body) = stream_id.get::<String>(BODY_FIELD) {
                entries.push((stream_id.id, 1, body));
            } else {
                warn!(queue = %self.name, entry_id = %stream_id.id, "Dropping stream entry without body");
                let mut manager = self.manager.clone();
                let _: i64 = manager.xack(&self.name, &self.group, &[&stream_id.id]).await?;
            }
        }
        Ok(entries)
    }

    /// Reclaims expired deliveries first, then reads new entries
    async fn poll_once(&self, count: usize) -> QueueResult<Vec<(String, u64, String)>> {
        let reclaimed = self.reclaim(count).await?;
        if !reclaimed.is_empty() {
            debug!(queue = %self.name, count = reclaimed.len(), "Reclaimed expired deliveries");
            return Ok(reclaimed);
        }
        self.read_new(count).await
    }

    async fn add(&self, content: &str) -> QueueResult<()> {
        let mut conn = self.manager.clone();
        let _: String = conn.xadd(&self.name, "*", &[(BODY_FIELD, content)]).await?;
        Ok(())
    }

    async fn run_lease_script(&self, script: &Script, id: &str, deliveries: u64) -> QueueResult<i64> {
        let mut conn = self.manager.clone();
        let held = script
            .key(&self.name)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(id)
            .arg(deliveries)
            .arg(self.lease_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(held)
    }

    /// Runs a lease script, mapping a failed ownership check to `LeaseLost`
    async fn with_lease(&self, script: &Script, id: &str, deliveries: u64) -> QueueResult<()> {
        let never = CancellationToken::new();
        let held =
            retry_when_throttled(self.policy, &never, || self.run_lease_script(script, id, deliveries))
                .await?;
        if held == 1 {
            Ok(())
        } else {
            Err(QueueError::LeaseLost(id.to_string()))
        }
    }
}

/// Broker [`MessageQueue`] backed by a Redis stream and consumer group
#[derive(Clone)]
pub struct RedisStreamQueue {
    inner: Arc<RedisStreamInner>,
}

impl RedisStreamQueue {
    /// Connects to Redis and makes sure the stream and consumer group exist
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Redis` if the URL is invalid, the server cannot be
    /// reached or the consumer group cannot be created
    pub async fn connect(config: &QueueConfig) -> QueueResult<Self> {
        let client = Client::open(config.endpoint.as_str())?;
        let mut manager = ConnectionManager::new(client.clone()).await?;

        let created: RedisResult<()> = manager
            .xgroup_create_mkstream(&config.name, config.consumer_group(), "0")
            .await;
        match created {
            Ok(()) => info!(queue = %config.name, group = config.consumer_group(), "Created consumer group"),
            Err(err) if err.code() == Some("BUSYGROUP") => {}
            Err(err) => return Err(err.into()),
        }

        let lease = config.lease();
        Ok(Self {
            inner: Arc::new(RedisStreamInner {
                name: config.name.clone(),
                group: config.consumer_group().to_string(),
                consumer: Uuid::new_v4().to_string(),
                lease,
                lease_ms: u64::try_from(lease.as_millis()).unwrap_or(u64::MAX),
                policy: config.throttle_policy(),
                client,
                manager,
                readers: Mutex::new(Vec::new()),
                scripts: Scripts::new(),
            }),
        })
    }

    /// Consumer name this handle reads as
    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.inner.consumer
    }
}

#[async_trait]
impl MessageQueue for RedisStreamQueue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn message_lease(&self) -> Duration {
        self.inner.lease
    }

    /// Entries read by an attempt that is canceled mid-flight stay pending
    /// and are redelivered once their lease expires.
    async fn wait_batch(
        &self,
        max_messages: usize,
        cancel: &CancellationToken,
    ) -> QueueResult<Vec<ReceivedMessage>> {
        let max_messages = max_messages.max(1);

        loop {
            let entries = tokio::select! {
                () = cancel.cancelled() => return Err(QueueError::Canceled),
                result = retry_when_throttled(self.inner.policy, cancel, || {
                    self.inner.poll_once(max_messages)
                }) => result?,
            };

            if !entries.is_empty() {
                return Ok(entries
                    .into_iter()
                    .map(|(id, deliveries, content)| {
                        let message: ReceivedMessage = Arc::new(RedisStreamMessage {
                            queue: self.inner.clone(),
                            id,
                            content,
                            deliveries,
                        });
                        message
                    })
                    .collect());
            }
        }
    }

    async fn send(&self, content: &str, cancel: &CancellationToken) -> QueueResult<()> {
        retry_when_throttled(self.inner.policy, cancel, || self.inner.add(content)).await
    }
}

/// A delivery leased from a [`RedisStreamQueue`]
struct RedisStreamMessage {
    queue: Arc<RedisStreamInner>,
    id: String,
    content: String,
    deliveries: u64,
}

#[async_trait]
impl QueueMessage for RedisStreamMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn content(&self) -> &str {
        &self.content
    }

    async fn renew_lease(&self) -> QueueResult<()> {
        self.queue
            .with_lease(&self.queue.scripts.renew, &self.id, self.deliveries)
            .await
    }

    async fn return_to_queue(&self) -> QueueResult<()> {
        self.queue
            .with_lease(&self.queue.scripts.release, &self.id, self.deliveries)
            .await
    }

    async fn delete(&self) -> QueueResult<()> {
        self.queue
            .with_lease(&self.queue.scripts.delete, &self.id, self.deliveries)
            .await
    }
}

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Thin wrapper over a shared Redis connection.
///
/// The worker uses Redis as its queue broker: ready jobs live in lists,
/// delayed retries in sorted sets scored by fire time, dead letters in a
/// separate list. The verbs here are the small set the queue runtime needs.
#[derive(Clone)]
pub struct RedisClient {
    conn: ConnectionManager,
}

impl RedisClient {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!("connected to queue broker");
        Ok(Self { conn })
    }

    pub async fn lpush(&self, key: &str, value: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.lpush(key, value).await
    }

    /// Blocking pop from the tail of a list. Returns `None` on timeout.
    pub async fn brpop(
        &self,
        key: &str,
        timeout_secs: u64,
    ) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(key)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;
        Ok(popped.map(|(_, value)| value))
    }

    pub async fn zadd(
        &self,
        key: &str,
        member: &str,
        score: i64,
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.zadd(key, member, score).await
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<bool, redis::RedisError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    /// Members whose score is at or below `max_score`, oldest first.
    pub async fn due_members(
        &self,
        key: &str,
        max_score: i64,
        limit: isize,
    ) -> Result<Vec<String>, redis::RedisError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max_score)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
    }

    pub async fn llen(&self, key: &str) -> Result<u64, redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.llen(key).await
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

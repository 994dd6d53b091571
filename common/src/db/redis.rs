// Redis connection manager and health check

use crate::config::RedisConfig;
use crate::errors::QueueError;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{info, instrument};

/// Redis connection wrapper shared by the work queue
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
}

impl RedisPool {
    #[instrument(skip(config), fields(redis_url = %config.url))]
    pub async fn new(config: &RedisConfig) -> Result<Self, QueueError> {
        info!("Initializing Redis connection");

        let client = Client::open(config.url.as_str())
            .map_err(|e| QueueError::Connection(format!("Failed to create Redis client: {}", e)))?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            QueueError::Connection(format!("Failed to create connection manager: {}", e))
        })?;

        info!("Redis connection initialized successfully");

        Ok(Self { manager })
    }

    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.get_connection();

        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::HealthCheck(e.to_string()))?;

        if response != "PONG" {
            return Err(QueueError::HealthCheck(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}

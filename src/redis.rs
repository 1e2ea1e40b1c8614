use rustis::client::{Config, PooledClientManager, ServerConfig};
use tokio::time::Duration;

pub type RedisPool = rustis::bb8::Pool<PooledClientManager>;

// a decision is one round-trip; a store that cannot answer in 250ms is
// treated as failed rather than waited on
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const COMMAND_TIMEOUT: Duration = Duration::from_millis(250);

/// Builds the shared connection pool the engine owns for its lifetime.
pub async fn new(cfg: super::conf::Redis) -> Result<RedisPool, rustis::Error> {
    let config = Config {
        server: ServerConfig::Standalone {
            host: cfg.host,
            port: cfg.port,
        },
        username: Some(cfg.username).filter(|s| !s.is_empty()),
        password: Some(cfg.password).filter(|s| !s.is_empty()),
        connect_timeout: CONNECT_TIMEOUT,
        command_timeout: COMMAND_TIMEOUT,
        keep_alive: Some(Duration::from_secs(65)),
        ..Config::default()
    };

    let manager = PooledClientManager::new(config).unwrap();
    RedisPool::builder()
        .max_size(cfg.pool_size)
        .min_idle(Some(2))
        .idle_timeout(Some(Duration::from_secs(120)))
        .connection_timeout(CONNECT_TIMEOUT)
        .build(manager)
        .await
}

#[cfg(test)]
mod tests {
    use rustis::resp;

    use super::{super::conf, *};

    #[actix_rt::test]
    async fn redis_pool_works() -> anyhow::Result<()> {
        let cfg = conf::Conf::from("./config/test.toml")?;
        let pool = new(cfg.redis).await?;

        let data = pool.get().await?.send(resp::cmd("PING"), None).await?;
        assert_eq!("PONG", data.to::<String>()?);

        let state = pool.state();
        assert!(state.connections >= 1);

        Ok(())
    }
}

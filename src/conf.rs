use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Log {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Server {
    pub port: u16,
    pub workers: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Redis {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub pool_size: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Scripts {
    pub dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Events {
    pub channel: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Conf {
    pub env: String,
    pub log: Log,
    pub server: Server,
    pub redis: Redis,
    pub scripts: Scripts,
    pub events: Events,
}

impl Conf {
    pub fn new() -> Result<Self, ConfigError> {
        let file_name =
            std::env::var("CONFIG_FILE_PATH").unwrap_or_else(|_| "./config/default.toml".into());
        Self::from(&file_name)
    }

    pub fn from(file_name: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder().add_source(File::new(file_name, FileFormat::Toml));
        builder.build()?.try_deserialize::<Conf>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_web::test]
    async fn config_works() -> anyhow::Result<()> {
        let cfg = Conf::new()?;
        assert_eq!("development", cfg.env);
        assert_eq!("debug", cfg.log.level);
        assert_eq!(8080, cfg.server.port);
        assert_eq!(2, cfg.server.workers);
        assert_eq!("127.0.0.1", cfg.redis.host);
        assert_eq!(6379, cfg.redis.port);
        assert_eq!(100, cfg.redis.pool_size);
        assert_eq!("./config/scripts", cfg.scripts.dir);
        assert_eq!("redquota:violations", cfg.events.channel);

        Ok(())
    }

    #[actix_web::test]
    async fn config_from_env_works() -> anyhow::Result<()> {
        let cfg = Conf::from("./config/test.toml")?;
        assert_eq!("test", cfg.env);
        assert_eq!("info", cfg.log.level);
        assert_eq!("redquota:violations:test", cfg.events.channel);

        Ok(())
    }
}

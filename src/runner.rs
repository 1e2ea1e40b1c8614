use std::collections::HashMap;

use rustis::resp;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{LimitError, Result},
    redis::RedisPool,
    scripts::{Script, ScriptRegistry},
};

/// Executes registry scripts atomically on the shared store by digest.
///
/// The digest table is process-local and repopulated lazily: a `NOSCRIPT`
/// reply (store restart, `SCRIPT FLUSH`) triggers one re-registration and
/// exactly one retry. A lost update on the table is benign because every
/// writer computes the same digest for the same source.
pub struct ScriptRunner {
    pool: RedisPool,
    registry: ScriptRegistry,
    digests: RwLock<HashMap<Script, String>>,
    shutdown: CancellationToken,
}

impl ScriptRunner {
    pub fn new(pool: RedisPool, registry: ScriptRegistry, shutdown: CancellationToken) -> Self {
        ScriptRunner {
            pool,
            registry,
            digests: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    /// Registers all four scripts and caches their digests. Failures are
    /// logged and non-fatal; `eval` heals the cache on first use.
    pub async fn preload(&self) {
        for script in Script::ALL {
            match self.load(script).await {
                Ok(digest) => {
                    log::info!("script '{}' registered as {}", script.name(), digest);
                }
                Err(err) => {
                    log::warn!("script '{}' preload failed: {}", script.name(), err);
                }
            }
        }
    }

    /// Runs `script` against `keys`/`args` and returns the raw reply.
    /// Exactly one successful script execution per call, or an error.
    pub async fn eval(&self, script: Script, keys: &[&str], args: &[String]) -> Result<resp::RespBuf> {
        let cached = self.digests.read().await.get(&script).cloned();
        let digest = match cached {
            Some(digest) => digest,
            // cold start or reconnect in progress: register the source
            // first, so the table heals on first use
            None => self.load(script).await?,
        };

        let data = self.send(eval_cmd(&digest, keys, args)).await?;
        match reply_error(&data) {
            None => Ok(data),
            Some(err) if err.contains("NOSCRIPT") => {
                // the store lost its script cache; re-register and retry once
                let digest = self.load(script).await?;
                let data = self.send(eval_cmd(&digest, keys, args)).await?;
                match reply_error(&data) {
                    None => Ok(data),
                    Some(err) => Err(LimitError::Store(err)),
                }
            }
            Some(err) => Err(LimitError::Store(err)),
        }
    }

    pub async fn digest(&self, script: Script) -> Option<String> {
        self.digests.read().await.get(&script).cloned()
    }

    async fn load(&self, script: Script) -> Result<String> {
        let cmd = resp::cmd("SCRIPT")
            .arg("LOAD")
            .arg(self.registry.source(script).to_string());

        let data = self.send(cmd).await?;
        if let Some(err) = reply_error(&data) {
            return Err(LimitError::Store(err));
        }

        let digest = data.to::<String>()?;
        self.digests
            .write()
            .await
            .insert(script, digest.clone());
        Ok(digest)
    }

    async fn send(&self, cmd: resp::Command) -> Result<resp::RespBuf> {
        let round_trip = async {
            let mut cli = self.pool.get().await?;
            let data = cli.send(cmd, None).await?;
            Ok::<resp::RespBuf, LimitError>(data)
        };

        tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => Err(LimitError::Cancelled),
            data = round_trip => data,
        }
    }
}

fn eval_cmd(digest: &str, keys: &[&str], args: &[String]) -> resp::Command {
    let mut cmd = resp::cmd("EVALSHA")
        .arg(digest.to_string())
        .arg(keys.len() as u64);
    for key in keys {
        cmd = cmd.arg(key.to_string());
    }
    for arg in args {
        cmd = cmd.arg(arg.clone());
    }
    cmd
}

fn reply_error(data: &resp::RespBuf) -> Option<String> {
    if data.is_error() {
        Some(data.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{
        super::{conf, redis},
        *,
    };

    async fn test_runner() -> anyhow::Result<ScriptRunner> {
        let cfg = conf::Conf::from("./config/test.toml")?;
        let pool = redis::new(cfg.redis).await?;
        let registry = ScriptRegistry::load(&cfg.scripts.dir)?;
        Ok(ScriptRunner::new(pool, registry, CancellationToken::new()))
    }

    #[actix_rt::test]
    async fn eval_works() -> anyhow::Result<()> {
        let runner = test_runner().await?;
        let key = "runner:eval_works";
        runner
            .pool
            .get()
            .await?
            .send(resp::cmd("DEL").arg(key), None)
            .await?;

        let data = runner
            .eval(
                Script::TokenBucket,
                &[key],
                &["5".into(), "10".into(), "1000".into()],
            )
            .await?;

        let (allowed, remaining, reset_at) = data.to::<(u64, u64, u64)>()?;
        assert_eq!(1, allowed);
        assert_eq!(4, remaining);
        assert_eq!(1000 + 10 * 1000, reset_at);

        assert!(runner.digest(Script::TokenBucket).await.is_some());

        Ok(())
    }

    #[actix_rt::test]
    async fn noscript_healing_works() -> anyhow::Result<()> {
        let runner = test_runner().await?;
        runner.preload().await;
        let digest = runner
            .digest(Script::SlidingWindow)
            .await
            .ok_or(anyhow::Error::msg("no digest after preload"))?;

        // simulate a store restart losing the script cache
        runner
            .pool
            .get()
            .await?
            .send(resp::cmd("SCRIPT").arg("FLUSH").arg("SYNC"), None)
            .await?;

        let key = "runner:noscript_healing_works";
        runner
            .pool
            .get()
            .await?
            .send(resp::cmd("DEL").arg(key), None)
            .await?;

        let data = runner
            .eval(
                Script::SlidingWindow,
                &[key],
                &["3".into(), "0".into(), "1000".into(), "1000".into()],
            )
            .await?;
        let (allowed, _, _) = data.to::<(u64, u64, u64)>()?;
        assert_eq!(1, allowed);

        // same source, same digest
        assert_eq!(Some(digest), runner.digest(Script::SlidingWindow).await);

        Ok(())
    }

    #[actix_rt::test]
    async fn cancelled_runner_fails() -> anyhow::Result<()> {
        let runner = test_runner().await?;
        runner.shutdown.cancel();

        let err = runner
            .eval(
                Script::TokenBucket,
                &["runner:cancelled"],
                &["5".into(), "10".into(), "1000".into()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LimitError::Cancelled));

        Ok(())
    }
}

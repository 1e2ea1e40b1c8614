use std::{collections::HashMap, fs, path::Path};

use crate::error::{LimitError, Result};

/// The four scripts the engine runs on the store. The set is closed; sources
/// are read once at startup and never change for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    RateLimit,
    TokenBucket,
    SlidingWindow,
    LeakyBucket,
}

impl Script {
    pub const ALL: [Script; 4] = [
        Script::RateLimit,
        Script::TokenBucket,
        Script::SlidingWindow,
        Script::LeakyBucket,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Script::RateLimit => "rateLimit",
            Script::TokenBucket => "tokenBucket",
            Script::SlidingWindow => "slidingWindow",
            Script::LeakyBucket => "leakyBucket",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Script::RateLimit => "rate-limit.lua",
            Script::TokenBucket => "token-bucket.lua",
            Script::SlidingWindow => "sliding-window.lua",
            Script::LeakyBucket => "leaky-bucket.lua",
        }
    }
}

#[derive(Debug)]
pub struct ScriptRegistry {
    sources: HashMap<Script, String>,
}

impl ScriptRegistry {
    /// Loads all four script sources from `dir`. A missing or empty file is
    /// a fatal configuration error.
    pub fn load(dir: &str) -> Result<Self> {
        let dir = Path::new(dir);
        let mut sources = HashMap::new();

        for script in Script::ALL {
            let path = dir.join(script.file_name());
            let text = fs::read_to_string(&path).map_err(|err| {
                LimitError::Configuration(format!(
                    "cannot read script '{}' from {}: {}",
                    script.name(),
                    path.display(),
                    err
                ))
            })?;

            if text.trim().is_empty() {
                return Err(LimitError::Configuration(format!(
                    "script '{}' at {} is empty",
                    script.name(),
                    path.display()
                )));
            }

            sources.insert(script, text);
        }

        Ok(ScriptRegistry { sources })
    }

    pub fn source(&self, script: Script) -> &str {
        &self.sources[&script]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_loads_all_scripts() -> anyhow::Result<()> {
        let registry = ScriptRegistry::load("./config/scripts")?;

        assert!(registry.source(Script::RateLimit).contains("INCR"));
        assert!(registry.source(Script::TokenBucket).contains("last_refill"));
        assert!(registry
            .source(Script::SlidingWindow)
            .contains("ZREMRANGEBYSCORE"));
        assert!(registry.source(Script::LeakyBucket).contains("last_leak"));

        Ok(())
    }

    #[test]
    fn registry_missing_dir_fails() {
        let err = ScriptRegistry::load("./config/no-such-dir").unwrap_err();
        assert!(matches!(err, LimitError::Configuration(_)));
        assert!(err.to_string().contains("rateLimit"));
    }

    #[test]
    fn script_names_are_stable() {
        assert_eq!("rateLimit", Script::RateLimit.name());
        assert_eq!("token-bucket.lua", Script::TokenBucket.file_name());
        assert_eq!(4, Script::ALL.len());
    }
}

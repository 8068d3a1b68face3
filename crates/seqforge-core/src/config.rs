//! Engine-facing configuration (§6.4, §10.2), read once at process startup.
//!
//! Every field is defaulted so the process starts with no environment
//! variables set, and a present-but-malformed variable falls back to the
//! default with a logged warning rather than panicking.

use std::env;
use std::str::FromStr;

/// How a completed `Branch`'s winning fork is chosen (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkSelectionStrategy {
    /// The first fork, by construction order. Matches the reference
    /// implementation's literal behavior.
    First,
    /// The fork with the greatest accumulated `logit_sum` (only meaningful
    /// for forks ending in `MatchPattern`; grounded on
    /// `original_source/example/fork.py`'s likelihood-sorting selection).
    MaxLikelihood,
}

impl FromStr for ForkSelectionStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(Self::First),
            "max_likelihood" => Ok(Self::MaxLikelihood),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub context_size: u32,
    pub temperature: f32,
    pub batch_size: u32,
    pub batch_max_tokens: u32,
    pub model_filename: Option<String>,
    pub tick_cap: u32,
    pub request_concurrency_limit: usize,
    pub fork_selection_strategy: ForkSelectionStrategy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            context_size: 4096,
            temperature: 1.0,
            batch_size: 512,
            batch_max_tokens: 2048,
            model_filename: None,
            tick_cap: 4096,
            request_concurrency_limit: 64,
            fork_selection_strategy: ForkSelectionStrategy::First,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, raw, "failed to parse environment variable, using default");
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            context_size: parse_env("SEQFORGE_CONTEXT_SIZE", default.context_size),
            temperature: parse_env("SEQFORGE_TEMPERATURE", default.temperature),
            batch_size: parse_env("SEQFORGE_BATCH_SIZE", default.batch_size),
            batch_max_tokens: parse_env("SEQFORGE_BATCH_MAX_TOKENS", default.batch_max_tokens),
            model_filename: env::var("SEQFORGE_MODEL_FILENAME").ok(),
            tick_cap: parse_env("SEQFORGE_TICK_CAP", default.tick_cap),
            request_concurrency_limit: parse_env(
                "SEQFORGE_REQUEST_CONCURRENCY_LIMIT",
                default.request_concurrency_limit,
            ),
            fork_selection_strategy: env::var("SEQFORGE_FORK_SELECTION_STRATEGY")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(default.fork_selection_strategy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_config() {
        let cfg = Config::default();
        assert_eq!(cfg.context_size, 4096);
        assert_eq!(cfg.temperature, 1.0);
        assert_eq!(cfg.batch_size, 512);
        assert_eq!(cfg.batch_max_tokens, 2048);
        assert_eq!(cfg.fork_selection_strategy, ForkSelectionStrategy::First);
    }

    #[test]
    fn fork_selection_strategy_parses_known_values() {
        assert_eq!("first".parse(), Ok(ForkSelectionStrategy::First));
        assert_eq!("max_likelihood".parse(), Ok(ForkSelectionStrategy::MaxLikelihood));
        assert!("nonsense".parse::<ForkSelectionStrategy>().is_err());
    }
}

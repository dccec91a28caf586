use crate::utils::logger::LoggerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Process-wide runtime configuration, consumed by
/// [`scheduler::install`](crate::scheduler::install).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RxConfig {
    /// Worker count of the default pool; available parallelism when unset.
    pub worker_threads: Option<usize>,
    /// Pin pool workers to cores round-robin.
    #[serde(default)]
    pub pin_workers: bool,
    pub thread_name_prefix: Option<String>,
    /// Upper bound of the blocking pool; unbounded when unset.
    pub blocking_max_threads: Option<usize>,
    pub blocking_keep_alive_ms: Option<u64>,
    /// Use the single-threaded microtask policy even where threads exist.
    #[serde(default)]
    pub single_threaded: bool,
    #[serde(default)]
    pub logger: Option<LoggerConfig>,
}

impl RxConfig {
    /// Reads RX_WORKER_THREADS, RX_PIN_WORKERS, RX_THREAD_NAME_PREFIX,
    /// RX_BLOCKING_MAX_THREADS, RX_BLOCKING_KEEP_ALIVE_MS, RX_SINGLE_THREADED.
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
        }

        Self {
            worker_threads: var("RX_WORKER_THREADS"),
            pin_workers: var("RX_PIN_WORKERS").unwrap_or(false),
            thread_name_prefix: std::env::var("RX_THREAD_NAME_PREFIX").ok(),
            blocking_max_threads: var("RX_BLOCKING_MAX_THREADS"),
            blocking_keep_alive_ms: var("RX_BLOCKING_KEEP_ALIVE_MS"),
            single_threaded: var("RX_SINGLE_THREADED").unwrap_or(false),
            logger: None,
        }
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
            .filter(|n| *n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
    }

    pub fn thread_name_prefix(&self) -> &str {
        self.thread_name_prefix.as_deref().unwrap_or("rx")
    }

    pub fn blocking_keep_alive(&self) -> Duration {
        Duration::from_millis(self.blocking_keep_alive_ms.unwrap_or(60_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_with_defaults() {
        let cfg: RxConfig = serde_json::from_value(json!({"worker_threads": 3})).unwrap();
        assert_eq!(cfg.worker_threads(), 3);
        assert!(!cfg.pin_workers);
        assert!(!cfg.single_threaded);
        assert_eq!(cfg.thread_name_prefix(), "rx");
        assert_eq!(cfg.blocking_keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn zero_workers_fall_back_to_parallelism() {
        let cfg = RxConfig {
            worker_threads: Some(0),
            ..Default::default()
        };
        assert!(cfg.worker_threads() >= 1);
    }
}

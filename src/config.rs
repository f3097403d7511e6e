//! Runtime configuration.
//!
//! Three layers: CLI flags, `OLLAMA_*` environment variables (parsed once
//! at startup), and an optional JSON config file with per-section
//! defaults.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::memory::KvCacheType;

/// Command-line arguments for the worker binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "gguf-serve", about = "Local LLM serving worker")]
pub struct Cli {
    /// Path to the GGUF model file.
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// HTTP listen address.
    #[arg(long, default_value = "127.0.0.1:11435")]
    pub listen: String,

    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// The flash-attention tri-state: unset lets the model decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashAttention {
    #[default]
    Auto,
    On,
    Off,
}

/// Environment variables consumed by the core, parsed once.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub flash_attention: FlashAttention,
    pub kv_cache_type: KvCacheType,
    pub load_timeout: Duration,
    pub sched_spread: bool,
    pub multiuser_cache: bool,
    pub gpu_overhead: u64,
    pub new_engine: bool,
    pub registry_maxstreams: usize,
    pub models_dir: PathBuf,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse from an arbitrary lookup, so tests never touch the process
    /// environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let truthy = |key: &str| {
            get(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false)
        };

        let flash_attention = match get("OLLAMA_FLASH_ATTENTION").as_deref() {
            None | Some("") => FlashAttention::Auto,
            Some("0") | Some("false") | Some("no") | Some("off") => FlashAttention::Off,
            Some(_) => FlashAttention::On,
        };

        let kv_cache_type = get("OLLAMA_KV_CACHE_TYPE")
            .as_deref()
            .and_then(KvCacheType::parse)
            .unwrap_or_default();

        let load_timeout = get("OLLAMA_LOAD_TIMEOUT")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));

        let gpu_overhead = get("OLLAMA_GPU_OVERHEAD")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let registry_maxstreams = get("OLLAMA_REGISTRY_MAXSTREAMS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let models_dir = get("OLLAMA_MODELS").map(PathBuf::from).unwrap_or_else(|| {
            let home = get("HOME").unwrap_or_else(|| ".".to_string());
            PathBuf::from(home).join(".ollama").join("models")
        });

        Self {
            flash_attention,
            kv_cache_type,
            load_timeout,
            sched_spread: truthy("OLLAMA_SCHED_SPREAD"),
            multiuser_cache: truthy("OLLAMA_MULTIUSER_CACHE"),
            gpu_overhead,
            new_engine: truthy("OLLAMA_NEW_ENGINE"),
            registry_maxstreams,
            models_dir,
        }
    }
}

/// Top-level file configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:11435").
    pub listen: String,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:11435".to_string(),
            request_timeout_secs: 300,
        }
    }
}

/// Model serving settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the GGUF model file.
    pub model_path: PathBuf,

    /// Per-sequence context size in tokens.
    pub context_size: usize,

    /// Logical batch size in tokens.
    pub batch_size: usize,

    /// Concurrent sequence slots.
    pub parallel: usize,

    /// Manual GPU layer count (negative = automatic).
    pub num_gpu: i32,

    /// Require the whole model on GPU.
    pub require_full_offload: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model.gguf"),
            context_size: 4096,
            batch_size: 512,
            parallel: 4,
            num_gpu: -1,
            require_full_offload: false,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file is absent.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&data)?)
        } else {
            tracing::warn!("config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Manual layer count as the planner expects it.
    pub fn num_gpu(&self) -> Option<usize> {
        (self.model.num_gpu >= 0).then_some(self.model.num_gpu as usize)
    }
}

use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Effective engine configuration, resolved once at startup from the
/// environment. There is no config file layer: the spec names environment
/// variables as the only configuration surface.
#[derive(Debug, Clone)]
pub struct Config {
    pub blender_path: String,
    pub output_dir: String,
    pub max_iterations: u32,
    pub render_engine: String,
    pub render_samples: u32,
    pub render_resolution_x: u32,
    pub render_resolution_y: u32,
    pub animation_enabled: bool,
    pub animation_frames: u32,
    pub animation_fps: u32,
    pub reviewer_enabled: bool,
    pub executor_concurrency: usize,
    pub inbox_capacity: usize,
    pub stage_timeout: Duration,
    pub executor_timeout: Duration,
    pub stale_session_threshold: Duration,
}

fn env_or(name: &'static str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) => v.parse().map_err(|_| ConfigError::Invalid { name, value: v }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { name, value: v }),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let blender_path = env::var("BLENDER_PATH").map_err(|_| ConfigError::Missing("BLENDER_PATH"))?;
        Ok(Self {
            blender_path,
            output_dir: env_or("OUTPUT_DIR", "./output"),
            max_iterations: env_parse("MAX_ITERATIONS", 3)?,
            render_engine: env_or("RENDER_ENGINE", "CYCLES"),
            render_samples: env_parse("RENDER_SAMPLES", 64)?,
            render_resolution_x: env_parse("RENDER_RESOLUTION_X", 1280)?,
            render_resolution_y: env_parse("RENDER_RESOLUTION_Y", 720)?,
            animation_enabled: env_bool("ANIMATION_ENABLED", false)?,
            animation_frames: env_parse("ANIMATION_FRAMES", 24)?,
            animation_fps: env_parse("ANIMATION_FPS", 24)?,
            reviewer_enabled: env_bool("REVIEWER_ENABLED", true)?,
            executor_concurrency: env_parse("EXECUTOR_CONCURRENCY", 2usize)?,
            inbox_capacity: env_parse("INBOX_CAPACITY", 64usize)?,
            stage_timeout: Duration::from_secs(env_parse("STAGE_TIMEOUT_S", 120u64)?),
            executor_timeout: Duration::from_secs(env_parse("EXECUTOR_TIMEOUT_S", 600u64)?),
            stale_session_threshold: Duration::from_secs(env_parse("STALE_SESSION_THRESHOLD_S", 1800u64)?),
        })
    }

    /// A redacted view suitable for the `GET /config` introspection endpoint.
    /// Nothing in this config is actually secret today, but the shape keeps
    /// parity with how the surface would evolve if credentials are added.
    pub fn to_effective_json(&self) -> serde_json::Value {
        serde_json::json!({
            "blender_path": self.blender_path,
            "output_dir": self.output_dir,
            "max_iterations": self.max_iterations,
            "render_engine": self.render_engine,
            "render_samples": self.render_samples,
            "render_resolution": [self.render_resolution_x, self.render_resolution_y],
            "animation_enabled": self.animation_enabled,
            "animation_frames": self.animation_frames,
            "animation_fps": self.animation_fps,
            "reviewer_enabled": self.reviewer_enabled,
            "executor_concurrency": self.executor_concurrency,
            "inbox_capacity": self.inbox_capacity,
            "stage_timeout_s": self.stage_timeout.as_secs(),
            "executor_timeout_s": self.executor_timeout.as_secs(),
            "stale_session_threshold_s": self.stale_session_threshold.as_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // env::set_var affects the whole process; serialize config tests.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_blender_path_fails_fast() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("BLENDER_PATH");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("BLENDER_PATH")));
    }

    #[test]
    fn defaults_apply_when_optional_vars_absent() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("BLENDER_PATH", "/usr/bin/blender");
        env::remove_var("MAX_ITERATIONS");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.max_iterations, 3);
        assert_eq!(cfg.executor_concurrency, 2);
        env::remove_var("BLENDER_PATH");
    }
}

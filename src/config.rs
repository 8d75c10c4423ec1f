use anyhow::Result;

/// Process-wide configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Bind host (env: VOICELEARN_MGMT_HOST)
    pub host: String,

    /// Bind port (env: VOICELEARN_MGMT_PORT)
    pub port: u16,

    /// Directory holding the persisted JSON files (env: VOICELEARN_DATA_DIR)
    pub data_dir: String,

    /// Base URL of the LLM runtime, used for PS/unload fallbacks when no
    /// in-process callback is registered (env: VOICELEARN_LLM_URL).
    pub llm_base_url: String,

    /// Base URL of the TTS service, used for health/unload fallbacks (env:
    /// VOICELEARN_TTS_URL).
    pub tts_base_url: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: std::env::var("VOICELEARN_MGMT_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("VOICELEARN_MGMT_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8766),
            data_dir: std::env::var("VOICELEARN_DATA_DIR").unwrap_or_else(|_| "data".into()),
            llm_base_url: std::env::var("VOICELEARN_LLM_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:11434".into()),
            tts_base_url: std::env::var("VOICELEARN_TTS_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8880".into()),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn power_profiles_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("power_profiles.json")
    }

    pub fn metrics_hourly_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("metrics_hourly.json")
    }

    pub fn metrics_daily_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("metrics_daily.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            host: "0.0.0.0".into(),
            port: 8766,
            data_dir: "data".into(),
            llm_base_url: "http://127.0.0.1:11434".into(),
            tts_base_url: "http://127.0.0.1:8880".into(),
        }
    }

    #[test]
    fn listen_addr_combines_host_and_port() {
        let cfg = AppConfig {
            host: "127.0.0.1".into(),
            port: 9000,
            ..base_config()
        };
        assert_eq!(cfg.listen_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn data_paths_are_relative_to_data_dir() {
        let cfg = AppConfig {
            data_dir: "/var/lib/voicelearn".into(),
            ..base_config()
        };
        assert_eq!(
            cfg.power_profiles_path(),
            std::path::Path::new("/var/lib/voicelearn/power_profiles.json")
        );
        assert_eq!(
            cfg.metrics_hourly_path(),
            std::path::Path::new("/var/lib/voicelearn/metrics_hourly.json")
        );
        assert_eq!(
            cfg.metrics_daily_path(),
            std::path::Path::new("/var/lib/voicelearn/metrics_daily.json")
        );
    }

    #[test]
    fn defaults_match_spec() {
        let cfg = base_config();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8766);
    }
}

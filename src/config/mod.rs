use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Config holds the command-line runner's configuration.
/// The synthesis core itself reads no environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub catalog_dir: PathBuf,
    pub output_dir: PathBuf,
    pub catalog_watch: bool,
    pub watch_debounce: Duration,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn load() -> Self {
        Self {
            catalog_dir: PathBuf::from(get_env("CATALOG_DIR", "./catalog")),
            output_dir: PathBuf::from(get_env("OUTPUT_DIR", "./out")),
            catalog_watch: parse_bool(&get_env("CATALOG_WATCH", "false")),
            watch_debounce: Duration::from_millis(
                get_env("WATCH_DEBOUNCE_MS", "500")
                    .parse()
                    .unwrap_or(500),
            ),
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool(" YES "));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }
}

//! agg_config
//!
//! Typed configuration structs for sources and publish routes, with
//! `${VAR}` environment-variable expansion performed before YAML parse.

use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("route '{0}' references unknown source '{1}'")]
    UnknownSource(String, String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Telegram,
    TelegramUser,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramSourceConfig {
    pub token: Option<String>,
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramUserSourceConfig {
    pub api_id: Option<String>,
    pub api_hash: Option<String>,
    pub session: Option<String>,
    pub peer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SelectorConfig {
    #[serde(default)]
    pub include_formats: Vec<String>,
}

impl SelectorConfig {
    pub fn allows(&self, format_id: &str) -> bool {
        self.include_formats.iter().any(|f| f == "all" || f == format_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    #[serde(default)]
    pub telegram: Option<TelegramSourceConfig>,
    #[serde(default)]
    pub telegram_user: Option<TelegramUserSourceConfig>,
    #[serde(default)]
    pub selector: SelectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub chat_id: String,
    pub mode: String,
    pub caption_template: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    pub from_sources: Vec<String>,
    pub formats: Vec<String>,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishingConfig {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub publishing: PublishingConfig,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl RootConfig {
    /// Cross-reference routes against declared sources; returns the first
    /// unknown source id encountered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let known: std::collections::HashSet<&str> =
            self.sources.iter().map(|s| s.id.as_str()).collect();
        for route in &self.publishing.routes {
            for source_id in &route.from_sources {
                if !known.contains(source_id.as_str()) {
                    return Err(ConfigError::UnknownSource(
                        route.name.clone(),
                        source_id.clone(),
                    ));
                }
            }
        }
        Ok(())
    }
}

static ENV_VAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Expand `${VAR}` references against the process environment. A reference
/// to an unset variable is left untouched (rather than blanked) so a
/// misconfigured deployment fails loudly at YAML-parse time instead of
/// silently producing an empty token.
pub fn expand_env_vars(text: &str) -> String {
    ENV_VAR_RE
        .replace_all(text, |caps: &regex::Captures| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(value) => value,
                Err(_) => {
                    tracing::warn!(var = name, "config references unset environment variable");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

pub fn load_config(path: impl AsRef<Path>) -> Result<RootConfig, ConfigError> {
    let raw = fs::read_to_string(path)?;
    let expanded = expand_env_vars(&raw);
    let config: RootConfig = serde_yaml::from_str(&expanded)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_env_var() {
        std::env::set_var("AGG_TEST_TOKEN", "secret123");
        let out = expand_env_vars("token: ${AGG_TEST_TOKEN}");
        assert_eq!(out, "token: secret123");
    }

    #[test]
    fn leaves_unknown_env_var_untouched() {
        std::env::remove_var("AGG_TEST_DOES_NOT_EXIST");
        let out = expand_env_vars("token: ${AGG_TEST_DOES_NOT_EXIST}");
        assert_eq!(out, "token: ${AGG_TEST_DOES_NOT_EXIST}");
    }

    #[test]
    fn parses_full_config() {
        let yaml = r#"
sources:
  - id: chan1
    type: telegram
    telegram:
      token: t
      chat_id: c1
    selector:
      include_formats: ["npvt", "conf_lines"]
publishing:
  routes:
    - name: main
      from_sources: [chan1]
      formats: [npvt]
      destinations:
        - chat_id: "999"
          mode: document
          caption_template: "{sha12}"
"#;
        let config: RootConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert!(config.sources[0].selector.allows("npvt"));
        assert!(!config.sources[0].selector.allows("ovpn"));
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_unknown_source_reference() {
        let config = RootConfig {
            sources: vec![],
            publishing: PublishingConfig {
                routes: vec![RouteConfig {
                    name: "r1".into(),
                    from_sources: vec!["ghost".into()],
                    formats: vec!["npvt".into()],
                    destinations: vec![],
                }],
            },
        };
        assert!(config.validate().is_err());
    }
}

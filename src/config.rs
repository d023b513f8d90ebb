use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::{env, fs, path::Path};
use tracing::info;

pub static DEFAULT_CONFIG_PATH: &str = "/etc/tiller-installer/config.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub webserver: Webserver,
    pub tiller: Tiller,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default = "default_schedule")]
    pub schedule: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tiller {
    /// Version tag of the Tiller image to deploy, e.g. `v2.16.12`.
    pub tag: String,
    #[serde(default = "default_max_wait_seconds", rename = "maxWaitSeconds")]
    pub max_wait_seconds: u64,
    #[serde(default = "default_helm_binary", rename = "helmBinary")]
    pub helm_binary: String,
}

/// Credentials of a private registry that mirrors the Tiller image.
///
/// An empty `server` means no private registry is configured and the public
/// image is used.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: SecretString,
    #[serde(default)]
    pub email: String,
}

impl RegistryConfig {
    pub fn has_registry_config(&self) -> bool {
        !self.server.is_empty()
    }
}

fn default_schedule() -> String {
    "*/30 * * * * *".to_string()
}

fn default_max_wait_seconds() -> u64 {
    60
}

fn default_helm_binary() -> String {
    "helm".to_string()
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variable values.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable: {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_expand_env_vars_success() {
        unsafe {
            env::set_var("TILLER_TEST_VAR", "value123");
        }
        let input = "This is a test: ${TILLER_TEST_VAR}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "This is a test: value123");
        unsafe {
            env::remove_var("TILLER_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let input = "This will fail: ${TILLER_MISSING_VAR}";
        let err = expand_env_vars(input).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable: TILLER_MISSING_VAR"
        );
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_load_config_file() {
        unsafe {
            env::set_var("TILLER_TEST_REGISTRY_PASSWORD", "hunter2");
        }
        let yaml_content = r#"
        webserver:
          port: 8080
        tiller:
          tag: v2.16.12
          maxWaitSeconds: 120
        registry:
          server: registry.example.com
          username: deployer
          password: ${TILLER_TEST_REGISTRY_PASSWORD}
          email: deployer@example.com
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let path = tmp_file.path();
        fs::write(path, yaml_content).expect("Failed to write to temp file");

        let config = load_config(path).expect("Should load config");

        assert_eq!(config.webserver.port, 8080);
        assert_eq!(config.tiller.tag, "v2.16.12");
        assert_eq!(config.tiller.max_wait_seconds, 120);
        assert_eq!(config.tiller.helm_binary, "helm");
        assert_eq!(config.schedule, "*/30 * * * * *");
        assert!(config.registry.has_registry_config());
        assert_eq!(config.registry.server, "registry.example.com");
        assert_eq!(config.registry.password.expose_secret(), "hunter2");
        unsafe {
            env::remove_var("TILLER_TEST_REGISTRY_PASSWORD");
        }
    }

    #[test]
    fn test_load_config_without_registry() {
        let yaml_content = r#"
        webserver:
          port: 9090
        tiller:
          tag: v2.9.1
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(tmp_file.path(), yaml_content).expect("Failed to write to temp file");

        let config = load_config(tmp_file.path()).expect("Should load config");

        assert_eq!(config.tiller.max_wait_seconds, 60);
        assert!(!config.registry.has_registry_config());
    }
}

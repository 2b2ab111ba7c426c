use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Load configuration from a file using the config crate
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously and propagate default timeouts
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    let mut gateway_config = load_config_raw(config_path)?;
    gateway_config.normalize();
    tracing::debug!(
        "Loaded {} endpoint(s) from {}",
        gateway_config.endpoints.len(),
        config_path
    );
    Ok(gateway_config)
}

/// Load configuration exactly as written (used by the validate command)
pub fn load_config_raw(config_path: &str) -> Result<GatewayConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml, // Default to YAML
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
timeout: "300ms"
endpoints:
  - endpoint: "/users/{id}"
    backends:
      - url_pattern: "/users/{{.id}}"
        hosts: ["http://users:8080"]
        allow_list: ["id", "name"]
      - url_pattern: "/orders"
        hosts: ["http://orders:8080"]
        timeout: "100ms"
        group: "orders"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.endpoints.len(), 1);

        let endpoint = &config.endpoints[0];
        assert_eq!(endpoint.timeout(), Duration::from_millis(300));
        assert_eq!(endpoint.backends[0].timeout(), Duration::from_millis(300));
        assert_eq!(endpoint.backends[1].timeout(), Duration::from_millis(100));
        assert_eq!(endpoint.backends[1].group.as_deref(), Some("orders"));
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "endpoints": [
    {
      "endpoint": "/profile",
      "extra_config": {
        "proxy": { "static": { "data": { "source": "cache" }, "strategy": "incomplete" } }
      },
      "backends": [
        { "url_pattern": "/me", "hosts": ["http://accounts:8080"], "concurrent_calls": 3 }
      ]
    }
  ]
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        let endpoint = &config.endpoints[0];
        assert_eq!(endpoint.backends[0].concurrent_calls, 3);
        let static_data = endpoint.proxy_config().static_data.unwrap();
        assert_eq!(static_data.data["source"], "cache");
    }

    #[test]
    fn test_load_missing_file() {
        assert!(load_config_sync("/definitely/not/here.yaml").is_err());
    }
}

use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::{MergeOption, ResponsePreference, SaveChangesOptions};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    pub service: ServiceConfig,
    pub save: SaveChangesOptions,
    pub query: QueryConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service root; entity sets and `$batch` resolve against it.
    pub root: String,
    /// Namespace used for `@odata.type` annotations on request bodies.
    pub type_namespace: Option<String>,
    pub response_preference: ResponsePreference,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryConfig {
    pub merge_option: MergeOption,
    /// Treat a 404 on a query as an empty result.
    pub ignore_resource_not_found: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
    /// Size of the pooled buffers used to read save streams.
    pub buffer_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            root: "http://localhost:5000/odata".to_string(),
            type_namespace: None,
            response_preference: ResponsePreference::None,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 100,
            user_agent: format!("odata-client/{}", env!("CARGO_PKG_VERSION")),
            buffer_size: 64 * 1024,
        }
    }
}

impl ClientConfig {
    /// Load configuration from defaults, an optional `odata-client` file and
    /// `ODATA_` environment variables (`ODATA_SERVICE__ROOT`, ...).
    pub fn load() -> anyhow::Result<Self> {
        let mut config = config::Config::builder();

        config = config.add_source(config::Config::try_from(&ClientConfig::default())?);

        config = config.add_source(config::File::with_name("odata-client").required(false));

        config = config.add_source(
            config::Environment::with_prefix("ODATA")
                .prefix_separator("_")
                .separator("__"),
        );

        let config = config.build()?;
        let client_config: ClientConfig = config.try_deserialize()?;
        client_config.save.validate()?;

        Ok(client_config)
    }

    /// The service root as an absolute URL.
    pub fn service_root(&self) -> anyhow::Result<Url> {
        let root = Url::parse(&self.service.root)
            .map_err(|e| anyhow::anyhow!("invalid service root '{}': {}", self.service.root, e))?;
        if root.cannot_be_a_base() {
            anyhow::bail!("service root '{}' cannot be used as a base URL", root);
        }
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SaveMode;

    #[test]
    fn defaults_round_trip_through_the_config_builder() {
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&ClientConfig::default()).unwrap())
            .set_override("save.mode", "batch_with_single_changeset")
            .unwrap()
            .set_override("query.merge_option", "overwrite_changes")
            .unwrap()
            .build()
            .unwrap();
        let loaded: ClientConfig = config.try_deserialize().unwrap();

        assert_eq!(loaded.save.mode, SaveMode::BatchWithSingleChangeset);
        assert_eq!(loaded.query.merge_option, MergeOption::OverwriteChanges);
        assert_eq!(loaded.http.buffer_size, 64 * 1024);
        assert_eq!(
            loaded.service_root().unwrap().as_str(),
            "http://localhost:5000/odata"
        );
    }

    #[test]
    fn rejects_relative_service_root() {
        let mut config = ClientConfig::default();
        config.service.root = "odata".to_string();
        assert!(config.service_root().is_err());
    }
}

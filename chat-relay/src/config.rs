use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

/// Where the client finds the relay, read from a JSON file such as
/// `{"host": "127.0.0.1", "port": 5000}`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("config file {0} has an empty host")]
    EmptyHost(PathBuf),
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ClientConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if config.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost(path.to_path_buf()));
        }
        Ok(config)
    }

    pub fn server(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn loads_host_and_port() {
        let file = config_file(r#"{"host": "localhost", "port": 5000}"#);
        let config = ClientConfig::load(file.path()).expect("load config");
        assert_eq!(config.server(), "localhost:5000");
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = ClientConfig::load(&dir.path().join("config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_files_are_rejected() {
        for contents in [
            "<config><host>x</host></config>",
            r#"{"host": "localhost", "port": "five"}"#,
            r#"{"host": "localhost", "port": 70000}"#,
            r#"{"host": "localhost"}"#,
            r#"{"host": "localhost", "port": 1, "proxy": true}"#,
        ] {
            let file = config_file(contents);
            let err = ClientConfig::load(file.path()).unwrap_err();
            assert!(matches!(err, ConfigError::Parse { .. }), "{contents}: {err}");
        }
    }

    #[test]
    fn empty_host_is_rejected() {
        let file = config_file(r#"{"host": " ", "port": 5000}"#);
        let err = ClientConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyHost(_)));
    }
}

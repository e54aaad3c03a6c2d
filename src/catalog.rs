//! Server catalog: the ordered list of candidate speed test servers.
//!
//! A catalog is read once from a static source (the compiled-in list, a JSON
//! file, or a TOML file) and never mutated afterwards. Declaration order is
//! try order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Upload payload used when a catalog entry does not name one (25 MB).
pub const DEFAULT_UPLOAD_SIZE_BYTES: u64 = 25_000_000;

const EMBEDDED_SERVERS: &str = include_str!("../data/servers.json");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read server list {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse server list {origin}: {message}")]
    Parse { origin: String, message: String },

    #[error("server #{index} ({name}): {problem}")]
    InvalidServer {
        index: usize,
        name: String,
        problem: String,
    },
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// One candidate server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub name: String,
    pub download_url: String,
    pub upload_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_size_bytes: Option<u64>,
}

impl Server {
    pub fn new(
        name: impl Into<String>,
        download_url: impl Into<String>,
        upload_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            download_url: download_url.into(),
            upload_url: upload_url.into(),
            upload_size_bytes: None,
        }
    }

    /// Payload size for the upload phase.
    pub fn upload_size(&self) -> u64 {
        self.upload_size_bytes.unwrap_or(DEFAULT_UPLOAD_SIZE_BYTES)
    }

    fn validate(&self, index: usize) -> Result<(), CatalogError> {
        let invalid = |problem: &str| CatalogError::InvalidServer {
            index,
            name: self.name.clone(),
            problem: problem.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        if !is_http_url(&self.download_url) {
            return Err(invalid("downloadUrl must be an http(s) URL"));
        }
        if !is_http_url(&self.upload_url) {
            return Err(invalid("uploadUrl must be an http(s) URL"));
        }
        if self.upload_size_bytes == Some(0) {
            return Err(invalid("uploadSizeBytes must be greater than zero"));
        }
        Ok(())
    }
}

fn is_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    matches!(rest, Some(host) if !host.is_empty())
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Immutable, ordered list of servers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    servers: Vec<Server>,
}

impl Catalog {
    /// Build a catalog, validating every entry.
    pub fn new(servers: Vec<Server>) -> Result<Self, CatalogError> {
        for (index, server) in servers.iter().enumerate() {
            server.validate(index)?;
        }
        Ok(Self { servers })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Server> {
        self.servers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter()
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }
}

/// TOML layout: `[[servers]]` tables.
#[derive(Debug, Deserialize)]
struct TomlCatalog {
    #[serde(default)]
    servers: Vec<Server>,
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Where the catalog comes from.
#[derive(Debug, Clone, Default)]
pub enum CatalogSource {
    /// The list compiled into the binary.
    #[default]
    Embedded,
    /// A JSON file, or TOML when the extension is `.toml`.
    File(PathBuf),
    /// A JSON document held in memory.
    Inline(String),
}

impl CatalogSource {
    /// Read and validate the catalog.
    pub fn load(&self) -> Result<Catalog, CatalogError> {
        let catalog = match self {
            CatalogSource::Embedded => parse_json(EMBEDDED_SERVERS, "embedded server list")?,
            CatalogSource::Inline(text) => parse_json(text, "inline server list")?,
            CatalogSource::File(path) => load_file(path)?,
        };
        info!(source = %self.describe(), servers = catalog.len(), "loaded server catalog");
        Ok(catalog)
    }

    pub fn describe(&self) -> String {
        match self {
            CatalogSource::Embedded => "embedded".to_string(),
            CatalogSource::Inline(_) => "inline".to_string(),
            CatalogSource::File(path) => path.display().to_string(),
        }
    }
}

fn load_file(path: &Path) -> Result<Catalog, CatalogError> {
    let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let origin = path.display().to_string();

    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

    if is_toml {
        debug!(path = %origin, "parsing TOML server list");
        let parsed: TomlCatalog = toml::from_str(&content).map_err(|e| CatalogError::Parse {
            origin: origin.clone(),
            message: e.to_string(),
        })?;
        Catalog::new(parsed.servers)
    } else {
        parse_json(&content, &origin)
    }
}

fn parse_json(text: &str, origin: &str) -> Result<Catalog, CatalogError> {
    let servers: Vec<Server> = serde_json::from_str(text).map_err(|e| CatalogError::Parse {
        origin: origin.to_string(),
        message: e.to_string(),
    })?;
    Catalog::new(servers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_embedded_catalog_loads() {
        let catalog = CatalogSource::Embedded.load().unwrap();
        assert!(!catalog.is_empty());
        assert_eq!(catalog.get(0).unwrap().name, "Cloudflare");
    }

    #[test]
    fn test_json_preserves_order_and_defaults_payload() {
        let json = r#"[
            {"name": "A", "downloadUrl": "http://a/down", "uploadUrl": "http://a/up"},
            {"name": "B", "downloadUrl": "https://b/down", "uploadUrl": "https://b/up", "uploadSizeBytes": 1000}
        ]"#;
        let catalog = CatalogSource::Inline(json.to_string()).load().unwrap();
        let names: Vec<_> = catalog.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["A", "B"]);
        assert_eq!(catalog.get(0).unwrap().upload_size(), DEFAULT_UPLOAD_SIZE_BYTES);
        assert_eq!(catalog.get(1).unwrap().upload_size(), 1000);
    }

    #[test]
    fn test_missing_field_is_parse_error() {
        let json = r#"[{"name": "A", "downloadUrl": "http://a/down"}]"#;
        let err = CatalogSource::Inline(json.to_string()).load().unwrap_err();
        assert!(matches!(err, CatalogError::Parse { .. }));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = CatalogSource::Inline("not json".to_string()).load().unwrap_err();
        assert!(matches!(err, CatalogError::Parse { .. }));
    }

    #[test]
    fn test_bad_url_is_rejected() {
        let json = r#"[{"name": "A", "downloadUrl": "ftp://a/down", "uploadUrl": "http://a/up"}]"#;
        let err = CatalogSource::Inline(json.to_string()).load().unwrap_err();
        assert!(matches!(err, CatalogError::InvalidServer { index: 0, .. }));
    }

    #[test]
    fn test_empty_list_is_valid() {
        let catalog = CatalogSource::Inline("[]".to_string()).load().unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = CatalogSource::File(PathBuf::from("/nonexistent/servers.json"))
            .load()
            .unwrap_err();
        assert!(matches!(err, CatalogError::Read { .. }));
    }

    #[test]
    fn test_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[[servers]]
name = "Lab"
downloadUrl = "http://10.0.0.2/down"
uploadUrl = "http://10.0.0.2/up"
uploadSizeBytes = 5000000
"#
        )
        .unwrap();
        let catalog = CatalogSource::File(file.path().to_path_buf()).load().unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get(0).unwrap().upload_size(), 5_000_000);
    }
}

//! Framework configuration.
//!
//! ```text
//! islet.toml
//!     → FrameworkConfig::load (read + toml deserialize, every section defaulted)
//!     → FrameworkConfig::validate (pattern compiles, extensions, API prefix)
//!     → shared via Arc by the scanner, renderer and app
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a route's HTML is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Rendered fresh for every request.
    Ssr,
    /// Rendered once, served from cache afterwards.
    #[default]
    Ssg,
    /// Cached, re-rendered in the background once stale.
    Isr,
    /// Static shell cached, dynamic regions rendered per request.
    Ppr,
}

impl RenderMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ssr => "ssr",
            Self::Ssg => "ssg",
            Self::Isr => "isr",
            Self::Ppr => "ppr",
        }
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenderMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ssr" => Ok(Self::Ssr),
            "ssg" => Ok(Self::Ssg),
            "isr" => Ok(Self::Isr),
            "ppr" => Ok(Self::Ppr),
            other => Err(ConfigError::Invalid(format!("unknown render mode `{other}`"))),
        }
    }
}

/// Development or production serving.
///
/// Development exposes error details in 500 pages, injects the HMR client and
/// watches the site directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Dev,
    Prod,
}

impl AppMode {
    pub fn is_dev(self) -> bool {
        self == Self::Dev
    }
}

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid route file pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    /// Directory holding route files, relative to the project root.
    pub site_dir: PathBuf,
    /// Output directory for static export.
    pub dist_dir: PathBuf,
    pub routes: RoutesConfig,
    pub rendering: RenderingConfig,
    pub inject: InjectConfig,
    pub server: ServerConfig,
    pub api: ApiConfig,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            site_dir: PathBuf::from("site"),
            dist_dir: PathBuf::from("dist"),
            routes: RoutesConfig::default(),
            rendering: RenderingConfig::default(),
            inject: InjectConfig::default(),
            server: ServerConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

/// Route discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
    /// Extensions (with leading dot) a route file may have.
    pub file_extensions: Vec<String>,
    /// Regex a route file name must match; capture group 1 is the segment token.
    pub route_file_pattern: String,
    /// Give directories without an index route their nearest ancestor's index.
    pub enable_index_fallback: bool,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            file_extensions: [".tsx", ".jsx", ".ts", ".js"]
                .into_iter()
                .map(String::from)
                .collect(),
            route_file_pattern: r"^([(\[].*)\.(?:tsx|jsx|ts|js)$".to_owned(),
            enable_index_fallback: true,
        }
    }
}

impl RoutesConfig {
    /// Compiles the route file pattern.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Pattern`] when the regex does not compile, and
    /// [`ConfigError::Invalid`] when it has no capture group.
    pub fn compiled_pattern(&self) -> Result<Regex, ConfigError> {
        let regex = Regex::new(&self.route_file_pattern).map_err(|source| ConfigError::Pattern {
            pattern: self.route_file_pattern.clone(),
            source,
        })?;
        if regex.captures_len() < 2 {
            return Err(ConfigError::Invalid(format!(
                "route file pattern `{}` must capture the segment token",
                self.route_file_pattern
            )));
        }
        Ok(regex)
    }
}

/// Render-mode defaults applied to every scanned route.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderingConfig {
    pub default_mode: RenderMode,
    /// ISR revalidation window; 0 never revalidates.
    pub default_revalidate_seconds: u64,
}

/// Markup injected into every document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectConfig {
    pub head: Vec<String>,
    pub body_end: Vec<String>,
}

impl Default for InjectConfig {
    fn default() -> Self {
        Self {
            head: vec![
                r#"<meta charset="utf-8">"#.to_owned(),
                r#"<meta name="viewport" content="width=device-width,initial-scale=1">"#
                    .to_owned(),
            ],
            body_end: Vec::new(),
        }
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "0.0.0.0".to_owned(),
            port: 5173,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// API route dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// URL prefix, starting and ending with `/`.
    pub prefix: String,
    /// Directory under the site root holding API modules; never scanned for pages.
    pub dir: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            prefix: "/api/".to_owned(),
            dir: "api".to_owned(),
        }
    }
}

impl FrameworkConfig {
    /// Reads, parses and validates a TOML config file.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] from reading, parsing or [`validate`](Self::validate).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    /// Checks the semantic constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Pattern`] or [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.routes.compiled_pattern()?;

        if self.routes.file_extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "routes.file_extensions must not be empty".to_owned(),
            ));
        }
        if let Some(ext) = self
            .routes
            .file_extensions
            .iter()
            .find(|ext| !ext.starts_with('.') || ext.len() < 2)
        {
            return Err(ConfigError::Invalid(format!(
                "route extension `{ext}` must start with `.`"
            )));
        }

        let prefix = &self.api.prefix;
        if !prefix.starts_with('/') || !prefix.ends_with('/') || prefix.len() < 2 {
            return Err(ConfigError::Invalid(format!(
                "api.prefix `{prefix}` must start and end with `/`"
            )));
        }
        Ok(())
    }

    /// Site directory resolved against `root`.
    pub fn site_root(&self, root: &Path) -> PathBuf {
        root.join(&self.site_dir)
    }
}

impl FromStr for FrameworkConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

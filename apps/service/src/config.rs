use std::{env, fmt, fs, path};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::browser::probe::BrowserMode;
use crate::error::{ConfigError, Violation};
use crate::monitoring::types::{CheckType, SiteEntry};

/// Shortest allowed check interval, in seconds
pub const MIN_CHECK_INTERVAL: u64 = 30;

pub const DEFAULT_CONFIG_PATH: &str = "./conf/websitebench.toml";
pub const DEFAULT_SECRETS_PATH: &str = "./conf/websitebench.secrets.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default)]
    pub allow_caching: bool,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_resource_errors: bool,
    #[serde(default)]
    pub ignore_ssl_errors: bool,
    /// Value of the `instance` tag on every point
    #[serde(default = "default_instance")]
    pub instance: String,
    #[serde(default = "default_repeat_count")]
    pub repeat_count: usize,
    #[serde(default = "default_true")]
    pub http_parallel: bool,
    #[serde(default)]
    pub browser_mode: BrowserMode,
    #[serde(default)]
    pub browser: BrowserSettings,
    pub influx_db: InfluxDbConfig,
    #[serde(default)]
    pub website_list: Vec<WebsiteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    pub no_sandbox: bool,
    pub executable_path: Option<path::PathBuf>,
    pub restart_interval_minutes: u64,
    pub max_restarts: u32,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            no_sandbox: false,
            executable_path: None,
            restart_interval_minutes: 30,
            max_restarts: 5,
        }
    }
}

impl BrowserSettings {
    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.restart_interval_minutes * 60)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfluxProtocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for InfluxProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfluxProtocol::Http => write!(f, "http"),
            InfluxProtocol::Https => write!(f, "https"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfluxAuthMethod {
    /// InfluxDB 1.x username/password
    #[default]
    Basic,
    /// InfluxDB 2.x API token
    Token,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxDbConfig {
    pub hostname: String,
    #[serde(default = "default_influx_port")]
    pub port: u16,
    pub database: String,
    #[serde(default = "default_influx_path")]
    pub path: String,
    #[serde(default)]
    pub protocol: InfluxProtocol,
    #[serde(default)]
    pub ignore_ssl: bool,
    #[serde(default)]
    pub auth_method: InfluxAuthMethod,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsiteConfig {
    pub site_name: String,
    pub site_url: String,
    /// Seconds
    pub check_interval: u64,
    #[serde(default)]
    pub check_type: CheckType,
    #[serde(default)]
    pub disabled: bool,
}

fn default_max_concurrent_jobs() -> usize {
    5
}

fn default_log_level() -> String {
    "info".into()
}

fn default_instance() -> String {
    env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "websitebench".into())
}

fn default_repeat_count() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_influx_port() -> u16 {
    8086
}

fn default_influx_path() -> String {
    "/".into()
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

fn read_table(path: &path::Path) -> Result<toml::Table, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    raw.parse::<toml::Table>().map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Overlay `secrets` onto `base`. Tables merge key by key, anything else is replaced.
fn merge_tables(base: &mut toml::Table, secrets: toml::Table) {
    for (key, value) in secrets {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(overlay)) => {
                merge_tables(existing, overlay);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or_default().is_empty()
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);
        let write_2 = write_indented(2);

        writeln!(f, "Current Configuration:")?;
        write_1(f, "Max Concurrent Jobs", &self.max_concurrent_jobs)?;
        write_1(f, "Repeat Count", &self.repeat_count)?;
        write_1(f, "Instance", &self.instance)?;
        write_1(f, "Allow Caching", &self.allow_caching)?;
        write_title_1(f, "Browser")?;
        write_2(f, "Headless", &self.browser.headless)?;
        write_2(f, "Restart Interval (min)", &self.browser.restart_interval_minutes)?;
        write_2(f, "Max Restarts", &self.browser.max_restarts)?;
        write_title_1(f, "InfluxDB")?;
        write_2(f, "Address", &format!(
            "{}://{}:{}{}",
            self.influx_db.protocol, self.influx_db.hostname, self.influx_db.port, self.influx_db.path
        ))?;
        write_2(f, "Database", &self.influx_db.database)?;
        write_title_1(f, "Websites")?;
        for site in &self.website_list {
            let state = if site.disabled { " (disabled)" } else { "" };
            write_2(f, &site.site_name, &format!(
                "{} every {}s via {}{}",
                site.site_url, site.check_interval, site.check_type, state
            ))?;
        }

        Ok(())
    }
}

impl Config {
    /// Load the main config file and overlay the secrets file.
    ///
    /// A missing secrets file is only an error when its path was given
    /// explicitly.
    pub fn load(
        config_path: Option<&path::Path>,
        secrets_path: Option<&path::Path>,
    ) -> Result<Self, ConfigError> {
        let config_path = config_path
            .map(normalize_toml_path)
            .unwrap_or_else(|| path::PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut table = read_table(&config_path)?;

        let secrets = match secrets_path {
            Some(path) => Some(read_table(&normalize_toml_path(path))?),
            None => {
                let default = path::Path::new(DEFAULT_SECRETS_PATH);
                if default.exists() { Some(read_table(default)?) } else { None }
            }
        };
        if let Some(secrets) = secrets {
            merge_tables(&mut table, secrets);
        }

        let config: Config = toml::Value::Table(table)
            .try_into()
            .map_err(|source| ConfigError::Parse { path: config_path.clone(), source })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every rule and report all violations at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();

        if self.max_concurrent_jobs == 0 {
            violations.push(Violation::new("max_concurrent_jobs", "must be at least 1"));
        }
        if self.repeat_count == 0 {
            violations.push(Violation::new("repeat_count", "must be at least 1"));
        }
        if self.user_agent.is_some() && is_blank(&self.user_agent) {
            violations.push(Violation::new("user_agent", "cannot be empty"));
        }
        if logger::Level::parse(&self.log_level).is_none() {
            violations.push(Violation::new("log_level", format!("unknown level \"{}\"", self.log_level)));
        }
        if self.browser.max_restarts == 0 {
            violations.push(Violation::new("browser.max_restarts", "must be at least 1"));
        }
        if self.browser.restart_interval_minutes == 0 {
            violations.push(Violation::new("browser.restart_interval_minutes", "must be at least 1"));
        }

        let influx = &self.influx_db;
        if influx.hostname.trim().is_empty() {
            violations.push(Violation::new("influx_db.hostname", "cannot be empty"));
        }
        if influx.database.trim().is_empty() {
            violations.push(Violation::new("influx_db.database", "cannot be empty"));
        }
        match influx.auth_method {
            InfluxAuthMethod::Basic => {
                if influx.username.is_some() && is_blank(&influx.password) {
                    violations.push(Violation::new("influx_db.password", "required with a username"));
                }
            }
            InfluxAuthMethod::Token => {
                if is_blank(&influx.token) {
                    violations.push(Violation::new("influx_db.token", "required for token authentication"));
                }
                if is_blank(&influx.organization) {
                    violations.push(Violation::new("influx_db.organization", "required for token authentication"));
                }
            }
        }

        if self.website_list.is_empty() {
            violations.push(Violation::new("website_list", "at least one website is required"));
        }
        for (index, site) in self.website_list.iter().enumerate() {
            let property = |field: &str| format!("website_list[{index}].{field}");
            if site.site_name.trim().is_empty() {
                violations.push(Violation::new(property("site_name"), "cannot be empty"));
            }
            if let Err(message) = parse_site_url(&site.site_url) {
                violations.push(Violation::new(property("site_url"), message));
            }
            if site.check_interval < MIN_CHECK_INTERVAL {
                violations.push(Violation::new(
                    property("check_interval"),
                    format!("must be at least {MIN_CHECK_INTERVAL} seconds"),
                ));
            }
        }

        if violations.is_empty() { Ok(()) } else { Err(ConfigError::Invalid(violations)) }
    }

    /// Sites as schedulable entries. Call after `validate`.
    pub fn site_entries(&self) -> Result<Vec<SiteEntry>, ConfigError> {
        self.website_list
            .iter()
            .enumerate()
            .map(|(index, site)| {
                let url = parse_site_url(&site.site_url).map_err(|message| {
                    ConfigError::Invalid(vec![Violation::new(format!("website_list[{index}].site_url"), message)])
                })?;
                Ok(SiteEntry {
                    name: site.site_name.trim().to_string(),
                    url,
                    check_interval: Duration::from_secs(site.check_interval),
                    check_type: site.check_type,
                    disabled: site.disabled,
                })
            })
            .collect()
    }

    /// Whether any enabled site needs the shared browser
    pub fn needs_browser(&self) -> bool {
        self.website_list
            .iter()
            .any(|site| !site.disabled && site.check_type == CheckType::Browser)
    }

    /// Longest enabled check interval, used to bound browser command timeouts
    pub fn longest_interval(&self) -> Duration {
        let secs = self
            .website_list
            .iter()
            .filter(|site| !site.disabled)
            .map(|site| site.check_interval)
            .max()
            .unwrap_or(MIN_CHECK_INTERVAL);
        Duration::from_secs(secs)
    }
}

fn parse_site_url(raw: &str) -> Result<Url, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("cannot be empty".into());
    }
    let url = Url::parse(raw).map_err(|e| format!("\"{raw}\" is not a valid URL: {e}"))?;
    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(url),
        "http" | "https" => Err(format!("\"{raw}\" has no host")),
        other => Err(format!("unsupported scheme \"{other}\"")),
    }
}

#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

/// Default config path: `~/.shadow/relay.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".shadow").join("relay.toml"))
}

/// Load the relay config from TOML (if present) and process environment overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	Ok(cfg)
}

/// String that never shows up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
	#[error("missing required settings: {}", .0.join(", "))]
	MissingCredentials(Vec<&'static str>),

	#[error("force_tls is on but no TLS certificate/key is configured (set SHADOW_TLS_CERT and SHADOW_TLS_KEY)")]
	TlsMaterialMissing,
}

/// Relay config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub app: AppSettings,
	pub server: ServerSettings,
	pub limits: LimitSettings,
}

/// Application identity. All four credentials are required.
#[derive(Debug, Clone)]
pub struct AppSettings {
	pub app_id: Option<String>,
	/// Public key clients present in `Hello`.
	pub app_key: Option<String>,
	/// Signing secret for authorization grants.
	pub app_secret: Option<SecretString>,
	pub cluster: Option<String>,
	pub force_tls: bool,
}

impl Default for AppSettings {
	fn default() -> Self {
		Self {
			app_id: None,
			app_key: None,
			app_secret: None,
			cluster: None,
			force_tls: true,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	pub tls_cert_path: Option<PathBuf>,
	pub tls_key_path: Option<PathBuf>,
	/// Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// `/healthz` + `/readyz` bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LimitSettings {
	pub grant_ttl: Duration,
	pub max_outstanding_grants: usize,
	pub publish_rate_limit_per_conn_burst: u32,
	pub publish_rate_limit_per_conn_per_minute: u32,
	pub publish_rate_limit_per_channel_burst: u32,
	pub publish_rate_limit_per_channel_per_minute: u32,
	pub max_message_chars: usize,
	pub subscriber_queue_capacity: usize,
}

impl Default for LimitSettings {
	fn default() -> Self {
		Self {
			grant_ttl: Duration::from_secs(30),
			max_outstanding_grants: 4096,
			publish_rate_limit_per_conn_burst: 20,
			publish_rate_limit_per_conn_per_minute: 120,
			publish_rate_limit_per_channel_burst: 10,
			publish_rate_limit_per_channel_per_minute: 60,
			max_message_chars: 2000,
			subscriber_queue_capacity: 256,
		}
	}
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = LimitSettings::default();
		let non_blank = |s: Option<String>| s.filter(|s| !s.trim().is_empty());

		Self {
			app: AppSettings {
				app_id: non_blank(file.app.app_id),
				app_key: non_blank(file.app.app_key),
				app_secret: non_blank(file.app.app_secret).map(SecretString::new),
				cluster: non_blank(file.app.cluster),
				force_tls: file.app.force_tls.unwrap_or(true),
			},
			server: ServerSettings {
				tls_cert_path: non_blank(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_blank(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_blank(file.server.metrics_bind),
				health_bind: non_blank(file.server.health_bind),
			},
			limits: LimitSettings {
				grant_ttl: file
					.limits
					.grant_ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.grant_ttl),
				max_outstanding_grants: file.limits.max_outstanding_grants.unwrap_or(defaults.max_outstanding_grants),
				publish_rate_limit_per_conn_burst: file
					.limits
					.publish_rate_limit_per_conn_burst
					.unwrap_or(defaults.publish_rate_limit_per_conn_burst),
				publish_rate_limit_per_conn_per_minute: file
					.limits
					.publish_rate_limit_per_conn_per_minute
					.unwrap_or(defaults.publish_rate_limit_per_conn_per_minute),
				publish_rate_limit_per_channel_burst: file
					.limits
					.publish_rate_limit_per_channel_burst
					.unwrap_or(defaults.publish_rate_limit_per_channel_burst),
				publish_rate_limit_per_channel_per_minute: file
					.limits
					.publish_rate_limit_per_channel_per_minute
					.unwrap_or(defaults.publish_rate_limit_per_channel_per_minute),
				max_message_chars: file
					.limits
					.max_message_chars
					.filter(|v| *v > 0)
					.unwrap_or(defaults.max_message_chars),
				subscriber_queue_capacity: file
					.limits
					.subscriber_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.subscriber_queue_capacity),
			},
		}
	}

	/// Refuse to run on incomplete credentials or with TLS required but unconfigured.
	pub fn validate(&self) -> Result<(), ConfigError> {
		let mut missing = Vec::new();
		if self.app.app_id.is_none() {
			missing.push("SHADOW_APP_ID");
		}
		if self.app.app_key.is_none() {
			missing.push("SHADOW_APP_KEY");
		}
		if self.app.app_secret.is_none() {
			missing.push("SHADOW_APP_SECRET");
		}
		if self.app.cluster.is_none() {
			missing.push("SHADOW_CLUSTER");
		}
		if !missing.is_empty() {
			return Err(ConfigError::MissingCredentials(missing));
		}

		if self.app.force_tls && (self.server.tls_cert_path.is_none() || self.server.tls_key_path.is_none()) {
			return Err(ConfigError::TlsMaterialMissing);
		}

		Ok(())
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	app: FileAppSettings,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	limits: FileLimitSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAppSettings {
	app_id: Option<String>,
	app_key: Option<String>,
	app_secret: Option<String>,
	cluster: Option<String>,
	force_tls: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLimitSettings {
	grant_ttl_secs: Option<u64>,
	max_outstanding_grants: Option<usize>,
	publish_rate_limit_per_conn_burst: Option<u32>,
	publish_rate_limit_per_conn_per_minute: Option<u32>,
	publish_rate_limit_per_channel_burst: Option<u32>,
	publish_rate_limit_per_channel_per_minute: Option<u32>,
	max_message_chars: Option<usize>,
	subscriber_queue_capacity: Option<usize>,
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => parse_toml(&s).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

/// Apply `SHADOW_*` overrides using `lookup` as the environment.
pub(crate) fn apply_env_overrides<F>(cfg: &mut ServerConfig, lookup: F)
where
	F: Fn(&str) -> Option<String>,
{
	let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = text("SHADOW_APP_ID") {
		cfg.app.app_id = Some(v);
		info!("app config: app_id overridden by env");
	}

	if let Some(v) = text("SHADOW_APP_KEY") {
		cfg.app.app_key = Some(v);
		info!("app config: app_key overridden by env");
	}

	if let Some(v) = text("SHADOW_APP_SECRET") {
		cfg.app.app_secret = Some(SecretString::new(v));
		info!("app config: app_secret overridden by env");
	}

	if let Some(v) = text("SHADOW_CLUSTER") {
		cfg.app.cluster = Some(v);
		info!("app config: cluster overridden by env");
	}

	if let Some(v) = text("SHADOW_FORCE_TLS") {
		match parse_env_bool(&v) {
			Some(force_tls) => {
				cfg.app.force_tls = force_tls;
				info!(force_tls, "app config: force_tls overridden by env");
			}
			None => {
				cfg.app.force_tls = true;
				warn!(value = %v, "app config: SHADOW_FORCE_TLS is not a boolean; keeping TLS enforced");
			}
		}
	}

	if let Some(v) = text("SHADOW_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = text("SHADOW_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = text("SHADOW_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = text("SHADOW_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = text("SHADOW_GRANT_TTL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.limits.grant_ttl = Duration::from_secs(secs);
		info!(secs, "limits: grant_ttl overridden by env");
	}

	if let Some(v) = text("SHADOW_MAX_OUTSTANDING_GRANTS")
		&& let Ok(max) = v.parse::<usize>()
	{
		cfg.limits.max_outstanding_grants = max;
		info!(max, "limits: max_outstanding_grants overridden by env");
	}

	if let Some(v) = text("SHADOW_PUBLISH_RATE_LIMIT_PER_CONN_BURST")
		&& let Ok(burst) = v.parse::<u32>()
	{
		cfg.limits.publish_rate_limit_per_conn_burst = burst;
		info!(burst, "limits: publish_rate_limit_per_conn_burst overridden by env");
	}

	if let Some(v) = text("SHADOW_PUBLISH_RATE_LIMIT_PER_CONN_PER_MINUTE")
		&& let Ok(rate) = v.parse::<u32>()
	{
		cfg.limits.publish_rate_limit_per_conn_per_minute = rate;
		info!(rate, "limits: publish_rate_limit_per_conn_per_minute overridden by env");
	}

	if let Some(v) = text("SHADOW_PUBLISH_RATE_LIMIT_PER_CHANNEL_BURST")
		&& let Ok(burst) = v.parse::<u32>()
	{
		cfg.limits.publish_rate_limit_per_channel_burst = burst;
		info!(burst, "limits: publish_rate_limit_per_channel_burst overridden by env");
	}

	if let Some(v) = text("SHADOW_PUBLISH_RATE_LIMIT_PER_CHANNEL_PER_MINUTE")
		&& let Ok(rate) = v.parse::<u32>()
	{
		cfg.limits.publish_rate_limit_per_channel_per_minute = rate;
		info!(rate, "limits: publish_rate_limit_per_channel_per_minute overridden by env");
	}

	if let Some(v) = text("SHADOW_MAX_MESSAGE_CHARS")
		&& let Ok(max) = v.parse::<usize>()
		&& max > 0
	{
		cfg.limits.max_message_chars = max;
		info!(max, "limits: max_message_chars overridden by env");
	}

	if !cfg.app.force_tls {
		warn!("app config: force_tls is off; the relay will accept a self-signed development certificate");
	}
}

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

use crate::server::assistant::AssistantConfig;
use crate::server::hub::HubConfig;
use crate::server::router::RouterConfig;

/// Default config path: `~/.syncroom/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".syncroom").join("config.toml"))
}

/// Load the core config from TOML and env overrides.
pub fn load_core_config() -> anyhow::Result<CoreConfig> {
	let path = default_config_path()?;
	load_core_config_from_path(&path)
}

/// Same as `load_core_config` but with an explicit config path.
pub fn load_core_config_from_path(path: &Path) -> anyhow::Result<CoreConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = CoreConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Core config (v1).
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
	pub hub: HubConfig,
	pub assistant: AssistantConfig,
	pub router: RouterConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	hub: FileHubSettings,

	#[serde(default)]
	assistant: FileAssistantSettings,

	#[serde(default)]
	router: FileRouterSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHubSettings {
	queue_capacity: Option<usize>,
	debug_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAssistantSettings {
	directive: Option<String>,
	history_limit: Option<usize>,
	completion_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRouterSettings {
	debug_log_events: Option<bool>,
}

impl CoreConfig {
	fn from_file(file: FileConfig) -> Self {
		let hub_defaults = HubConfig::default();
		let assistant_defaults = AssistantConfig::default();

		Self {
			hub: HubConfig {
				queue_capacity: file.hub.queue_capacity.filter(|c| *c > 0).unwrap_or(hub_defaults.queue_capacity),
				debug_logs: file.hub.debug_logs.unwrap_or(hub_defaults.debug_logs),
			},
			assistant: AssistantConfig {
				directive: file
					.assistant
					.directive
					.map(|d| d.trim().to_string())
					.filter(|d| !d.is_empty())
					.unwrap_or(assistant_defaults.directive),
				history_limit: file
					.assistant
					.history_limit
					.filter(|l| *l > 0)
					.unwrap_or(assistant_defaults.history_limit),
				completion_timeout: file
					.assistant
					.completion_timeout_secs
					.filter(|s| *s > 0)
					.map(Duration::from_secs)
					.unwrap_or(assistant_defaults.completion_timeout),
			},
			router: RouterConfig {
				debug_log_events: file.router.debug_log_events.unwrap_or_default(),
			},
		}
	}
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
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut CoreConfig) {
	if let Ok(v) = std::env::var("SYNCROOM_ASSISTANT_DIRECTIVE") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.assistant.directive = v;
			info!("assistant config: directive overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SYNCROOM_ASSISTANT_HISTORY_LIMIT")
		&& let Ok(limit) = v.trim().parse::<usize>()
		&& limit > 0
	{
		cfg.assistant.history_limit = limit;
		info!("assistant config: history_limit overridden by env");
	}

	if let Ok(v) = std::env::var("SYNCROOM_ASSISTANT_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.assistant.completion_timeout = Duration::from_secs(secs);
		info!("assistant config: completion_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("SYNCROOM_HUB_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.hub.queue_capacity = capacity;
		info!("hub config: queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("SYNCROOM_DEBUG_EVENTS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.hub.debug_logs = enabled;
		cfg.router.debug_log_events = enabled;
		info!("config: event debug logging overridden by env");
	}
}

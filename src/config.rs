//! Process configuration, layered the usual way: environment variables win
//! over the config file, defaults fill the rest.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::http::codec::Limits;

const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
const DEFAULT_CA_DIR: &str = ".";
const DEFAULT_VERDICT_TIMEOUT_SECS: u64 = 5 * 60;
const DEFAULT_CERT_CACHE_CAPACITY: usize = 1024;

/// Everything optional, as read from the YAML file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	pub listen: Option<SocketAddr>,
	pub ca_cert_path: Option<PathBuf>,
	pub ca_key_path: Option<PathBuf>,
	pub verdict_timeout_secs: Option<u64>,
	pub max_line_bytes: Option<usize>,
	pub max_header_bytes: Option<usize>,
	pub max_body_bytes: Option<usize>,
	pub cert_cache_capacity: Option<usize>,
	pub review_responses: Option<bool>,
	pub upstream_connect_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct Config {
	pub listen: SocketAddr,
	pub ca_cert_path: PathBuf,
	pub ca_key_path: PathBuf,
	pub verdict_timeout: Duration,
	pub limits: Limits,
	pub cert_cache_capacity: usize,
	/// Hold origin responses of reviewed requests for a symmetric verdict.
	pub review_responses: bool,
	pub upstream_connect_timeout: Duration,
}

impl Default for Config {
	fn default() -> Self {
		parse_config(RawConfig::default()).expect("defaults are valid")
	}
}

/// Loads the optional config file, then folds in the environment.
pub fn load(file: Option<&std::path::Path>) -> anyhow::Result<Config> {
	let raw = match file {
		Some(path) => {
			let contents = std::fs::read_to_string(path)
				.with_context(|| format!("read config file {}", path.display()))?;
			serde_yaml::from_str(&contents)
				.with_context(|| format!("parse config file {}", path.display()))?
		},
		None => RawConfig::default(),
	};
	parse_config(raw)
}

pub fn parse_config(raw: RawConfig) -> anyhow::Result<Config> {
	let listen = parse::<SocketAddr>("LISTEN_ADDRESS")?
		.or(raw.listen)
		.unwrap_or_else(|| DEFAULT_LISTEN.parse().expect("default listen address is valid"));
	let ca_dir = PathBuf::from(DEFAULT_CA_DIR);
	let ca_cert_path = parse::<PathBuf>("CA_CERT_PATH")?
		.or(raw.ca_cert_path)
		.unwrap_or_else(|| ca_dir.join("ca.crt"));
	let ca_key_path = parse::<PathBuf>("CA_KEY_PATH")?
		.or(raw.ca_key_path)
		.unwrap_or_else(|| ca_dir.join("ca.key"));
	let verdict_timeout = Duration::from_secs(
		parse::<u64>("VERDICT_TIMEOUT_SECS")?
			.or(raw.verdict_timeout_secs)
			.unwrap_or(DEFAULT_VERDICT_TIMEOUT_SECS),
	);

	let defaults = Limits::default();
	let limits = Limits {
		max_line_bytes: parse::<usize>("MAX_LINE_BYTES")?
			.or(raw.max_line_bytes)
			.unwrap_or(defaults.max_line_bytes),
		max_header_bytes: parse::<usize>("MAX_HEADER_BYTES")?
			.or(raw.max_header_bytes)
			.unwrap_or(defaults.max_header_bytes),
		max_body_bytes: parse::<usize>("MAX_BODY_BYTES")?
			.or(raw.max_body_bytes)
			.unwrap_or(defaults.max_body_bytes),
	};

	Ok(Config {
		listen,
		ca_cert_path,
		ca_key_path,
		verdict_timeout,
		limits,
		cert_cache_capacity: parse::<usize>("CERT_CACHE_CAPACITY")?
			.or(raw.cert_cache_capacity)
			.unwrap_or(DEFAULT_CERT_CACHE_CAPACITY),
		review_responses: parse::<bool>("REVIEW_RESPONSES")?
			.or(raw.review_responses)
			.unwrap_or(false),
		upstream_connect_timeout: Duration::from_secs(
			parse::<u64>("UPSTREAM_CONNECT_TIMEOUT_SECS")?
				.or(raw.upstream_connect_timeout_secs)
				.unwrap_or(10),
		),
	})
}

fn parse<T: FromStr>(env_name: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
	match env::var(env_name) {
		Ok(val) if !val.is_empty() => val
			.parse::<T>()
			.map(Some)
			.with_context(|| format!("invalid env var {env_name}={val}")),
		_ => Ok(None),
	}
}

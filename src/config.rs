//! `.proxy` file parsing: a deliberately small INI-like format with one
//! `HOST` section and any number of ordered upstream sections.
//!
//! ```text
//! [HOST]
//! Port=9100
//! PosType=PASSPORT
//!
//! [CLIENT-1]
//! Remote=10.0.0.5
//! Port=9200
//! CardMasks=4250,4251
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::upstream::UpstreamConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{path}: no [HOST] section")]
    MissingHost { path: String },
    #[error("{path}: [HOST] is missing required key {key}")]
    MissingHostKey { path: String, key: &'static str },
    #[error("{path}: {section} is missing required key {key}")]
    MissingClientKey {
        path: String,
        section: String,
        key: &'static str,
    },
    #[error("{path}: {section}.{key} value {value:?} is not a valid {expected}")]
    InvalidValue {
        path: String,
        section: String,
        key: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("{path}: unsupported PosType {pos_type:?}, only PASSPORT is defined")]
    UnsupportedPosType { path: String, pos_type: String },
    #[error("{path}: {0}")]
    Io(String, #[source] std::io::Error),
}

/// A fully parsed and validated `.proxy` file.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_port: u16,
    pub pos_kind: String,
    pub upstreams: Vec<UpstreamConfig>,
}

/// A bare `key = value` section, in file order, before validation.
struct RawSection {
    name: String,
    entries: HashMap<String, String>,
}

/// Parse and validate a single `.proxy` file.
pub fn load(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let path_str = path.display().to_string();
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(path_str.clone(), e))?;
    let sections = parse_sections(&text);

    let host = sections
        .iter()
        .find(|s| s.name.eq_ignore_ascii_case("HOST"))
        .ok_or_else(|| ConfigError::MissingHost {
            path: path_str.clone(),
        })?;

    let listen_port = required(&path_str, "HOST", host, "Port")?;
    let listen_port: u16 = listen_port.parse().map_err(|_| ConfigError::InvalidValue {
        path: path_str.clone(),
        section: "HOST".to_string(),
        key: "Port",
        value: listen_port.clone(),
        expected: "u16",
    })?;
    let pos_kind = required(&path_str, "HOST", host, "PosType")?.clone();
    if !pos_kind.eq_ignore_ascii_case("PASSPORT") {
        return Err(ConfigError::UnsupportedPosType {
            path: path_str.clone(),
            pos_type: pos_kind,
        });
    }

    // Every section besides HOST and the conventional INI DEFAULT
    // section is an upstream definition, kept in file declaration
    // order — the first one is the default upstream.
    let client_sections: Vec<&RawSection> = sections
        .iter()
        .filter(|s| !s.name.eq_ignore_ascii_case("HOST") && !s.name.eq_ignore_ascii_case("DEFAULT"))
        .collect();

    let mut upstreams = Vec::with_capacity(client_sections.len());
    for section in client_sections {
        upstreams.push(load_upstream(&path_str, section)?);
    }

    Ok(ProxyConfig {
        listen_port,
        pos_kind,
        upstreams,
    })
}

fn load_upstream(path: &str, section: &RawSection) -> Result<UpstreamConfig, ConfigError> {
    let host = required(path, &section.name, section, "Remote")?.clone();
    let port_str = required(path, &section.name, section, "Port")?;
    let port: u16 = port_str.parse().map_err(|_| ConfigError::InvalidValue {
        path: path.to_string(),
        section: section.name.clone(),
        key: "Port",
        value: port_str.clone(),
        expected: "u16",
    })?;
    let masks = section
        .entries
        .get("cardmasks")
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    let mut config = UpstreamConfig::new(host, port, masks);
    if let Some(secs) = section.entries.get("connecttimeoutsecs") {
        config.connect_timeout = parse_secs(path, &section.name, "ConnectTimeoutSecs", secs)?;
    }
    if let Some(secs) = section.entries.get("retrytimeoutsecs") {
        config.retry_timeout = parse_secs(path, &section.name, "RetryTimeoutSecs", secs)?;
    }
    if let Some(secs) = section.entries.get("responsetimeoutsecs") {
        config.response_timeout = parse_secs(path, &section.name, "ResponseTimeoutSecs", secs)?;
    }
    Ok(config)
}

fn parse_secs(
    path: &str,
    section: &str,
    key: &'static str,
    value: &str,
) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::InvalidValue {
            path: path.to_string(),
            section: section.to_string(),
            key,
            value: value.to_string(),
            expected: "u64 seconds",
        })
}

fn required<'a>(
    path: &str,
    section_name: &str,
    section: &'a RawSection,
    key: &'static str,
) -> Result<&'a String, ConfigError> {
    section
        .entries
        .get(&key.to_ascii_lowercase())
        .ok_or_else(|| {
            if section_name.eq_ignore_ascii_case("HOST") {
                ConfigError::MissingHostKey {
                    path: path.to_string(),
                    key,
                }
            } else {
                ConfigError::MissingClientKey {
                    path: path.to_string(),
                    section: section_name.to_string(),
                    key,
                }
            }
        })
}

fn parse_sections(text: &str) -> Vec<RawSection> {
    let mut sections = Vec::new();
    let mut current: Option<RawSection> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            current = Some(RawSection {
                name: name.trim().to_string(),
                entries: HashMap::new(),
            });
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if let Some(section) = current.as_mut() {
                section
                    .entries
                    .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }
    }
    if let Some(section) = current.take() {
        sections.push(section);
    }
    sections
}

//! Deployment configuration.
//!
//! One TOML document per deployment. The `[snap_hal]` table configures the
//! device layer; each backend binary additionally reads its own table
//! (`[local_mirror]`, `[nfs]`, `[kv]`), and the software transport reads
//! `[rvfs]`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot open config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub snap_hal: HalConfig,
    pub rvfs: Option<RvfsConfig>,
    pub local_mirror: Option<MirrorConfig>,
    pub nfs: Option<NfsConfig>,
    pub kv: Option<KvConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HalConfig {
    /// Emulation-manager device name of the DPU vendor SDK.
    pub emu_manager: String,
    /// Physical functions to emulate, one device each.
    pub pf_ids: Vec<u16>,
    /// Virtio queue depth, power of two.
    pub queue_depth: u32,
    /// Polling threads; never more than there are devices.
    pub nthreads: u16,
    /// 0 busy-polls; > 0 sleeps this long between polls.
    #[serde(default)]
    pub polling_interval_usec: u64,
    /// Mount tag the host sees.
    pub tag: String,
    /// Declared but idle functions, polled at 1 Hz by a background thread.
    #[serde(default)]
    pub mock_pf_ids: Vec<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RvfsConfig {
    /// `host:udp_port` the gateway listens on.
    pub remote_uri: String,
    pub dpu_uri: Option<String>,
    #[serde(default)]
    pub two_threads: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    /// Directory mirrored to the host.
    pub dir: PathBuf,
    /// When true the host may cache metadata for 24 hours, otherwise not at
    /// all.
    #[serde(default)]
    pub cached: bool,
}

impl MirrorConfig {
    /// Metadata attribute/entry timeout handed to the host.
    pub fn timeout(&self) -> std::time::Duration {
        if self.cached {
            std::time::Duration::from_secs(24 * 60 * 60)
        } else {
            std::time::Duration::ZERO
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NfsConfig {
    /// Server hostname or address, optionally `host:port` (default 2049).
    pub server: String,
    /// Absolute export path on the server.
    pub export: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KvConfig {
    pub ramcloud_coordinator: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let hal = &self.snap_hal;
        if hal.pf_ids.is_empty() {
            return Err(invalid("pf_ids must name at least one physical function"));
        }
        if hal.queue_depth < 1 || !hal.queue_depth.is_power_of_two() {
            return Err(invalid("queue_depth must be a power of 2 and >= 1"));
        }
        if hal.nthreads < 1 || hal.nthreads as usize > hal.pf_ids.len() {
            return Err(invalid(
                "nthreads must be >= 1 and no larger than the number of devices",
            ));
        }
        for mock in &hal.mock_pf_ids {
            if hal.pf_ids.contains(mock) {
                return Err(invalid(format!(
                    "mock pf {mock} must not also be present in pf_ids"
                )));
            }
        }
        if let Some(nfs) = &self.nfs {
            if !nfs.export.starts_with('/') {
                return Err(invalid("nfs export must start with a '/'"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(text: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    const BASE: &str = r#"
        [snap_hal]
        emu_manager = "mlx5_0"
        pf_ids = [0, 1]
        queue_depth = 64
        nthreads = 2
        polling_interval_usec = 0
        tag = "dpfs"
    "#;

    #[test]
    fn accepts_minimal_config() {
        let c = parse(BASE).unwrap();
        assert_eq!(c.snap_hal.pf_ids, vec![0, 1]);
        assert_eq!(c.snap_hal.queue_depth, 64);
        assert!(c.snap_hal.mock_pf_ids.is_empty());
    }

    #[test]
    fn rejects_bad_queue_depth() {
        let text = BASE.replace("queue_depth = 64", "queue_depth = 63");
        assert!(matches!(parse(&text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_excess_threads() {
        let text = BASE.replace("nthreads = 2", "nthreads = 3");
        assert!(matches!(parse(&text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_overlapping_mock_pfs() {
        let text = format!("{BASE}\nmock_pf_ids = [1]\n");
        // mock_pf_ids belongs to [snap_hal]; appended lines still land there
        assert!(matches!(parse(&text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_relative_export() {
        let text = format!("{BASE}\n[nfs]\nserver = \"10.0.0.1\"\nexport = \"data\"\n");
        assert!(matches!(parse(&text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn mirror_timeout_follows_cached() {
        let text = format!("{BASE}\n[local_mirror]\ndir = \"/tmp\"\ncached = true\n");
        let c = parse(&text).unwrap();
        assert_eq!(
            c.local_mirror.unwrap().timeout(),
            std::time::Duration::from_secs(86400)
        );
        let text = format!("{BASE}\n[local_mirror]\ndir = \"/tmp\"\n");
        let c = parse(&text).unwrap();
        assert_eq!(c.local_mirror.unwrap().timeout(), std::time::Duration::ZERO);
    }
}

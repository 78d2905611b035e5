// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTP backend-extension configuration files.
//!
//! Accelerator graphs for Qualcomm Hexagon (HTP) are compiled with a JSON
//! backend-extension config describing the target DSP and graph options,
//! plus a small "link" file that points the converter tools at the
//! extension library and that config.  This module renders both.
//!
//! # Usage
//!
//! ```
//! use rwkv_chunks::htp::HtpBackendConfig;
//!
//! let config = HtpBackendConfig::for_soc("SM8650", &["librwkv-chunk0"]).unwrap();
//! assert_eq!(config.graphs[0].graph_names, vec!["rwkv_chunk0"]);
//! assert_eq!(config.devices[0].soc_id, 57);
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RwkvError};

// ---------------------------------------------------------------------------
// SoC table
// ---------------------------------------------------------------------------

/// DSP identification of one supported SoC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtpDevice {
    /// Marketing part number, e.g. `"SM8650"`.
    pub soc: &'static str,
    /// Hexagon architecture revision.
    pub dsp_arch: &'static str,
    /// SoC id understood by the HTP backend.
    pub soc_id: u32,
}

/// SoCs with a known DSP architecture.
pub const HTP_DEVICES: &[HtpDevice] = &[
    HtpDevice {
        soc: "SM8650",
        dsp_arch: "v75",
        soc_id: 57,
    },
    HtpDevice {
        soc: "SM8550",
        dsp_arch: "v73",
        soc_id: 43,
    },
    HtpDevice {
        soc: "SC8380",
        dsp_arch: "v73",
        soc_id: 60,
    },
];

/// Look up a SoC by part number (exact match).
#[must_use]
pub fn lookup_soc(soc: &str) -> Option<&'static HtpDevice> {
    HTP_DEVICES.iter().find(|d| d.soc == soc)
}

/// Graph name as the HTP backend expects it: library prefix dropped and
/// dashes replaced by underscores.
#[must_use]
pub fn normalize_graph_name(name: &str) -> String {
    name.replace("lib", "").replace('-', "_")
}

// ---------------------------------------------------------------------------
// Backend config
// ---------------------------------------------------------------------------

/// Per-graph compilation options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtpGraphOptions {
    /// On-chip TCM budget in MiB.
    pub vtcm_mb: u32,
    /// Graph optimization level.
    #[serde(rename = "O")]
    pub optimization_level: u32,
    /// Graphs these options apply to.
    pub graph_names: Vec<String>,
    /// Allow relaxed fp16 precision (`1`) or not (`0`).
    pub fp16_relaxed_precision: u8,
}

/// One DSP core's performance setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtpCoreOptions {
    /// Core index.
    pub core_id: u32,
    /// Power/performance profile name.
    pub perf_profile: String,
}

/// Target device description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtpDeviceOptions {
    /// Hexagon architecture revision.
    pub dsp_arch: String,
    /// Device index.
    pub device_id: u32,
    /// SoC id.
    pub soc_id: u32,
    /// Protection-domain session type.
    pub pd_session: String,
    /// Core settings.
    pub cores: Vec<HtpCoreOptions>,
}

/// Root of the backend-extension config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtpBackendConfig {
    /// Graph option groups.
    pub graphs: Vec<HtpGraphOptions>,
    /// Target devices.
    pub devices: Vec<HtpDeviceOptions>,
}

impl HtpBackendConfig {
    /// Config for compiling `graph_names` on `soc`: 8 MiB VTCM, `-O3`,
    /// relaxed fp16, one unsigned-PD device with core 0 in burst mode.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::Config`] for an unknown SoC or an empty graph
    /// list.
    pub fn for_soc(soc: &str, graph_names: &[impl AsRef<str>]) -> Result<Self> {
        let device =
            lookup_soc(soc).ok_or_else(|| RwkvError::Config(format!("invalid SoC name: {soc}")))?;
        if graph_names.is_empty() {
            return Err(RwkvError::Config("no graph names given".into()));
        }

        Ok(Self {
            graphs: vec![HtpGraphOptions {
                vtcm_mb: 8,
                optimization_level: 3,
                graph_names: graph_names
                    .iter()
                    .map(|n| normalize_graph_name(n.as_ref()))
                    .collect(),
                fp16_relaxed_precision: 1,
            }],
            devices: vec![HtpDeviceOptions {
                dsp_arch: device.dsp_arch.to_owned(),
                device_id: 0,
                soc_id: device.soc_id,
                pd_session: "unsigned".into(),
                cores: vec![HtpCoreOptions {
                    core_id: 0,
                    perf_profile: "burst".into(),
                }],
            }],
        })
    }

    /// Write the config as pretty-printed JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::Io`] or [`RwkvError::Json`] on failure.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_json(self, path.as_ref())
    }

    /// Read a config written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::Io`] or [`RwkvError::Json`] on failure.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }
}

// ---------------------------------------------------------------------------
// Link config
// ---------------------------------------------------------------------------

/// Where the converter finds the extension library and its config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtpExtensionPaths {
    /// Path of the HTP net-run extension library.
    pub shared_library_path: PathBuf,
    /// Path of the backend-extension config file.
    pub config_file_path: PathBuf,
}

/// Root of the link file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtpLinkConfig {
    /// Extension paths.
    pub backend_extensions: HtpExtensionPaths,
}

impl HtpLinkConfig {
    /// Link file for an SDK installed at `sdk_root`, pointing at
    /// `config_path`.
    #[must_use]
    pub fn new(sdk_root: impl AsRef<Path>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            backend_extensions: HtpExtensionPaths {
                shared_library_path: sdk_root
                    .as_ref()
                    .join("lib/x86_64-linux-clang/libQnnHtpNetRunExtensions.so"),
                config_file_path: config_path.into(),
            },
        }
    }

    /// Link file stored at `link_path`, with the config next to it: a
    /// `link.json` suffix becomes `config.json`.
    #[must_use]
    pub fn beside(link_path: impl AsRef<Path>, sdk_root: impl AsRef<Path>) -> Self {
        let link = link_path.as_ref().to_string_lossy();
        Self::new(sdk_root, PathBuf::from(link.replace("link.json", "config.json")))
    }

    /// Write the link file as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::Io`] or [`RwkvError::Json`] on failure.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_json(self, path.as_ref())
    }
}

/// Serialize `value` to `path`, creating parent directories.
fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, json)?;
    tracing::debug!(path = %path.display(), "wrote HTP config");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

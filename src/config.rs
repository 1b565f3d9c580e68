// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device configuration.
//!
//! One value object enumerates every recognized option; it deserializes
//! from JSON the way the rest of the configuration surface of this stack's
//! deployments does. TLS key paths are wrapped so no diagnostic output ever
//! renders them.

use std::fmt;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::sc::tls::TlsMaterial;
use crate::sc::ScConfig;
use crate::transaction::TsmConfig;
use crate::types::MAX_INSTANCE;
use crate::wire::apdu::{MaxApdu, MaxSegments};

/// A string whose `Debug` output is redacted; used for secret-adjacent
/// configuration fields.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(pub String);

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Transport selection for one router port.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    Bip4 {
        bind: SocketAddrV4,
        broadcast: SocketAddrV4,
    },
    Bip6 {
        bind: std::net::SocketAddrV6,
    },
    Ethernet {
        interface: String,
    },
    Sc {
        primary_uri: String,
        #[serde(default)]
        secondary_uri: Option<String>,
    },
}

/// One `(port id, network, transport)` entry of the router table.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RouterPortConfig {
    pub port_id: u32,
    pub network: u16,
    pub transport: TransportConfig,
}

/// Secure Connect TLS options.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ScTlsOptions {
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub key_password: Option<Secret>,
    #[serde(default)]
    pub allow_plaintext: bool,
}

/// Secure Connect options.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ScOptions {
    pub primary_uri: Option<String>,
    #[serde(default)]
    pub secondary_uri: Option<String>,
    #[serde(default)]
    pub tls: ScTlsOptions,
    #[serde(default)]
    pub heartbeat_interval_s: Option<u64>,
    #[serde(default)]
    pub reconnect_min_delay_s: Option<u64>,
    #[serde(default)]
    pub reconnect_max_delay_s: Option<u64>,
}

/// The device configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Local Device object instance.
    pub instance_number: u32,
    /// Local network number; 0 for a single-network node.
    pub network_number: u16,
    pub apdu_timeout_ms: u64,
    pub apdu_retries: u32,
    pub max_segments: u8,
    pub max_apdu_length: u16,
    pub vendor_id: u16,
    /// Register as a foreign device with this BBMD.
    pub bbmd_address: Option<SocketAddrV4>,
    pub bbmd_ttl: u16,
    pub router_ports: Vec<RouterPortConfig>,
    pub sc: ScOptions,
    /// Password for DeviceCommunicationControl / ReinitializeDevice;
    /// compared in constant time.
    pub password: Option<Secret>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            instance_number: 0,
            network_number: 0,
            apdu_timeout_ms: 3000,
            apdu_retries: 3,
            max_segments: 64,
            max_apdu_length: 1476,
            vendor_id: 0,
            bbmd_address: None,
            bbmd_ttl: 60,
            router_ports: Vec::new(),
            sc: ScOptions::default(),
            password: None,
        }
    }
}

impl DeviceConfig {
    pub fn from_json(json: &str) -> Result<DeviceConfig, ConfigError> {
        let config: DeviceConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidOption {
                name: "json",
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_number > MAX_INSTANCE {
            return Err(ConfigError::InstanceOutOfRange(self.instance_number));
        }
        if self.apdu_timeout_ms == 0 {
            return Err(ConfigError::InvalidOption {
                name: "apdu_timeout_ms",
                reason: "must be nonzero".into(),
            });
        }
        if ![50u16, 128, 206, 480, 1024, 1476].contains(&self.max_apdu_length) {
            return Err(ConfigError::InvalidOption {
                name: "max_apdu_length",
                reason: format!("{} is not a Clause 20 table value", self.max_apdu_length),
            });
        }
        if self.bbmd_ttl > 3600 {
            return Err(ConfigError::InvalidOption {
                name: "bbmd_ttl",
                reason: "registrations may not exceed 3600 s".into(),
            });
        }
        if self.sc.primary_uri.is_some() {
            let tls = &self.sc.tls;
            let has_material = tls.ca.is_some() && tls.cert.is_some() && tls.key.is_some();
            if !has_material && !tls.allow_plaintext {
                return Err(ConfigError::MissingTlsMaterial);
            }
        }
        Ok(())
    }

    /// TSM parameters derived from this configuration.
    pub fn tsm_config(&self) -> TsmConfig {
        TsmConfig {
            apdu_timeout: Duration::from_millis(self.apdu_timeout_ms),
            retries: self.apdu_retries,
            max_segments: match self.max_segments {
                0 => MaxSegments::Unspecified,
                1..=2 => MaxSegments::Two,
                3..=4 => MaxSegments::Four,
                5..=8 => MaxSegments::Eight,
                9..=16 => MaxSegments::Sixteen,
                17..=32 => MaxSegments::ThirtyTwo,
                33..=64 => MaxSegments::SixtyFour,
                _ => MaxSegments::MoreThanSixtyFour,
            },
            max_apdu: MaxApdu::fitting(self.max_apdu_length as usize),
            ..TsmConfig::default()
        }
    }

    /// Secure Connect runtime settings, when configured.
    pub fn sc_config(&self) -> Result<Option<ScConfig>, ConfigError> {
        let Some(primary_uri) = self.sc.primary_uri.clone() else {
            return Ok(None);
        };
        self.validate()?;
        let tls = &self.sc.tls;
        let material = match (&tls.ca, &tls.cert, &tls.key) {
            (Some(ca), Some(cert), Some(key)) => Some(TlsMaterial {
                ca: ca.clone(),
                cert: cert.clone(),
                key: key.clone(),
                key_password: tls.key_password.as_ref().map(|s| s.0.clone()),
            }),
            _ => None,
        };
        let mut config = ScConfig {
            primary_uri,
            secondary_uri: self.sc.secondary_uri.clone(),
            tls: material,
            ..ScConfig::default()
        };
        if let Some(s) = self.sc.heartbeat_interval_s {
            config.heartbeat_interval = Duration::from_secs(s);
            config.heartbeat_timeout = Duration::from_secs((s / 2).max(1));
        }
        if let Some(s) = self.sc.reconnect_min_delay_s {
            config.reconnect_min_delay = Duration::from_secs(s);
        }
        if let Some(s) = self.sc.reconnect_max_delay_s {
            config.reconnect_max_delay = Duration::from_secs(s);
        }
        Ok(Some(config))
    }
}

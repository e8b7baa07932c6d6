/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::error::{ConfigError, ConfigResult};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{info, instrument, warn};

#[derive(Parser)]
#[command(author, version, about, long_about)]
pub struct Args {
    /// Path to config file
    #[arg(short, long, env = "ECHOLINK_GW_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub name: String,
    pub instance: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "echolink-gw".to_owned(),
            instance: "default".to_owned(),
        }
    }
}

/// EchoLink client side: directory registration, peer sessions and the
/// optional proxy tunnel.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub callsign: String,
    pub password: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "default_port_base")]
    pub port_base: u16,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Refuse the Speex codec upgrade even when the peer offers it.
    #[serde(default)]
    pub use_gsm_only: bool,
}

fn default_servers() -> Vec<String> {
    vec![
        "servers.echolink.org".to_owned(),
        "server1.echolink.org".to_owned(),
        "server2.echolink.org".to_owned(),
        "server3.echolink.org".to_owned(),
    ]
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port_base() -> u16 {
    5198
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub callsign: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTrxConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    pub listen_port: u16,
    /// Signal level the RX adapter reports while its paired TX is emitting.
    #[serde(default = "default_adapter_siglev")]
    pub siglev: f32,
}

fn default_adapter_siglev() -> f32 {
    1.0
}

/// Voter timing configuration. All intervals in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoterConfig {
    #[serde(default)]
    pub voting_delay: u64,
    /// Defaults to `voting_delay` when unset.
    #[serde(default)]
    pub buffer_length: Option<u64>,
    #[serde(default = "default_hysteresis")]
    pub hysteresis: f32,
    #[serde(default = "default_sql_close_revote_delay")]
    pub sql_close_revote_delay: u64,
    #[serde(default = "default_rx_switch_delay")]
    pub rx_switch_delay: u64,
    #[serde(default = "default_revote_interval")]
    pub revote_interval: u64,
}

fn default_hysteresis() -> f32 {
    1.5
}

fn default_sql_close_revote_delay() -> u64 {
    500
}

fn default_rx_switch_delay() -> u64 {
    500
}

fn default_revote_interval() -> u64 {
    1000
}

impl Default for VoterConfig {
    fn default() -> Self {
        Self {
            voting_delay: 0,
            buffer_length: None,
            hysteresis: default_hysteresis(),
            sql_close_revote_delay: default_sql_close_revote_delay(),
            rx_switch_delay: default_rx_switch_delay(),
            revote_interval: default_revote_interval(),
        }
    }
}

impl VoterConfig {
    pub const MAX_VOTING_DELAY: u64 = 5000;
    pub const MAX_HYSTERESIS: f32 = 2.0;
    pub const MAX_SQL_CLOSE_REVOTE_DELAY: u64 = 3000;
    pub const MAX_RX_SWITCH_DELAY: u64 = 3000;
    pub const MIN_REVOTE_INTERVAL: u64 = 100;
    pub const MAX_REVOTE_INTERVAL: u64 = 60000;

    pub fn buffer_length(&self) -> u64 {
        self.buffer_length.unwrap_or(self.voting_delay)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.voting_delay > Self::MAX_VOTING_DELAY {
            return Err(ConfigError::InvalidValue(format!(
                "votingDelay {} exceeds {}",
                self.voting_delay,
                Self::MAX_VOTING_DELAY
            )));
        }
        if !(0.0..=Self::MAX_HYSTERESIS).contains(&self.hysteresis) {
            return Err(ConfigError::InvalidValue(format!(
                "hysteresis {} outside 0..={}",
                self.hysteresis,
                Self::MAX_HYSTERESIS
            )));
        }
        if self.sql_close_revote_delay > Self::MAX_SQL_CLOSE_REVOTE_DELAY {
            return Err(ConfigError::InvalidValue(format!(
                "sqlCloseRevoteDelay {} exceeds {}",
                self.sql_close_revote_delay,
                Self::MAX_SQL_CLOSE_REVOTE_DELAY
            )));
        }
        if self.rx_switch_delay > Self::MAX_RX_SWITCH_DELAY {
            return Err(ConfigError::InvalidValue(format!(
                "rxSwitchDelay {} exceeds {}",
                self.rx_switch_delay,
                Self::MAX_RX_SWITCH_DELAY
            )));
        }
        if !(Self::MIN_REVOTE_INTERVAL..=Self::MAX_REVOTE_INTERVAL)
            .contains(&self.revote_interval)
        {
            return Err(ConfigError::InvalidValue(format!(
                "revoteInterval {} outside {}..={}",
                self.revote_interval,
                Self::MIN_REVOTE_INTERVAL,
                Self::MAX_REVOTE_INTERVAL
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AfskConfig {
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
}

fn default_baudrate() -> u32 {
    1200
}

impl Default for AfskConfig {
    fn default() -> Self {
        Self {
            baudrate: default_baudrate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "AppConfig::default")]
    pub app: AppConfig,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub remotetrx: Option<RemoteTrxConfig>,
    #[serde(default)]
    pub voter: Option<VoterConfig>,
    #[serde(default)]
    pub afsk: Option<AfskConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: Default::default(),
            gateway: None,
            remotetrx: None,
            voter: None,
            afsk: None,
        }
    }
}

impl Config {
    #[instrument]
    pub async fn load() -> ConfigResult<Config> {
        let args = Args::parse();

        info!("Loading config …");

        let config = Config::load_from_file(args.config.as_deref()).await?;
        config.validate()?;

        Ok(config)
    }

    #[instrument]
    async fn load_from_file(path: Option<&Path>) -> ConfigResult<Config> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(&path).await?;
                let config = serde_yaml::from_str(&content)?;
                info!("Config loaded from {}", path.to_string_lossy());
                Ok(config)
            }
            None => {
                let path = if cfg!(debug_assertions) {
                    let it = "./config-dev.yaml";
                    warn!("No config file specified, using {it}");
                    it
                } else {
                    let it = "/etc/echolink-gw/config.yaml";
                    warn!("No config file specified, using {it}");
                    it
                };
                match fs::read_to_string(path).await {
                    Ok(it) => {
                        let config = serde_yaml::from_str(&it)?;
                        info!("Config loaded from {path}");
                        Ok(config)
                    }
                    Err(_) => {
                        warn!("Could not read config file {path}, using default config.");
                        Ok(Config::default())
                    }
                }
            }
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(gateway) = &self.gateway {
            gateway.validate()?;
        }
        if let Some(voter) = &self.voter {
            voter.validate()?;
        }
        Ok(())
    }

    pub fn instance_name(&self) -> String {
        format!("{}/{}", self.app.name, self.app.instance)
    }
}

impl GatewayConfig {
    pub const MAX_CALLSIGN_SIZE: usize = 10;
    pub const MAX_DESCRIPTION_SIZE: usize = 27;

    pub fn validate(&self) -> ConfigResult<()> {
        if self.callsign.is_empty()
            || self.callsign.len() > Self::MAX_CALLSIGN_SIZE
            || !self.callsign.is_ascii()
        {
            return Err(ConfigError::InvalidValue(format!(
                "callsign '{}' must be 1..={} ASCII characters",
                self.callsign,
                Self::MAX_CALLSIGN_SIZE
            )));
        }
        Ok(())
    }

    /// Callsign as registered on the network (upper-cased).
    pub fn callsign_upper(&self) -> String {
        self.callsign.to_ascii_uppercase()
    }

    /// Description truncated to the directory protocol limit.
    pub fn description_trimmed(&self) -> String {
        let mut desc = self.description.clone();
        desc.truncate(Self::MAX_DESCRIPTION_SIZE);
        desc
    }
}

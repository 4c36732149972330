/*  Copyright 2022-23, Juspay India Pvt Ltd
    This program is free software: you can redistribute it and/or modify it under the terms of the GNU Affero General Public License
    as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version. This program
    is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more details. You should have received a copy of
    the GNU Affero General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use crate::{
    channel::ChannelSettings,
    domain::action::{
        chat::ChatSettings, driver::DriverSettings, rider::RiderSettings,
        tracking::TrackingSettings,
    },
    tools::{error::AppError, logger::LoggerConfig},
};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "./dhall_config/ride_sync_client.dhall";
pub const CONFIG_PATH_ENV: &str = "RIDE_SYNC_CONFIG";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AppConfig {
    pub logger_cfg: LoggerConfig,
    pub api_base_url: String,
    pub channel_url: String,
    pub credentials_path: String,
    pub request_timeout_ms: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub location_publish_interval_ms: u64,
    pub otp_expiry_seconds: u32,
    pub typing_idle_timeout_ms: u64,
    pub liveness_ping_interval_secs: u64,
    pub average_speed_kmph: f64,
    pub currency: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            logger_cfg: LoggerConfig::default(),
            api_base_url: "http://localhost:4000".to_string(),
            channel_url: "ws://localhost:4000".to_string(),
            credentials_path: "./.ride_sync/credentials.json".to_string(),
            request_timeout_ms: 10_000,
            reconnect_max_attempts: 5,
            reconnect_delay_ms: 1000,
            location_publish_interval_ms: 1000,
            otp_expiry_seconds: 300,
            typing_idle_timeout_ms: 2000,
            liveness_ping_interval_secs: 5,
            average_speed_kmph: 30.0,
            currency: "INR".to_string(),
        }
    }
}

pub fn read_dhall_config(config_path: &str) -> Result<AppConfig, AppError> {
    serde_dhall::from_file(config_path)
        .parse::<AppConfig>()
        .map_err(|err| AppError::InvalidConfiguration(format!("Error reading config: {err}")))
}

impl AppConfig {
    /// Reads the file named by `RIDE_SYNC_CONFIG`, falling back to the default path.
    pub fn from_env() -> Result<AppConfig, AppError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        read_dhall_config(&path)
    }

    pub fn api_base_url(&self) -> Result<Url, AppError> {
        Url::parse(&self.api_base_url)
            .map_err(|err| AppError::InvalidConfiguration(format!("api_base_url : {err}")))
    }

    pub fn channel_url(&self) -> Result<Url, AppError> {
        Url::parse(&self.channel_url)
            .map_err(|err| AppError::InvalidConfiguration(format!("channel_url : {err}")))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            reconnect_max_attempts: self.reconnect_max_attempts,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }

    pub fn rider_settings(&self) -> RiderSettings {
        RiderSettings {
            currency: self.currency.to_owned(),
        }
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            otp_expiry_seconds: self.otp_expiry_seconds,
            liveness_ping_interval: Duration::from_secs(self.liveness_ping_interval_secs),
        }
    }

    pub fn tracking_settings(&self) -> TrackingSettings {
        TrackingSettings {
            publish_interval: Duration::from_millis(self.location_publish_interval_ms),
            average_speed_kmph: self.average_speed_kmph,
        }
    }

    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            typing_idle_timeout: Duration::from_millis(self.typing_idle_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = AppConfig::default();
        assert_eq!(config.channel_settings().reconnect_max_attempts, 5);
        assert_eq!(
            config.channel_settings().reconnect_delay,
            Duration::from_secs(1)
        );
        assert_eq!(config.driver_settings().otp_expiry_seconds, 300);
        assert_eq!(
            config.chat_settings().typing_idle_timeout,
            Duration::from_secs(2)
        );
        assert!(config.api_base_url().is_ok());
    }

    #[test]
    fn test_missing_config_file_is_reported() {
        let result = read_dhall_config("./does/not/exist.dhall");
        assert!(matches!(result, Err(AppError::InvalidConfiguration(_))));
    }
}

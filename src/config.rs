//! Configuration management for the Zik tray service.
//!
//! This module handles loading and saving configuration from disk,
//! including lookup overrides, connection parameters and the icon set.

use std::{
   env, fs,
   path::{Path, PathBuf},
   str::FromStr,
   time::Duration,
};

use bluer::Address;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
   bluetooth::{address, lookup::LookupMethod},
   error::{Result, ZikError},
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
   /// Fixed headset address, skipping the lookup.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub address: Option<String>,

   #[serde(default)]
   pub lookup: LookupMethod,

   /// Fixed RFCOMM channel, skipping the service probe.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub channel: Option<u8>,

   #[serde(default = "default_poll_interval")]
   pub poll_interval: u64,

   #[serde(default = "default_request_timeout")]
   pub request_timeout_sec: u64,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub icon_dir: Option<PathBuf>,

   #[serde(default = "default_plist_path")]
   pub plist_path: PathBuf,
}

const fn default_poll_interval() -> u64 {
   30
}

const fn default_request_timeout() -> u64 {
   10
}

fn default_plist_path() -> PathBuf {
   PathBuf::from(crate::bluetooth::lookup::DEFAULT_PLIST_PATH)
}

impl Default for Config {
   fn default() -> Self {
      Self {
         address: None,
         lookup: LookupMethod::default(),
         channel: None,
         poll_interval: default_poll_interval(),
         request_timeout_sec: default_request_timeout(),
         icon_dir: None,
         plist_path: default_plist_path(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(config_path: &Path) -> Result<Self> {
      if config_path.exists() {
         let contents = fs::read_to_string(config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(config_path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, config_path: &Path) -> Result<()> {
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("ZIKTRAY_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(ZikError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("ziktray").join("config.toml"))
   }

   /// Parses the configured headset address, if any.
   pub fn fixed_address(&self) -> Result<Option<Address>> {
      let Some(s) = self.address.as_deref() else {
         return Ok(None);
      };
      let addr = Address::from_str(s).map_err(|_| ZikError::InvalidAddress(s.to_string()))?;
      if !address::is_zik_address(s) {
         warn!("Configured address {addr} does not carry a Zik vendor prefix");
      }
      Ok(Some(addr))
   }

   pub fn poll_interval(&self) -> Duration {
      Duration::from_secs(self.poll_interval.max(1))
   }

   pub fn request_timeout(&self) -> Duration {
      Duration::from_secs(self.request_timeout_sec.max(1))
   }

   /// Directory holding `<name>.png` tray icons.
   ///
   /// Defaults to `share/icons/zik` next to the executable, then to the
   /// user data directory.
   pub fn icon_dir(&self) -> PathBuf {
      if let Some(dir) = &self.icon_dir {
         return dir.clone();
      }
      if let Ok(exe) = env::current_exe()
         && let Some(bin_dir) = exe.parent()
      {
         let dir = bin_dir.join("share").join("icons").join("zik");
         if dir.is_dir() {
            return dir;
         }
      }
      dirs::data_dir()
         .unwrap_or_else(|| PathBuf::from("."))
         .join("ziktray")
         .join("icons")
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn defaults() {
      let config = Config::default();
      assert_eq!(config.lookup, LookupMethod::Auto);
      assert_eq!(config.poll_interval(), Duration::from_secs(30));
      assert_eq!(config.request_timeout(), Duration::from_secs(10));
      assert_eq!(
         config.plist_path,
         PathBuf::from("/Library/Preferences/com.apple.Bluetooth.plist")
      );
      assert_eq!(config.fixed_address().unwrap(), None);
   }

   #[test]
   fn partial_file_fills_defaults() {
      let config: Config = toml::from_str(
         r#"
         lookup = "bluetoothctl"
         channel = 1
         "#,
      )
      .unwrap();
      assert_eq!(config.lookup, LookupMethod::Bluetoothctl);
      assert_eq!(config.channel, Some(1));
      assert_eq!(config.poll_interval, 30);
   }

   #[test]
   fn first_load_writes_default() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("ziktray").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert!(path.exists());
      assert_eq!(config, Config::default());
   }

   #[test]
   fn saved_config_loads_back() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");

      let config = Config {
         address: Some("90:03:B7:01:02:03".into()),
         lookup: LookupMethod::BluezTest,
         icon_dir: Some(dir.path().join("icons")),
         poll_interval: 5,
         ..Default::default()
      };
      config.save_to(&path).unwrap();

      let loaded = Config::load_from(&path).unwrap();
      assert_eq!(loaded, config);
      assert_eq!(
         loaded.fixed_address().unwrap(),
         Some(Address::new([0x90, 0x03, 0xB7, 0x01, 0x02, 0x03]))
      );
      assert_eq!(loaded.icon_dir(), dir.path().join("icons"));
   }

   #[test]
   fn invalid_address_is_rejected() {
      let config = Config {
         address: Some("not-an-address".into()),
         ..Default::default()
      };
      assert!(matches!(
         config.fixed_address(),
         Err(ZikError::InvalidAddress(_))
      ));
   }

   #[test]
   fn zero_intervals_are_clamped() {
      let config = Config {
         poll_interval: 0,
         request_timeout_sec: 0,
         ..Default::default()
      };
      assert_eq!(config.poll_interval(), Duration::from_secs(1));
      assert_eq!(config.request_timeout(), Duration::from_secs(1));
   }
}

//! Error types for the Zik tray service.
//!
//! This module defines all error types that can occur while locating,
//! connecting to and talking with a Parrot Zik headset, as well as the
//! configuration and desktop integration failures around it.

use bluer::Address;
use smol_str::SmolStr;
use thiserror::Error;

/// Main error type for the Zik tray service.
#[derive(Error, Debug)]
pub enum ZikError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Tray error: {0}")]
   Tray(#[from] ksni::Error),

   #[error("Property list error: {0}")]
   Plist(#[from] plist::Error),

   #[error("No paired Parrot Zik found")]
   DeviceNotConnected,

   #[error("Could not connect to {0}")]
   ConnectionFailure(Address),

   #[error("Bluetooth is not on")]
   BluetoothNotOn,

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Invalid answer: {0}")]
   InvalidAnswer(String),

   #[error("Headset rejected request for {0}")]
   ResourceError(SmolStr),

   #[error("Lookup method {0} is not supported on this platform")]
   UnsupportedPlatform(&'static str),

   #[error("Invalid address: {0}")]
   InvalidAddress(String),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

impl ZikError {
   /// Whether the error means the lookup tool itself is unusable, so the
   /// next lookup method should be tried.
   pub fn is_tool_unavailable(&self) -> bool {
      match self {
         Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
         Self::Bluetooth(_) | Self::DBus(_) | Self::UnsupportedPlatform(_) => true,
         _ => false,
      }
   }
}

/// Convenience type alias for Results with `ZikError`.
pub type Result<T> = std::result::Result<T, ZikError>;

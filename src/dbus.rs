use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::bluetooth::manager::ZikManager;

pub const SERVICE_NAME: &str = "org.ziktray";
pub const OBJECT_PATH: &str = "/org/ziktray/headset";

pub struct ZikService {
   manager: ZikManager,
}

impl ZikService {
   pub const fn new(manager: ZikManager) -> Self {
      Self { manager }
   }
}

#[interface(name = "org.ziktray.Headset")]
impl ZikService {
   async fn get_status(&self) -> zbus::fdo::Result<String> {
      Ok(self.manager.status().await.to_json().to_string())
   }

   /// Returns the raw XML answer for a resource path.
   async fn get(&self, path: String) -> zbus::fdo::Result<String> {
      let msg = self
         .manager
         .get(&path)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(msg.xml)
   }

   async fn set(&self, path: String, arg: String) -> zbus::fdo::Result<String> {
      let msg = self
         .manager
         .set(&path, &arg)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      info!("Set {path} to {arg}");
      Ok(msg.xml)
   }

   async fn set_noise_cancellation(&self, enabled: bool) -> zbus::fdo::Result<bool> {
      let enabled = self
         .manager
         .set_noise_cancellation(enabled)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      info!("Noise cancellation {}", if enabled { "on" } else { "off" });
      Ok(enabled)
   }

   async fn connect_device(&self) -> zbus::fdo::Result<String> {
      let address = self
         .manager
         .connect()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(address.to_string())
   }

   async fn disconnect_device(&self) -> zbus::fdo::Result<bool> {
      self
         .manager
         .disconnect()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_updated(
      emitter: &SignalEmitter<'_>,
      level: u8,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn noise_cancellation_changed(
      emitter: &SignalEmitter<'_>,
      enabled: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_error(emitter: &SignalEmitter<'_>, message: &str) -> zbus::Result<()>;

   #[zbus(property)]
   async fn connected(&self) -> bool {
      self.manager.status().await.is_connected()
   }
}

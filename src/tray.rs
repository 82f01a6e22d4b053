//! System tray indicator.
//!
//! The indicator is a StatusNotifierItem served over D-Bus by `ksni`. The
//! host shows the popup menu on right-click and hides it on dismissal.
//! Menu entries do not talk to the headset themselves; they forward a
//! [`TrayAction`] to the main loop.

use std::path::{Path, PathBuf};

use bluer::Address;
use ksni::{
   MenuItem, ToolTip,
   menu::{CheckmarkItem, StandardItem},
};
use log::warn;
use smol_str::SmolStr;
use tokio::sync::mpsc;

use crate::{event::ZikEvent, zik::protocol::Battery};

pub const TRAY_TITLE: &str = "Parrot Zik";

pub const ICON_DISCONNECTED: &str = "zik-audio-headset";
pub const ICON_CHARGING: &str = "zik-battery-charging";
pub const ICON_BATTERY_100: &str = "zik-battery-100";
pub const ICON_BATTERY_060: &str = "zik-battery-060";
pub const ICON_BATTERY_040: &str = "zik-battery-040";
pub const ICON_BATTERY_LOW: &str = "zik-battery-low";

const ALL_ICONS: [&str; 6] = [
   ICON_DISCONNECTED,
   ICON_CHARGING,
   ICON_BATTERY_100,
   ICON_BATTERY_060,
   ICON_BATTERY_040,
   ICON_BATTERY_LOW,
];

/// Requests raised from the tray menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrayAction {
   Reconnect,
   SetNoiseCancellation(bool),
   About,
   Quit,
}

/// Icon files laid out as `<dir>/<name>.png`.
#[derive(Debug, Clone)]
pub struct IconSet {
   dir: PathBuf,
}

impl IconSet {
   pub fn new(dir: impl Into<PathBuf>) -> Self {
      Self { dir: dir.into() }
   }

   pub fn dir(&self) -> &Path {
      &self.dir
   }

   pub fn path(&self, name: &str) -> PathBuf {
      self.dir.join(format!("{name}.png"))
   }

   /// Icons the indicator may show that are absent from disk.
   pub fn missing(&self) -> Vec<&'static str> {
      ALL_ICONS
         .into_iter()
         .filter(|name| !self.path(name).is_file())
         .collect()
   }
}

/// What the indicator currently shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrayState {
   pub address: Option<Address>,
   pub firmware: Option<SmolStr>,
   pub battery: Option<Battery>,
   pub noise_cancellation: Option<bool>,
   pub error: Option<SmolStr>,
}

impl TrayState {
   pub fn apply(&mut self, event: &ZikEvent) {
      match event {
         ZikEvent::Connected { address, firmware } => {
            *self = Self {
               address: Some(*address),
               firmware: firmware.clone(),
               ..Default::default()
            };
         },
         ZikEvent::Disconnected => {
            *self = Self {
               error: self.error.take(),
               ..Default::default()
            };
         },
         ZikEvent::BatteryUpdated(battery) => self.battery = Some(*battery),
         ZikEvent::NoiseCancellationChanged(on) => self.noise_cancellation = Some(*on),
         ZikEvent::Error(msg) => self.error = Some(msg.clone()),
      }
   }

   pub fn is_connected(&self) -> bool {
      self.address.is_some()
   }

   pub fn icon_name(&self) -> &'static str {
      if !self.is_connected() {
         return ICON_DISCONNECTED;
      }
      match self.battery {
         None => ICON_DISCONNECTED,
         Some(b) if b.is_charging() => ICON_CHARGING,
         Some(b) if b.level > 80 => ICON_BATTERY_100,
         Some(b) if b.level > 40 => ICON_BATTERY_060,
         Some(b) if b.level > 20 => ICON_BATTERY_040,
         Some(_) => ICON_BATTERY_LOW,
      }
   }

   pub fn status_label(&self) -> String {
      match (&self.address, &self.error) {
         (Some(address), _) => format!("Connected to {address}"),
         (None, Some(error)) => format!("Not connected: {error}"),
         (None, None) => "Not connected".to_string(),
      }
   }

   pub fn battery_label(&self) -> String {
      match self.battery {
         Some(b) if b.is_charging() => format!("Battery: {}% (charging)", b.level),
         Some(b) => format!("Battery: {}%", b.level),
         None => "Battery: unknown".to_string(),
      }
   }
}

pub struct ZikTray {
   icons: IconSet,
   state: TrayState,
   actions: mpsc::UnboundedSender<TrayAction>,
}

impl ZikTray {
   pub fn new(icons: IconSet, actions: mpsc::UnboundedSender<TrayAction>) -> Self {
      Self {
         icons,
         state: TrayState::default(),
         actions,
      }
   }

   pub fn apply(&mut self, event: &ZikEvent) {
      self.state.apply(event);
   }

   fn send(&self, action: TrayAction) {
      if self.actions.send(action).is_err() {
         warn!("Dropping tray action {action:?}, main loop is gone");
      }
   }
}

impl ksni::Tray for ZikTray {
   fn id(&self) -> String {
      env!("CARGO_PKG_NAME").into()
   }

   fn title(&self) -> String {
      TRAY_TITLE.into()
   }

   fn category(&self) -> ksni::Category {
      ksni::Category::Hardware
   }

   fn status(&self) -> ksni::Status {
      if self.state.is_connected() {
         ksni::Status::Active
      } else {
         ksni::Status::Passive
      }
   }

   fn icon_theme_path(&self) -> String {
      self.icons.dir().to_string_lossy().into_owned()
   }

   fn icon_name(&self) -> String {
      self.state.icon_name().into()
   }

   fn tool_tip(&self) -> ToolTip {
      let mut description = self.state.status_label();
      if self.state.battery.is_some() {
         description.push('\n');
         description.push_str(&self.state.battery_label());
      }
      if let Some(firmware) = &self.state.firmware {
         description.push_str("\nFirmware ");
         description.push_str(firmware);
      }
      ToolTip {
         title: TRAY_TITLE.into(),
         description,
         ..Default::default()
      }
   }

   fn menu(&self) -> Vec<MenuItem<Self>> {
      let noise_cancellation = self.state.noise_cancellation;
      vec![
         StandardItem {
            label: self.state.status_label(),
            enabled: false,
            ..Default::default()
         }
         .into(),
         StandardItem {
            label: self.state.battery_label(),
            enabled: false,
            ..Default::default()
         }
         .into(),
         MenuItem::Separator,
         CheckmarkItem {
            label: "Noise cancellation".into(),
            enabled: noise_cancellation.is_some(),
            checked: noise_cancellation.unwrap_or(false),
            activate: Box::new(|tray: &mut Self| {
               let enable = !tray.state.noise_cancellation.unwrap_or(false);
               tray.send(TrayAction::SetNoiseCancellation(enable));
            }),
            ..Default::default()
         }
         .into(),
         StandardItem {
            label: "Reconnect".into(),
            icon_name: "view-refresh".into(),
            activate: Box::new(|tray: &mut Self| tray.send(TrayAction::Reconnect)),
            ..Default::default()
         }
         .into(),
         MenuItem::Separator,
         StandardItem {
            label: "About".into(),
            icon_name: "help-about".into(),
            activate: Box::new(|tray: &mut Self| tray.send(TrayAction::About)),
            ..Default::default()
         }
         .into(),
         StandardItem {
            label: "Quit".into(),
            icon_name: "application-exit".into(),
            activate: Box::new(|tray: &mut Self| tray.send(TrayAction::Quit)),
            ..Default::default()
         }
         .into(),
      ]
   }
}

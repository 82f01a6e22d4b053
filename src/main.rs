//! Parrot Zik tray service
//!
//! This service finds the paired Parrot Zik headset, connects to its
//! RFCOMM control channel and shows its state in the system tray. The
//! same controls are exposed on the session bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use ksni::TrayMethods;
use log::{info, warn};
use tokio::{
   select, signal,
   sync::{Notify, mpsc},
   time,
};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::manager::ZikManager;
use dbus::ZikService;
use event::{EventBus, ZikEvent};
use tray::{IconSet, TrayAction, ZikTray};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod notify;
mod tray;
mod zik;

use crate::{dbus::ZikServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting Zik tray service...");

   // Load configuration
   let config = config::Config::load()?;
   info!("Loaded configuration (lookup: {})", config.lookup);

   let session = bluer::Session::new().await?;

   // Create event channel
   let event_bus = EventProcessor::new();

   // Create the connection manager
   let manager = ZikManager::new(event_bus.clone(), config.clone(), session);

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(dbus::SERVICE_NAME)?
      .serve_at(dbus::OBJECT_PATH, ZikService::new(manager.clone()))?
      .build()
      .await?;

   info!("Zik D-Bus service started at {}", dbus::SERVICE_NAME);

   let icons = IconSet::new(config.icon_dir());
   for name in icons.missing() {
      warn!("Missing tray icon {}", icons.path(name).display());
   }

   let (action_tx, mut action_rx) = mpsc::unbounded_channel();
   let tray = ZikTray::new(icons.clone(), action_tx).spawn().await?;

   // Start event processor
   event_bus
      .spawn_dispatcher(connection.clone(), tray.clone())
      .await?;

   loop {
      select! {
         action = action_rx.recv() => {
            let Some(action) = action else {
               break;
            };
            if !handle_action(action, &manager, &connection, &icons).await {
               break;
            }
         }
         _ = signal::ctrl_c() => {
            break;
         }
      }
   }

   info!("Shutting down Zik tray service...");
   if let Err(e) = manager.disconnect().await {
      warn!("Error disconnecting: {e}");
   }
   tray.shutdown().await;

   Ok(())
}

/// Runs a tray menu action. Returns `false` when the service should exit.
async fn handle_action(
   action: TrayAction,
   manager: &ZikManager,
   connection: &Connection,
   icons: &IconSet,
) -> bool {
   match action {
      TrayAction::Reconnect => {
         let manager = manager.clone();
         tokio::spawn(async move {
            let _ = manager.disconnect().await;
            match manager.connect().await {
               Ok(address) => info!("Reconnected to {address}"),
               Err(e) => warn!("Reconnect failed: {e}"),
            }
         });
      },
      TrayAction::SetNoiseCancellation(enabled) => {
         let manager = manager.clone();
         tokio::spawn(async move {
            if let Err(e) = manager.set_noise_cancellation(enabled).await {
               warn!("Failed to set noise cancellation: {e}");
            }
         });
      },
      TrayAction::About => {
         let icon = icons.path(tray::ICON_DISCONNECTED);
         if let Err(e) = notify::show_about(connection, &icon.to_string_lossy()).await {
            warn!("Failed to show About: {e}");
         }
      },
      TrayAction::Quit => return false,
   }
   true
}

struct EventProcessor {
   queue: SegQueue<ZikEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<ZikEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<ZikService>,
      tray: &ksni::Handle<ZikTray>,
      event: ZikEvent,
   ) -> Result<()> {
      let tray_event = event.clone();
      tray.update(move |tray| tray.apply(&tray_event)).await;

      if event.changes_connection() {
         iface
            .get()
            .await
            .connected_changed(iface.signal_emitter())
            .await?;
      }

      match event {
         ZikEvent::Connected { address, .. } => {
            iface.device_connected(&address.to_string()).await?;
         },
         ZikEvent::Disconnected => {
            iface.device_disconnected().await?;
         },
         ZikEvent::BatteryUpdated(battery) => {
            iface
               .battery_updated(battery.level, battery.state.into())
               .await?;
         },
         ZikEvent::NoiseCancellationChanged(enabled) => {
            iface.noise_cancellation_changed(enabled).await?;
         },
         ZikEvent::Error(message) => {
            iface.device_error(&message).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(
      self: Arc<Self>,
      connection: Connection,
      tray: ksni::Handle<ZikTray>,
   ) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, ZikService>(dbus::OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, &tray, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: ZikEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}

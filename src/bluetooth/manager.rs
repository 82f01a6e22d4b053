//! Connection manager for the Zik headset.
//!
//! This module owns the headset connection: it looks up the paired
//! address, opens the RFCOMM link, keeps the battery state fresh and
//! serializes every request to the headset through a single actor.

use std::time::Duration;

use bluer::{Address, Session, rfcomm::ProfileHandle};
use log::{debug, info, warn};
use rand::Rng;
use serde_json::json;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   io::{AsyncRead, AsyncWrite},
   select,
   sync::{mpsc, oneshot},
   time::{self, Instant, MissedTickBehavior},
};

use crate::{
   bluetooth::{lookup::MacFinder, rfcomm},
   config::Config,
   error::{Result, ZikError},
   event::{EventSender, ZikEvent},
   zik::{
      protocol::{Battery, Message, RES_BATTERY, RES_NOISE_CANCELLATION},
      resource::ResourceManager,
   },
};

/// Upper bound between two connection attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;

/// Snapshot of the headset state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Status {
   pub address: Option<Address>,
   pub firmware: Option<SmolStr>,
   pub battery: Option<Battery>,
   pub noise_cancellation: Option<bool>,
   pub last_error: Option<SmolStr>,
}

impl Status {
   pub fn is_connected(&self) -> bool {
      self.address.is_some()
   }

   /// Converts the status to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "connected": self.is_connected(),
         "address": self.address.map(|a| a.to_string()),
         "firmware": self.firmware.as_deref(),
         "battery": self.battery.map(|b| json!({
            "level": b.level,
            "state": <&'static str>::from(b.state),
         })),
         "noise_cancellation": self.noise_cancellation,
         "last_error": self.last_error.as_deref(),
      })
   }
}

// === Commands ===

enum ManagerCommand {
   Connect(oneshot::Sender<Result<Address>>),
   Disconnect(oneshot::Sender<()>),
   GetStatus(oneshot::Sender<Status>),
   Get(SmolStr, oneshot::Sender<Result<Message>>),
   Set(SmolStr, SmolStr, oneshot::Sender<Result<Message>>),
   SetNoiseCancellation(bool, oneshot::Sender<Result<bool>>),
}

// === Main Manager ===

/// Handle to the connection actor.
///
/// This type is cheaply cloneable.
#[derive(Clone)]
pub struct ZikManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl ZikManager {
   pub fn new(event_tx: EventSender, config: Config, session: Session) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ManagerActor::new(config, event_tx, command_rx, session).run());
      Self { inbox: command_tx }
   }

   async fn call<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(cmd(tx))
         .await
         .map_err(|_| ZikError::ManagerShutdown)?;
      rx.await.map_err(|_| ZikError::ManagerShutdown)
   }

   /// Connects now, regardless of the retry schedule.
   pub async fn connect(&self) -> Result<Address> {
      self.call(ManagerCommand::Connect).await?
   }

   pub async fn disconnect(&self) -> Result<()> {
      self.call(ManagerCommand::Disconnect).await
   }

   pub async fn status(&self) -> Status {
      self
         .call(ManagerCommand::GetStatus)
         .await
         .unwrap_or_default()
   }

   pub async fn get(&self, path: &str) -> Result<Message> {
      self
         .call(|tx| ManagerCommand::Get(SmolStr::new(path), tx))
         .await?
   }

   pub async fn set(&self, path: &str, arg: &str) -> Result<Message> {
      self
         .call(|tx| ManagerCommand::Set(SmolStr::new(path), SmolStr::new(arg), tx))
         .await?
   }

   pub async fn set_noise_cancellation(&self, enabled: bool) -> Result<bool> {
      self
         .call(|tx| ManagerCommand::SetNoiseCancellation(enabled, tx))
         .await?
   }
}

// === Manager Actor ===

struct Connection {
   resources: ResourceManager<bluer::rfcomm::Stream>,
   _profile: Option<ProfileHandle>,
}

struct ManagerActor {
   config: Config,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   session: Session,
   finder: MacFinder,

   // State
   conn: Option<Connection>,
   status: Status,
   retry_count: u32,
   next_attempt: Instant,
}

impl ManagerActor {
   fn new(
      config: Config,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
      session: Session,
   ) -> Self {
      let finder = MacFinder::new(config.lookup, config.plist_path.clone(), session.clone());
      Self {
         config,
         event_tx,
         command_rx,
         session,
         finder,
         conn: None,
         status: Status::default(),
         retry_count: 0,
         next_attempt: Instant::now(),
      }
   }

   async fn run(mut self) {
      info!("Zik manager starting up");

      let mut poll_interval = time::interval(self.config.poll_interval());
      poll_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
             _ = poll_interval.tick() => {
                 self.poll().await;
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Zik manager shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
         }
      }

      self.drop_connection();
   }

   async fn poll(&mut self) {
      if self.conn.is_some() {
         self.refresh_battery().await;
         self.process_notifications().await;
         return;
      }
      if Instant::now() < self.next_attempt {
         return;
      }
      if let Err(e) = self.establish().await {
         self.retry_count += 1;
         let delay = calc_retry_delay(self.config.poll_interval(), self.retry_count);
         debug!("Connection attempt failed, next in {delay:?}");
         self.next_attempt = Instant::now() + delay;
         self.report_error(&e);
      }
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::Connect(reply) => {
            let result = self.establish().await;
            if let Err(e) = &result {
               self.report_error(e);
            }
            let _ = reply.send(result);
         },
         ManagerCommand::Disconnect(reply) => {
            self.drop_connection();
            let _ = reply.send(());
         },
         ManagerCommand::GetStatus(reply) => {
            let _ = reply.send(self.status.clone());
         },
         ManagerCommand::Get(path, reply) => {
            let result = match self.conn.as_mut() {
               Some(conn) => conn.resources.get(&path).await,
               None => Err(ZikError::DeviceNotConnected),
            };
            if let Err(e) = &result {
               self.request_failed(e);
            }
            let _ = reply.send(result);
            self.process_notifications().await;
         },
         ManagerCommand::Set(path, arg, reply) => {
            let result = match self.conn.as_mut() {
               Some(conn) => conn.resources.set(&path, &arg).await,
               None => Err(ZikError::DeviceNotConnected),
            };
            if let Err(e) = &result {
               self.request_failed(e);
            }
            let _ = reply.send(result);
            self.process_notifications().await;
         },
         ManagerCommand::SetNoiseCancellation(enabled, reply) => {
            let result = match self.conn.as_mut() {
               Some(conn) => conn.resources.set_noise_cancellation(enabled).await,
               None => Err(ZikError::DeviceNotConnected),
            };
            match &result {
               Ok(on) => self.update_noise_cancellation(*on),
               Err(e) => self.request_failed(e),
            }
            let _ = reply.send(result);
            self.process_notifications().await;
         },
      }
   }

   async fn establish(&mut self) -> Result<Address> {
      if let Some(conn) = &self.conn {
         return Ok(conn.resources.address());
      }

      if !self.finder.is_bluetooth_on().await? {
         return Err(ZikError::BluetoothNotOn);
      }
      let address = match self.config.fixed_address()? {
         Some(address) => address,
         None => self.finder.get_mac().await?,
      };

      let link = rfcomm::connect(&self.session, address, self.config.channel).await?;
      let mut resources =
         ResourceManager::new(link.stream, address, self.config.request_timeout());
      let initial = read_initial_state(&mut resources).await?;

      self.conn = Some(Connection {
         resources,
         _profile: link.profile,
      });
      self.retry_count = 0;
      self.status = Status {
         address: Some(address),
         firmware: initial.firmware.clone(),
         ..Default::default()
      };
      info!("Zik {address} ready (firmware {:?})", initial.firmware);
      self.event_tx.emit(ZikEvent::Connected {
         address,
         firmware: initial.firmware,
      });

      if let Some(battery) = initial.battery {
         self.update_battery(battery);
      }
      if let Some(enabled) = initial.noise_cancellation {
         self.update_noise_cancellation(enabled);
      }
      Ok(address)
   }

   async fn refresh_battery(&mut self) {
      let Some(conn) = self.conn.as_mut() else {
         return;
      };
      let result = conn.resources.battery().await;
      match result {
         Ok(battery) => self.update_battery(battery),
         Err(e) => self.request_failed(&e),
      }
   }

   async fn refresh_noise_cancellation(&mut self) {
      let Some(conn) = self.conn.as_mut() else {
         return;
      };
      let result = conn.resources.noise_cancellation().await;
      match result {
         Ok(on) => self.update_noise_cancellation(on),
         Err(e) => self.request_failed(&e),
      }
   }

   async fn process_notifications(&mut self) {
      let notified = match self.conn.as_mut() {
         Some(conn) => conn.resources.take_notified(),
         None => return,
      };
      for path in notified {
         match path.as_str() {
            RES_BATTERY => self.refresh_battery().await,
            RES_NOISE_CANCELLATION => self.refresh_noise_cancellation().await,
            other => debug!("Ignoring notification for {other}"),
         }
      }
   }

   fn update_battery(&mut self, battery: Battery) {
      if self.status.battery != Some(battery) {
         debug!("Battery {}% ({})", battery.level, battery.state);
         self.status.battery = Some(battery);
         self.event_tx.emit(ZikEvent::BatteryUpdated(battery));
      }
   }

   fn update_noise_cancellation(&mut self, enabled: bool) {
      if self.status.noise_cancellation != Some(enabled) {
         self.status.noise_cancellation = Some(enabled);
         self
            .event_tx
            .emit(ZikEvent::NoiseCancellationChanged(enabled));
      }
   }

   fn request_failed(&mut self, e: &ZikError) {
      warn!("Request failed: {e}");
      self.report_error(e);
      if is_link_error(e) {
         self.drop_connection();
      }
   }

   fn report_error(&mut self, e: &ZikError) {
      let msg = e.to_smolstr();
      if self.status.last_error.as_ref() != Some(&msg) {
         self.event_tx.emit(ZikEvent::Error(msg.clone()));
      }
      self.status.last_error = Some(msg);
   }

   fn drop_connection(&mut self) {
      if let Some(conn) = self.conn.take() {
         info!("Disconnected from {}", conn.resources.address());
         self.status = Status {
            last_error: self.status.last_error.take(),
            ..Default::default()
         };
         self.next_attempt = Instant::now();
         self.event_tx.emit(ZikEvent::Disconnected);
      }
   }
}

/// State read right after the handshake, before the link is kept.
#[derive(Debug, Default)]
struct InitialState {
   firmware: Option<SmolStr>,
   battery: Option<Battery>,
   noise_cancellation: Option<bool>,
}

/// Reads firmware, battery and noise cancellation from a fresh link.
///
/// A rejected or unreadable resource only leaves its field empty. Anything
/// that leaves the socket unusable fails the whole connection attempt.
async fn read_initial_state<S>(resources: &mut ResourceManager<S>) -> Result<InitialState>
where
   S: AsyncRead + AsyncWrite + Unpin,
{
   let address = resources.address();
   let firmware = match resources.firmware_version().await {
      Ok(version) => Some(version),
      Err(e @ (ZikError::ResourceError(_) | ZikError::InvalidAnswer(_))) => {
         warn!("Failed to read firmware version of {address}: {e}");
         None
      },
      Err(e) => return Err(e),
   };
   let battery = soft_failure(address, resources.battery().await)?;
   let noise_cancellation = soft_failure(address, resources.noise_cancellation().await)?;
   Ok(InitialState {
      firmware,
      battery,
      noise_cancellation,
   })
}

fn soft_failure<T>(address: Address, result: Result<T>) -> Result<Option<T>> {
   match result {
      Ok(value) => Ok(Some(value)),
      Err(e) if is_link_error(&e) => Err(e),
      Err(e) => {
         warn!("Initial read from {address} failed: {e}");
         Ok(None)
      },
   }
}

/// Whether the error leaves the socket unusable.
fn is_link_error(e: &ZikError) -> bool {
   matches!(
      e,
      ZikError::ConnectionClosed
         | ZikError::Io(_)
         | ZikError::RequestTimeout
         | ZikError::InvalidAnswer(_)
   )
}

fn calc_retry_delay(base_delay: Duration, retry_count: u32) -> Duration {
   let exponential = base_delay * (1 << retry_count.min(4));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
   use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

   use super::*;
   use crate::zik::protocol::{ANSWER_HEADER_LEN, BatteryState};

   fn answer(xml: &str) -> Vec<u8> {
      let total = (ANSWER_HEADER_LEN + xml.len()) as u16;
      let mut frame = total.to_be_bytes().to_vec();
      frame.extend_from_slice(&[0x80, 0x01, 0x00, 0x00, 0x00]);
      frame.extend_from_slice(xml.as_bytes());
      frame
   }

   async fn read_request(headset: &mut DuplexStream) -> String {
      let mut len = [0u8; 2];
      headset.read_exact(&mut len).await.unwrap();
      let mut rest = vec![0u8; u16::from_be_bytes(len) as usize - 2];
      headset.read_exact(&mut rest).await.unwrap();
      String::from_utf8(rest[1..].to_vec()).unwrap()
   }

   fn resources(stream: DuplexStream) -> ResourceManager<DuplexStream> {
      ResourceManager::new(stream, Address::any(), Duration::from_secs(5))
   }

   const VERSION: &str =
      r#"<answer path="/api/software/version/get"><software version="2.05"/></answer>"#;
   const BATTERY: &str = r#"<answer path="/api/system/battery/get"><system><battery state="charging" percent="40"/></system></answer>"#;
   const NC_ON: &str = r#"<answer path="/api/audio/noise_cancellation/enabled/get"><audio><noise_cancellation enabled="true"/></audio></answer>"#;

   #[tokio::test]
   async fn initial_state_reads_everything() {
      let (client, mut headset) = duplex(4096);
      tokio::spawn(async move {
         for xml in [VERSION, BATTERY, NC_ON] {
            read_request(&mut headset).await;
            headset.write_all(&answer(xml)).await.unwrap();
         }
      });

      let mut rm = resources(client);
      let state = read_initial_state(&mut rm).await.unwrap();
      assert_eq!(state.firmware.as_deref(), Some("2.05"));
      assert_eq!(state.battery.map(|b| b.level), Some(40));
      assert_eq!(state.noise_cancellation, Some(true));
   }

   #[tokio::test]
   async fn rejected_firmware_read_keeps_the_link() {
      let (client, mut headset) = duplex(4096);
      tokio::spawn(async move {
         read_request(&mut headset).await;
         headset
            .write_all(&answer(
               r#"<answer path="/api/software/version/get" error="true"/>"#,
            ))
            .await
            .unwrap();
         for xml in [BATTERY, NC_ON] {
            read_request(&mut headset).await;
            headset.write_all(&answer(xml)).await.unwrap();
         }
      });

      let mut rm = resources(client);
      let state = read_initial_state(&mut rm).await.unwrap();
      assert!(state.firmware.is_none());
      assert!(state.battery.is_some());
   }

   #[tokio::test]
   async fn closed_link_fails_the_connection() {
      let (client, mut headset) = duplex(4096);
      tokio::spawn(async move {
         read_request(&mut headset).await;
         drop(headset);
      });

      let mut rm = resources(client);
      assert!(matches!(
         read_initial_state(&mut rm).await,
         Err(ZikError::ConnectionClosed)
      ));
   }

   #[tokio::test]
   async fn silent_headset_fails_the_connection() {
      let (client, _headset) = duplex(4096);
      let mut rm = ResourceManager::new(client, Address::any(), Duration::from_millis(50));
      assert!(matches!(
         read_initial_state(&mut rm).await,
         Err(ZikError::RequestTimeout)
      ));
   }

   #[test]
   fn retry_delay_grows_and_caps() {
      let base = Duration::from_secs(30);
      let first = calc_retry_delay(base, 0);
      assert!(first >= base && first < base + Duration::from_secs(1));

      let second = calc_retry_delay(base, 1);
      assert!(second >= base * 2);

      let capped = calc_retry_delay(base, 20);
      assert!(capped >= MAX_RETRY_DELAY && capped < MAX_RETRY_DELAY + Duration::from_secs(1));
   }

   #[test]
   fn link_errors_drop_the_connection() {
      assert!(is_link_error(&ZikError::ConnectionClosed));
      assert!(is_link_error(&ZikError::RequestTimeout));
      assert!(!is_link_error(&ZikError::ResourceError(SmolStr::new(
         RES_BATTERY
      ))));
      assert!(!is_link_error(&ZikError::DeviceNotConnected));
   }

   #[test]
   fn status_json() {
      let status = Status {
         address: Some(Address::new([0x90, 0x03, 0xB7, 0x01, 0x02, 0x03])),
         battery: Some(Battery {
            state: BatteryState::InUse,
            level: 64,
         }),
         noise_cancellation: Some(true),
         ..Default::default()
      };
      let json = status.to_json();
      assert_eq!(json["connected"], true);
      assert_eq!(json["address"], "90:03:B7:01:02:03");
      assert_eq!(json["battery"]["level"], 64);
      assert_eq!(json["battery"]["state"], "in_use");
      assert_eq!(json["noise_cancellation"], true);
      assert!(json["firmware"].is_null());

      assert_eq!(Status::default().to_json()["connected"], false);
   }
}

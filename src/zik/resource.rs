//! Generic resource manager over the headset's control socket.
//!
//! Every setting on the headset is a resource addressed by path. Reading
//! one sends a `GET`, changing one a `SET` followed by a fresh `GET`.
//! Answers are cached per resource until the headset sends a
//! notification for it.

use std::{collections::HashMap, time::Duration};

use bluer::Address;
use log::{debug, warn};
use smol_str::SmolStr;
use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
   time,
};

use crate::{
   error::{Result, ZikError},
   zik::protocol::{
      ANSWER_HEADER_LEN, Battery, Message, MessageKind, Method, RES_BATTERY,
      RES_NOISE_CANCELLATION, RES_VERSION, answer_body_len, build_request,
   },
};

/// Owns the socket and the answer cache.
pub struct ResourceManager<S> {
   stream: S,
   address: Address,
   timeout: Duration,
   cache: HashMap<SmolStr, Message>,
   notified: Vec<SmolStr>,
}

impl<S> ResourceManager<S>
where
   S: AsyncRead + AsyncWrite + Unpin,
{
   pub fn new(stream: S, address: Address, timeout: Duration) -> Self {
      Self {
         stream,
         address,
         timeout,
         cache: HashMap::new(),
         notified: Vec::new(),
      }
   }

   pub fn address(&self) -> Address {
      self.address
   }

   /// Returns the cached answer for `path`, fetching it if needed.
   pub async fn get(&mut self, path: &str) -> Result<Message> {
      if let Some(msg) = self.cache.get(path) {
         return Ok(msg.clone());
      }
      self.fetch(path).await
   }

   /// Reads `path` from the headset, bypassing the cache.
   pub async fn fetch(&mut self, path: &str) -> Result<Message> {
      let msg = self.request(path, Method::Get, None).await?;
      self.cache.insert(SmolStr::new(path), msg.clone());
      Ok(msg)
   }

   /// Writes `arg` to `path` and returns the refreshed value.
   pub async fn set(&mut self, path: &str, arg: &str) -> Result<Message> {
      self.request(path, Method::Set, Some(arg)).await?;
      self.fetch(path).await
   }

   /// Drains the resource paths the headset notified about.
   pub fn take_notified(&mut self) -> Vec<SmolStr> {
      std::mem::take(&mut self.notified)
   }

   pub async fn battery(&mut self) -> Result<Battery> {
      let msg = self.fetch(RES_BATTERY).await?;
      Battery::from_message(&msg)
   }

   pub async fn noise_cancellation(&mut self) -> Result<bool> {
      let msg = self.get(RES_NOISE_CANCELLATION).await?;
      Ok(noise_cancellation_enabled(&msg))
   }

   pub async fn set_noise_cancellation(&mut self, enabled: bool) -> Result<bool> {
      let arg = if enabled { "true" } else { "false" };
      let msg = self.set(RES_NOISE_CANCELLATION, arg).await?;
      Ok(noise_cancellation_enabled(&msg))
   }

   pub async fn firmware_version(&mut self) -> Result<SmolStr> {
      let msg = self.get(RES_VERSION).await?;
      msg.attr("software", "version")
         .or_else(|| msg.attr("software", "sip6"))
         .map(SmolStr::new)
         .ok_or_else(|| ZikError::InvalidAnswer(msg.xml.clone()))
   }

   async fn request(&mut self, path: &str, method: Method, arg: Option<&str>) -> Result<Message> {
      let frame = build_request(path, method, arg)?;
      debug!(
         "→ {}: {}",
         self.address,
         String::from_utf8_lossy(&frame[3..])
      );
      self.stream.write_all(&frame).await.map_err(closed)?;
      self.stream.flush().await.map_err(closed)?;

      let msg = time::timeout(self.timeout, self.read_answer(path))
         .await
         .map_err(|_| ZikError::RequestTimeout)??;
      if msg.is_error() {
         warn!("{} rejected {method} {path}", self.address);
         return Err(ZikError::ResourceError(SmolStr::new(path)));
      }
      Ok(msg)
   }

   /// Waits for the answer to `path`.
   ///
   /// Answers for other resources are left over from requests that timed
   /// out and are dropped.
   async fn read_answer(&mut self, path: &str) -> Result<Message> {
      loop {
         let msg = self.read_message().await?;
         match msg.kind {
            MessageKind::Answer if msg.path == path => return Ok(msg),
            MessageKind::Answer => {
               warn!(
                  "{} sent a stale answer for {} while waiting for {path}",
                  self.address, msg.path
               );
            },
            MessageKind::Notify => {
               debug!("{} notified {}", self.address, msg.path);
               self.cache.remove(&msg.path);
               if !self.notified.contains(&msg.path) {
                  self.notified.push(msg.path);
               }
            },
         }
      }
   }

   async fn read_message(&mut self) -> Result<Message> {
      let mut header = [0u8; ANSWER_HEADER_LEN];
      self.stream.read_exact(&mut header).await.map_err(closed)?;
      let len = answer_body_len(&header)?;

      let mut body = vec![0u8; len];
      self.stream.read_exact(&mut body).await.map_err(closed)?;
      debug!("← {}: {}", self.address, String::from_utf8_lossy(&body));
      Message::parse(&body)
   }
}

fn noise_cancellation_enabled(msg: &Message) -> bool {
   msg.attr("noise_cancellation", "enabled") == Some("true")
}

fn closed(e: std::io::Error) -> ZikError {
   match e.kind() {
      std::io::ErrorKind::UnexpectedEof
      | std::io::ErrorKind::BrokenPipe
      | std::io::ErrorKind::ConnectionReset => ZikError::ConnectionClosed,
      _ => ZikError::Io(e),
   }
}

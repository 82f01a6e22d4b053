//! RFCOMM connection to the headset.
//!
//! The headset exposes its control channel as an RFCOMM service. The
//! channel number is resolved by BlueZ through a client profile
//! registered for each known service UUID, unless a fixed channel is
//! configured, in which case the socket is connected directly.

use std::time::Duration;

use bluer::{
   Address, Session,
   rfcomm::{Profile, ProfileHandle, ReqError, Role, SocketAddr, Stream},
};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
   select, time,
};
use uuid::Uuid;

use crate::{
   error::{Result, ZikError},
   zik::protocol::{Frame, HANDSHAKE_ACK_MAX, PKT_HANDSHAKE, SERVICE_UUIDS},
};

/// Timeout for a single service connection attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for the handshake acknowledgment
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// An open, handshaken RFCOMM link.
///
/// The profile registration (if any) must be kept alive as long as the
/// stream.
pub struct Link {
   pub stream: Stream,
   pub profile: Option<ProfileHandle>,
}

/// Connects to the headset at `address` and performs the handshake.
pub async fn connect(session: &Session, address: Address, channel: Option<u8>) -> Result<Link> {
   let mut link = match channel {
      Some(channel) => {
         debug!("Connecting to {address} on RFCOMM channel {channel}");
         let stream = time::timeout(
            CONNECT_TIMEOUT,
            Stream::connect(SocketAddr::new(address, channel)),
         )
         .await
         .map_err(|_| ZikError::RequestTimeout)?
         .map_err(|e| {
            warn!("RFCOMM connect to {address}:{channel} failed: {e}");
            ZikError::ConnectionFailure(address)
         })?;
         Link {
            stream,
            profile: None,
         }
      },
      None => probe_services(session, address).await?,
   };

   let ack = time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut link.stream, address))
      .await
      .map_err(|_| ZikError::RequestTimeout)??;
   info!("Connected to {address}, handshake ack {} bytes", ack.len());
   Ok(link)
}

async fn probe_services(session: &Session, address: Address) -> Result<Link> {
   for uuid in SERVICE_UUIDS {
      debug!("Finding service {uuid} on {address}");
      match connect_service(session, address, uuid).await {
         Ok(link) => return Ok(link),
         Err(e) => warn!("Service {uuid} on {address}: {e}"),
      }
   }
   Err(ZikError::ConnectionFailure(address))
}

async fn connect_service(session: &Session, address: Address, uuid: Uuid) -> Result<Link> {
   let profile = Profile {
      uuid,
      name: Some("Parrot RFcomm service".to_string()),
      role: Some(Role::Client),
      require_authentication: Some(false),
      require_authorization: Some(false),
      auto_connect: Some(false),
      ..Default::default()
   };
   let mut handle = session.register_profile(profile).await?;
   let device = session.default_adapter().await?.device(address)?;

   let stream = time::timeout(
      CONNECT_TIMEOUT,
      accept_request(&mut handle, &device, address, uuid),
   )
   .await
   .map_err(|_| ZikError::RequestTimeout)??;
   Ok(Link {
      stream,
      profile: Some(handle),
   })
}

/// Asks BlueZ to connect the profile and accepts the resulting socket.
async fn accept_request(
   handle: &mut ProfileHandle,
   device: &bluer::Device,
   address: Address,
   uuid: Uuid,
) -> Result<Stream> {
   let connect = device.connect_profile(&uuid);
   tokio::pin!(connect);
   let mut connect_done = false;
   loop {
      select! {
         res = &mut connect, if !connect_done => {
            res?;
            connect_done = true;
         }
         req = handle.next() => {
            let Some(req) = req else {
               return Err(ZikError::ConnectionFailure(address));
            };
            if req.device() == address {
               return Ok(req.accept()?);
            }
            debug!("Rejecting RFCOMM request from {}", req.device());
            req.reject(ReqError::Rejected);
         }
      }
   }
}

/// Sends the opening bytes and returns the acknowledgment.
pub async fn handshake<S>(stream: &mut S, address: Address) -> Result<Frame>
where
   S: AsyncRead + AsyncWrite + Unpin,
{
   debug!("→ {address}: {}", hex::encode(PKT_HANDSHAKE));
   stream.write_all(PKT_HANDSHAKE).await?;
   stream.flush().await?;

   let mut buf = [0u8; HANDSHAKE_ACK_MAX];
   let n = stream.read(&mut buf).await?;
   if n == 0 {
      return Err(ZikError::ConnectionFailure(address));
   }
   debug!("← {address}: {}", hex::encode(&buf[..n]));
   Ok(Frame::from_slice(&buf[..n]))
}

#[cfg(test)]
mod tests {
   use tokio::io::duplex;

   use super::*;

   #[tokio::test]
   async fn handshake_sends_opening_bytes() {
      let (mut client, mut headset) = duplex(4096);
      let peer = tokio::spawn(async move {
         let mut hello = [0u8; 3];
         headset.read_exact(&mut hello).await.unwrap();
         headset.write_all(&[0x00, 0x03, 0x02]).await.unwrap();
         hello
      });

      let ack = handshake(&mut client, Address::any()).await.unwrap();
      assert_eq!(&ack[..], &[0x00, 0x03, 0x02]);
      assert_eq!(peer.await.unwrap(), [0x00, 0x03, 0x00]);
   }

   #[tokio::test]
   async fn handshake_ack_is_capped() {
      let (mut client, mut headset) = duplex(4096);
      tokio::spawn(async move {
         let mut hello = [0u8; 3];
         headset.read_exact(&mut hello).await.unwrap();
         headset.write_all(&[0xAB; 2000]).await.unwrap();
         // Keep the pipe open until the client is done.
         let _ = headset.read(&mut hello).await;
      });

      let ack = handshake(&mut client, Address::any()).await.unwrap();
      assert!(!ack.is_empty());
      assert!(ack.len() <= HANDSHAKE_ACK_MAX);
   }

   #[tokio::test]
   async fn handshake_on_closed_socket_fails() {
      let (mut client, mut headset) = duplex(64);
      tokio::spawn(async move {
         let mut hello = [0u8; 3];
         headset.read_exact(&mut hello).await.unwrap();
         drop(headset);
      });

      assert!(matches!(
         handshake(&mut client, Address::any()).await,
         Err(ZikError::ConnectionFailure(_))
      ));
   }

   #[test]
   fn service_uuids_in_probe_order() {
      assert_eq!(
         SERVICE_UUIDS[0].to_string(),
         "0ef0f502-f0ee-46c9-986c-54ed027807fb"
      );
      assert_eq!(
         SERVICE_UUIDS[2].to_string(),
         "8b6814d3-6ce7-4498-9700-9312c1711f64"
      );
   }
}

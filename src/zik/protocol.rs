//! Zik protocol definitions and data structures.
//!
//! This module contains the RFCOMM service identifiers, the handshake, the
//! request/answer framing and the handful of resources the tray uses.

use std::sync::LazyLock;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use regex::Regex;
use smallvec::SmallVec;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::error::{Result, ZikError};

pub type Frame = SmallVec<[u8; 64]>;

/// RFCOMM service classes advertised by the different Zik generations.
pub const SERVICE_UUIDS: [Uuid; 3] = [
   Uuid::from_u128(0x0ef0f502_f0ee_46c9_986c_54ed027807fb),
   Uuid::from_u128(0x8b6814d3_6ce7_4498_9700_9312c1711f63),
   Uuid::from_u128(0x8b6814d3_6ce7_4498_9700_9312c1711f64),
];

/// Opening bytes sent right after the socket connects.
pub const PKT_HANDSHAKE: &[u8] = &[0x00, 0x03, 0x00];
/// Largest handshake acknowledgment read back.
pub const HANDSHAKE_ACK_MAX: usize = 1024;

/// Request frame: `len_hi len_lo 0x80 body`.
const REQUEST_TYPE: u8 = 0x80;
const REQUEST_HEADER_LEN: usize = 3;
/// Answer frame: 7 byte header, total length in the first two bytes.
pub const ANSWER_HEADER_LEN: usize = 7;

/// Characters escaped in a `SET` argument so it stays one query value.
const ARG_ESCAPES: &AsciiSet = &CONTROLS
   .add(b' ')
   .add(b'"')
   .add(b'#')
   .add(b'%')
   .add(b'&')
   .add(b'+')
   .add(b'<')
   .add(b'>')
   .add(b'=')
   .add(b'?');

// Resources
pub const RES_BATTERY: &str = "/api/system/battery";
pub const RES_NOISE_CANCELLATION: &str = "/api/audio/noise_cancellation/enabled";
pub const RES_VERSION: &str = "/api/software/version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum Method {
   #[strum(serialize = "get")]
   Get,
   #[strum(serialize = "set")]
   Set,
}

/// Builds the request frame for `method` on `path`.
pub fn build_request(path: &str, method: Method, arg: Option<&str>) -> Result<Frame> {
   let body = match (method, arg) {
      (Method::Set, Some(arg)) => {
         format!("SET {path}/set?arg={}", utf8_percent_encode(arg, ARG_ESCAPES))
      },
      (Method::Set, None) => format!("SET {path}/set"),
      (Method::Get, _) => format!("GET {path}/get"),
   };
   let total = u16::try_from(body.len() + REQUEST_HEADER_LEN)
      .map_err(|_| ZikError::InvalidAnswer(format!("request for {path} too large")))?;

   let mut frame = Frame::with_capacity(total as usize);
   frame.extend_from_slice(&total.to_be_bytes());
   frame.push(REQUEST_TYPE);
   frame.extend_from_slice(body.as_bytes());
   Ok(frame)
}

/// Returns the number of body bytes following an answer header.
pub fn answer_body_len(header: &[u8; ANSWER_HEADER_LEN]) -> Result<usize> {
   let total = u16::from_be_bytes([header[0], header[1]]) as usize;
   total.checked_sub(ANSWER_HEADER_LEN).ok_or_else(|| {
      ZikError::InvalidAnswer(format!("frame length {total} shorter than its header"))
   })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
   Answer,
   Notify,
}

/// A decoded XML message from the headset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
   pub kind: MessageKind,
   /// Resource path without the trailing `/get` or `/set`.
   pub path: SmolStr,
   pub xml: String,
}

static ROOT: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r#"<(answer|notify)\b[^>]*?\bpath="([^"]*)""#).expect("valid root pattern")
});

impl Message {
   pub fn parse(body: &[u8]) -> Result<Self> {
      let xml = String::from_utf8_lossy(body)
         .trim_end_matches(['\0', '\r', '\n', ' '])
         .to_string();
      let caps = ROOT
         .captures(&xml)
         .ok_or_else(|| ZikError::InvalidAnswer(xml.clone()))?;
      let kind = if &caps[1] == "notify" {
         MessageKind::Notify
      } else {
         MessageKind::Answer
      };
      let path = resource_of(&caps[2]).into();
      Ok(Self { kind, path, xml })
   }

   /// Looks up `name` on the first `element` tag of the document.
   pub fn attr(&self, element: &str, name: &str) -> Option<&str> {
      let pattern = format!(
         r#"<{}\b[^>]*?\b{}="([^"]*)""#,
         regex::escape(element),
         regex::escape(name)
      );
      let re = Regex::new(&pattern).ok()?;
      re.captures(&self.xml)
         .and_then(|c| c.get(1))
         .map(|m| m.as_str())
   }

   pub fn is_error(&self) -> bool {
      self.kind == MessageKind::Answer && self.attr("answer", "error") == Some("true")
   }
}

/// Strips the method suffix and query from a request path.
fn resource_of(path: &str) -> &str {
   let path = path.split_once('?').map_or(path, |(p, _)| p);
   path
      .strip_suffix("/get")
      .or_else(|| path.strip_suffix("/set"))
      .unwrap_or(path)
}

/// Battery charge state as reported by the headset.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum BatteryState {
   InUse,
   Charging,
   Charged,
   #[default]
   Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Battery {
   pub state: BatteryState,
   pub level: u8,
}

impl Battery {
   pub fn from_message(msg: &Message) -> Result<Self> {
      let state = msg
         .attr("battery", "state")
         .and_then(|s| s.parse().ok())
         .unwrap_or_default();
      // Zik 1 reports `level`, later models `percent`.
      let level = msg
         .attr("battery", "percent")
         .or_else(|| msg.attr("battery", "level"))
         .and_then(|l| l.parse::<u8>().ok())
         .ok_or_else(|| ZikError::InvalidAnswer(msg.xml.clone()))?;
      Ok(Self {
         state,
         level: level.min(100),
      })
   }

   pub fn is_charging(&self) -> bool {
      self.state == BatteryState::Charging
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn get_request_frame() {
      let frame = build_request(RES_BATTERY, Method::Get, None).unwrap();
      let body = b"GET /api/system/battery/get";
      assert_eq!(&frame[..3], &[0x00, (body.len() + 3) as u8, 0x80]);
      assert_eq!(&frame[3..], body);
   }

   #[test]
   fn set_request_carries_argument() {
      let frame = build_request(RES_NOISE_CANCELLATION, Method::Set, Some("true")).unwrap();
      assert_eq!(
         &frame[3..],
         b"SET /api/audio/noise_cancellation/enabled/set?arg=true"
      );
      assert_eq!(u16::from_be_bytes([frame[0], frame[1]]) as usize, frame.len());
   }

   #[test]
   fn set_argument_is_escaped() {
      let frame =
         build_request("/api/bluetooth/friendlyname", Method::Set, Some("My Zik&co")).unwrap();
      assert_eq!(
         &frame[3..],
         b"SET /api/bluetooth/friendlyname/set?arg=My%20Zik%26co"
      );

      let frame = build_request(RES_NOISE_CANCELLATION, Method::Set, Some("1.5-x")).unwrap();
      assert!(frame.ends_with(b"?arg=1.5-x"));
   }

   #[test]
   fn oversized_request_is_rejected() {
      let path = "/".repeat(u16::MAX as usize);
      assert!(build_request(&path, Method::Get, None).is_err());
   }

   #[test]
   fn answer_header_length() {
      assert_eq!(answer_body_len(&[0x00, 0x10, 0, 0, 0, 0, 0]).unwrap(), 9);
      assert_eq!(answer_body_len(&[0x01, 0x00, 0, 0, 0, 0, 0]).unwrap(), 249);
      assert!(answer_body_len(&[0x00, 0x03, 0, 0, 0, 0, 0]).is_err());
   }

   #[test]
   fn parses_answer() {
      let msg = Message::parse(
         br#"<?xml version="1.0" encoding="UTF-8" ?><answer path="/api/system/battery/get"><system><battery state="charging" percent="42"/></system></answer>"#,
      )
      .unwrap();
      assert_eq!(msg.kind, MessageKind::Answer);
      assert_eq!(msg.path, RES_BATTERY);
      assert!(!msg.is_error());

      let battery = Battery::from_message(&msg).unwrap();
      assert_eq!(battery.state, BatteryState::Charging);
      assert_eq!(battery.level, 42);
      assert!(battery.is_charging());
   }

   #[test]
   fn parses_notification() {
      let msg =
         Message::parse(br#"<notify path="/api/audio/noise_cancellation/enabled/get"/>"#).unwrap();
      assert_eq!(msg.kind, MessageKind::Notify);
      assert_eq!(msg.path, RES_NOISE_CANCELLATION);
   }

   #[test]
   fn error_answer() {
      let msg =
         Message::parse(br#"<answer path="/api/software/version/get" error="true"/>"#).unwrap();
      assert!(msg.is_error());
   }

   #[test]
   fn zik1_battery_level_and_unknown_state() {
      let msg = Message::parse(
         br#"<answer path="/api/system/battery/get"><system><battery state="sleeping" level="80"/></system></answer>"#,
      )
      .unwrap();
      let battery = Battery::from_message(&msg).unwrap();
      assert_eq!(battery.state, BatteryState::Unknown);
      assert_eq!(battery.level, 80);
   }

   #[test]
   fn garbage_is_invalid() {
      assert!(matches!(
         Message::parse(b"\x00\x00garbage"),
         Err(ZikError::InvalidAnswer(_))
      ));
   }

   #[test]
   fn strips_query_from_path() {
      assert_eq!(
         resource_of("/api/audio/noise_cancellation/enabled/set?arg=true"),
         RES_NOISE_CANCELLATION
      );
      assert_eq!(resource_of("/api/system/battery"), RES_BATTERY);
   }
}

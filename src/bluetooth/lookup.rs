//! Platform-specific discovery of the paired Zik's address.
//!
//! Every platform keeps its pairing records somewhere different: BlueZ
//! exposes them over D-Bus (and through its helper tools), macOS stores
//! them in a binary property list and Windows in the registry. The
//! [`MacFinder`] walks the methods configured for the running platform
//! and returns the first paired address with a Zik vendor prefix.

use std::{io::Cursor, path::PathBuf, process::Stdio, time::Duration};

use bluer::{Address, Session};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, process::Command, time};

use crate::{
   bluetooth::address,
   error::{Result, ZikError},
};

/// Where macOS keeps its Bluetooth pairing records.
pub const DEFAULT_PLIST_PATH: &str = "/Library/Preferences/com.apple.Bluetooth.plist";

/// Registry subtree listing paired devices on Windows.
#[cfg_attr(not(windows), allow(dead_code))]
const BTHPORT_DEVICES: &str = r"SYSTEM\CurrentControlSet\Services\BTHPORT\Parameters\Devices";

/// Upper bound for a helper tool invocation.
const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Method used to find the headset address.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LookupMethod {
   /// Platform default chain.
   #[default]
   Auto,
   /// BlueZ over D-Bus.
   Bluer,
   /// `bluez-test-adapter` / `bluez-test-device` scripts.
   BluezTest,
   /// Interactive `bluetoothctl`.
   Bluetoothctl,
   /// macOS binary property list.
   Plist,
   /// Windows BTHPORT registry subtree.
   Registry,
}

#[cfg(target_os = "macos")]
const PLATFORM_CHAIN: &[LookupMethod] = &[LookupMethod::Plist];
#[cfg(windows)]
const PLATFORM_CHAIN: &[LookupMethod] = &[LookupMethod::Registry];
#[cfg(not(any(target_os = "macos", windows)))]
const PLATFORM_CHAIN: &[LookupMethod] = &[
   LookupMethod::Bluer,
   LookupMethod::BluezTest,
   LookupMethod::Bluetoothctl,
];

impl LookupMethod {
   /// Methods to try, in order.
   pub fn chain(self) -> &'static [Self] {
      match self {
         Self::Auto => PLATFORM_CHAIN,
         Self::Bluer => &[Self::Bluer],
         Self::BluezTest => &[Self::BluezTest],
         Self::Bluetoothctl => &[Self::Bluetoothctl],
         Self::Plist => &[Self::Plist],
         Self::Registry => &[Self::Registry],
      }
   }
}

/// Finds the paired headset with the configured lookup method.
#[derive(Clone)]
pub struct MacFinder {
   method: LookupMethod,
   plist_path: PathBuf,
   session: Session,
}

impl MacFinder {
   pub fn new(method: LookupMethod, plist_path: PathBuf, session: Session) -> Self {
      Self {
         method,
         plist_path,
         session,
      }
   }

   /// Reports whether the Bluetooth radio is powered.
   ///
   /// The first method in the chain that can answer decides. Methods with
   /// no notion of power state report it as on.
   pub async fn is_bluetooth_on(&self) -> Result<bool> {
      walk_chain(self.method.chain(), "Power state", |method| self.powered(method)).await
   }

   /// Returns the address of the first paired Zik.
   pub async fn get_mac(&self) -> Result<Address> {
      let addr = walk_chain(self.method.chain(), "Lookup", |method| self.lookup(method)).await?;
      info!("Found paired Zik {addr}");
      Ok(addr)
   }

   async fn powered(&self, method: LookupMethod) -> Result<bool> {
      match method {
         LookupMethod::Bluer => {
            let adapter = self.session.default_adapter().await?;
            Ok(adapter.is_powered().await?)
         },
         LookupMethod::BluezTest => {
            let output = run_tool("bluez-test-adapter", &["powered"], None).await?;
            Ok(parse_powered(&output))
         },
         LookupMethod::Registry => registry_available(),
         LookupMethod::Auto | LookupMethod::Bluetoothctl | LookupMethod::Plist => Ok(true),
      }
   }

   async fn lookup(&self, method: LookupMethod) -> Result<Address> {
      match method {
         LookupMethod::Bluer => bluer_lookup(&self.session).await,
         LookupMethod::BluezTest => {
            let output = run_tool("bluez-test-device", &["list"], None).await?;
            address::find_zik_address(&output).ok_or(ZikError::DeviceNotConnected)
         },
         LookupMethod::Bluetoothctl => {
            let output = run_tool("bluetoothctl", &[], Some(b"exit\n")).await?;
            address::find_zik_address(&output).ok_or(ZikError::DeviceNotConnected)
         },
         LookupMethod::Plist => plist_lookup(&self.plist_path).await,
         LookupMethod::Registry => registry_lookup(),
         LookupMethod::Auto => Err(ZikError::DeviceNotConnected),
      }
   }
}

/// Tries each method in turn until one of them answers.
///
/// A method whose backend is missing falls through to the next one; any
/// other error ends the walk. When every method is unavailable the last
/// error is returned.
async fn walk_chain<T, F, Fut>(chain: &[LookupMethod], what: &str, mut attempt: F) -> Result<T>
where
   F: FnMut(LookupMethod) -> Fut,
   Fut: Future<Output = Result<T>>,
{
   let mut last_err = ZikError::DeviceNotConnected;
   for &method in chain {
      debug!("{what} via {method}");
      match attempt(method).await {
         Ok(value) => return Ok(value),
         Err(e) if e.is_tool_unavailable() => {
            warn!("{what} via {method} unavailable: {e}");
            last_err = e;
         },
         Err(e) => return Err(e),
      }
   }
   Err(last_err)
}

async fn bluer_lookup(session: &Session) -> Result<Address> {
   let adapter = session.default_adapter().await?;
   for addr in adapter.device_addresses().await? {
      if !address::is_zik(addr) {
         continue;
      }
      let device = adapter.device(addr)?;
      if device.is_paired().await.unwrap_or(false) {
         return Ok(addr);
      }
      debug!("Ignoring unpaired Zik {addr}");
   }
   Err(ZikError::DeviceNotConnected)
}

/// Reads the `PairedDevices` list of a macOS Bluetooth property list.
pub async fn plist_lookup(path: &std::path::Path) -> Result<Address> {
   let bytes = tokio::fs::read(path).await?;
   let value = plist::Value::from_reader(Cursor::new(bytes))?;
   paired_from_plist(&value).ok_or(ZikError::DeviceNotConnected)
}

fn paired_from_plist(value: &plist::Value) -> Option<Address> {
   value
      .as_dictionary()?
      .get("PairedDevices")?
      .as_array()?
      .iter()
      .filter_map(plist::Value::as_string)
      .find_map(|mac| address::find_zik_address(&address::normalize(mac)))
}

#[cfg(windows)]
fn registry_available() -> Result<bool> {
   Ok(true)
}

#[cfg(not(windows))]
fn registry_available() -> Result<bool> {
   Err(ZikError::UnsupportedPlatform("registry"))
}

#[cfg(windows)]
fn registry_lookup() -> Result<Address> {
   use winreg::{RegKey, enums::HKEY_LOCAL_MACHINE};

   debug!("Opening {BTHPORT_DEVICES}");
   let devices = RegKey::predef(HKEY_LOCAL_MACHINE).open_subkey(BTHPORT_DEVICES)?;
   // Iteration ends on ERROR_NO_MORE_ITEMS; any other failure surfaces as an error.
   for name in devices.enum_keys() {
      let name = name?;
      debug!("Paired device key {name}");
      if let Some(mac) = address::from_registry_key(&name)
         && let Some(addr) = address::find_zik_address(&mac)
      {
         return Ok(addr);
      }
   }
   Err(ZikError::DeviceNotConnected)
}

#[cfg(not(windows))]
fn registry_lookup() -> Result<Address> {
   Err(ZikError::UnsupportedPlatform("registry"))
}

/// Interprets `bluez-test-adapter powered` output.
fn parse_powered(output: &str) -> bool {
   matches!(
      output.trim().to_ascii_lowercase().as_str(),
      "1" | "true" | "yes" | "on"
   )
}

/// Runs a helper tool, optionally feeding it `input`, and returns its
/// combined stdout and stderr.
async fn run_tool(program: &str, args: &[&str], input: Option<&[u8]>) -> Result<String> {
   debug!("Running {program} {}", args.join(" "));
   let mut child = Command::new(program)
      .args(args)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()?;

   // Dropping stdin closes it so the tool sees EOF.
   if let Some(mut stdin) = child.stdin.take()
      && let Some(input) = input
   {
      stdin.write_all(input).await?;
   }

   let output = time::timeout(TOOL_TIMEOUT, child.wait_with_output())
      .await
      .map_err(|_| ZikError::RequestTimeout)??;

   let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
   text.push_str(&String::from_utf8_lossy(&output.stderr));
   Ok(text)
}

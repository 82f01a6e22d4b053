//! Recognition of Parrot Zik MAC addresses.
//!
//! Zik headsets are recognized purely by the vendor prefix of their
//! Bluetooth address. Paired-device records come in a few textual forms
//! depending on the platform, so this module also normalizes those.

use std::{str::FromStr, sync::LazyLock};

use bluer::Address;
use regex::Regex;

/// Vendor prefixes (first two octets) assigned to Zik headsets.
pub const ZIK_PREFIXES: [[u8; 2]; 2] = [[0x90, 0x03], [0xA0, 0x14]];

static ZIK_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"(?i)\b(?:90:03|a0:14)(?::[0-9a-f]{2}){4}\b").expect("valid address pattern")
});

/// Checks whether `s` contains a Zik address.
pub fn is_zik_address(s: &str) -> bool {
   ZIK_ADDRESS.is_match(s)
}

/// Returns the first Zik address found anywhere in `text`.
pub fn find_zik_address(text: &str) -> Option<Address> {
   ZIK_ADDRESS
      .find_iter(text)
      .find_map(|m| Address::from_str(m.as_str()).ok())
}

/// Checks an already parsed address against the vendor prefixes.
pub fn is_zik(address: Address) -> bool {
   ZIK_PREFIXES
      .iter()
      .any(|pfx| address.0.starts_with(pfx))
}

/// Converts the dashed form used by macOS (`90-03-aa-bb-cc-dd`) to colons.
pub fn normalize(s: &str) -> String {
   s.replace('-', ":")
}

/// Converts a BTHPORT registry subkey name (`9003aabbccdd`) to colon form.
#[cfg_attr(not(windows), allow(dead_code))]
pub fn from_registry_key(name: &str) -> Option<String> {
   if name.len() != 12 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
      return None;
   }
   let octets: Vec<&str> = (0..12).step_by(2).map(|i| &name[i..i + 2]).collect();
   Some(octets.join(":").to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn matches_both_vendor_prefixes() {
      assert!(is_zik_address("90:03:AA:BB:CC:DD"));
      assert!(is_zik_address("a0:14:11:22:33:44"));
      assert!(!is_zik_address("00:11:22:33:44:55"));
   }

   #[test]
   fn rejects_truncated_addresses() {
      assert!(!is_zik_address("90:03:AA:BB:CC"));
      assert!(!is_zik_address("12:90:03:AA:BB:CC"));
   }

   #[test]
   fn prefix_may_start_after_a_colon() {
      assert!(is_zik_address("12:90:03:AA:BB:CC:DD"));
      assert!(!is_zik_address("1290:03:AA:BB:CC:DD"));
   }

   #[test]
   fn finds_first_address_in_tool_output() {
      let output = "Device 00:11:22:33:44:55 Speaker\n\
                    Device A0:14:3D:01:02:03 Parrot ZIK 2.0\n\
                    Device 90:03:B7:00:00:01 Parrot ZIK\n";
      let addr = find_zik_address(output).expect("no address found");
      assert_eq!(addr, Address::new([0xA0, 0x14, 0x3D, 0x01, 0x02, 0x03]));
   }

   #[test]
   fn no_address_in_unrelated_output() {
      assert_eq!(find_zik_address("Agent registered\n[bluetooth]# exit"), None);
   }

   #[test]
   fn prefix_check_on_parsed_address() {
      assert!(is_zik(Address::new([0x90, 0x03, 1, 2, 3, 4])));
      assert!(!is_zik(Address::new([0x90, 0x04, 1, 2, 3, 4])));
   }

   #[test]
   fn normalizes_dashed_addresses() {
      assert_eq!(normalize("90-03-aa-bb-cc-dd"), "90:03:aa:bb:cc:dd");
      assert!(is_zik_address(&normalize("a0-14-11-22-33-44")));
   }

   #[test]
   fn registry_key_to_address() {
      assert_eq!(
         from_registry_key("9003AABBCCDD").as_deref(),
         Some("90:03:aa:bb:cc:dd")
      );
      assert_eq!(from_registry_key("9003aabbcc"), None);
      assert_eq!(from_registry_key("9003aabbccgg"), None);
   }
}

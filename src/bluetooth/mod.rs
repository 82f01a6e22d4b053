//! Bluetooth layer for the Zik headset.
//!
//! This module provides address recognition, the per-platform lookup of
//! the paired headset, the RFCOMM connector and the connection manager.

pub mod address;
pub mod lookup;
pub mod manager;
pub mod rfcomm;

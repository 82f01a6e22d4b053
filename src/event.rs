//! Event handling system for headset status updates.
//!
//! This module provides the event infrastructure for notifying the tray
//! and the D-Bus interface about connection, battery and setting changes.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

use crate::zik::protocol::Battery;

/// Events that can be emitted by the headset manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ZikEvent {
   Connected {
      address: Address,
      firmware: Option<SmolStr>,
   },
   Disconnected,
   BatteryUpdated(Battery),
   NoiseCancellationChanged(bool),
   Error(SmolStr),
}

impl ZikEvent {
   /// Whether the event flips the `Connected` property.
   pub fn changes_connection(&self) -> bool {
      matches!(self, Self::Connected { .. } | Self::Disconnected)
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: ZikEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

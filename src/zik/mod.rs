//! Parrot Zik protocol and resource access.
//!
//! This module contains the request/answer framing spoken over the
//! RFCOMM control channel and the resource manager built on top of it.

pub mod protocol;
pub mod resource;

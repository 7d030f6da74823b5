#![cfg_attr(docsrs, feature(doc_cfg))]
//! # dalyble_lib
//!
//! This crate decodes the register protocol spoken by Daly BMS (Battery Management System)
//! devices over Bluetooth LE and collects readings from several devices at once.
//!
//! A BLE notification carries one or more frames, each starting with `D2 03`, followed by a
//! command byte, a payload of big endian 16 bit registers and a 2 byte suffix. Two frame kinds
//! are understood: configuration (`0x52`) and runtime (`0x7C`).
//!
//! ```
//! use dalyble_lib::protocol::{decode_notification, DecodedFrame};
//!
//! let notification = [0xd2, 0x03, 0x52, 0x0c, 0x1c, 0x00, 0x00];
//! let frames = decode_notification(&notification).unwrap();
//! match &frames[0] {
//!     Ok(DecodedFrame::Configuration(config)) => assert_eq!(config.rated_capacity_ah, Some(3.1)),
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `dalyble` command-line tool
//!   and pulls in `ble`, so the tool can acquire from real devices.
//! - `serde`: Enables `serde` serialization of readings and acquisition events.
//! - `ble`: Enables the Bluetooth LE transport based on the `bluest` crate.

/// Contains error types for the library.
mod error;
/// Frame splitting and decoding of the Daly BLE register protocol.
pub mod protocol;
/// Per device acquisition over an abstract transport.
pub mod session;

pub use error::Error;

/// Bluetooth LE transport.
#[cfg_attr(docsrs, doc(cfg(feature = "ble")))]
#[cfg(feature = "ble")]
pub mod ble;

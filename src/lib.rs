//! tapbeacon library: portable tap-to-card decoding and covert beacon encoding.
//!
//! A wrist-worn accelerometer picks up taps; two pause-separated bursts of
//! taps spell a playing card (suit, then rank); the card is hidden in
//! zero-width characters of an 802.11 SSID and broadcast as a short burst
//! of beacon frames that look like an ordinary network.
//!
//! This crate holds all sensing, decoding, encoding and protocol logic with
//! no platform dependencies, testable on any host with `cargo test`. The
//! firmware binaries (Embassy in `src/main.rs`, ESP-IDF in `firmware-std/`)
//! are thin consumers that provide the I2C bus, the radio and the clock.
//!
//! Pipeline: [`accel`] → [`detector`] → [`decoder`] (composed in
//! [`pipeline`]) → [`beacon`] using [`stego`] names. [`protocol`] and
//! [`comm`] carry telemetry and commands to a companion app.

#![cfg_attr(not(test), no_std)]

pub mod accel;
pub mod beacon;
pub mod board;
pub mod card;
pub mod comm;
pub mod config;
pub mod decoder;
pub mod defaults;
pub mod detector;
pub mod pipeline;
pub mod protocol;
pub mod stego;

//! Instrument endpoints.
//!
//! Real drivers (GPIB/serial instruments) live outside this crate and plug
//! in through the traits in [`crate::parameter`]. This module carries the
//! mock endpoints used by tests and demos.

pub mod mock;

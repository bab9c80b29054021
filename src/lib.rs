//! Core library for the half-duplex Modbus-RTU bus arbiter, register
//! dispatcher, and Modbus-TCP injection gateway described by the crate's
//! design documents.

pub mod arbiter;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod metrics;
pub mod registers;
pub mod rules;
pub mod serial_io;

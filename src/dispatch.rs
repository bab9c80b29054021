//! Register dispatcher: maps base register addresses to typed decoders that
//! publish values into the metrics sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use prometheus::{Gauge, GaugeVec, Registry};

use crate::frame::Exchange;

type DecodeFn = Box<dyn Fn(&[u8]) -> Option<f64> + Send + Sync>;

/// Big-endian, width- and sign-aware register decoders. Handlers that need
/// four bytes but are handed fewer (a read response that happened to fall
/// short of a 32-bit value at the end of the register range) decode to
/// `None` and are silently skipped rather than treated as an error.
pub fn decode_u16(scale: f64) -> DecodeFn {
    Box::new(move |data| {
        (data.len() >= 2).then(|| u16::from_be_bytes([data[0], data[1]]) as f64 * scale)
    })
}

pub fn decode_s16(scale: f64) -> DecodeFn {
    Box::new(move |data| {
        (data.len() >= 2).then(|| i16::from_be_bytes([data[0], data[1]]) as f64 * scale)
    })
}

pub fn decode_u32(scale: f64) -> DecodeFn {
    Box::new(move |data| {
        (data.len() >= 4)
            .then(|| u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64 * scale)
    })
}

pub fn decode_s32(scale: f64) -> DecodeFn {
    Box::new(move |data| {
        (data.len() >= 4)
            .then(|| i32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64 * scale)
    })
}

/// A scalar gauge, registered lazily on first successful decode so that
/// registers which never arrive on the bus do not produce a spurious zero
/// sample.
pub struct GaugeHandler {
    gauge: Gauge,
    registry: Registry,
    registered: AtomicBool,
    decode: DecodeFn,
}

impl GaugeHandler {
    pub fn new(gauge: Gauge, registry: Registry, decode: DecodeFn) -> Self {
        GaugeHandler {
            gauge,
            registry,
            registered: AtomicBool::new(false),
            decode,
        }
    }

    fn process(&self, data: &[u8]) {
        let Some(value) = (self.decode)(data) else {
            return;
        };
        if !self.registered.swap(true, Ordering::AcqRel) {
            let _ = self.registry.register(Box::new(self.gauge.clone()));
        }
        self.gauge.set(value);
    }
}

/// A handler targeting one slot of a vector gauge with fixed label values.
/// Vector gauges are registered eagerly at construction time, because one
/// vector commonly backs several handlers with distinct label values.
pub struct GaugeVecHandler {
    vec: GaugeVec,
    labels: Vec<String>,
    decode: DecodeFn,
}

impl GaugeVecHandler {
    pub fn new(vec: GaugeVec, labels: Vec<String>, decode: DecodeFn) -> Self {
        GaugeVecHandler {
            vec,
            labels,
            decode,
        }
    }

    fn process(&self, data: &[u8]) {
        let Some(value) = (self.decode)(data) else {
            return;
        };
        let refs: Vec<&str> = self.labels.iter().map(String::as_str).collect();
        self.vec.with_label_values(&refs).set(value);
    }
}

/// The inverter-info handler: extracts hex-formatted model/version words
/// and a printable serial number from a 40-byte block, resetting the
/// label set first so stale identifiers never linger after a firmware
/// change.
pub struct InverterInfoHandler {
    vec: GaugeVec,
}

impl InverterInfoHandler {
    pub fn new(vec: GaugeVec) -> Self {
        InverterInfoHandler { vec }
    }

    fn process(&self, data: &[u8]) {
        if data.len() < 40 {
            return;
        }
        let word = |lo: usize| format!("{:04X}", u16::from_be_bytes([data[lo], data[lo + 1]]));
        let serial_bytes = &data[8..40];
        let trimmed = serial_bytes
            .iter()
            .rposition(|&b| b != 0)
            .map(|last| &serial_bytes[..=last])
            .unwrap_or(&[]);
        let serial = String::from_utf8_lossy(trimmed).into_owned();

        self.vec.reset();
        self.vec
            .with_label_values(&[&word(0), &word(2), &word(4), &word(6), &serial])
            .set(1.0);
    }
}

/// The battery-current handler: sign is inverted when the companion
/// direction word (the following register) reads 1 ("discharging"), to
/// match the polarity convention used by the vendor's own cloud graphs.
pub struct BatteryCurrentHandler {
    gauge: Gauge,
    registry: Registry,
    registered: AtomicBool,
    scale: f64,
}

impl BatteryCurrentHandler {
    pub fn new(gauge: Gauge, registry: Registry, scale: f64) -> Self {
        BatteryCurrentHandler {
            gauge,
            registry,
            registered: AtomicBool::new(false),
            scale,
        }
    }

    fn process(&self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        let magnitude = u16::from_be_bytes([data[0], data[1]]) as f64 * self.scale;
        let direction = u16::from_be_bytes([data[2], data[3]]);
        let value = if direction == 1 {
            -magnitude
        } else {
            magnitude
        };
        if !self.registered.swap(true, Ordering::AcqRel) {
            let _ = self.registry.register(Box::new(self.gauge.clone()));
        }
        self.gauge.set(value);
    }
}

pub enum Handler {
    Gauge(GaugeHandler),
    GaugeVec(GaugeVecHandler),
    InverterInfo(InverterInfoHandler),
    BatteryCurrent(BatteryCurrentHandler),
}

impl Handler {
    fn process(&self, data: &[u8]) {
        match self {
            Handler::Gauge(h) => h.process(data),
            Handler::GaugeVec(h) => h.process(data),
            Handler::InverterInfo(h) => h.process(data),
            Handler::BatteryCurrent(h) => h.process(data),
        }
    }
}

/// Owns the register_base -> handler map and dispatches decoded register
/// values out of successful read exchanges.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<u16, Handler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher::default()
    }

    /// Registers `handler` at `base`. Duplicate registration is a
    /// configuration bug and is reported as an error rather than silently
    /// overwriting — callers should treat it as fatal at startup.
    pub fn add_handler(&mut self, base: u16, handler: Handler) -> Result<()> {
        if self.handlers.contains_key(&base) {
            return Err(anyhow!("duplicate metric registration at register {base}"));
        }
        self.handlers.insert(base, handler);
        Ok(())
    }

    /// Dispatches a completed, error-free exchange for `station` against
    /// every handler whose register falls inside `[base, base + count)`.
    /// Only function codes 3 (read holding registers) and 4 (read input
    /// registers) carry register data; other functions are not dispatched.
    pub fn dispatch(&self, station: u8, exchange: &Exchange) {
        if exchange.error.is_some() || exchange.exception != 0 {
            return;
        }
        if exchange.station != station {
            return;
        }
        if !matches!(exchange.function, 3 | 4) {
            return;
        }

        let limit = exchange.base.saturating_add(exchange.count);
        let mut register = exchange.base;
        while register < limit {
            if let Some(handler) = self.handlers.get(&register) {
                let offset = ((register - exchange.base) as usize) * 2;
                if offset + 1 < exchange.data.len() {
                    handler.process(&exchange.data[offset..]);
                }
            }
            register = register.wrapping_add(1);
        }
    }
}

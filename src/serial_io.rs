//! Dedicated-thread serial reader.
//!
//! Must be started on its own OS thread: reads are blocking, with the
//! underlying driver's timeout mutated between an indefinite wait for
//! line activity and a permissive 50 ms intra-frame window, so running it
//! on the async runtime's own executor thread would stall every other
//! task for as long as the bus stays quiet.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use flume::Sender;
use serialport::SerialPort;

use crate::arbiter::{new_exchange_cell, release, try_claim, ExchangeCell, ERROR_TIMEOUT, RESPONSE_TIMEOUT};
use crate::error::ErrorKind;
use crate::frame::{parse_request, parse_response, Exchange};

const READ_BUF_SIZE: usize = 256;

/// Handles produced by [`spawn`]: the shared current-exchange cell and
/// the channel endpoints the arbiter needs to receive from.
pub struct SerialHandles {
    pub cell: ExchangeCell,
    pub sniffer_rx: flume::Receiver<Exchange>,
    pub busy_rx: flume::Receiver<()>,
    pub response_rx: flume::Receiver<()>,
}

/// Spawns the reader thread and returns the channel endpoints the rest of
/// the process needs. `dump` mirrors the original's `serial.dump` option,
/// tracing every frame at debug level.
pub fn spawn(mut port: Box<dyn SerialPort>, dump: bool) -> SerialHandles {
    let cell = new_exchange_cell();
    let (sniffer_tx, sniffer_rx) = flume::bounded(1);
    let (busy_tx, busy_rx) = flume::bounded(1);
    let (response_tx, response_rx) = flume::bounded(1);

    let thread_cell = Arc::clone(&cell);
    std::thread::spawn(move || {
        reader_loop(port.as_mut(), &thread_cell, &sniffer_tx, &busy_tx, &response_tx, dump);
    });

    SerialHandles {
        cell,
        sniffer_rx,
        busy_rx,
        response_rx,
    }
}

fn reader_loop(
    port: &mut dyn SerialPort,
    cell: &ExchangeCell,
    sniffer_tx: &Sender<Exchange>,
    busy_tx: &Sender<()>,
    response_tx: &Sender<()>,
    dump: bool,
) {
    let mut dummy = [0u8; READ_BUF_SIZE];
    loop {
        // RECOVERING: discard until the line has been silent for ERROR_TIMEOUT.
        let _ = port.set_timeout(ERROR_TIMEOUT);
        loop {
            match port.read(&mut dummy) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => {
                    log::warn!("serial discard read error: {e}");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }

        if !request_response_cycle(port, cell, sniffer_tx, busy_tx, response_tx, dump) {
            continue;
        }
    }
}

/// Runs one or more request/response frame cycles until a gross error
/// forces a return to RECOVERING (signalled by returning `false`).
fn request_response_cycle(
    port: &mut dyn SerialPort,
    cell: &ExchangeCell,
    sniffer_tx: &Sender<Exchange>,
    busy_tx: &Sender<()>,
    response_tx: &Sender<()>,
    dump: bool,
) -> bool {
    loop {
        let mut buf = vec![0u8; READ_BUF_SIZE];

        // Wait forever for the first byte of a new frame.
        let _ = port.set_timeout(Duration::from_secs(3600 * 24 * 365));
        let n = match port.read(&mut buf[0..1]) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("serial first-byte read error: {e}");
                return false;
            }
        };
        if n != 1 {
            log::warn!("serial first-byte read: expected 1 byte, got {n}");
            return false;
        }

        let is_request = try_claim(cell, Exchange::new(true));
        if is_request {
            let _ = busy_tx.try_send(());
        }

        let _ = port.set_timeout(Duration::from_millis(50));
        let mut exchange = {
            let guard = cell.load();
            match guard.as_ref() {
                Some(locked) => locked.lock().expect("exchange mutex poisoned").clone(),
                None => Exchange::new(true),
            }
        };

        let ok = if is_request {
            read_remainder(port, &mut buf, 1, true, &mut exchange)
        } else {
            read_remainder(port, &mut buf, 1, false, &mut exchange)
        };

        if let Some(locked) = cell.load().as_ref() {
            *locked.lock().expect("exchange mutex poisoned") = exchange.clone();
        }

        if !ok {
            if is_request {
                log::warn!("request framing error: {:?}", exchange.error);
                release(cell);
                let _ = sniffer_tx.try_send(exchange);
                return false;
            }
            // Response framing error: the exchange (with its error already
            // set) is still sitting in the cell; wake the arbiter so it
            // reports the specific error kind instead of falling through to
            // a generic response timeout.
            log::warn!("response framing error: {:?}", exchange.error);
            let _ = response_tx.try_send(());
            return false;
        }

        if dump {
            if is_request {
                log::debug!("-> {}", format_hex(&exchange.request));
            } else {
                log::debug!("=< {}", format_hex(&exchange.response));
            }
        }

        if is_request {
            if exchange.station != 0 {
                let _ = port.set_timeout(RESPONSE_TIMEOUT);
                let n = match port.read(&mut buf[0..1]) {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
                    Err(e) => {
                        log::warn!("serial response first-byte read error: {e}");
                        0
                    }
                };
                if n == 0 {
                    log::warn!("response: timeout");
                    exchange.error = Some(ErrorKind::Timeout);
                    release(cell);
                    let _ = sniffer_tx.try_send(exchange);
                    return false;
                }
                let _ = port.set_timeout(Duration::from_millis(50));
                if !read_remainder(port, &mut buf, 1, false, &mut exchange) {
                    log::warn!("response framing error: {:?}", exchange.error);
                    release(cell);
                    let _ = sniffer_tx.try_send(exchange);
                    return false;
                }
                if dump {
                    log::debug!("-< {}", format_hex(&exchange.response));
                }
            }
            release(cell);
            let _ = sniffer_tx.try_send(exchange);
        } else {
            // The cell was claimed by the arbiter, not by this thread: leave
            // it populated so the arbiter can read the completed exchange
            // back out of it, and let the arbiter release it.
            let _ = response_tx.try_send(());
        }
    }
}

/// Reads whatever additional bytes the incremental parser still needs,
/// re-invoking it after every read until it reports completion.
fn read_remainder(
    port: &mut dyn SerialPort,
    buf: &mut [u8],
    mut nread: usize,
    is_request: bool,
    exchange: &mut Exchange,
) -> bool {
    let mut remaining = 4usize; // minimum frame is 5 bytes including what we already have
    while remaining > 0 {
        while remaining > 0 {
            let n = match port.read(&mut buf[nread..nread + remaining]) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
                Err(e) => {
                    log::warn!("serial read error: {e}");
                    exchange.error = Some(ErrorKind::Timeout);
                    return false;
                }
            };
            if n == 0 {
                exchange.error = Some(ErrorKind::Timeout);
                return false;
            }
            nread += n;
            remaining -= n;
        }
        remaining = if is_request {
            parse_request(&buf[0..nread], exchange)
        } else {
            parse_response(&buf[0..nread], exchange)
        };
        if exchange.error.is_some() {
            return false;
        }
    }
    true
}

fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

//! The half-duplex bus arbiter: a single control loop that owns the
//! write side of the UART, serializes local injections against a foreign
//! master's traffic, and pairs injected requests with their responses.
//!
//! RECOVERING is realized entirely inside the serial reader thread
//! ([`crate::serial_io`]), which discards bytes until the line has been
//! silent for `ERROR_TIMEOUT` before resuming normal framing. This loop
//! only ever observes BUSY, IDLE, INJECTING and COOLDOWN.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use flume::Receiver;

use crate::dispatch::Dispatcher;
use crate::error::ErrorKind;
use crate::frame::Exchange;
use crate::metrics::Metrics;

pub const ERROR_TIMEOUT: Duration = Duration::from_millis(1500);
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(1500);
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);
pub const POST_TRANSMIT_TIMEOUT: Duration = Duration::from_millis(300);
pub const POST_BROADCAST_TIMEOUT: Duration = Duration::from_millis(500);

/// The single-slot, cross-thread rendezvous point: `None` means the line
/// is idle, `Some` means a frame is in flight (being sniffed or awaiting
/// its injected-request's response). The slot swap itself is lock-free;
/// the inner `Mutex` only serializes field writes by whichever single
/// thread currently holds the claim, and is never held across a blocking
/// read or an await point.
pub type ExchangeCell = Arc<ArcSwapOption<Mutex<Exchange>>>;

pub fn new_exchange_cell() -> ExchangeCell {
    Arc::new(ArcSwapOption::from(None))
}

/// Attempts to claim the cell from idle, installing `exchange`. Returns
/// `true` on success (the caller now owns the in-flight exchange).
pub fn try_claim(cell: &ExchangeCell, exchange: Exchange) -> bool {
    let new = Arc::new(Mutex::new(exchange));
    let prev = cell.compare_and_swap(&None::<Arc<Mutex<Exchange>>>, Some(new));
    prev.is_none()
}

/// Releases the cell back to idle.
pub fn release(cell: &ExchangeCell) {
    cell.store(None);
}

/// A submission queued to the arbiter: an `Exchange` whose `request` is
/// fully populated (valid CRC included), and a single-shot channel the
/// arbiter uses to hand the completed (or failed) exchange back.
pub struct InjectMessage {
    pub exchange: Exchange,
    pub done: tokio::sync::oneshot::Sender<Exchange>,
}

enum NextState {
    Busy,
    Idle,
    Cooldown(Duration),
}

pub struct Arbiter<W: Write> {
    writer: W,
    station: u8,
    cell: ExchangeCell,
    busy_rx: Receiver<()>,
    sniffer_rx: Receiver<Exchange>,
    response_rx: Receiver<()>,
    inject_rx: Receiver<InjectMessage>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
}

impl<W: Write> Arbiter<W> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        writer: W,
        station: u8,
        cell: ExchangeCell,
        busy_rx: Receiver<()>,
        sniffer_rx: Receiver<Exchange>,
        response_rx: Receiver<()>,
        inject_rx: Receiver<InjectMessage>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Arbiter {
            writer,
            station,
            cell,
            busy_rx,
            sniffer_rx,
            response_rx,
            inject_rx,
            dispatcher,
            metrics,
        }
    }

    /// Records the bus-activity counters and, for error-free sniffed or
    /// injected reads, runs the register dispatcher.
    fn publish(&self, exchange: &Exchange) {
        self.metrics.record_exchange(exchange);
        if exchange.error.is_none() {
            self.dispatcher.dispatch(self.station, exchange);
        }
    }

    /// Runs the control loop forever. Only returns if every channel it
    /// depends on has been dropped (process shutdown).
    pub async fn run(mut self) {
        let mut state = NextState::Busy;
        loop {
            state = match state {
                NextState::Busy => self.wait_for_idle().await,
                NextState::Idle => self.idle_once().await,
                NextState::Cooldown(dur) => self.cooldown(dur).await,
            };
        }
    }

    /// BUSY: waits for `BUSY_TIMEOUT` of silence, publishing sniffed
    /// exchanges as they arrive and resetting the timer on any further
    /// activity (busy signal or delivery).
    async fn wait_for_idle(&mut self) -> NextState {
        let sleep = tokio::time::sleep(BUSY_TIMEOUT);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.busy_rx.recv_async() => {
                    sleep.as_mut().reset(tokio::time::Instant::now() + BUSY_TIMEOUT);
                }
                Ok(exchange) = self.sniffer_rx.recv_async() => {
                    self.publish(&exchange);
                    sleep.as_mut().reset(tokio::time::Instant::now() + BUSY_TIMEOUT);
                }
                () = &mut sleep => return NextState::Idle,
            }
        }
    }

    /// IDLE: may accept one pending injection; any sniffed activity sends
    /// the loop back to BUSY.
    async fn idle_once(&mut self) -> NextState {
        tokio::select! {
            _ = self.busy_rx.recv_async() => NextState::Busy,
            Ok(exchange) = self.sniffer_rx.recv_async() => {
                self.publish(&exchange);
                NextState::Busy
            }
            Ok(msg) = self.inject_rx.recv_async() => self.inject(msg).await,
        }
    }

    /// INJECTING: claims the cell, writes the request, and (for
    /// non-broadcasts) awaits the paired response up to `RESPONSE_TIMEOUT`.
    async fn inject(&mut self, msg: InjectMessage) -> NextState {
        let mut exchange = msg.exchange;

        if !try_claim(&self.cell, exchange.clone()) {
            log::warn!("collision: injection attempted while the bus was non-idle");
            exchange.error = Some(ErrorKind::Timeout);
            self.publish(&exchange);
            let _ = msg.done.send(exchange);
            return NextState::Busy;
        }

        while self.response_rx.try_recv().is_ok() {}

        let mut written = 0;
        while written < exchange.request.len() {
            match self.writer.write(&exchange.request[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) => {
                    log::warn!("serial write error: {e}");
                    break;
                }
            }
        }

        if exchange.is_broadcast() {
            release(&self.cell);
            let _ = msg.done.send(exchange.clone());
            self.publish(&exchange);
            return NextState::Cooldown(POST_BROADCAST_TIMEOUT);
        }

        match tokio::time::timeout(RESPONSE_TIMEOUT, self.response_rx.recv_async()).await {
            Ok(Ok(())) => {
                let completed = {
                    let guard = self.cell.load();
                    match guard.as_ref() {
                        Some(locked) => locked.lock().expect("exchange mutex poisoned").clone(),
                        None => exchange,
                    }
                };
                release(&self.cell);
                let next = if completed.error.is_some() {
                    NextState::Busy
                } else {
                    NextState::Cooldown(POST_TRANSMIT_TIMEOUT)
                };
                let _ = msg.done.send(completed.clone());
                self.publish(&completed);
                next
            }
            _ => {
                log::warn!("injection response timeout");
                let mut completed = {
                    let guard = self.cell.load();
                    match guard.as_ref() {
                        Some(locked) => locked.lock().expect("exchange mutex poisoned").clone(),
                        None => exchange,
                    }
                };
                release(&self.cell);
                if completed.error.is_none() {
                    completed.error = Some(ErrorKind::Timeout);
                }
                self.publish(&completed);
                let _ = msg.done.send(completed);
                NextState::Busy
            }
        }
    }

    /// COOLDOWN: waits `dur` before the bus is considered idle again,
    /// still listening for sniffed activity that should send the loop
    /// straight back to BUSY.
    async fn cooldown(&mut self, dur: Duration) -> NextState {
        let sleep = tokio::time::sleep(dur);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.busy_rx.recv_async() => return NextState::Busy,
                Ok(exchange) = self.sniffer_rx.recv_async() => {
                    self.publish(&exchange);
                    return NextState::Busy;
                }
                () = &mut sleep => return NextState::Idle,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::metrics::Metrics;

    #[test]
    fn claim_fails_on_second_attempt() {
        let cell = new_exchange_cell();
        assert!(try_claim(&cell, Exchange::new(true)));
        assert!(!try_claim(&cell, Exchange::new(false)));
        release(&cell);
        assert!(try_claim(&cell, Exchange::new(false)));
    }

    fn test_exchange() -> Exchange {
        Exchange {
            station: 1,
            function: 0x04,
            base: 0x80E8,
            count: 1,
            request: vec![0x01, 0x04, 0x80, 0xE8, 0x00, 0x01, 0x98, 0x3E],
            ..Exchange::new(false)
        }
    }

    /// Also returns the sender halves so the caller can keep them alive
    /// (or drop them) to control whether channel recv resolves by signal,
    /// timeout, or disconnect.
    #[allow(clippy::type_complexity)]
    fn test_arbiter() -> (
        Arbiter<Vec<u8>>,
        flume::Sender<()>,
        flume::Sender<Exchange>,
        flume::Sender<()>,
        flume::Sender<InjectMessage>,
    ) {
        let (busy_tx, busy_rx) = flume::bounded(1);
        let (sniffer_tx, sniffer_rx) = flume::bounded::<Exchange>(1);
        let (response_tx, response_rx) = flume::bounded::<()>(1);
        let (inject_tx, inject_rx) = flume::bounded(1);
        let arbiter = Arbiter::new(
            Vec::new(),
            1,
            new_exchange_cell(),
            busy_rx,
            sniffer_rx,
            response_rx,
            inject_rx,
            Arc::new(Dispatcher::new()),
            Arc::new(Metrics::new(false, false).unwrap()),
        );
        (arbiter, busy_tx, sniffer_tx, response_tx, inject_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn injection_response_timeout_is_recorded_as_a_timeout_error() {
        let (mut arbiter, _busy_tx, _sniffer_tx, _response_tx, _inject_tx) = test_arbiter();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let msg = InjectMessage {
            exchange: test_exchange(),
            done: done_tx,
        };

        let next = arbiter.inject(msg).await;
        assert!(matches!(next, NextState::Busy));

        let completed = done_rx.await.unwrap();
        assert_eq!(completed.error, Some(ErrorKind::Timeout));
        assert!(arbiter.cell.load().is_none());
    }

    #[tokio::test]
    async fn injection_collision_fails_fast_with_timeout_error() {
        let (mut arbiter, _busy_tx, _sniffer_tx, _response_tx, _inject_tx) = test_arbiter();
        // Pre-claim the cell to simulate a sniffed frame already in flight.
        assert!(try_claim(&arbiter.cell, Exchange::new(true)));

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let msg = InjectMessage {
            exchange: test_exchange(),
            done: done_tx,
        };

        let next = arbiter.inject(msg).await;
        assert!(matches!(next, NextState::Busy));

        let completed = done_rx.await.unwrap();
        assert_eq!(completed.error, Some(ErrorKind::Timeout));
        // The pre-existing sniffed claim is left untouched by the failed injection.
        assert!(arbiter.cell.load().is_some());
    }

    #[tokio::test]
    async fn broadcast_injection_skips_response_wait() {
        let (mut arbiter, _busy_tx, _sniffer_tx, _response_tx, _inject_tx) = test_arbiter();
        let mut exchange = test_exchange();
        exchange.station = 0;
        exchange.request = vec![0x00, 0x04, 0x80, 0xE8, 0x00, 0x01, 0x00, 0x00];

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let msg = InjectMessage {
            exchange,
            done: done_tx,
        };

        let next = arbiter.inject(msg).await;
        assert!(matches!(next, NextState::Cooldown(d) if d == POST_BROADCAST_TIMEOUT));

        let completed = done_rx.await.unwrap();
        assert!(completed.error.is_none());
        assert!(arbiter.cell.load().is_none());
    }
}

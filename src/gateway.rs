//! Injection front-end: a Modbus-TCP gateway that accepts remote clients,
//! authorizes their requests against the rule checker, hands them to the
//! arbiter, and reframes the outcome as MBAP over the same connection.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::arbiter::InjectMessage;
use crate::frame::{append_crc, parse_request, Exchange};
use crate::rules::{check_rules, Rule};

const MBAP_HEADER_LEN: usize = 7;

/// Everything a connection handler needs: the rule table and a sender
/// into the arbiter's injection queue.
#[derive(Clone)]
pub struct Gateway {
    rules: Arc<Vec<Rule>>,
    inject_tx: flume::Sender<InjectMessage>,
}

impl Gateway {
    pub fn new(rules: Vec<Rule>, inject_tx: flume::Sender<InjectMessage>) -> Self {
        Gateway {
            rules: Arc::new(rules),
            inject_tx,
        }
    }

    /// Binds `addr` and serves connections until the process exits.
    pub async fn listen(self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind gateway listener on {addr}"))?;
        log::info!("gateway listening on {addr}");

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("gateway accept error: {e}");
                    continue;
                }
            };
            let gateway = self.clone();
            tokio::spawn(async move {
                log::debug!("gateway connection from {peer}");
                if let Err(e) = gateway.serve_connection(socket).await {
                    log::debug!("gateway connection from {peer} ended: {e}");
                }
            });
        }
    }

    /// Serves one TCP connection: one request in flight at a time, for
    /// as many MBAP requests as the client sends.
    async fn serve_connection(&self, mut socket: TcpStream) -> Result<()> {
        loop {
            let mut header = [0u8; MBAP_HEADER_LEN];
            match socket.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            let transaction_id = [header[0], header[1]];
            let protocol_id = u16::from_be_bytes([header[2], header[3]]);
            let length = u16::from_be_bytes([header[4], header[5]]);
            let station = header[6];

            if protocol_id != 0 {
                return Err(anyhow!("non-zero Modbus-TCP protocol id {protocol_id}"));
            }
            if !(2..=256).contains(&length) {
                return Err(anyhow!("MBAP length {length} out of bounds"));
            }

            let mut pdu = vec![0u8; (length - 1) as usize];
            socket.read_exact(&mut pdu).await?;

            let response = self.handle_pdu(station, &pdu).await;
            let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + response.len());
            frame.extend_from_slice(&transaction_id);
            frame.extend_from_slice(&[0, 0]);
            frame.extend_from_slice(&((response.len() + 1) as u16).to_be_bytes());
            frame.push(station);
            frame.extend_from_slice(&response);

            socket.write_all(&frame).await?;
        }
    }

    /// Builds an RTU request from `station` + `pdu`, authorizes and
    /// submits it, and returns the PDU bytes of the response (without
    /// MBAP header, without trailing CRC).
    async fn handle_pdu(&self, station: u8, pdu: &[u8]) -> Vec<u8> {
        let mut rtu = Vec::with_capacity(pdu.len() + 3);
        rtu.push(station);
        rtu.extend_from_slice(pdu);
        append_crc(&mut rtu);

        let mut exchange = Exchange::new(false);
        if parse_request(&rtu, &mut exchange) != 0 || exchange.error.is_some() {
            return exception_pdu(pdu.first().copied().unwrap_or(0), 1);
        }

        if !check_rules(&exchange, &self.rules) {
            return exception_pdu(exchange.function, 2);
        }

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let msg = InjectMessage {
            exchange,
            done: done_tx,
        };
        if self.inject_tx.send_async(msg).await.is_err() {
            log::warn!("arbiter injection queue closed");
            return exception_pdu(pdu.first().copied().unwrap_or(0), 1);
        }

        match done_rx.await {
            Ok(completed) if completed.error.is_none() => response_pdu(&completed),
            _ => {
                // A gross framing/timeout error on an injected exchange is
                // deliberately not surfaced as a Modbus exception; it drops
                // the connection instead, so as not to mislead the remote
                // client into thinking the device itself replied.
                exception_pdu(pdu.first().copied().unwrap_or(0), 1)
            }
        }
    }
}

/// Strips the trailing 2-byte CRC from a completed exchange's raw response
/// to produce the PDU the MBAP frame carries.
fn response_pdu(exchange: &Exchange) -> Vec<u8> {
    let resp = &exchange.response;
    if resp.len() < 3 {
        return exception_pdu(exchange.function, 1);
    }
    resp[1..resp.len() - 2].to_vec()
}

fn exception_pdu(function: u8, code: u8) -> Vec<u8> {
    vec![function | 0x80, code]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_pdu_sets_response_bit() {
        let pdu = exception_pdu(0x04, 2);
        assert_eq!(pdu, vec![0x84, 0x02]);
    }

    #[test]
    fn response_pdu_strips_crc() {
        let exchange = Exchange {
            function: 0x04,
            response: vec![0x01, 0x04, 0x02, 0x31, 0x05, 0x6C, 0xA3],
            ..Exchange::new(false)
        };
        assert_eq!(response_pdu(&exchange), vec![0x04, 0x02, 0x31, 0x05]);
    }
}

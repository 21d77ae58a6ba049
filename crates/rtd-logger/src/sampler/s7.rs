// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal S7comm client over ISO-on-TCP (RFC 1006).
//!
//! Exchanges implemented:
//! - COTP connection request / confirm
//! - S7 setup communication (PDU negotiation)
//! - S7 read-var of bytes from a data block

use super::{ConnectError, Controller, ControllerEndpoint, MemoryArea, ReadError};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const TPKT_VERSION: u8 = 0x03;
const TPKT_HEADER_LEN: usize = 4;

const COTP_CC: u8 = 0xD0;
const COTP_DR: u8 = 0x80;
const COTP_DATA: [u8; 3] = [0x02, 0xF0, 0x80];

const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK_DATA: u8 = 0x03;

const FN_READ_VAR: u8 = 0x04;
const FN_SETUP_COMM: u8 = 0xF0;

const AREA_DB: u8 = 0x84;
const TS_BYTE: u8 = 0x02;
const RETURN_OK: u8 = 0xFF;

/// PDU size requested during setup; the controller may negotiate it down.
pub const REQUESTED_PDU: u16 = 480;

/// Highest byte offset expressible in the 24-bit bit address of a read item.
pub const MAX_BYTE_OFFSET: u32 = 0x1F_FFFF;

/// Bytes of framing around a single-item read reply.
const READ_REPLY_OVERHEAD: usize = 18;

// Offsets into the TPKT payload of an ACK_DATA frame.
const ACK_HEADER_LEN: usize = 15;

#[derive(Debug)]
enum LinkError {
    Io(io::Error),
    Timeout,
    Malformed(String),
}

/// S7 client session.
#[derive(Debug)]
pub struct S7Client {
    stream: Option<TcpStream>,
    io_timeout: Duration,
    pdu_ref: u16,
    pdu_size: u16,
}

impl Default for S7Client {
    fn default() -> Self {
        Self::new()
    }
}

impl S7Client {
    pub fn new() -> Self {
        Self {
            stream: None,
            io_timeout: Duration::from_secs(5),
            pdu_ref: 0,
            pdu_size: REQUESTED_PDU,
        }
    }

    /// PDU size negotiated with the controller.
    pub fn pdu_size(&self) -> u16 {
        self.pdu_size
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    async fn handshake(
        &mut self,
        stream: &mut TcpStream,
        endpoint: &ControllerEndpoint,
    ) -> Result<(), ConnectError> {
        let cr = connection_request(endpoint.rack, endpoint.slot);
        let reply = exchange(stream, &cr, self.io_timeout)
            .await
            .map_err(|e| link_to_connect(e, self.io_timeout))?;

        match reply.get(1).copied() {
            Some(pdu) if pdu & 0xF0 == COTP_CC => {}
            Some(pdu) if pdu & 0xF0 == COTP_DR => {
                return Err(ConnectError::Rejected(format!(
                    "COTP disconnect request for rack {} slot {}",
                    endpoint.rack, endpoint.slot
                )));
            }
            Some(pdu) => {
                return Err(ConnectError::Handshake(format!(
                    "unexpected COTP PDU type 0x{pdu:02x}"
                )));
            }
            None => return Err(ConnectError::Handshake("empty COTP reply".into())),
        }

        let pdu_ref = self.next_ref();
        let setup = setup_communication(pdu_ref, REQUESTED_PDU);
        let reply = exchange(stream, &setup, self.io_timeout)
            .await
            .map_err(|e| link_to_connect(e, self.io_timeout))?;

        let ack = parse_ack_data(&reply, pdu_ref).map_err(|e| match e {
            AckError::Refused { .. } => ConnectError::Rejected(e.to_string()),
            AckError::Malformed(m) => ConnectError::Handshake(m),
        })?;
        let negotiated = ack
            .params
            .get(6..8)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| ConnectError::Handshake("setup reply too short".into()))?;
        if negotiated == 0 {
            return Err(ConnectError::Handshake("controller negotiated PDU size 0".into()));
        }
        self.pdu_size = negotiated;
        tracing::debug!(pdu_size = negotiated, "S7 communication set up");
        Ok(())
    }

    fn drop_session(&mut self) {
        self.stream = None;
    }
}

impl Controller for S7Client {
    async fn connect(&mut self, endpoint: &ControllerEndpoint) -> Result<(), ConnectError> {
        self.drop_session();
        self.io_timeout = endpoint.io_timeout;

        let target = (endpoint.address.as_str(), endpoint.port);
        let connecting = TcpStream::connect(target);
        let mut stream = match tokio::time::timeout(self.io_timeout, connecting).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(ConnectError::Unreachable(e)),
            Err(_) => return Err(ConnectError::Timeout(self.io_timeout)),
        };
        stream.set_nodelay(true).map_err(ConnectError::Unreachable)?;

        self.handshake(&mut stream, endpoint).await?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn read_area(
        &mut self,
        area: MemoryArea,
        offset: u32,
        len: usize,
    ) -> Result<Vec<u8>, ReadError> {
        if self.stream.is_none() {
            return Err(ReadError::NotConnected);
        }
        if len + READ_REPLY_OVERHEAD > usize::from(self.pdu_size) {
            return Err(ReadError::Protocol(format!(
                "{len} bytes do not fit in a {} byte PDU",
                self.pdu_size
            )));
        }
        if offset > MAX_BYTE_OFFSET {
            return Err(ReadError::Protocol(format!(
                "byte offset {offset:#X} exceeds the S7 address range"
            )));
        }
        let count = u16::try_from(len)
            .map_err(|_| ReadError::Protocol(format!("read length {len} out of range")))?;

        let pdu_ref = self.next_ref();
        let request = read_var_request(pdu_ref, area, offset, count);
        let timeout = self.io_timeout;

        let Some(stream) = self.stream.as_mut() else {
            return Err(ReadError::NotConnected);
        };
        let reply = match exchange(stream, &request, timeout).await {
            Ok(r) => r,
            Err(e) => {
                // The stream may be out of sync; force a reconnect.
                self.drop_session();
                return Err(match e {
                    LinkError::Io(e) => ReadError::Transport(e),
                    LinkError::Timeout => ReadError::Timeout(timeout),
                    LinkError::Malformed(m) => ReadError::Protocol(m),
                });
            }
        };

        let ack =
            parse_ack_data(&reply, pdu_ref).map_err(|e| ReadError::Protocol(e.to_string()))?;
        parse_read_data(ack.data)
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn disconnect(&mut self) {
        self.drop_session();
    }
}

fn link_to_connect(err: LinkError, timeout: Duration) -> ConnectError {
    match err {
        LinkError::Io(e) => ConnectError::Unreachable(e),
        LinkError::Timeout => ConnectError::Timeout(timeout),
        LinkError::Malformed(m) => ConnectError::Handshake(m),
    }
}

/// Send one frame and wait for the reply, bounded by `timeout`.
async fn exchange(
    stream: &mut TcpStream,
    frame: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, LinkError> {
    let io = async {
        stream.write_all(frame).await.map_err(LinkError::Io)?;
        read_tpkt(stream).await
    };
    tokio::time::timeout(timeout, io)
        .await
        .map_err(|_| LinkError::Timeout)?
}

/// Read one TPKT frame and return its payload.
async fn read_tpkt(stream: &mut TcpStream) -> Result<Vec<u8>, LinkError> {
    let mut header = [0u8; TPKT_HEADER_LEN];
    stream.read_exact(&mut header).await.map_err(LinkError::Io)?;
    if header[0] != TPKT_VERSION {
        return Err(LinkError::Malformed(format!(
            "bad TPKT version 0x{:02x}",
            header[0]
        )));
    }
    let total = usize::from(u16::from_be_bytes([header[2], header[3]]));
    if total <= TPKT_HEADER_LEN {
        return Err(LinkError::Malformed(format!("bad TPKT length {total}")));
    }
    let mut body = vec![0u8; total - TPKT_HEADER_LEN];
    stream.read_exact(&mut body).await.map_err(LinkError::Io)?;
    Ok(body)
}

pub(crate) fn tpkt(payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + TPKT_HEADER_LEN) as u16;
    let mut frame = Vec::with_capacity(usize::from(len));
    frame.extend_from_slice(&[TPKT_VERSION, 0x00]);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Remote TSAP for a rack/slot pair (PG connection).
pub fn remote_tsap(rack: u16, slot: u16) -> u16 {
    0x0100 | (rack.wrapping_mul(0x20).wrapping_add(slot) & 0xFF)
}

/// COTP connection request frame.
pub fn connection_request(rack: u16, slot: u16) -> Vec<u8> {
    let [tsap_hi, tsap_lo] = remote_tsap(rack, slot).to_be_bytes();
    tpkt(&[
        0x11, 0xE0, // length, CR
        0x00, 0x00, // dst ref
        0x00, 0x01, // src ref
        0x00, // class 0
        0xC0, 0x01, 0x0A, // TPDU size 1024
        0xC1, 0x02, 0x01, 0x00, // local TSAP
        0xC2, 0x02, tsap_hi, tsap_lo,
    ])
}

fn s7_job(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(13 + params.len() + data.len());
    payload.extend_from_slice(&COTP_DATA);
    payload.extend_from_slice(&[S7_PROTOCOL_ID, ROSCTR_JOB, 0x00, 0x00]);
    payload.extend_from_slice(&pdu_ref.to_be_bytes());
    payload.extend_from_slice(&(params.len() as u16).to_be_bytes());
    payload.extend_from_slice(&(data.len() as u16).to_be_bytes());
    payload.extend_from_slice(params);
    payload.extend_from_slice(data);
    tpkt(&payload)
}

/// Setup communication job.
pub fn setup_communication(pdu_ref: u16, pdu_size: u16) -> Vec<u8> {
    let [hi, lo] = pdu_size.to_be_bytes();
    s7_job(
        pdu_ref,
        &[FN_SETUP_COMM, 0x00, 0x00, 0x01, 0x00, 0x01, hi, lo],
        &[],
    )
}

/// Read-var job for `count` bytes at byte `offset` of `area`.
pub fn read_var_request(pdu_ref: u16, area: MemoryArea, offset: u32, count: u16) -> Vec<u8> {
    let MemoryArea::DataBlock(db) = area;
    let [len_hi, len_lo] = count.to_be_bytes();
    let [db_hi, db_lo] = db.to_be_bytes();
    let bit_addr = offset.min(MAX_BYTE_OFFSET) * 8;
    s7_job(
        pdu_ref,
        &[
            FN_READ_VAR,
            0x01, // item count
            0x12, 0x0A, 0x10, // item header, S7ANY syntax
            TS_BYTE,
            len_hi,
            len_lo,
            db_hi,
            db_lo,
            AREA_DB,
            (bit_addr >> 16) as u8,
            (bit_addr >> 8) as u8,
            bit_addr as u8,
        ],
        &[],
    )
}

#[derive(Debug)]
enum AckError {
    Malformed(String),
    Refused { class: u8, code: u8 },
}

impl std::fmt::Display for AckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(m) => f.write_str(m),
            Self::Refused { class, code } => {
                write!(f, "S7 error class 0x{class:02x} code 0x{code:02x}")
            }
        }
    }
}

fn malformed<T>(msg: String) -> Result<T, AckError> {
    Err(AckError::Malformed(msg))
}

struct AckData<'a> {
    params: &'a [u8],
    data: &'a [u8],
}

/// Split an ACK_DATA TPKT payload into its parameter and data sections.
fn parse_ack_data(body: &[u8], expected_ref: u16) -> Result<AckData<'_>, AckError> {
    if body.len() < ACK_HEADER_LEN {
        return malformed(format!("ACK_DATA frame too short ({} bytes)", body.len()));
    }
    if body[3] != S7_PROTOCOL_ID {
        return malformed(format!("bad S7 protocol id 0x{:02x}", body[3]));
    }
    if body[4] != ROSCTR_ACK_DATA {
        return malformed(format!("unexpected ROSCTR 0x{:02x}", body[4]));
    }
    let pdu_ref = u16::from_be_bytes([body[7], body[8]]);
    if pdu_ref != expected_ref {
        return malformed(format!(
            "PDU reference mismatch: sent {expected_ref}, got {pdu_ref}"
        ));
    }
    let (class, code) = (body[13], body[14]);
    if class != 0 || code != 0 {
        return Err(AckError::Refused { class, code });
    }
    let param_len = usize::from(u16::from_be_bytes([body[9], body[10]]));
    let data_len = usize::from(u16::from_be_bytes([body[11], body[12]]));
    let params_end = ACK_HEADER_LEN + param_len;
    let Some(params) = body.get(ACK_HEADER_LEN..params_end) else {
        return malformed("parameter section truncated".into());
    };
    let data_end = (params_end + data_len).min(body.len());
    let data = body.get(params_end..data_end).unwrap_or(&[]);
    Ok(AckData { params, data })
}

/// Extract the payload of a single-item read reply.
///
/// A reply shorter than its declared length yields the bytes present.
fn parse_read_data(data: &[u8]) -> Result<Vec<u8>, ReadError> {
    let Some(&code) = data.first() else {
        return Err(ReadError::Protocol("read reply has no data item".into()));
    };
    if code != RETURN_OK {
        return Err(ReadError::Device { code });
    }
    if data.len() < 4 {
        return Ok(Vec::new());
    }
    let declared = usize::from(u16::from_be_bytes([data[2], data[3]]));
    let bytes = match data[1] {
        // BIT, BYTE/WORD/DWORD, INTEGER lengths are given in bits
        0x03..=0x05 => declared.div_ceil(8),
        _ => declared,
    };
    let payload = &data[4..];
    Ok(payload[..bytes.min(payload.len())].to_vec())
}

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::tcp::TcpFlags::{RST, SYN};
use pnet_packet::tcp::{TcpOptionNumbers, TcpPacket};
use pnet_packet::Packet;
use rand::RngCore;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::{Error, Result};
use crate::link::{FlowTuple, Link};

pub mod seq;

mod acker;
mod reader;
mod stream;
mod writer;

pub use acker::AckHandler;
pub use reader::ReliableReader;
pub use stream::{FlowStream, StreamDetach};
pub use writer::ReliableWriter;

/// Window scale advertised in the SYN.
pub const WINDOW_SHIFT: u8 = 9;

const TCP_HEADER_LEN: usize = 20;
/// IPv4 + TCP headers without options.
const IP_TCP_HEADER_LEN: u16 = 40;

/// States of a dialed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TcpState {
    /// SYN transmitted, waiting for the SYN-ACK.
    SynSent = 1,
    /// Three-way handshake complete.
    Established = 2,
    /// Torn down; no further segments are emitted.
    Finished = 3,
}

impl TcpState {
    fn from_u8(v: u8) -> TcpState {
        match v {
            1 => TcpState::SynSent,
            2 => TcpState::Established,
            _ => TcpState::Finished,
        }
    }
}

/// Pluggable per-connection behavior.
///
/// The connection owns the handler; the handler keeps a weak back reference
/// installed by `bind(Some(conn))` and cleared by `bind(None)`.
pub trait TcpHandler: Send + Sync {
    fn bind(&self, conn: Option<&Arc<TcpConn>>);
    fn on_segment(&self, tcp: &TcpPacket<'_>) -> Result<()>;
}

/// One userspace TCP endpoint.
///
/// `seq` is the next byte we will send, `ack` the next byte we expect.
/// Field mutation is serialized by the receive loop and the handler buffer
/// locks; the atomics make cross-task reads sound.
pub struct TcpConn {
    this: Weak<TcpConn>,
    link: Arc<dyn Link>,
    tuple: FlowTuple,
    state: AtomicU8,
    seq: AtomicU32,
    ack: AtomicU32,
    win: AtomicU16,
    mss: AtomicU16,
    handler: Mutex<Option<Arc<dyn TcpHandler>>>,
    shutdown: CancellationToken,
}

impl TcpConn {
    /// Transmit a SYN toward `peer` and register the flow. The caller's
    /// outer timeout reaps the connection if the peer never answers.
    pub fn dial(link: Arc<dyn Link>, peer: SocketAddrV4, local_port: u16, handler: Arc<dyn TcpHandler>) -> Result<Arc<Self>> {
        Self::dial_with_iss(link, peer, local_port, handler, rand::thread_rng().next_u32())
    }

    pub(crate) fn dial_with_iss(
        link: Arc<dyn Link>,
        peer: SocketAddrV4,
        local_port: u16,
        handler: Arc<dyn TcpHandler>,
        iss: u32,
    ) -> Result<Arc<Self>> {
        let tuple = FlowTuple::tcp(link.src_ip(), local_port, *peer.ip(), peer.port());
        let mss = link.mtu().saturating_sub(IP_TCP_HEADER_LEN);
        let conn = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            link,
            tuple,
            state: AtomicU8::new(TcpState::SynSent as u8),
            seq: AtomicU32::new(iss),
            ack: AtomicU32::new(0),
            win: AtomicU16::new(u16::MAX),
            mss: AtomicU16::new(mss),
            handler: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });
        conn.set_handler(handler);
        conn.link.register(conn.clone())?;

        let options = syn_options(mss);
        if let Err(e) = conn.send_segment(SYN, &[], Some(&options)) {
            conn.link.deregister(&tuple);
            return Err(e);
        }
        Ok(conn)
    }

    pub fn tuple(&self) -> FlowTuple {
        self.tuple
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.tuple.local_ip, self.tuple.local_port)
    }

    pub fn peer_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.tuple.peer_ip, self.tuple.peer_port)
    }

    pub fn state(&self) -> TcpState {
        TcpState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn seq(&self) -> u32 {
        self.seq.load(Ordering::SeqCst)
    }

    pub(crate) fn set_seq(&self, seq: u32) {
        self.seq.store(seq, Ordering::SeqCst);
    }

    pub fn ack(&self) -> u32 {
        self.ack.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ack(&self, ack: u32) {
        self.ack.store(ack, Ordering::SeqCst);
    }

    pub fn window(&self) -> u16 {
        self.win.load(Ordering::SeqCst)
    }

    /// Change the advertised receive window (used for the post-TLS hand-off).
    pub fn set_window(&self, win: u16) {
        self.win.store(win, Ordering::SeqCst);
    }

    pub fn mss(&self) -> u16 {
        self.mss.load(Ordering::SeqCst)
    }

    pub(crate) fn link(&self) -> &Arc<dyn Link> {
        &self.link
    }

    /// Replace the handler: detach the old one, attach the new one. The
    /// handler slot lock keeps the swap atomic with inbound dispatch.
    pub fn set_handler(&self, handler: Arc<dyn TcpHandler>) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let mut slot = self.handler.lock();
        if let Some(old) = slot.take() {
            old.bind(None);
        }
        handler.bind(Some(&this));
        *slot = Some(handler);
    }

    pub(crate) fn handle_segment(&self, tcp: &TcpPacket<'_>) {
        let slot = self.handler.lock();
        let Some(handler) = slot.as_ref() else {
            return;
        };
        if let Err(e) = handler.on_segment(tcp) {
            log::warn!("tcp handler {} -> {}: {e}", self.peer_addr(), self.local_addr());
        }
    }

    /// Emit a segment with the current seq/ack/window. A non-empty payload
    /// advances `seq` before transmission so subsequent segments chain.
    pub(crate) fn send_segment(&self, flags: u8, payload: &[u8], options: Option<&[u8]>) -> Result<()> {
        if self.state() == TcpState::Finished {
            return Err(Error::Closed);
        }
        self.emit(flags, payload, options)
    }

    fn emit(&self, flags: u8, payload: &[u8], options: Option<&[u8]>) -> Result<()> {
        let seq = if payload.is_empty() {
            self.seq.load(Ordering::SeqCst)
        } else {
            self.seq.fetch_add(payload.len() as u32, Ordering::SeqCst)
        };
        let segment = build_segment(
            self.tuple.local_ip,
            self.tuple.local_port,
            self.tuple.peer_ip,
            self.tuple.peer_port,
            seq,
            self.ack.load(Ordering::SeqCst),
            self.win.load(Ordering::SeqCst),
            flags,
            payload,
            options,
        );
        self.link.send_ipv4(self.tuple.peer_ip, &segment)
    }

    /// Tear the connection down with a RST.
    pub fn close(&self) -> Result<()> {
        self.shut(true)
    }

    /// Deregister, fire the close signal and mark `Finished`. Idempotent;
    /// only the transitioning call emits the (optional) single RST.
    pub(crate) fn shut(&self, reset: bool) -> Result<()> {
        self.link.deregister(&self.tuple);
        self.shutdown.cancel();
        let prev = self.state.swap(TcpState::Finished as u8, Ordering::SeqCst);
        if prev != TcpState::Finished as u8 && reset {
            self.emit(RST, &[], None)?;
        }
        Ok(())
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFutureOwned {
        self.shutdown.clone().cancelled_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// SYN-ACK bookkeeping shared by handlers: record the peer's sequence,
    /// lower the MSS if the peer's is smaller, then account for the SYNs.
    pub(crate) fn establish(&self, tcp: &TcpPacket<'_>) {
        self.state.store(TcpState::Established as u8, Ordering::SeqCst);
        self.ack.store(tcp.get_sequence(), Ordering::SeqCst);

        for opt in tcp.get_options_iter() {
            if opt.get_number() == TcpOptionNumbers::MSS {
                let payload = opt.payload();
                if payload.len() == 2 {
                    let mss = (payload[0] as u16) << 8 | payload[1] as u16;
                    if mss < self.mss.load(Ordering::SeqCst) {
                        self.mss.store(mss, Ordering::SeqCst);
                    }
                }
            }
        }

        self.seq.fetch_add(1, Ordering::SeqCst);
        self.ack.fetch_add(1, Ordering::SeqCst);
    }
}

/// SYN options: MSS, NOP, window scale — 4-byte aligned.
fn syn_options(mss: u16) -> BytesMut {
    let mut options = BytesMut::with_capacity(8);
    options.put_u8(TcpOptionNumbers::MSS.0);
    options.put_u8(4);
    options.put_u16(mss);
    options.put_u8(TcpOptionNumbers::NOP.0);
    options.put_u8(TcpOptionNumbers::WSCALE.0);
    options.put_u8(3);
    options.put_u8(WINDOW_SHIFT);
    options
}

/// Serialize a TCP segment with the checksum linked to the address pair.
pub(crate) fn build_segment(
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    seq: u32,
    ack: u32,
    window: u16,
    flags: u8,
    payload: &[u8],
    options: Option<&[u8]>,
) -> BytesMut {
    let head_len = options
        .filter(|op| !op.is_empty())
        .map(|op| {
            assert_eq!(op.len() & 3, 0, "options must be aligned with four bytes");
            TCP_HEADER_LEN + op.len()
        })
        .unwrap_or(TCP_HEADER_LEN);

    let mut bytes = BytesMut::with_capacity(head_len + payload.len());
    bytes.put_u16(src_port);
    bytes.put_u16(dst_port);
    bytes.put_u32(seq);
    bytes.put_u32(ack);
    // Data Offset
    bytes.put_u8((head_len as u8 / 4) << 4);
    bytes.put_u8(flags);
    bytes.put_u16(window);
    // Checksum
    bytes.put_u16(0);
    // Urgent Pointer
    bytes.put_u16(0);
    if let Some(op) = options {
        if !op.is_empty() {
            bytes.extend_from_slice(op);
        }
    }
    bytes.extend_from_slice(payload);
    let checksum = pnet_packet::util::ipv4_checksum(&bytes, 8, &[], &src, &dst, IpNextHeaderProtocols::Tcp);
    bytes[16..18].copy_from_slice(&checksum.to_be_bytes());
    bytes
}

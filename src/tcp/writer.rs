use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use pnet_packet::tcp::TcpFlags::{ACK, PSH, SYN};
use pnet_packet::tcp::{TcpOptionNumbers, TcpPacket};
use pnet_packet::Packet;

use crate::error::{Error, Result};
use crate::tcp::seq::SeqNum;
use crate::tcp::{TcpConn, TcpHandler, TcpState};

/// How stale the last transmission may get before the whole unacked window
/// is resent; also the tick period of the retransmit timer.
const RETRANSMIT_AFTER: Duration = Duration::from_secs(1);

/// Byte-stream egress with retransmission.
///
/// Buffers written bytes until the peer's cumulative ACK covers them,
/// honors the peer's scaled receive window and resends the unacked window
/// when transmissions go stale. No congestion control.
pub struct ReliableWriter {
    this: Weak<ReliableWriter>,
    conn: Mutex<Weak<TcpConn>>,
    buf: Mutex<BytesMut>,
    /// The peer's latest cumulative ACK: the next local byte it has not
    /// acknowledged. Index 0 of `buf` corresponds to this sequence number.
    peer_acked: AtomicU32,
    /// Peer receive window in bytes (already scaled).
    peer_window: AtomicU32,
    peer_window_scale: AtomicU32,
    last_send: Mutex<Instant>,
    primed: AtomicBool,
    ticking: AtomicBool,
}

impl ReliableWriter {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            conn: Mutex::new(Weak::new()),
            buf: Mutex::new(BytesMut::new()),
            peer_acked: AtomicU32::new(0),
            peer_window: AtomicU32::new(0),
            peer_window_scale: AtomicU32::new(1),
            last_send: Mutex::new(Instant::now()),
            primed: AtomicBool::new(false),
            ticking: AtomicBool::new(false),
        })
    }

    pub(crate) fn conn(&self) -> Option<Arc<TcpConn>> {
        self.conn.lock().upgrade()
    }

    /// Bytes written but not yet acknowledged by the peer.
    pub fn pending(&self) -> usize {
        self.buf.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn peer_acked(&self) -> u32 {
        self.peer_acked.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn peer_window(&self) -> u32 {
        self.peer_window.load(Ordering::SeqCst)
    }

    /// Queue bytes for transmission and try to push them out.
    pub fn write(&self, payload: &[u8]) -> Result<usize> {
        if let Some(conn) = self.conn() {
            if conn.state() == TcpState::Finished {
                return Err(Error::Closed);
            }
        }
        self.buf.lock().extend_from_slice(payload);
        self.flush();
        Ok(payload.len())
    }

    /// The send decision. Returns whether a transmission round happened.
    ///
    /// Resends the whole unacked window when the last transmission went
    /// stale; otherwise sends MSS-sized slices until the peer window or the
    /// buffer is exhausted.
    pub(crate) fn flush(&self) -> bool {
        let Some(conn) = self.conn() else {
            return false;
        };
        if conn.state() != TcpState::Established {
            return false;
        }
        let buf = self.buf.lock();
        if buf.is_empty() {
            return false;
        }
        let peer_acked = SeqNum(self.peer_acked.load(Ordering::SeqCst));
        let window = self.peer_window.load(Ordering::SeqCst);
        let mut last_send = self.last_send.lock();
        let now = Instant::now();

        let ahead = SeqNum(conn.seq()).distance(peer_acked);
        if now.duration_since(*last_send) > RETRANSMIT_AFTER {
            // resend everything the peer has not acknowledged
            conn.set_seq(peer_acked.0);
        } else if ahead >= window as i64 || ahead >= buf.len() as i64 {
            return false;
        }
        if SeqNum(conn.seq()) < peer_acked {
            conn.set_seq(peer_acked.0);
        }

        let limit = peer_acked.add_num(window.min(buf.len() as u32));
        while SeqNum(conn.seq()) < limit {
            let off = SeqNum(conn.seq()).distance(peer_acked) as usize;
            let end = buf.len().min(off + conn.mss() as usize);
            if conn.send_segment(ACK | PSH, &buf[off..end], None).is_err() {
                // abandon the round, the timer retries
                return false;
            }
        }
        *last_send = now;
        true
    }

    /// Ingress bookkeeping: trim acknowledged bytes, track the peer window,
    /// kick the send path, and finish the handshake on a SYN-ACK.
    pub(crate) fn on_ack(&self, tcp: &TcpPacket<'_>) -> Result<()> {
        let flags = tcp.get_flags();
        if flags & ACK != ACK {
            return Ok(());
        }
        let ack = SeqNum(tcp.get_acknowledgement());
        {
            let mut buf = self.buf.lock();
            let acked = SeqNum(self.peer_acked.load(Ordering::SeqCst));
            if ack > acked {
                let n = (ack.distance(acked) as usize).min(buf.len());
                buf.advance(n);
                self.peer_acked.store(ack.0, Ordering::SeqCst);
            }
        }
        let scale = self.peer_window_scale.load(Ordering::SeqCst);
        self.peer_window.store(tcp.get_window() as u32 * scale, Ordering::SeqCst);
        let mut wrote = self.flush();

        if flags & SYN == SYN {
            for opt in tcp.get_options_iter() {
                if opt.get_number() == TcpOptionNumbers::WSCALE {
                    if let Some(shift) = opt.payload().first() {
                        let scale = 1u32 << (*shift).min(14);
                        self.peer_window_scale.store(scale, Ordering::SeqCst);
                        self.peer_window.store(tcp.get_window() as u32 * scale, Ordering::SeqCst);
                    }
                }
            }
            // the scaled window may admit what the pre-scale flush could not
            wrote |= self.flush();
            if !wrote {
                // nothing buffered; complete the handshake with a bare ACK
                if let Some(conn) = self.conn() {
                    conn.send_segment(ACK, &[], None)?;
                }
            }
        }
        Ok(())
    }

    fn spawn_ticker(&self) {
        if self.ticking.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(writer) = self.this.upgrade() else {
            self.ticking.store(false, Ordering::SeqCst);
            return;
        };
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RETRANSMIT_AFTER);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(conn) = writer.conn() else {
                    break;
                };
                if conn.state() == TcpState::Finished {
                    break;
                }
                writer.flush();
            }
            writer.ticking.store(false, Ordering::SeqCst);
        });
    }
}

impl TcpHandler for ReliableWriter {
    fn bind(&self, conn: Option<&Arc<TcpConn>>) {
        let Some(conn) = conn else {
            *self.conn.lock() = Weak::new();
            return;
        };
        *self.conn.lock() = Arc::downgrade(conn);
        if !self.primed.swap(true, Ordering::SeqCst) {
            // the SYN consumes one sequence number; index 0 of the buffer
            // corresponds to the byte after it
            self.peer_acked.store(conn.seq().wrapping_add(1), Ordering::SeqCst);
            *self.last_send.lock() = Instant::now();
        }
        self.spawn_ticker();
    }

    fn on_segment(&self, tcp: &TcpPacket<'_>) -> Result<()> {
        self.on_ack(tcp)
    }
}

use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use pnet_packet::tcp::TcpFlags::{ACK, FIN, RST, SYN};
use pnet_packet::tcp::TcpPacket;
use pnet_packet::Packet;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::tcp::seq::SeqNum;
use crate::tcp::writer::ReliableWriter;
use crate::tcp::{TcpConn, TcpHandler, TcpState, WINDOW_SHIFT};

/// Reliable ingress with out-of-order reassembly, for wrapping a TLS client
/// stream over the connection.
///
/// Inbound bytes land in a contiguous buffer whose index 0 corresponds to
/// the absolute sequence number `offset`; received `[start, end)` ranges
/// are merged into the cumulative ACK, and `read` delivers the contiguous
/// prefix.
pub struct ReliableReader {
    writer: Arc<ReliableWriter>,
    /// Raw value placed in the TCP window field (scaled by 2^9 on the wire).
    window: u16,
    /// The advertised window in bytes.
    window_bytes: u32,
    inner: Mutex<Reassembly>,
    /// One-slot receive signal: a stored permit means the prefix grew.
    recv: Notify,
    deadline: Mutex<Option<Instant>>,
}

struct Reassembly {
    buf: BytesMut,
    offset: SeqNum,
    segments: Vec<SegRange>,
}

#[derive(Debug, Clone, Copy)]
struct SegRange {
    start: u32,
    end: u32,
}

impl ReliableReader {
    pub fn new() -> Arc<Self> {
        Self::with_writer(ReliableWriter::new())
    }

    pub fn with_writer(writer: Arc<ReliableWriter>) -> Arc<Self> {
        let scale = 1u32 << WINDOW_SHIFT;
        let window_bytes = (0x10000 / scale) * scale;
        Arc::new(Self {
            writer,
            window: (window_bytes / scale) as u16,
            window_bytes,
            inner: Mutex::new(Reassembly {
                buf: BytesMut::with_capacity((window_bytes as usize) << 1),
                offset: SeqNum(0),
                segments: Vec::with_capacity(16),
            }),
            recv: Notify::new(),
            deadline: Mutex::new(None),
        })
    }

    pub fn writer(&self) -> &Arc<ReliableWriter> {
        &self.writer
    }

    /// Queue bytes on the embedded writer.
    pub fn write(&self, payload: &[u8]) -> Result<usize> {
        self.writer.write(payload)
    }

    /// `None` clears the deadline.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock() = deadline;
    }

    /// Deliver contiguous bytes, waiting until some are available, the
    /// connection closes (`Closed`) or the deadline passes
    /// (`DeadlineExceeded`).
    pub async fn read(&self, out: &mut [u8]) -> Result<usize> {
        loop {
            let Some(conn) = self.writer.conn() else {
                return Err(Error::Closed);
            };
            if conn.state() == TcpState::Finished {
                return Err(Error::Closed);
            }
            let deadline = *self.deadline.lock();
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(Error::DeadlineExceeded);
                }
            }
            {
                let mut inner = self.inner.lock();
                let inner = &mut *inner;
                let avail = SeqNum(conn.ack()).distance(inner.offset).max(0) as usize;
                if avail > 0 {
                    let n = avail.min(out.len());
                    out[..n].copy_from_slice(&inner.buf[..n]);
                    inner.buf.advance(n);
                    inner.offset = inner.offset.add_num(n as u32);
                    for s in &mut inner.segments {
                        s.start -= n as u32;
                        s.end -= n as u32;
                    }
                    return Ok(n);
                }
            }
            let notified = self.recv.notified();
            match deadline {
                Some(d) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = conn.closed() => return Err(Error::Closed),
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(d)) => {
                            return Err(Error::DeadlineExceeded);
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = notified => {}
                        _ = conn.closed() => return Err(Error::Closed),
                    }
                }
            }
        }
    }

    fn ingest(&self, conn: &Arc<TcpConn>, tcp: &TcpPacket<'_>) -> Result<()> {
        self.writer.on_ack(tcp)?;

        let flags = tcp.get_flags();
        if flags & FIN == FIN {
            // data riding on the FIN is still buffered below
            conn.shut(false)?;
        } else if flags & RST == RST {
            return conn.shut(false);
        }
        let mut payload = tcp.payload();
        if payload.is_empty() {
            return Ok(());
        }
        let mut seq = SeqNum(tcp.get_sequence());

        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        if seq < inner.offset {
            // partly or wholly behind the read cursor
            if seq.add_num(payload.len() as u32) > inner.offset {
                let cut = inner.offset.distance(seq) as usize;
                payload = &payload[cut..];
                seq = inner.offset;
            } else {
                return Ok(());
            }
        }

        let start = seq.distance(inner.offset) as usize;
        let extend = start + payload.len();
        if extend > inner.buf.len() + self.window_bytes as usize {
            // retransmission gone wrong or a bad packet
            return Err(Error::OutOfWindow);
        }
        if extend > inner.buf.len() {
            inner.buf.resize(extend, 0);
        }

        let segment = SegRange {
            start: start as u32,
            end: extend as u32,
        };
        if inner.segments.iter().any(|s| segment.start >= s.start && segment.end <= s.end) {
            return Ok(());
        }
        inner.buf[start..extend].copy_from_slice(payload);
        inner.segments.push(segment);

        let previous_ack = SeqNum(conn.ack());
        merge_segments(inner, conn);

        if SeqNum(conn.ack()) > previous_ack {
            if conn.state() == TcpState::Established {
                conn.send_segment(ACK, &[], None)?;
            }
            self.recv.notify_one();
        }
        Ok(())
    }
}

/// Fold stored ranges into the cumulative ACK: walk ranges touching the
/// fulfilled prefix, extend it, drop everything folded in.
fn merge_segments(inner: &mut Reassembly, conn: &TcpConn) {
    inner.segments.sort_by_key(|s| s.start);

    let mut fulfilled = SeqNum(conn.ack()).distance(inner.offset).max(0) as u32;
    let mut last = None;
    for (i, s) in inner.segments.iter().enumerate() {
        if s.start <= fulfilled {
            fulfilled = fulfilled.max(s.end);
            last = Some(i);
        }
    }
    if let Some(i) = last {
        inner.segments.drain(..=i);
    }

    conn.set_ack(inner.offset.add_num(fulfilled).0);
}

impl TcpHandler for ReliableReader {
    fn bind(&self, conn: Option<&Arc<TcpConn>>) {
        self.writer.bind(conn);
        // wake readers blocked across a detach
        self.recv.notify_waiters();
        if let Some(conn) = conn {
            self.inner.lock().offset = SeqNum(conn.ack());
        }
    }

    fn on_segment(&self, tcp: &TcpPacket<'_>) -> Result<()> {
        let conn = self.writer.conn().ok_or(Error::Closed)?;
        let flags = tcp.get_flags();
        match conn.state() {
            TcpState::SynSent => {
                if flags & RST == RST || flags & FIN == FIN {
                    return conn.shut(false);
                }
                if flags & SYN != SYN || flags & ACK != ACK {
                    return Ok(());
                }
                conn.establish(tcp);
                conn.set_window(self.window);
                self.inner.lock().offset = SeqNum(conn.ack());
                // a SYN-ACK may carry payload; process it like any segment
                self.ingest(&conn, tcp)
            }
            TcpState::Established => self.ingest(&conn, tcp),
            TcpState::Finished => {
                conn.link().deregister(&conn.tuple());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testlink::{wscale_options, MockLink};
    use std::time::Duration;

    fn dial(link: &Arc<MockLink>, port: u16) -> (Arc<TcpConn>, Arc<ReliableReader>) {
        let reader = ReliableReader::new();
        let conn = TcpConn::dial_with_iss(link.clone(), link.peer(), port, reader.clone(), 1000).unwrap();
        let seg = link.peer_segment(5000, 1001, SYN | ACK, 64, &[], Some(&wscale_options(1400, 7)));
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());
        link.clear();
        (conn, reader)
    }

    #[tokio::test]
    async fn test_window_advertisement_after_handshake() {
        let link = MockLink::new();
        let (conn, reader) = dial(&link, 43000);
        assert_eq!(conn.window(), 128);
        assert_eq!(reader.window_bytes, 65536);

        let seg = link.peer_segment(5001, 1001, ACK, 64, &[9u8; 10], None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());
        let sent = link.sent();
        let tcp = TcpPacket::new(sent.last().unwrap()).unwrap();
        assert_eq!(tcp.get_window(), 128);
    }

    #[tokio::test]
    async fn test_out_of_order_reassembly_with_duplicate() {
        let link = MockLink::new();
        let (conn, reader) = dial(&link, 43001);

        let tail: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let head: Vec<u8> = (0..1400u32).map(|i| (i * 3) as u8).collect();

        // tail first: nothing contiguous yet, no ACK
        let seg = link.peer_segment(6401, 1001, ACK, 64, &tail, None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());
        assert_eq!(conn.ack(), 5001);
        assert!(link.sent().is_empty());

        // the hole fills: prefix jumps to 1600, one cumulative ACK
        let seg = link.peer_segment(5001, 1001, ACK, 64, &head, None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());
        assert_eq!(conn.ack(), 6601);
        assert_eq!(link.sent().len(), 1);
        let sent = link.sent();
        let tcp = TcpPacket::new(&sent[0]).unwrap();
        assert_eq!(tcp.get_acknowledgement(), 6601);

        // retransmitted tail changes nothing
        let seg = link.peer_segment(6401, 1001, ACK, 64, &tail, None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());
        assert_eq!(conn.ack(), 6601);
        assert_eq!(link.sent().len(), 1);

        let mut out = vec![0u8; 4096];
        let n = reader.read(&mut out).await.unwrap();
        assert_eq!(n, 1600);
        assert_eq!(&out[..1400], &head[..]);
        assert_eq!(&out[1400..1600], &tail[..]);
    }

    #[tokio::test]
    async fn test_duplicate_before_merge_is_contained() {
        let link = MockLink::new();
        let (conn, _reader) = dial(&link, 43002);

        // two copies of the same out-of-order segment, then the hole fills
        let seg = link.peer_segment(6401, 1001, ACK, 64, &[5u8; 200], None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());
        let seg = link.peer_segment(6401, 1001, ACK, 64, &[5u8; 200], None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());
        {
            let inner = _reader.inner.lock();
            assert_eq!(inner.segments.len(), 1);
        }
        let seg = link.peer_segment(5001, 1001, ACK, 64, &[6u8; 1400], None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());
        assert_eq!(conn.ack(), 6601);
    }

    #[tokio::test]
    async fn test_out_of_window_segment_is_dropped() {
        let link = MockLink::new();
        let (conn, reader) = dial(&link, 43003);

        let seg = link.peer_segment(5001 + 65536, 1001, ACK, 64, &[1u8], None);
        let tcp = TcpPacket::new(&seg).unwrap();
        assert!(matches!(reader.on_segment(&tcp), Err(Error::OutOfWindow)));
        assert_eq!(conn.ack(), 5001);

        // the last in-window byte is accepted
        let seg = link.peer_segment(5001 + 65535, 1001, ACK, 64, &[1u8], None);
        let tcp = TcpPacket::new(&seg).unwrap();
        reader.on_segment(&tcp).unwrap();
    }

    #[tokio::test]
    async fn test_segment_permutation_delivers_exact_stream() {
        let link = MockLink::new();
        let (conn, reader) = dial(&link, 43004);

        let data: Vec<u8> = (0..4200u32).map(|i| (i % 251) as u8).collect();
        // mss-sized fragmentation, delivered in a scrambled order with dups
        let order = [2usize, 0, 2, 1];
        for &i in &order {
            let (start, end) = (i * 1400, (i + 1) * 1400);
            let seg = link.peer_segment(5001 + start as u32, 1001, ACK, 64, &data[start..end], None);
            conn.handle_segment(&TcpPacket::new(&seg).unwrap());
        }
        assert_eq!(conn.ack(), 5001 + 4200);

        let mut out = vec![0u8; 1000];
        let mut got = Vec::new();
        while got.len() < 4200 {
            let n = reader.read(&mut out).await.unwrap();
            got.extend_from_slice(&out[..n]);
        }
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn test_zero_length_segments_only_touch_flags() {
        let link = MockLink::new();
        let (conn, reader) = dial(&link, 43005);

        let seg = link.peer_segment(5001, 1001, ACK, 64, &[], None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());
        assert_eq!(reader.inner.lock().buf.len(), 0);
        assert_eq!(conn.ack(), 5001);

        reader.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
        let mut out = [0u8; 16];
        assert!(matches!(reader.read(&mut out).await, Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_read_unblocks_on_close() {
        let link = MockLink::new();
        let (conn, reader) = dial(&link, 43006);

        let closer = conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close().unwrap();
        });

        let mut out = [0u8; 16];
        assert!(matches!(reader.read(&mut out).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_expired_deadline_fails_immediately() {
        let link = MockLink::new();
        let (_conn, reader) = dial(&link, 43007);
        reader.set_read_deadline(Some(Instant::now() - Duration::from_millis(1)));
        let mut out = [0u8; 16];
        assert!(matches!(reader.read(&mut out).await, Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_fin_closes_and_suppresses_further_acks() {
        let link = MockLink::new();
        let (conn, _reader) = dial(&link, 43008);

        let seg = link.peer_segment(5001, 1001, ACK | FIN, 64, &[2u8; 100], None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());

        assert_eq!(conn.state(), TcpState::Finished);
        assert!(conn.is_closed());
        // closed without reset and without a trailing ACK
        assert!(link.sent().is_empty());
    }
}

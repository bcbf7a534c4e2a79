use std::sync::Arc;

use parking_lot::Mutex;
use pnet_packet::tcp::TcpFlags::{ACK, FIN, RST, SYN};
use pnet_packet::tcp::TcpPacket;
use pnet_packet::Packet;

use crate::error::{Error, Result};
use crate::tcp::seq::SeqNum;
use crate::tcp::writer::ReliableWriter;
use crate::tcp::{TcpConn, TcpHandler, TcpState};

/// ACK dampening for heavy response streams.
///
/// A small down-counter skips ACKs while the peer stays close to our
/// cursor; every emission refills the budget, up to one ACK per
/// [`AckPolicy::MAX_BUDGET`] payload segments. A sequence jump past
/// `ack + len + 2·mss` forces an ACK and shrinks the budget back down.
struct AckPolicy {
    budget: u8,
    refill: u8,
}

impl AckPolicy {
    const MAX_BUDGET: u8 = 5;

    fn new() -> Self {
        Self { budget: 0, refill: 0 }
    }

    /// Whether this payload segment needs an ACK. `in_reach` is true while
    /// the peer's sequence is within the dampening reach of our cursor.
    fn should_ack(&mut self, in_reach: bool) -> bool {
        if self.budget != 0 {
            self.budget -= 1;
            if in_reach {
                return false;
            }
            self.refill = 1;
        }
        self.budget = (self.refill + 1).min(Self::MAX_BUDGET);
        self.refill = self.budget;
        true
    }
}

/// Transmits via the embedded [`ReliableWriter`] and acknowledges the
/// response stream without delivering it up-stack. Suitable for
/// request/response protocols where the body is discarded, such as HTTP.
pub struct AckHandler {
    writer: Arc<ReliableWriter>,
    policy: Mutex<AckPolicy>,
}

impl AckHandler {
    pub fn new() -> Arc<Self> {
        Self::with_writer(ReliableWriter::new())
    }

    /// Wrap an existing writer, keeping its unacked bytes and accounting.
    /// Used when a TLS-phase connection hands off to the bulk HTTP phase.
    pub fn with_writer(writer: Arc<ReliableWriter>) -> Arc<Self> {
        Arc::new(Self {
            writer,
            policy: Mutex::new(AckPolicy::new()),
        })
    }

    pub fn writer(&self) -> &Arc<ReliableWriter> {
        &self.writer
    }

    /// Queue request bytes on the embedded writer.
    pub fn write(&self, payload: &[u8]) -> Result<usize> {
        self.writer.write(payload)
    }
}

impl TcpHandler for AckHandler {
    fn bind(&self, conn: Option<&Arc<TcpConn>>) {
        self.writer.bind(conn);
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
                // emits the request the writer already buffered
                self.writer.on_ack(tcp)
            }
            TcpState::Established => {
                self.writer.on_ack(tcp)?;

                if flags & FIN == FIN {
                    return conn.shut(false);
                }
                if flags & RST == RST {
                    return conn.shut(false);
                }
                let payload = tcp.payload();
                if payload.is_empty() {
                    return Ok(());
                }

                let reach = SeqNum(conn.ack())
                    .add_num(payload.len() as u32)
                    .add_num(conn.mss() as u32 * 2);
                let in_reach = reach > SeqNum(tcp.get_sequence());
                if !self.policy.lock().should_ack(in_reach) {
                    return Ok(());
                }

                conn.set_ack(tcp.get_sequence().wrapping_add(payload.len() as u32));
                conn.send_segment(ACK, &[], None)
            }
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

    fn dial(link: &Arc<MockLink>, port: u16, request: &[u8]) -> (Arc<TcpConn>, Arc<AckHandler>) {
        let handler = AckHandler::new();
        if !request.is_empty() {
            handler.write(request).unwrap();
        }
        let conn = TcpConn::dial_with_iss(link.clone(), link.peer(), port, handler.clone(), 1000).unwrap();
        (conn, handler)
    }

    fn handshake(link: &Arc<MockLink>, conn: &Arc<TcpConn>) {
        let seg = link.peer_segment(5000, 1001, SYN | ACK, 64, &[], Some(&wscale_options(1400, 7)));
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());
    }

    #[tokio::test]
    async fn test_handshake_bookkeeping() {
        let link = MockLink::new();
        let (conn, handler) = dial(&link, 42000, &[]);
        handshake(&link, &conn);

        assert_eq!(conn.state(), TcpState::Established);
        assert_eq!(conn.seq(), 1001);
        assert_eq!(conn.ack(), 5001);
        assert_eq!(conn.mss(), 1400);
        assert_eq!(handler.writer().peer_window(), 64 * 128);

        // nothing buffered, so the handshake finished with a bare ACK
        let sent = link.sent();
        let tcp = TcpPacket::new(sent.last().unwrap()).unwrap();
        assert_eq!(tcp.get_flags(), ACK);
        assert_eq!(tcp.get_acknowledgement(), 5001);
    }

    #[tokio::test]
    async fn test_request_flows_out_after_handshake() {
        let link = MockLink::new();
        let request: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let (conn, handler) = dial(&link, 42001, &request);
        link.clear();
        handshake(&link, &conn);

        let sent = link.sent();
        let lens: Vec<usize> = sent
            .iter()
            .map(|s| s.len() - (TcpPacket::new(s).unwrap().get_data_offset() as usize * 4))
            .collect();
        assert_eq!(lens, vec![1400, 1400, 200]);
        assert_eq!(conn.seq(), 4001);

        let seg = link.peer_segment(5001, 4001, ACK, 64, &[], None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());
        assert_eq!(handler.writer().pending(), 0);
    }

    #[tokio::test]
    async fn test_ack_dampening_acks_every_few_segments() {
        let link = MockLink::new();
        let (conn, _handler) = dial(&link, 42002, &[]);
        handshake(&link, &conn);
        link.clear();

        // 12 in-order 100-byte response segments
        let mut seq = 5001u32;
        for _ in 0..12 {
            let seg = link.peer_segment(seq, 1001, ACK, 64, &[1u8; 100], None);
            conn.handle_segment(&TcpPacket::new(&seg).unwrap());
            seq += 100;
        }

        let acks = link.sent();
        // budget grows 1, 2, 3, 4 -> acks after segments 1, 3, 6, 10
        assert_eq!(acks.len(), 4);
        let last = TcpPacket::new(acks.last().unwrap()).unwrap();
        assert_eq!(last.get_flags(), ACK);
        assert_eq!(last.get_acknowledgement(), 5001 + 10 * 100);
    }

    #[tokio::test]
    async fn test_sequence_jump_forces_ack() {
        let link = MockLink::new();
        let (conn, _handler) = dial(&link, 42003, &[]);
        handshake(&link, &conn);
        link.clear();

        // first segment acked, second skipped by the dampener
        let seg = link.peer_segment(5001, 1001, ACK, 64, &[1u8; 100], None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());
        let seg = link.peer_segment(5101, 1001, ACK, 64, &[1u8; 100], None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());
        assert_eq!(link.sent().len(), 1);

        // a jump far past ack + len + 2*mss may not be skipped
        let seg = link.peer_segment(5101 + 10_000, 1001, ACK, 64, &[1u8; 100], None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());
        let acks = link.sent();
        assert_eq!(acks.len(), 2);
        let last = TcpPacket::new(acks.last().unwrap()).unwrap();
        assert_eq!(last.get_acknowledgement(), 5101 + 10_000 + 100);
    }

    #[tokio::test]
    async fn test_fin_closes_without_reset() {
        let link = MockLink::new();
        let (conn, _handler) = dial(&link, 42004, &[]);
        handshake(&link, &conn);
        link.clear();

        let seg = link.peer_segment(5001, 1001, ACK | FIN, 64, &[], None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());

        assert_eq!(conn.state(), TcpState::Finished);
        assert!(conn.is_closed());
        assert!(link.sent().is_empty());
        assert!(!link.is_registered(&conn.tuple()));
    }

    #[tokio::test]
    async fn test_rst_during_handshake_closes_quietly() {
        let link = MockLink::new();
        let (conn, _handler) = dial(&link, 42005, &[]);
        link.clear();

        let seg = link.peer_segment(5000, 1001, RST, 0, &[], None);
        conn.handle_segment(&TcpPacket::new(&seg).unwrap());

        assert_eq!(conn.state(), TcpState::Finished);
        assert!(link.sent().is_empty());
    }
}

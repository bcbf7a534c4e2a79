//! Recording link double for handler and connection tests.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use pnet_packet::tcp::TcpOptionNumbers;

use crate::error::{Error, Result};
use crate::link::{FlowTuple, Link};
use crate::tcp::{build_segment, TcpConn};

const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const PEER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), 80);

pub(crate) struct MockLink {
    sent: Mutex<Vec<BytesMut>>,
    registered: Mutex<Vec<FlowTuple>>,
}

impl MockLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            registered: Mutex::new(Vec::new()),
        })
    }

    pub fn peer(&self) -> SocketAddrV4 {
        PEER
    }

    /// TCP segments handed to the link so far, oldest first.
    pub fn sent(&self) -> Vec<BytesMut> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    pub fn is_registered(&self, tuple: &FlowTuple) -> bool {
        self.registered.lock().contains(tuple)
    }

    /// Build an inbound segment as the peer would emit it.
    pub fn peer_segment(
        &self,
        seq: u32,
        ack: u32,
        flags: u8,
        window: u16,
        payload: &[u8],
        options: Option<&BytesMut>,
    ) -> BytesMut {
        build_segment(
            *PEER.ip(),
            PEER.port(),
            LOCAL_IP,
            40000,
            seq,
            ack,
            window,
            flags,
            payload,
            options.map(|o| &o[..]),
        )
    }
}

impl Link for MockLink {
    fn src_ip(&self) -> Ipv4Addr {
        LOCAL_IP
    }

    fn mtu(&self) -> u16 {
        1500
    }

    fn send_ipv4(&self, _dst: Ipv4Addr, segment: &[u8]) -> Result<()> {
        self.sent.lock().push(BytesMut::from(segment));
        Ok(())
    }

    fn register(&self, conn: Arc<TcpConn>) -> Result<()> {
        let mut registered = self.registered.lock();
        if registered.contains(&conn.tuple()) {
            return Err(Error::TupleInUse);
        }
        registered.push(conn.tuple());
        Ok(())
    }

    fn deregister(&self, tuple: &FlowTuple) {
        self.registered.lock().retain(|t| t != tuple);
    }
}

/// SYN-ACK style options: MSS, NOP, window scale.
pub(crate) fn wscale_options(mss: u16, shift: u8) -> BytesMut {
    let mut options = BytesMut::with_capacity(8);
    options.put_u8(TcpOptionNumbers::MSS.0);
    options.put_u8(4);
    options.put_u16(mss);
    options.put_u8(TcpOptionNumbers::NOP.0);
    options.put_u8(TcpOptionNumbers::WSCALE.0);
    options.put_u8(3);
    options.put_u8(shift);
    options
}

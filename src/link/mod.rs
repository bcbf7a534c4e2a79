use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use pnet_datalink::{self as datalink, Channel, Config, DataLinkReceiver, DataLinkSender, MacAddr};
use pnet_packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet_packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::Packet;

use crate::error::{Error, Result};
use crate::tcp::TcpConn;

const ETHER_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const ARP_DEADLINE: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// One direction of a TCP flow, as seen from this host.
#[derive(Eq, Hash, PartialEq, Debug, Clone, Copy)]
pub struct FlowTuple {
    pub protocol: IpNextHeaderProtocol,
    pub local_ip: Ipv4Addr,
    pub peer_ip: Ipv4Addr,
    pub local_port: u16,
    pub peer_port: u16,
}

impl FlowTuple {
    pub fn tcp(local_ip: Ipv4Addr, local_port: u16, peer_ip: Ipv4Addr, peer_port: u16) -> Self {
        Self {
            protocol: IpNextHeaderProtocols::Tcp,
            local_ip,
            peer_ip,
            local_port,
            peer_port,
        }
    }
}

/// The seam between connections and the wire. [`Egress`] is the production
/// implementation; tests install a recording double.
pub trait Link: Send + Sync {
    fn src_ip(&self) -> Ipv4Addr;
    fn mtu(&self) -> u16;
    /// Wrap `segment` in IPv4 (+ the cached Ethernet header) and transmit it.
    fn send_ipv4(&self, dst: Ipv4Addr, segment: &[u8]) -> Result<()>;
    fn register(&self, conn: Arc<TcpConn>) -> Result<()>;
    fn deregister(&self, tuple: &FlowTuple);
}

/// Raw link-layer I/O engine.
///
/// Owns the capture channel bound to one interface, the cached Ethernet
/// header toward the gateway, the per-tuple connection registry, and the
/// inbound traffic counter.
pub struct Egress {
    src: Ipv4Addr,
    mtu: u16,
    ether_header: [u8; ETHER_HEADER_LEN],
    tx: Mutex<Box<dyn DataLinkSender>>,
    rx: Mutex<Option<Box<dyn DataLinkReceiver>>>,
    conns: DashMap<FlowTuple, Arc<TcpConn>>,
    traffic: AtomicU64,
    ident: AtomicU16,
}

impl Egress {
    /// Bind the interface, resolve the gateway MAC via ARP and cache the
    /// Ethernet header. `mtu` falls back to the interface's sysfs value.
    pub fn open(interface: &str, src: Ipv4Addr, gateway: Ipv4Addr, mtu: Option<u16>) -> Result<Arc<Self>> {
        let iface = datalink::interfaces()
            .into_iter()
            .find(|i| i.name == interface)
            .ok_or_else(|| Error::LinkOpen(io::Error::new(io::ErrorKind::NotFound, format!("no interface {interface}"))))?;
        let local_mac = iface
            .mac
            .ok_or_else(|| Error::LinkOpen(io::Error::new(io::ErrorKind::Other, "interface has no MAC address")))?;
        let mtu = mtu.unwrap_or_else(|| interface_mtu(interface));

        let config = Config {
            read_timeout: Some(READ_TIMEOUT),
            ..Default::default()
        };
        let (mut tx, mut rx) = match datalink::channel(&iface, config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => {
                return Err(Error::LinkOpen(io::Error::new(io::ErrorKind::Other, "not an ethernet channel")));
            }
            Err(e) => return Err(Error::LinkOpen(e)),
        };

        let gw_mac = resolve_gateway(tx.as_mut(), rx.as_mut(), local_mac, src, gateway)?;

        let mut ether_header = [0u8; ETHER_HEADER_LEN];
        {
            let mut eth = MutableEthernetPacket::new(&mut ether_header).expect("header buffer");
            eth.set_destination(gw_mac);
            eth.set_source(local_mac);
            eth.set_ethertype(EtherTypes::Ipv4);
        }

        Ok(Arc::new(Self {
            src,
            mtu,
            ether_header,
            tx: Mutex::new(tx),
            rx: Mutex::new(Some(rx)),
            conns: DashMap::new(),
            traffic: AtomicU64::new(0),
            ident: AtomicU16::new(rand::random()),
        }))
    }

    /// Total bytes of inbound frames delivered to connections.
    pub fn traffic(&self) -> u64 {
        self.traffic.load(Ordering::Relaxed)
    }

    /// Run the receive loop on a blocking task until the link read fails.
    pub fn run(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let egress = self;
        tokio::task::spawn_blocking(move || {
            let Some(rx) = egress.rx.lock().take() else {
                log::warn!("receive loop already running");
                return;
            };
            egress.recv_loop(rx);
        })
    }

    fn recv_loop(&self, mut rx: Box<dyn DataLinkReceiver>) {
        loop {
            let frame = match rx.next() {
                Ok(frame) => frame,
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(e) => {
                    log::error!("link read: {e}");
                    return;
                }
            };

            if frame.len() < ETHER_HEADER_LEN || frame[12] != 0x08 || frame[13] != 0x00 {
                continue;
            }
            let Some(ipv4) = Ipv4Packet::new(&frame[ETHER_HEADER_LEN..]) else {
                continue;
            };
            // Inbound TCP only; outbound copies carry a foreign destination.
            if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Tcp || ipv4.get_destination() != self.src {
                continue;
            }
            let Some(tcp) = TcpPacket::new(ipv4.payload()) else {
                continue;
            };
            let tuple = FlowTuple::tcp(
                ipv4.get_destination(),
                tcp.get_destination(),
                ipv4.get_source(),
                tcp.get_source(),
            );
            let Some(conn) = self.conns.get(&tuple).map(|c| c.value().clone()) else {
                continue;
            };
            conn.handle_segment(&tcp);
            self.traffic.fetch_add(frame.len() as u64, Ordering::Relaxed);
        }
    }
}

impl Link for Egress {
    fn src_ip(&self) -> Ipv4Addr {
        self.src
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn send_ipv4(&self, dst: Ipv4Addr, segment: &[u8]) -> Result<()> {
        let total_length = IPV4_HEADER_LEN + segment.len();
        let mut frame = BytesMut::with_capacity(ETHER_HEADER_LEN + total_length);
        frame.put_slice(&self.ether_header);

        let identification = self.ident.fetch_add(1, Ordering::Relaxed);
        let mut ip_header = [0u8; IPV4_HEADER_LEN];
        ip_header[0] = (4 << 4) | (IPV4_HEADER_LEN / 4) as u8; // Version + IHL
        ip_header[2..4].copy_from_slice(&(total_length as u16).to_be_bytes());
        ip_header[4..6].copy_from_slice(&identification.to_be_bytes());
        ip_header[8] = 255; // TTL
        ip_header[9] = IpNextHeaderProtocols::Tcp.0;
        ip_header[12..16].copy_from_slice(&self.src.octets());
        ip_header[16..20].copy_from_slice(&dst.octets());
        let checksum = pnet_packet::util::checksum(&ip_header, 5);
        ip_header[10..12].copy_from_slice(&checksum.to_be_bytes());

        frame.put_slice(&ip_header);
        frame.put_slice(segment);

        match self.tx.lock().send_to(&frame, None) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(Error::Send(e)),
            None => Err(Error::Send(io::Error::new(io::ErrorKind::Other, "link sender rejected frame"))),
        }
    }

    fn register(&self, conn: Arc<TcpConn>) -> Result<()> {
        match self.conns.entry(conn.tuple()) {
            Entry::Occupied(_) => Err(Error::TupleInUse),
            Entry::Vacant(entry) => {
                entry.insert(conn);
                Ok(())
            }
        }
    }

    fn deregister(&self, tuple: &FlowTuple) {
        self.conns.remove(tuple);
    }
}

/// Broadcast an ARP request for the gateway and wait for its reply.
fn resolve_gateway(
    tx: &mut dyn DataLinkSender,
    rx: &mut dyn DataLinkReceiver,
    local_mac: MacAddr,
    src: Ipv4Addr,
    gateway: Ipv4Addr,
) -> Result<MacAddr> {
    let mut request = [0u8; ETHER_HEADER_LEN + 28];
    {
        let mut eth = MutableEthernetPacket::new(&mut request).expect("arp buffer");
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(local_mac);
        eth.set_ethertype(EtherTypes::Arp);
    }
    {
        let mut arp = MutableArpPacket::new(&mut request[ETHER_HEADER_LEN..]).expect("arp buffer");
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(local_mac);
        arp.set_sender_proto_addr(src);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(gateway);
    }
    match tx.send_to(&request, None) {
        Some(Ok(())) => {}
        Some(Err(e)) => return Err(Error::Send(e)),
        None => return Err(Error::Send(io::Error::new(io::ErrorKind::Other, "link sender rejected frame"))),
    }

    let start = Instant::now();
    while start.elapsed() < ARP_DEADLINE {
        let frame = match rx.next() {
            Ok(frame) => frame,
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(e) => return Err(Error::LinkOpen(e)),
        };
        let Some(eth) = EthernetPacket::new(frame) else {
            continue;
        };
        if eth.get_ethertype() != EtherTypes::Arp {
            continue;
        }
        let Some(arp) = ArpPacket::new(eth.payload()) else {
            continue;
        };
        if arp.get_operation() != ArpOperations::Reply {
            continue;
        }
        if arp.get_sender_proto_addr() == gateway {
            return Ok(arp.get_sender_hw_addr());
        }
        // A reply aimed at us that is not from the gateway is a bad answer;
        // unrelated ARP chatter is skipped.
        if arp.get_target_proto_addr() == src && arp.get_target_hw_addr() == local_mac {
            return Err(Error::ArpBadReply(arp.get_sender_proto_addr()));
        }
    }
    Err(Error::ArpTimeout(ARP_DEADLINE))
}

fn interface_mtu(interface: &str) -> u16 {
    std::fs::read_to_string(format!("/sys/class/net/{interface}/mtu"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(1500)
}

//! Central dispatch (§4.4): demultiplexes inbound frames down the stack,
//! assembles outbound packets up the stack, consults the neighbor caches,
//! performs source-address selection, and drives fragmentation.
//!
//! `PacketHandler` owns plain data — addresses, caches, config, counters —
//! and every operation is a method taking `&self`/`&mut self` rather than
//! a virtual call through a mix-in hierarchy (§9).

use crate::addr::{Host4, Host6, Ipv4Addr, Ipv6Addr, Mask6, MacAddr, Network6, Origin};
use crate::config::StackConfig;
use crate::neighbor::{ArpCache, CacheAction, DadOutcome, DadTracker, NdCache, ObservationSource};
use crate::reassembly::ReassemblyTable;
use crate::wire::arp::{ArpMessage, ArpOperation};
use crate::wire::ethernet::{EtherType, EthernetFrame};
use crate::wire::icmpv4::{DestUnreachableCode, Icmpv4Message};
use crate::wire::icmpv6::Icmpv6Message;
use crate::wire::ipv4::{FlagsAndOffset, IpProtocol, Ipv4Packet};
use crate::wire::ipv6::Ipv6Packet;
use crate::wire::nd_options::NdOption;
use crate::wire::tcp::{TcpFlags, TcpSegment};
use crate::wire::udp::{UdpDatagram, HEADER_LEN as UDP_HEADER_LEN};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

fn all_nodes_multicast() -> Ipv6Addr {
    Ipv6Addr::new([0xff, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1])
}

/// What a completed demultiplex of a UDP datagram or TCP segment hands to
/// the socket layer. `PacketHandler` has no knowledge of `SocketTable` or
/// `Tcb` — it only knows how to ask whether a local tuple is claimed.
pub trait SocketDemux {
    fn udp_has_listener(&self, local: (crate::addr::IpAddr, u16)) -> bool;
    fn deliver_udp(&self, local: (crate::addr::IpAddr, u16), remote: (crate::addr::IpAddr, u16), payload: Vec<u8>);

    /// True if some TCB or LISTEN socket would accept a segment on this
    /// 4-tuple (used to decide whether a non-SYN, non-RST segment earns a
    /// RST per §4.5).
    fn tcp_has_acceptor(&self, local: (crate::addr::IpAddr, u16), remote: (crate::addr::IpAddr, u16)) -> bool;
    fn deliver_tcp(&self, local: (crate::addr::IpAddr, u16), remote: (crate::addr::IpAddr, u16), segment: TcpSegment);
}

pub struct PacketHandler {
    pub mac: MacAddr,
    pub config: StackConfig,
    pub hosts4: Mutex<Vec<Host4>>,
    pub hosts6: Mutex<Vec<Host6>>,
    pub arp_cache: ArpCache,
    pub nd_cache: NdCache,
    pub dad: DadTracker,
    reassembly4: ReassemblyTable<(Ipv4Addr, Ipv4Addr, u16)>,
    reassembly6: ReassemblyTable<(Ipv6Addr, Ipv6Addr, u32)>,
    ip4_ident: AtomicU16,
    ip6_flow_id: AtomicU32,
}

impl PacketHandler {
    pub fn new(mac: MacAddr, config: StackConfig) -> Self {
        PacketHandler {
            mac,
            reassembly4: ReassemblyTable::new(config.ip6_frag_flow_timeout),
            reassembly6: ReassemblyTable::new(config.ip6_frag_flow_timeout),
            config,
            hosts4: Mutex::new(Vec::new()),
            hosts6: Mutex::new(Vec::new()),
            arp_cache: ArpCache::new(),
            nd_cache: NdCache::new(),
            dad: DadTracker::default(),
            ip4_ident: AtomicU16::new(0),
            ip6_flow_id: AtomicU32::new(0),
        }
    }

    fn our_v4_addrs(&self) -> Vec<Ipv4Addr> {
        self.hosts4.lock().unwrap().iter().map(|h| h.address).collect()
    }

    fn our_v6_addrs(&self) -> Vec<Ipv6Addr> {
        self.hosts6.lock().unwrap().iter().map(|h| h.address).collect()
    }

    fn is_our_v4(&self, addr: Ipv4Addr) -> bool {
        self.our_v4_addrs().contains(&addr)
    }

    fn is_broadcast_v4(&self, addr: Ipv4Addr) -> bool {
        if addr.is_limited_broadcast() {
            return true;
        }
        self.hosts4
            .lock()
            .unwrap()
            .iter()
            .any(|h| h.network.mask.apply(addr) == h.network.addr && addr == directed_broadcast(h))
    }

    fn is_our_v6(&self, addr: Ipv6Addr) -> bool {
        self.our_v6_addrs().contains(&addr)
    }

    /// §4.4 inbound Ethernet filter: our unicast MAC, broadcast, or a
    /// multicast group we are implicitly joined to (solicited-node for
    /// each of our IPv6 addresses, and all-nodes).
    fn accepts_dst_mac(&self, dst: MacAddr) -> bool {
        if dst == self.mac || dst.is_broadcast() {
            return true;
        }
        if dst == MacAddr::for_ipv6_multicast(all_nodes_multicast()) {
            return true;
        }
        self.our_v6_addrs()
            .iter()
            .any(|a| dst == MacAddr::for_ipv6_multicast(a.solicited_node_multicast()))
    }

    /// §4.4 source-address selection for a remote address `target`:
    /// prefer a host whose network contains it, else the first host with
    /// a gateway, else `None` ("no route").
    pub fn select_source_v4(&self, target: Ipv4Addr) -> Option<Ipv4Addr> {
        let hosts = self.hosts4.lock().unwrap();
        if let Some(h) = hosts.iter().find(|h| h.network.contains(target)) {
            return Some(h.address);
        }
        hosts.iter().find(|h| h.gateway.is_some()).map(|h| h.address)
    }

    pub fn select_source_v6(&self, target: Ipv6Addr) -> Option<Ipv6Addr> {
        let hosts = self.hosts6.lock().unwrap();
        if let Some(h) = hosts.iter().find(|h| h.network.contains(target)) {
            return Some(h.address);
        }
        hosts.iter().find(|h| h.gateway.is_some()).map(|h| h.address)
    }

    fn next_ip4_ident(&self) -> u16 {
        self.ip4_ident.fetch_add(1, Ordering::Relaxed)
    }

    fn next_ip6_flow_id(&self) -> u32 {
        self.ip6_flow_id.fetch_add(1, Ordering::Relaxed)
    }

    // ---- inbound -------------------------------------------------------

    /// Process one inbound Ethernet frame. Returns outbound Ethernet
    /// frames to emit immediately (ARP/ND replies, ICMP echo replies,
    /// destination-unreachable, RST-on-closed-port) after consulting
    /// `sockets` for UDP/TCP demultiplex decisions.
    pub fn receive(&self, frame: &[u8], now: Instant, sockets: &dyn SocketDemux) -> Vec<Vec<u8>> {
        let eth = match EthernetFrame::parse(frame) {
            Ok(eth) => eth,
            Err(e) => {
                debug!(error = %e, "dropping malformed ethernet frame");
                return Vec::new();
            }
        };
        if !self.accepts_dst_mac(eth.dst) {
            trace!(dst = %eth.dst, "ethernet frame not addressed to us, dropping");
            return Vec::new();
        }
        match eth.ethertype {
            EtherType::Arp => self.phrx_arp(&eth, now),
            EtherType::Ipv4 => self.phrx_ip4(&eth, now, sockets),
            EtherType::Ipv6 => self.phrx_ip6(&eth, now, sockets),
            EtherType::Unknown(v) => {
                trace!(ethertype = format!("0x{:04x}", v), "dropping unknown ethertype");
                Vec::new()
            }
        }
    }

    fn phrx_arp(&self, eth: &EthernetFrame, now: Instant) -> Vec<Vec<u8>> {
        let msg = match ArpMessage::parse(&eth.payload) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "dropping malformed arp message");
                return Vec::new();
            }
        };
        let flushed = self.arp_cache.observe(msg.sender_ip, msg.sender_mac, ObservationSource::Spontaneous, now);
        let mut out: Vec<Vec<u8>> = flushed
            .into_iter()
            .map(|ip_packet| {
                EthernetFrame { dst: msg.sender_mac, src: self.mac, ethertype: EtherType::Ipv4, payload: ip_packet }
                    .assemble()
            })
            .collect();
        if msg.operation == ArpOperation::Request && self.is_our_v4(msg.target_ip) {
            let reply = ArpMessage::reply(self.mac, msg.target_ip, msg.sender_mac, msg.sender_ip);
            out.push(
                EthernetFrame {
                    dst: msg.sender_mac,
                    src: self.mac,
                    ethertype: EtherType::Arp,
                    payload: reply.assemble().to_vec(),
                }
                .assemble(),
            );
        }
        out
    }

    fn phrx_ip4(&self, eth: &EthernetFrame, now: Instant, sockets: &dyn SocketDemux) -> Vec<Vec<u8>> {
        let pkt = match Ipv4Packet::parse(&eth.payload) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "dropping malformed ipv4 packet");
                return Vec::new();
            }
        };
        if let Err(e) = pkt.check_sanity() {
            warn!(error = %e, "dropping ipv4 packet failing sanity check");
            return Vec::new();
        }
        if !self.is_our_v4(pkt.dst) && !self.is_broadcast_v4(pkt.dst) {
            trace!(dst = %pkt.dst, "ipv4 packet not addressed to us, dropping");
            return Vec::new();
        }

        let more_fragments = pkt.flags_offset.mf();
        let offset_bytes = pkt.flags_offset.offset() as usize * 8;
        if more_fragments || offset_bytes != 0 {
            let key = (pkt.src, pkt.dst, pkt.identification);
            let mut header = pkt.clone();
            header.payload = Vec::new();
            let header_bytes = header.assemble();
            match self.reassembly4.insert_fragment(key, &header_bytes, offset_bytes, &pkt.payload, more_fragments, now) {
                Some((header_bytes, body)) => {
                    let mut reassembled = match Ipv4Packet::parse(&header_bytes) {
                        Ok(p) => p,
                        Err(_) => return Vec::new(),
                    };
                    reassembled.payload = body;
                    self.dispatch_ip4_payload(eth.src, &reassembled, sockets)
                }
                None => Vec::new(),
            }
        } else {
            self.dispatch_ip4_payload(eth.src, &pkt, sockets)
        }
    }

    fn dispatch_ip4_payload(&self, eth_src: MacAddr, pkt: &Ipv4Packet, sockets: &dyn SocketDemux) -> Vec<Vec<u8>> {
        match pkt.protocol {
            IpProtocol::Icmp => self.phrx_icmpv4(eth_src, pkt),
            IpProtocol::Udp => self.phrx_udp4(pkt, sockets),
            IpProtocol::Tcp => self.phrx_tcp4(pkt, sockets),
            other => {
                trace!(?other, "dropping ipv4 payload of unhandled protocol");
                Vec::new()
            }
        }
    }

    fn phrx_icmpv4(&self, eth_src: MacAddr, pkt: &Ipv4Packet) -> Vec<Vec<u8>> {
        let msg = match Icmpv4Message::parse(&pkt.payload) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "dropping malformed icmpv4 message");
                return Vec::new();
            }
        };
        if let Icmpv4Message::EchoRequest { identifier, sequence, data } = msg {
            let reply = Icmpv4Message::EchoReply { identifier, sequence, data };
            let ip_reply = Ipv4Packet {
                dscp: 0,
                ecn: 0,
                total_length: 0,
                identification: self.next_ip4_ident(),
                flags_offset: FlagsAndOffset::new(),
                ttl: self.config.ip4_default_ttl,
                protocol: IpProtocol::Icmp,
                src: pkt.dst,
                dst: pkt.src,
                options: Vec::new(),
                payload: reply.assemble(),
            };
            return vec![EthernetFrame { dst: eth_src, src: self.mac, ethertype: EtherType::Ipv4, payload: ip_reply.assemble() }.assemble()];
        }
        Vec::new()
    }

    fn phrx_udp4(&self, pkt: &Ipv4Packet, sockets: &dyn SocketDemux) -> Vec<Vec<u8>> {
        let pseudo = crate::checksum::ipv4_pseudo_header_sum(pkt.src, pkt.dst, IpProtocol::Udp.to_u8(), pkt.payload.len() as u16);
        let dgram = match UdpDatagram::parse(&pkt.payload, pseudo) {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "dropping malformed udp datagram");
                return Vec::new();
            }
        };
        let local = (crate::addr::IpAddr::V4(pkt.dst), dgram.dst_port);
        let remote = (crate::addr::IpAddr::V4(pkt.src), dgram.src_port);
        if sockets.udp_has_listener(local) {
            sockets.deliver_udp(local, remote, dgram.payload);
            return Vec::new();
        }
        let mut original = pkt.clone();
        original.payload.truncate(8);
        let original_bytes = {
            let mut header = original.clone();
            header.payload = pkt.payload[..8.min(pkt.payload.len())].to_vec();
            header.assemble()
        };
        let icmp = Icmpv4Message::DestinationUnreachable {
            code: DestUnreachableCode::Port,
            next_hop_mtu: 0,
            original: original_bytes,
        };
        let ip_reply = Ipv4Packet {
            dscp: 0,
            ecn: 0,
            total_length: 0,
            identification: self.next_ip4_ident(),
            flags_offset: FlagsAndOffset::new(),
            ttl: self.config.ip4_default_ttl,
            protocol: IpProtocol::Icmp,
            src: pkt.dst,
            dst: pkt.src,
            options: Vec::new(),
            payload: icmp.assemble(),
        };
        self.emit_ip4(pkt.src, ip_reply.assemble())
    }

    fn phrx_tcp4(&self, pkt: &Ipv4Packet, sockets: &dyn SocketDemux) -> Vec<Vec<u8>> {
        let pseudo = crate::checksum::ipv4_pseudo_header_sum(pkt.src, pkt.dst, IpProtocol::Tcp.to_u8(), pkt.payload.len() as u16);
        let seg = match TcpSegment::parse(&pkt.payload, pseudo) {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "dropping malformed tcp segment");
                return Vec::new();
            }
        };
        let local = (crate::addr::IpAddr::V4(pkt.dst), seg.dst_port);
        let remote = (crate::addr::IpAddr::V4(pkt.src), seg.src_port);
        if sockets.tcp_has_acceptor(local, remote) {
            sockets.deliver_tcp(local, remote, seg);
            return Vec::new();
        }
        if seg.flags.rst() {
            return Vec::new();
        }
        let rst = build_rst_reply(&seg);
        let ip_reply = Ipv4Packet {
            dscp: 0,
            ecn: 0,
            total_length: 0,
            identification: self.next_ip4_ident(),
            flags_offset: FlagsAndOffset::new(),
            ttl: self.config.ip4_default_ttl,
            protocol: IpProtocol::Tcp,
            src: pkt.dst,
            dst: pkt.src,
            options: Vec::new(),
            payload: rst.assemble(crate::checksum::ipv4_pseudo_header_sum(
                pkt.dst,
                pkt.src,
                IpProtocol::Tcp.to_u8(),
                crate::wire::tcp::MIN_HEADER_LEN as u16,
            )),
        };
        self.emit_ip4(pkt.src, ip_reply.assemble())
    }

    fn phrx_ip6(&self, eth: &EthernetFrame, now: Instant, sockets: &dyn SocketDemux) -> Vec<Vec<u8>> {
        let pkt = match Ipv6Packet::parse(&eth.payload) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "dropping malformed ipv6 packet");
                return Vec::new();
            }
        };
        if !self.is_our_v6(pkt.dst) && !pkt.dst.is_multicast() {
            trace!(dst = %pkt.dst, "ipv6 packet not addressed to us, dropping");
            return Vec::new();
        }

        if let Some(frag) = pkt.fragment {
            let key = (pkt.src, pkt.dst, frag.identification);
            let offset_bytes = frag.offset as usize * 8;
            let mut header = pkt.clone();
            header.fragment = None;
            header.payload = Vec::new();
            header.next_header = frag.next_header;
            let header_bytes = header.assemble();
            return match self.reassembly6.insert_fragment(key, &header_bytes, offset_bytes, &pkt.payload, frag.more_fragments, now) {
                Some((header_bytes, body)) => {
                    let mut reassembled = match Ipv6Packet::parse(&header_bytes) {
                        Ok(p) => p,
                        Err(_) => return Vec::new(),
                    };
                    reassembled.payload = body;
                    self.dispatch_ip6_payload(eth.src, &reassembled, now, sockets)
                }
                None => Vec::new(),
            };
        }
        self.dispatch_ip6_payload(eth.src, &pkt, now, sockets)
    }

    fn dispatch_ip6_payload(&self, eth_src: MacAddr, pkt: &Ipv6Packet, now: Instant, sockets: &dyn SocketDemux) -> Vec<Vec<u8>> {
        match pkt.next_header {
            IpProtocol::Icmp => self.phrx_icmpv6(eth_src, pkt, now),
            IpProtocol::Udp => self.phrx_udp6(eth_src, pkt, sockets),
            IpProtocol::Tcp => self.phrx_tcp6(eth_src, pkt, sockets),
            other => {
                trace!(?other, "dropping ipv6 payload of unhandled next header");
                Vec::new()
            }
        }
    }

    fn phrx_icmpv6(&self, eth_src: MacAddr, pkt: &Ipv6Packet, now: Instant) -> Vec<Vec<u8>> {
        let msg = match Icmpv6Message::parse(&pkt.payload, pkt.src, pkt.dst) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "dropping malformed icmpv6 message");
                return Vec::new();
            }
        };
        if msg.check_sanity(pkt.src, pkt.dst, pkt.hop_limit).is_err() {
            warn!("dropping icmpv6 message failing sanity check");
            return Vec::new();
        }
        match msg {
            Icmpv6Message::EchoRequest { identifier, sequence, data } => {
                let reply = Icmpv6Message::EchoReply { identifier, sequence, data };
                self.emit_icmpv6(eth_src, pkt.dst, pkt.src, reply, self.config.ip6_default_hop)
            }
            Icmpv6Message::NeighborSolicitation { target, options } => {
                self.handle_neighbor_solicitation(eth_src, pkt, target, &options, now)
            }
            Icmpv6Message::NeighborAdvertisement { solicited: _, target, options, .. } => {
                self.handle_neighbor_advertisement(target, &options, now)
            }
            Icmpv6Message::RouterAdvertisement { options, .. } => self.handle_router_advertisement(pkt, &options, now),
            _ => Vec::new(),
        }
    }

    /// SLAAC (§4.2): for each autonomous /64 prefix in a Router
    /// Advertisement, form a candidate address from the prefix plus our
    /// EUI-64 interface identifier, register it with origin [`Origin::Nd`],
    /// and start DAD on it.
    fn handle_router_advertisement(&self, pkt: &Ipv6Packet, options: &[NdOption], now: Instant) -> Vec<Vec<u8>> {
        let gateway = pkt.src.is_link_local().then_some(pkt.src);
        let mut out = Vec::new();
        for opt in options {
            let NdOption::PrefixInformation { prefix_len, autonomous, valid_lifetime, prefix, .. } = opt else {
                continue;
            };
            if !*autonomous || *prefix_len != 64 {
                continue;
            }
            let candidate = self.slaac_address(*prefix);
            if self.is_our_v6(candidate) {
                continue;
            }
            let network = Network6::new(*prefix, Mask6::from_prefix_len(64).unwrap());
            let expiration = if *valid_lifetime == 0 { None } else { Some(now + Duration::from_secs(*valid_lifetime as u64)) };
            let host = match Host6::new(candidate, network, gateway, Origin::Nd, expiration) {
                Ok(h) => h,
                Err(e) => {
                    debug!(error = %e, %candidate, "rejecting slaac candidate failing host invariant");
                    continue;
                }
            };
            self.hosts6.lock().unwrap().push(host);
            self.dad.begin(candidate, now);
            out.extend(self.emit_dad_probe(candidate));
        }
        out
    }

    fn slaac_address(&self, prefix: Ipv6Addr) -> Ipv6Addr {
        let p = prefix.octets();
        let m = self.mac.octets();
        let mut octets = [0u8; 16];
        octets[..8].copy_from_slice(&p[..8]);
        octets[8] = m[0] ^ 0x02;
        octets[9] = m[1];
        octets[10] = m[2];
        octets[11] = 0xff;
        octets[12] = 0xfe;
        octets[13] = m[3];
        octets[14] = m[4];
        octets[15] = m[5];
        Ipv6Addr::new(octets)
    }

    fn emit_dad_probe(&self, candidate: Ipv6Addr) -> Vec<Vec<u8>> {
        let ns = Icmpv6Message::NeighborSolicitation { target: candidate, options: vec![NdOption::SourceLinkLayerAddress(self.mac)] };
        let solicited_node = candidate.solicited_node_multicast();
        let unspecified = Ipv6Addr::new([0; 16]);
        self.emit_icmpv6(MacAddr::for_ipv6_multicast(solicited_node), unspecified, solicited_node, ns, 255)
    }

    fn handle_neighbor_solicitation(
        &self,
        eth_src: MacAddr,
        pkt: &Ipv6Packet,
        target: Ipv6Addr,
        options: &[NdOption],
        now: Instant,
    ) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        if !pkt.src.is_unspecified() {
            let sender_mac = options
                .iter()
                .find_map(|o| match o {
                    NdOption::SourceLinkLayerAddress(mac) => Some(*mac),
                    _ => None,
                })
                .unwrap_or(eth_src);
            let flushed = self.nd_cache.observe(pkt.src, sender_mac, ObservationSource::Spontaneous, now);
            out.extend(
                flushed
                    .into_iter()
                    .map(|ip_packet| EthernetFrame { dst: sender_mac, src: self.mac, ethertype: EtherType::Ipv6, payload: ip_packet }.assemble()),
            );
        }
        if self.is_our_v6(target) {
            // We own `target`: defend it with a solicited NA whether this
            // is ordinary address resolution or another host's DAD probe
            // (RFC 4862 §5.4.3). A DAD probe carries an unspecified source,
            // so the reply must go to the all-nodes multicast address
            // rather than unicast to that source.
            let na = Icmpv6Message::NeighborAdvertisement {
                router: false,
                solicited: !pkt.src.is_unspecified(),
                overridden: true,
                target,
                options: vec![NdOption::TargetLinkLayerAddress(self.mac)],
            };
            if pkt.src.is_unspecified() {
                let dst = all_nodes_multicast();
                out.extend(self.emit_icmpv6(MacAddr::for_ipv6_multicast(dst), target, dst, na, 255));
            } else {
                out.extend(self.emit_icmpv6(eth_src, target, pkt.src, na, 255));
            }
        }
        out
    }

    fn handle_neighbor_advertisement(&self, target: Ipv6Addr, options: &[NdOption], now: Instant) -> Vec<Vec<u8>> {
        if self.is_our_v6(target) {
            self.dad.observe_conflict(target);
            return Vec::new();
        }
        let tlla = options.iter().find_map(|o| match o {
            NdOption::TargetLinkLayerAddress(mac) => Some(*mac),
            _ => None,
        });
        let Some(mac) = tlla else { return Vec::new() };
        let flushed = self.nd_cache.observe(target, mac, ObservationSource::Solicited, now);
        flushed
            .into_iter()
            .map(|ip_packet| EthernetFrame { dst: mac, src: self.mac, ethertype: EtherType::Ipv6, payload: ip_packet }.assemble())
            .collect()
    }

    fn emit_icmpv6(&self, eth_src: MacAddr, src: Ipv6Addr, dst: Ipv6Addr, msg: Icmpv6Message, hop_limit: u8) -> Vec<Vec<u8>> {
        let ip_reply = Ipv6Packet {
            traffic_class: 0,
            flow_label: 0,
            hop_limit,
            next_header: IpProtocol::Icmp,
            src,
            dst,
            fragment: None,
            payload: msg.assemble(src, dst),
        };
        vec![EthernetFrame { dst: eth_src, src: self.mac, ethertype: EtherType::Ipv6, payload: ip_reply.assemble() }.assemble()]
    }

    fn phrx_udp6(&self, eth_src: MacAddr, pkt: &Ipv6Packet, sockets: &dyn SocketDemux) -> Vec<Vec<u8>> {
        let pseudo = crate::checksum::ipv6_pseudo_header_sum(pkt.src, pkt.dst, 17, pkt.payload.len() as u32);
        let dgram = match UdpDatagram::parse(&pkt.payload, pseudo) {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "dropping malformed udp datagram");
                return Vec::new();
            }
        };
        let local = (crate::addr::IpAddr::V6(pkt.dst), dgram.dst_port);
        let remote = (crate::addr::IpAddr::V6(pkt.src), dgram.src_port);
        if sockets.udp_has_listener(local) {
            sockets.deliver_udp(local, remote, dgram.payload);
            return Vec::new();
        }
        let icmp = icmp_dest_unreachable_port(pkt);
        self.emit_icmpv6(eth_src, pkt.dst, pkt.src, icmp, self.config.ip6_default_hop)
    }

    fn phrx_tcp6(&self, eth_src: MacAddr, pkt: &Ipv6Packet, sockets: &dyn SocketDemux) -> Vec<Vec<u8>> {
        let pseudo = crate::checksum::ipv6_pseudo_header_sum(pkt.src, pkt.dst, 6, pkt.payload.len() as u32);
        let seg = match TcpSegment::parse(&pkt.payload, pseudo) {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "dropping malformed tcp segment");
                return Vec::new();
            }
        };
        let local = (crate::addr::IpAddr::V6(pkt.dst), seg.dst_port);
        let remote = (crate::addr::IpAddr::V6(pkt.src), seg.src_port);
        if sockets.tcp_has_acceptor(local, remote) {
            sockets.deliver_tcp(local, remote, seg);
            return Vec::new();
        }
        if seg.flags.rst() {
            return Vec::new();
        }
        let rst = build_rst_reply(&seg);
        let pseudo_reply = crate::checksum::ipv6_pseudo_header_sum(pkt.dst, pkt.src, 6, crate::wire::tcp::MIN_HEADER_LEN as u32);
        let ip_reply = Ipv6Packet {
            traffic_class: 0,
            flow_label: 0,
            hop_limit: self.config.ip6_default_hop,
            next_header: IpProtocol::Tcp,
            src: pkt.dst,
            dst: pkt.src,
            fragment: None,
            payload: rst.assemble(pseudo_reply),
        };
        self.emit_ip6(pkt.src, ip_reply.assemble())
    }

    // ---- outbound --------------------------------------------------------

    /// Assemble and frame a UDP datagram, fragmenting the IPv4 payload if
    /// it exceeds the configured MTU (§4.3 outbound). Frames that need
    /// neighbor resolution are queued inside the relevant cache; this
    /// returns whatever is ready to send right away (data frames on a
    /// cache hit, or a resolution-request frame on a cache miss).
    pub fn send_udp4(&self, local: Ipv4Addr, local_port: u16, remote: Ipv4Addr, remote_port: u16, payload: &[u8], now: Instant) -> Vec<Vec<u8>> {
        let pseudo = crate::checksum::ipv4_pseudo_header_sum(local, remote, IpProtocol::Udp.to_u8(), (UDP_HEADER_LEN + payload.len()) as u16);
        let dgram = UdpDatagram { src_port: local_port, dst_port: remote_port, payload: payload.to_vec() };
        let udp_bytes = dgram.assemble(pseudo);
        self.send_ip4(local, remote, IpProtocol::Udp, &udp_bytes, now)
    }

    fn send_ip4(&self, local: Ipv4Addr, remote: Ipv4Addr, protocol: IpProtocol, payload: &[u8], now: Instant) -> Vec<Vec<u8>> {
        let header_len = crate::wire::ipv4::MIN_HEADER_LEN;
        let max_chunk = ((self.config.mtu - header_len) / 8) * 8;
        if payload.len() + header_len <= self.config.mtu || max_chunk == 0 {
            let pkt = Ipv4Packet {
                dscp: 0,
                ecn: 0,
                total_length: 0,
                identification: self.next_ip4_ident(),
                flags_offset: FlagsAndOffset::new(),
                ttl: self.config.ip4_default_ttl,
                protocol,
                src: local,
                dst: remote,
                options: Vec::new(),
                payload: payload.to_vec(),
            };
            return self.emit_ip4(remote, pkt.assemble());
        }
        let ident = self.next_ip4_ident();
        let mut out = Vec::new();
        let mut offset = 0usize;
        while offset < payload.len() {
            let end = (offset + max_chunk).min(payload.len());
            let more = end < payload.len();
            let pkt = Ipv4Packet {
                dscp: 0,
                ecn: 0,
                total_length: 0,
                identification: ident,
                flags_offset: FlagsAndOffset::new().with_offset((offset / 8) as u16).with_mf(more),
                ttl: self.config.ip4_default_ttl,
                protocol,
                src: local,
                dst: remote,
                options: Vec::new(),
                payload: payload[offset..end].to_vec(),
            };
            out.extend(self.emit_ip4(remote, pkt.assemble()));
            offset = end;
        }
        out
    }

    fn emit_ip4(&self, dst: Ipv4Addr, ip_packet: Vec<u8>) -> Vec<Vec<u8>> {
        if dst.is_limited_broadcast() || self.is_broadcast_v4(dst) {
            return vec![EthernetFrame { dst: MacAddr::BROADCAST, src: self.mac, ethertype: EtherType::Ipv4, payload: ip_packet }.assemble()];
        }
        match self.arp_cache.resolve(dst, ip_packet, Instant::now()) {
            CacheAction::FlushPending { link_addr, frames } => frames
                .into_iter()
                .map(|p| EthernetFrame { dst: link_addr, src: self.mac, ethertype: EtherType::Ipv4, payload: p }.assemble())
                .collect(),
            CacheAction::EmitResolutionRequest { target } => {
                let Some(src) = self.select_source_v4(target) else {
                    warn!(%target, "no route for arp resolution, dropping");
                    return Vec::new();
                };
                let req = ArpMessage::request(self.mac, src, target);
                vec![EthernetFrame { dst: MacAddr::BROADCAST, src: self.mac, ethertype: EtherType::Arp, payload: req.assemble().to_vec() }.assemble()]
            }
            CacheAction::None => Vec::new(),
        }
    }

    fn emit_ip6(&self, dst: Ipv6Addr, ip_packet: Vec<u8>) -> Vec<Vec<u8>> {
        if dst.is_multicast() {
            return vec![EthernetFrame { dst: MacAddr::for_ipv6_multicast(dst), src: self.mac, ethertype: EtherType::Ipv6, payload: ip_packet }.assemble()];
        }
        match self.nd_cache.resolve(dst, ip_packet, Instant::now()) {
            CacheAction::FlushPending { link_addr, frames } => frames
                .into_iter()
                .map(|p| EthernetFrame { dst: link_addr, src: self.mac, ethertype: EtherType::Ipv6, payload: p }.assemble())
                .collect(),
            CacheAction::EmitResolutionRequest { target } => {
                let Some(src) = self.select_source_v6(target) else {
                    warn!(%target, "no route for neighbor solicitation, dropping");
                    return Vec::new();
                };
                let ns = Icmpv6Message::NeighborSolicitation { target, options: vec![NdOption::SourceLinkLayerAddress(self.mac)] };
                let solicited_node = target.solicited_node_multicast();
                let ip_pkt = Ipv6Packet {
                    traffic_class: 0,
                    flow_label: 0,
                    hop_limit: 255,
                    next_header: IpProtocol::Icmp,
                    src,
                    dst: solicited_node,
                    fragment: None,
                    payload: ns.assemble(src, solicited_node),
                };
                vec![EthernetFrame {
                    dst: MacAddr::for_ipv6_multicast(solicited_node),
                    src: self.mac,
                    ethertype: EtherType::Ipv6,
                    payload: ip_pkt.assemble(),
                }
                .assemble()]
            }
            CacheAction::None => Vec::new(),
        }
    }

    pub fn send_udp6(&self, local: Ipv6Addr, local_port: u16, remote: Ipv6Addr, remote_port: u16, payload: &[u8]) -> Vec<Vec<u8>> {
        let pseudo = crate::checksum::ipv6_pseudo_header_sum(local, remote, 17, (UDP_HEADER_LEN + payload.len()) as u32);
        let dgram = UdpDatagram { src_port: local_port, dst_port: remote_port, payload: payload.to_vec() };
        let udp_bytes = dgram.assemble(pseudo);
        let ip_pkt = Ipv6Packet {
            traffic_class: 0,
            flow_label: self.next_ip6_flow_id() & 0xfffff,
            hop_limit: self.config.ip6_default_hop,
            next_header: IpProtocol::Udp,
            src: local,
            dst: remote,
            fragment: None,
            payload: udp_bytes,
        };
        self.emit_ip6(remote, ip_pkt.assemble())
    }

    /// Frame an already-assembled TCP/IPv4 payload (used by the TCP engine,
    /// which owns segment construction but not neighbor resolution).
    pub fn send_tcp4(&self, local: Ipv4Addr, remote: Ipv4Addr, tcp_bytes: &[u8], now: Instant) -> Vec<Vec<u8>> {
        self.send_ip4(local, remote, IpProtocol::Tcp, tcp_bytes, now)
    }

    pub fn send_tcp6(&self, local: Ipv6Addr, remote: Ipv6Addr, tcp_bytes: &[u8]) -> Vec<Vec<u8>> {
        let ip_pkt = Ipv6Packet {
            traffic_class: 0,
            flow_label: 0,
            hop_limit: self.config.ip6_default_hop,
            next_header: IpProtocol::Tcp,
            src: local,
            dst: remote,
            fragment: None,
            payload: tcp_bytes.to_vec(),
        };
        self.emit_ip6(remote, ip_pkt.assemble())
    }

    pub fn evict_sweep(&self, now: Instant) {
        self.arp_cache.evict_sweep(now);
        self.nd_cache.evict_sweep(now);
        self.reassembly4.evict_sweep(now);
        self.reassembly6.evict_sweep(now);
        self.dad_sweep(now);
    }

    /// Resolve outstanding DAD probes (§4.2): drop any ND-origin address an
    /// NA claimed during its probe window, and stop tracking ones that
    /// survived it.
    fn dad_sweep(&self, now: Instant) {
        let mut hosts = self.hosts6.lock().unwrap();
        hosts.retain(|h| {
            if h.origin != Origin::Nd {
                return true;
            }
            match self.dad.poll(h.address, now) {
                DadOutcome::Rejected => {
                    warn!(address = %h.address, "slaac candidate rejected by dad");
                    self.dad.finish(h.address);
                    false
                }
                DadOutcome::Accepted => {
                    self.dad.finish(h.address);
                    true
                }
                DadOutcome::StillProbing => true,
            }
        });
    }
}

fn directed_broadcast(host: &Host4) -> Ipv4Addr {
    Ipv4Addr::from_u32(host.network.addr.to_u32() | !host.network.mask.to_bits())
}

fn icmp_dest_unreachable_port(pkt: &Ipv6Packet) -> Icmpv6Message {
    let mut original = pkt.payload.clone();
    original.truncate(8);
    Icmpv6Message::DestinationUnreachable { code: 4, original }
}

/// §4.5 RST-generation rule for a segment with no matching socket.
fn build_rst_reply(seg: &TcpSegment) -> TcpSegment {
    let data_len = seg.payload.len() as u32;
    let (seq, ack) = if seg.flags.ack() {
        (seg.ack, 0)
    } else {
        (0, seg.seq.wrapping_add(data_len).wrapping_add(seg.flags.syn() as u32).wrapping_add(seg.flags.fin() as u32))
    };
    TcpSegment {
        src_port: seg.dst_port,
        dst_port: seg.src_port,
        seq,
        ack,
        flags: TcpFlags::new().with_rst(true).with_ack(!seg.flags.ack()),
        window: 0,
        urgent_pointer: 0,
        options: Vec::new(),
        payload: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{Mask4, Network4};

    struct NoSockets;
    impl SocketDemux for NoSockets {
        fn udp_has_listener(&self, _local: (crate::addr::IpAddr, u16)) -> bool {
            false
        }
        fn deliver_udp(&self, _local: (crate::addr::IpAddr, u16), _remote: (crate::addr::IpAddr, u16), _payload: Vec<u8>) {}
        fn tcp_has_acceptor(&self, _local: (crate::addr::IpAddr, u16), _remote: (crate::addr::IpAddr, u16)) -> bool {
            false
        }
        fn deliver_tcp(&self, _local: (crate::addr::IpAddr, u16), _remote: (crate::addr::IpAddr, u16), _segment: TcpSegment) {}
    }

    fn handler_with_host(mac: MacAddr, our_ip: Ipv4Addr) -> PacketHandler {
        let h = PacketHandler::new(mac, StackConfig::default());
        let net = Network4::new(our_ip, Mask4::from_prefix_len(24).unwrap());
        h.hosts4.lock().unwrap().push(Host4::new(our_ip, net, None, crate::addr::Origin::Static, None).unwrap());
        h
    }

    #[test]
    fn ipv4_echo_request_produces_echo_reply() {
        let our_mac = MacAddr::new([2, 0, 0, 0, 0, 1]);
        let peer_mac = MacAddr::new([2, 0, 0, 0, 0, 2]);
        let our_ip = Ipv4Addr::new([192, 168, 9, 7]);
        let peer_ip = Ipv4Addr::new([192, 168, 9, 102]);
        let handler = handler_with_host(our_mac, our_ip);

        let echo = Icmpv4Message::EchoRequest { identifier: 0x1234, sequence: 1, data: b"abcd".to_vec() };
        let ip_pkt = Ipv4Packet {
            dscp: 0,
            ecn: 0,
            total_length: 0,
            identification: 1,
            flags_offset: FlagsAndOffset::new(),
            ttl: 64,
            protocol: IpProtocol::Icmp,
            src: peer_ip,
            dst: our_ip,
            options: Vec::new(),
            payload: echo.assemble(),
        };
        let frame = EthernetFrame { dst: our_mac, src: peer_mac, ethertype: EtherType::Ipv4, payload: ip_pkt.assemble() }.assemble();

        let sockets = NoSockets;
        let out = handler.receive(&frame, Instant::now(), &sockets);
        assert_eq!(out.len(), 1);
        let reply_eth = EthernetFrame::parse(&out[0]).unwrap();
        assert_eq!(reply_eth.dst, peer_mac);
        assert_eq!(reply_eth.src, our_mac);
        let reply_ip = Ipv4Packet::parse(&reply_eth.payload).unwrap();
        assert_eq!(reply_ip.src, our_ip);
        assert_eq!(reply_ip.dst, peer_ip);
        let reply_icmp = Icmpv4Message::parse(&reply_ip.payload).unwrap();
        assert_eq!(reply_icmp, Icmpv4Message::EchoReply { identifier: 0x1234, sequence: 1, data: b"abcd".to_vec() });
    }

    #[test]
    fn tcp_syn_to_closed_port_elicits_rst_ack() {
        let our_mac = MacAddr::new([2, 0, 0, 0, 0, 1]);
        let peer_mac = MacAddr::new([2, 0, 0, 0, 0, 2]);
        let our_ip = Ipv4Addr::new([192, 168, 9, 7]);
        let peer_ip = Ipv4Addr::new([192, 168, 9, 102]);
        let handler = handler_with_host(our_mac, our_ip);

        let syn = TcpSegment {
            src_port: 4000,
            dst_port: 80,
            seq: 1000,
            ack: 0,
            flags: TcpFlags::new().with_syn(true),
            window: 65535,
            urgent_pointer: 0,
            options: Vec::new(),
            payload: Vec::new(),
        };
        let pseudo = crate::checksum::ipv4_pseudo_header_sum(peer_ip, our_ip, IpProtocol::Tcp.to_u8(), crate::wire::tcp::MIN_HEADER_LEN as u16);
        let ip_pkt = Ipv4Packet {
            dscp: 0,
            ecn: 0,
            total_length: 0,
            identification: 1,
            flags_offset: FlagsAndOffset::new(),
            ttl: 64,
            protocol: IpProtocol::Tcp,
            src: peer_ip,
            dst: our_ip,
            options: Vec::new(),
            payload: syn.assemble(pseudo),
        };
        let frame = EthernetFrame { dst: our_mac, src: peer_mac, ethertype: EtherType::Ipv4, payload: ip_pkt.assemble() }.assemble();

        let sockets = NoSockets;
        let out = handler.receive(&frame, Instant::now(), &sockets);
        assert_eq!(out.len(), 1);
        let reply_eth = EthernetFrame::parse(&out[0]).unwrap();
        let reply_ip = Ipv4Packet::parse(&reply_eth.payload).unwrap();
        let pseudo_reply =
            crate::checksum::ipv4_pseudo_header_sum(our_ip, peer_ip, IpProtocol::Tcp.to_u8(), crate::wire::tcp::MIN_HEADER_LEN as u16);
        let reply_seg = TcpSegment::parse(&reply_ip.payload, pseudo_reply).unwrap();
        assert!(reply_seg.flags.rst());
        assert!(reply_seg.flags.ack());
        assert_eq!(reply_seg.seq, 0);
        assert_eq!(reply_seg.ack, 1001);
    }

    #[test]
    fn source_selection_prefers_matching_network() {
        let our_mac = MacAddr::new([2, 0, 0, 0, 0, 1]);
        let handler = handler_with_host(our_mac, Ipv4Addr::new([192, 168, 9, 7]));
        let src = handler.select_source_v4(Ipv4Addr::new([192, 168, 9, 200]));
        assert_eq!(src, Some(Ipv4Addr::new([192, 168, 9, 7])));
    }

    #[test]
    fn source_selection_with_no_route_returns_none() {
        let our_mac = MacAddr::new([2, 0, 0, 0, 0, 1]);
        let handler = handler_with_host(our_mac, Ipv4Addr::new([192, 168, 9, 7]));
        assert_eq!(handler.select_source_v4(Ipv4Addr::new([10, 0, 0, 1])), None);
    }
}

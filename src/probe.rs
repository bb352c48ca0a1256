use anyhow::{Context, Result};
use pnet::packet::ethernet::{EtherType, EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, MutableIpv4Packet};
use pnet::packet::udp::{self, MutableUdpPacket};
use pnet::util::MacAddr;
use std::net::Ipv4Addr;
use tracing::debug;
use trust_dns_proto::op::{Message, MessageType, OpCode, Query};
use trust_dns_proto::rr::{Name, RecordType};

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

const IPV4_IDENTIFICATION: u16 = 1;
const IPV4_TTL: u8 = 64;

/// Field values of the injected DNS query frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub ethertype: EtherType,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub recursion_desired: bool,
    pub qname: String,
    pub qtype: RecordType,
}

impl Default for ProbeSpec {
    fn default() -> Self {
        Self {
            src_mac: MacAddr::new(0xde, 0xad, 0xbe, 0xef, 0x02, 0x02),
            dst_mac: MacAddr::new(0xde, 0xad, 0xbe, 0xef, 0x02, 0x03),
            ethertype: EtherTypes::Ipv4,
            src_ip: Ipv4Addr::new(1, 1, 1, 1),
            dst_ip: Ipv4Addr::new(1, 1, 1, 2),
            src_port: 53,
            dst_port: 60185,
            recursion_desired: true,
            qname: "www.thepacketgeek.com".to_string(),
            qtype: RecordType::A,
        }
    }
}

impl ProbeSpec {
    /// DNS layer on its own: id 0, standard query, one question of class IN
    pub fn dns_message(&self) -> Result<Message> {
        let fqdn = if self.qname.ends_with('.') {
            self.qname.clone()
        } else {
            format!("{}.", self.qname)
        };
        let name = Name::from_ascii(&fqdn)
            .with_context(|| format!("Invalid DNS query name: {}", self.qname))?;

        let mut message = Message::new();
        message
            .set_id(0)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(self.recursion_desired);
        message.add_query(Query::query(name, self.qtype));

        Ok(message)
    }

    /// Serialize the full Ethernet/IPv4/UDP/DNS frame.
    ///
    /// Lengths and checksums are filled in here and every other field is taken
    /// as is, so repeated calls return identical bytes.
    pub fn build_frame(&self) -> Result<Vec<u8>> {
        let dns = self
            .dns_message()?
            .to_vec()
            .context("Failed to encode DNS message")?;

        let udp_len = UDP_HEADER_LEN + dns.len();
        let ip_len = IPV4_HEADER_LEN + udp_len;
        let mut frame = vec![0u8; ETHERNET_HEADER_LEN + ip_len];

        // Innermost first: the UDP checksum must be final before the IPv4
        // header is laid over the same buffer.
        self.write_udp_header(&mut frame[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..], &dns)?;
        self.write_ip_header(&mut frame[ETHERNET_HEADER_LEN..])?;
        self.write_ethernet_header(&mut frame)?;

        debug!(
            "Built frame: {} bytes ({} byte DNS payload) for {}",
            frame.len(),
            dns.len(),
            self.qname
        );

        Ok(frame)
    }

    fn write_ethernet_header(&self, buf: &mut [u8]) -> Result<()> {
        let mut ethernet =
            MutableEthernetPacket::new(buf).context("Frame buffer too small for Ethernet header")?;
        ethernet.set_destination(self.dst_mac);
        ethernet.set_source(self.src_mac);
        ethernet.set_ethertype(self.ethertype);
        Ok(())
    }

    fn write_ip_header(&self, buf: &mut [u8]) -> Result<()> {
        let total_length =
            u16::try_from(buf.len()).context("IPv4 datagram exceeds maximum length")?;

        let mut ip = MutableIpv4Packet::new(buf).context("Frame buffer too small for IPv4 header")?;
        ip.set_version(4);
        ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
        ip.set_dscp(0);
        ip.set_ecn(0);
        ip.set_total_length(total_length);
        ip.set_identification(IPV4_IDENTIFICATION);
        ip.set_flags(0);
        ip.set_fragment_offset(0);
        ip.set_ttl(IPV4_TTL);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip.set_source(self.src_ip);
        ip.set_destination(self.dst_ip);

        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
        Ok(())
    }

    fn write_udp_header(&self, buf: &mut [u8], payload: &[u8]) -> Result<()> {
        let length = u16::try_from(buf.len()).context("UDP datagram exceeds maximum length")?;

        let mut udp = MutableUdpPacket::new(buf).context("Frame buffer too small for UDP header")?;
        udp.set_source(self.src_port);
        udp.set_destination(self.dst_port);
        udp.set_length(length);
        udp.set_payload(payload);

        let checksum = udp::ipv4_checksum(&udp.to_immutable(), &self.src_ip, &self.dst_ip);
        // A zero UDP checksum means "not computed" on the wire
        udp.set_checksum(if checksum == 0 { 0xffff } else { checksum });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::Packet;
    use pnet::packet::ethernet::EthernetPacket;
    use pnet::packet::ipv4::Ipv4Packet;
    use pnet::packet::udp::UdpPacket;

    fn layers(frame: &[u8]) -> (EthernetPacket<'_>, Vec<u8>, Vec<u8>) {
        let ethernet = EthernetPacket::new(frame).unwrap();
        let ip = ethernet.payload().to_vec();
        let udp = Ipv4Packet::new(&ip).unwrap().payload().to_vec();
        (ethernet, ip, udp)
    }

    #[test]
    fn test_default_fields() {
        let spec = ProbeSpec::default();
        assert_eq!(spec.src_mac.to_string(), "de:ad:be:ef:02:02");
        assert_eq!(spec.dst_mac.to_string(), "de:ad:be:ef:02:03");
        assert_eq!(spec.ethertype.0, 0x0800);
        assert_eq!(spec.src_ip, Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(spec.dst_ip, Ipv4Addr::new(1, 1, 1, 2));
        assert_eq!(spec.src_port, 53);
        assert_eq!(spec.dst_port, 60185);
        assert!(spec.recursion_desired);
        assert_eq!(spec.qname, "www.thepacketgeek.com");
    }

    #[test]
    fn test_frame_layout() {
        let frame = ProbeSpec::default().build_frame().unwrap();

        // 12 byte DNS header + 23 byte qname + qtype/qclass
        let dns_len = 12 + 23 + 4;
        assert_eq!(frame.len(), ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + dns_len);

        assert_eq!(&frame[0..6], &[0xde, 0xad, 0xbe, 0xef, 0x02, 0x03]);
        assert_eq!(&frame[6..12], &[0xde, 0xad, 0xbe, 0xef, 0x02, 0x02]);
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
    }

    #[test]
    fn test_ip_header() {
        let frame = ProbeSpec::default().build_frame().unwrap();
        let (_, ip, _) = layers(&frame);
        let ip = Ipv4Packet::new(&ip).unwrap();

        assert_eq!(ip.get_version(), 4);
        assert_eq!(ip.get_header_length(), 5);
        assert_eq!(ip.get_ttl(), 64);
        assert_eq!(ip.get_identification(), 1);
        assert_eq!(ip.get_next_level_protocol(), IpNextHeaderProtocols::Udp);
        assert_eq!(ip.get_total_length() as usize, frame.len() - ETHERNET_HEADER_LEN);
        assert_eq!(ip.get_source(), Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(ip.get_destination(), Ipv4Addr::new(1, 1, 1, 2));
        assert_eq!(ip.get_checksum(), ipv4::checksum(&ip));
    }

    #[test]
    fn test_udp_header() {
        let spec = ProbeSpec::default();
        let frame = spec.build_frame().unwrap();
        let (_, _, udp) = layers(&frame);
        let udp = UdpPacket::new(&udp).unwrap();

        assert_eq!(udp.get_source(), 53);
        assert_eq!(udp.get_destination(), 60185);
        assert_eq!(
            udp.get_length() as usize,
            frame.len() - ETHERNET_HEADER_LEN - IPV4_HEADER_LEN
        );
        assert_eq!(
            udp.get_checksum(),
            udp::ipv4_checksum(&udp, &spec.src_ip, &spec.dst_ip)
        );
    }

    #[test]
    fn test_dns_payload() {
        let frame = ProbeSpec::default().build_frame().unwrap();
        let (_, _, udp) = layers(&frame);
        let udp = UdpPacket::new(&udp).unwrap();

        let message = Message::from_vec(udp.payload()).unwrap();
        assert_eq!(message.header().id(), 0);
        assert_eq!(message.header().message_type(), MessageType::Query);
        assert!(message.header().recursion_desired());
        assert_eq!(message.queries().len(), 1);
        assert_eq!(message.answers().len(), 0);

        let query = &message.queries()[0];
        assert_eq!(query.name().to_ascii(), "www.thepacketgeek.com.");
        assert_eq!(query.query_type(), RecordType::A);
    }

    #[test]
    fn test_build_is_deterministic() {
        let spec = ProbeSpec::default();
        assert_eq!(spec.build_frame().unwrap(), spec.build_frame().unwrap());
    }

    #[test]
    fn test_invalid_qname() {
        let spec = ProbeSpec {
            qname: format!("{}.com", "a".repeat(70)),
            ..ProbeSpec::default()
        };
        assert!(spec.build_frame().is_err());
    }
}

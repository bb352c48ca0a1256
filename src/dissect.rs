use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Packet};
use pnet::packet::udp::{self, UdpPacket};
use pnet::util::MacAddr;
use std::net::Ipv4Addr;
use tracing::debug;
use trust_dns_proto::op::{Message, MessageType};
use trust_dns_proto::rr::RecordType;

use crate::probe::ProbeSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub record_type: RecordType,
}

/// Header fields recovered from a captured Ethernet/IPv4/UDP/DNS frame
#[derive(Debug, Clone)]
pub struct ProbeSummary {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub ethertype: EtherType,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub is_query: bool,
    pub recursion_desired: bool,
    pub questions: Vec<Question>,
    pub ipv4_checksum_ok: bool,
    pub udp_checksum_ok: bool,
}

/// Parse a frame down to its DNS message.
///
/// Returns `None` for anything that is not IPv4/UDP carrying a DNS message, so
/// unrelated traffic on a shared interface is skipped rather than reported.
pub fn dissect(frame: &[u8]) -> Option<ProbeSummary> {
    let ethernet = EthernetPacket::new(frame)?;

    // Only process IPv4 packets
    if ethernet.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }

    let ip = Ipv4Packet::new(ethernet.payload())?;

    // Only process UDP packets
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return None;
    }

    let udp = UdpPacket::new(ip.payload())?;

    let message = match Message::from_vec(udp.payload()) {
        Ok(message) => message,
        Err(e) => {
            debug!(
                "UDP {}:{} -> {}:{} is not DNS: {}",
                ip.get_source(),
                udp.get_source(),
                ip.get_destination(),
                udp.get_destination(),
                e
            );
            return None;
        }
    };

    let questions = message
        .queries()
        .iter()
        .map(|query| Question {
            name: query.name().to_ascii().trim_end_matches('.').to_string(),
            record_type: query.query_type(),
        })
        .collect();

    Some(ProbeSummary {
        src_mac: ethernet.get_source(),
        dst_mac: ethernet.get_destination(),
        ethertype: ethernet.get_ethertype(),
        src_ip: ip.get_source(),
        dst_ip: ip.get_destination(),
        src_port: udp.get_source(),
        dst_port: udp.get_destination(),
        is_query: message.header().message_type() == MessageType::Query,
        recursion_desired: message.header().recursion_desired(),
        questions,
        ipv4_checksum_ok: ip.get_checksum() == ipv4::checksum(&ip),
        udp_checksum_ok: udp_checksum_ok(
            udp.get_checksum(),
            udp::ipv4_checksum(&udp, &ip.get_source(), &ip.get_destination()),
        ),
    })
}

fn udp_checksum_ok(stored: u16, computed: u16) -> bool {
    // 0 = sender skipped the checksum, 0xffff is how a computed 0 is sent
    stored == 0 || stored == computed || (computed == 0 && stored == 0xffff)
}

impl ProbeSummary {
    /// True when every injected field matches and the message carries exactly
    /// the one expected question.
    pub fn matches(&self, spec: &ProbeSpec) -> bool {
        self.src_mac == spec.src_mac
            && self.dst_mac == spec.dst_mac
            && self.ethertype == spec.ethertype
            && self.src_ip == spec.src_ip
            && self.dst_ip == spec.dst_ip
            && self.src_port == spec.src_port
            && self.dst_port == spec.dst_port
            && self.is_query
            && self.recursion_desired == spec.recursion_desired
            && match self.questions.as_slice() {
                [question] => {
                    question.record_type == spec.qtype
                        && question
                            .name
                            .eq_ignore_ascii_case(spec.qname.trim_end_matches('.'))
                }
                _ => false,
            }
    }
}

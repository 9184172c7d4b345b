use crate::agreement::ConnectionAgreement;
use crate::packet_header::PacketHeader;
use anyhow::bail;
use std::time::Duration;

/// Configuration of a [`crate::terminal::ConnectionTerminal`].
///
/// All durations that feed protocol state machines are in microseconds
/// ("mics") relative to the terminal's epoch, matching the granularity the
/// wire format and the RTT estimator work in.
pub struct TransportConfig {
    /// This is the UDP payload size the protocol assumes end to end. The
    ///  protocol never sends anything bigger, relying on the application to
    ///  pick a value all routes support (IP fragmentation is not an option
    ///  for a retransmitting protocol).
    ///
    /// With full Ethernet frames and no optional IP headers the ceiling is
    ///  `1500 - 20 - 8 = 1472` for IPV4; the default leaves headroom for
    ///  tunnels and surprising network hardware.
    pub max_packet_size: usize,

    /// Delay between the first pending acknowledgment for a connection and
    ///  the flush of its ack batch. Bigger values coalesce more acks per
    ///  packet at the cost of added RTT on the sender side.
    pub ack_delay_mics: u64,

    /// Grace period between a connection reaching `Closed` and its disposal.
    pub disposal_grace_mics: u64,

    /// How long a fully acknowledged send transmission is retained to answer
    ///  duplicate or late acks before it is physically removed.
    pub acked_retention_mics: u64,

    /// How long a completed receive transmission is retained, for the same
    ///  reason.
    pub disposed_retention_mics: u64,

    /// How long an incomplete receive transmission may go without a new gene
    ///  before it is swept, freeing its slot. A sender that is still alive
    ///  resends every RTO, so anything quiet this long is abandoned.
    pub receive_stall_timeout_mics: u64,

    /// Upper bound for the out-of-scope handshake exchange.
    pub handshake_timeout: Duration,

    /// Capability ceilings offered to peers; the effective agreement per
    ///  connection is the accept-all merge with what the peer offers.
    pub default_agreement: ConnectionAgreement,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_packet_size: 1432,
            ack_delay_mics: 2_000,
            disposal_grace_mics: 5_000_000,
            acked_retention_mics: 2_000_000,
            disposed_retention_mics: 2_000_000,
            receive_stall_timeout_mics: 10_000_000,
            handshake_timeout: Duration::from_secs(2),
            default_agreement: ConnectionAgreement::default(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size < PacketHeader::SERIALIZED_LEN + 64 {
            bail!("max_packet_size is too small to fit a header and a frame");
        }
        if self.max_packet_size > 65_507 {
            bail!("max_packet_size exceeds what UDP can carry");
        }
        if self.ack_delay_mics == 0 {
            bail!("ack_delay_mics must be non-zero");
        }
        Ok(())
    }
}

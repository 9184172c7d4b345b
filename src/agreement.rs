use crate::frame::GENE_PAYLOAD_LEN;

/// The negotiated capability ceiling both peers abide by for one connection.
///
/// Each side starts from its configured defaults; the values carried in the
/// handshake are merged with [`ConnectionAgreement::accept_all`], which takes
/// the most permissive value per field so neither side ends up below what it
/// offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionAgreement {
    /// Maximum number of concurrent transmissions per direction.
    pub max_transmissions: u32,
    /// Maximum size of a block-mode message in bytes.
    pub max_block_size: u32,
    /// Maximum total length of a stream-mode transfer in bytes.
    /// `0` disables streams, a negative value means unlimited.
    pub max_stream_length: i64,
    /// Size of the stream send/receive window in bytes.
    pub stream_buffer_size: u32,
    /// Whether the peer may open a paired counterpart connection.
    pub allow_bidirectional: bool,
    /// How long an idle connection is retained before being closed.
    pub minimum_retention_mics: u64,
}

impl Default for ConnectionAgreement {
    fn default() -> Self {
        ConnectionAgreement {
            max_transmissions: 256,
            max_block_size: 4 * 1024 * 1024,
            max_stream_length: 1024 * 1024 * 1024,
            stream_buffer_size: 256 * 1024,
            allow_bidirectional: true,
            minimum_retention_mics: 10_000_000,
        }
    }
}

impl ConnectionAgreement {
    /// Number of genes a maximum-size block splits into.
    pub fn max_block_genes(&self) -> u32 {
        (self.max_block_size as u64).div_ceil(GENE_PAYLOAD_LEN as u64) as u32
    }

    /// Number of genes in the stream window, at least one.
    pub fn stream_buffer_genes(&self) -> u32 {
        ((self.stream_buffer_size as u64).div_ceil(GENE_PAYLOAD_LEN as u64) as u32).max(1)
    }

    pub fn stream_enabled(&self) -> bool {
        self.max_stream_length != 0
    }

    /// Checks whether a stream of `requested` bytes is within this agreement.
    /// A negative `requested` length asks for an unlimited stream.
    pub fn accepts_stream_length(&self, requested: i64) -> bool {
        if self.max_stream_length < 0 {
            self.stream_enabled()
        } else if requested < 0 {
            false
        } else {
            requested <= self.max_stream_length
        }
    }

    /// Merges two agreements by taking the most permissive value per field.
    ///
    /// The unlimited sentinel (negative `max_stream_length`) dominates any
    /// finite limit. The merge is associative and never below either input.
    pub fn accept_all(&self, other: &ConnectionAgreement) -> ConnectionAgreement {
        let max_stream_length = if self.max_stream_length < 0 || other.max_stream_length < 0 {
            -1
        } else {
            self.max_stream_length.max(other.max_stream_length)
        };

        ConnectionAgreement {
            max_transmissions: self.max_transmissions.max(other.max_transmissions),
            max_block_size: self.max_block_size.max(other.max_block_size),
            max_stream_length,
            stream_buffer_size: self.stream_buffer_size.max(other.stream_buffer_size),
            allow_bidirectional: self.allow_bidirectional || other.allow_bidirectional,
            minimum_retention_mics: self
                .minimum_retention_mics
                .max(other.minimum_retention_mics),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn agreement(
        max_transmissions: u32,
        max_block_size: u32,
        max_stream_length: i64,
        stream_buffer_size: u32,
        allow_bidirectional: bool,
        minimum_retention_mics: u64,
    ) -> ConnectionAgreement {
        ConnectionAgreement {
            max_transmissions,
            max_block_size,
            max_stream_length,
            stream_buffer_size,
            allow_bidirectional,
            minimum_retention_mics,
        }
    }

    #[rstest]
    #[case::identical(agreement(1, 2, 3, 4, false, 5), agreement(1, 2, 3, 4, false, 5), agreement(1, 2, 3, 4, false, 5))]
    #[case::pairwise_max(agreement(1, 20, 3, 40, false, 5), agreement(10, 2, 30, 4, true, 50), agreement(10, 20, 30, 40, true, 50))]
    #[case::unlimited_dominates(agreement(1, 2, -1, 4, false, 5), agreement(10, 20, 1000, 40, false, 50), agreement(10, 20, -1, 40, false, 50))]
    #[case::disabled_vs_finite(agreement(1, 2, 0, 4, false, 5), agreement(1, 2, 7, 4, false, 5), agreement(1, 2, 7, 4, false, 5))]
    fn test_accept_all(
        #[case] a: ConnectionAgreement,
        #[case] b: ConnectionAgreement,
        #[case] expected: ConnectionAgreement,
    ) {
        assert_eq!(a.accept_all(&b), expected);
        assert_eq!(b.accept_all(&a), expected);
    }

    #[test]
    fn test_accept_all_associative() {
        let a = agreement(1, 200, 0, 4, false, 500);
        let b = agreement(100, 2, -1, 400, true, 5);
        let c = agreement(10, 20, 30, 40, false, 50);

        assert_eq!(a.accept_all(&b.accept_all(&c)), a.accept_all(&b).accept_all(&c));
    }

    #[test]
    fn test_accept_all_monotone() {
        let a = agreement(3, 100, 50, 7, false, 9);
        let b = agreement(5, 80, 70, 3, true, 11);
        let merged = a.accept_all(&b);

        assert!(merged.max_transmissions >= a.max_transmissions);
        assert!(merged.max_transmissions >= b.max_transmissions);
        assert!(merged.max_block_size >= a.max_block_size);
        assert!(merged.max_block_size >= b.max_block_size);
        assert!(merged.max_stream_length >= a.max_stream_length);
        assert!(merged.max_stream_length >= b.max_stream_length);
        assert!(merged.stream_buffer_size >= a.stream_buffer_size);
        assert!(merged.stream_buffer_size >= b.stream_buffer_size);
        assert!(merged.minimum_retention_mics >= a.minimum_retention_mics);
        assert!(merged.minimum_retention_mics >= b.minimum_retention_mics);
    }

    #[rstest]
    #[case::within(1000, 500, true)]
    #[case::exact(1000, 1000, true)]
    #[case::above(1000, 1001, false)]
    #[case::disabled(0, 1, false)]
    #[case::unlimited(-1, i64::MAX, true)]
    #[case::unlimited_requested_finite_limit(1000, -1, false)]
    #[case::unlimited_requested_unlimited(-1, -1, true)]
    fn test_accepts_stream_length(#[case] limit: i64, #[case] requested: i64, #[case] expected: bool) {
        let a = ConnectionAgreement {
            max_stream_length: limit,
            ..Default::default()
        };
        assert_eq!(a.accepts_stream_length(requested), expected);
    }
}

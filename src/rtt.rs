/// Smoothed RTT / variance tracking per connection, classic TCP-style EWMA
/// (mean weight 7/8, variance weight 3/4). All values in microseconds.

pub const RTT_CLAMP_MIN_MICS: u64 = 5_000;
pub const RTT_CLAMP_MAX_MICS: u64 = 1_000_000;

/// Used until the first sample arrives (or a peer hint seeds the estimator).
pub const INITIAL_RTT_MICS: u64 = 200_000;

#[derive(Debug, Clone)]
pub struct RttStats {
    srtt_mics: u64,
    rttvar_mics: u64,
    has_sample: bool,
}

impl Default for RttStats {
    fn default() -> Self {
        RttStats {
            srtt_mics: INITIAL_RTT_MICS,
            rttvar_mics: INITIAL_RTT_MICS / 2,
            has_sample: false,
        }
    }
}

impl RttStats {
    pub fn srtt_mics(&self) -> u64 {
        self.srtt_mics
    }

    pub fn rttvar_mics(&self) -> u64 {
        self.rttvar_mics
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    /// Seed the estimator from a peer-provided hint. Only effective before
    ///  the first real sample.
    pub fn seed(&mut self, hint_mics: u64) {
        if !self.has_sample && hint_mics > 0 {
            self.srtt_mics = hint_mics.clamp(RTT_CLAMP_MIN_MICS, RTT_CLAMP_MAX_MICS);
            self.rttvar_mics = self.srtt_mics / 2;
        }
    }

    pub fn on_sample(&mut self, raw_mics: u64) {
        let sample = raw_mics.clamp(RTT_CLAMP_MIN_MICS, RTT_CLAMP_MAX_MICS);

        if !self.has_sample {
            self.srtt_mics = sample;
            self.rttvar_mics = sample / 2;
            self.has_sample = true;
            return;
        }

        let deviation = self.srtt_mics.abs_diff(sample);
        self.rttvar_mics = (3 * self.rttvar_mics + deviation) / 4;
        self.srtt_mics = (7 * self.srtt_mics + sample) / 8;
    }

    /// `srtt + srtt/4 + 4*rttvar + ackDelay` - the ack delay term accounts
    ///  for the peer's deliberate ack batching.
    pub fn retransmission_timeout_mics(&self, ack_delay_mics: u64) -> u64 {
        self.srtt_mics + self.srtt_mics / 4 + 4 * self.rttvar_mics + ack_delay_mics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, RTT_CLAMP_MIN_MICS)]
    #[case::below_min(4_999, RTT_CLAMP_MIN_MICS)]
    #[case::at_min(5_000, 5_000)]
    #[case::in_range(123_456, 123_456)]
    #[case::at_max(1_000_000, 1_000_000)]
    #[case::above_max(5_000_000, RTT_CLAMP_MAX_MICS)]
    #[case::huge(u64::MAX, RTT_CLAMP_MAX_MICS)]
    fn test_first_sample_clamped(#[case] raw: u64, #[case] expected: u64) {
        let mut rtt = RttStats::default();
        rtt.on_sample(raw);
        assert_eq!(rtt.srtt_mics(), expected);
        assert_eq!(rtt.rttvar_mics(), expected / 2);
        assert!(rtt.has_sample());
    }

    #[test]
    fn test_smoothing_weights() {
        let mut rtt = RttStats::default();
        rtt.on_sample(80_000);
        rtt.on_sample(160_000);

        // srtt = (7 * 80000 + 160000) / 8 = 90000
        assert_eq!(rtt.srtt_mics(), 90_000);
        // rttvar = (3 * 40000 + 80000) / 4 = 50000
        assert_eq!(rtt.rttvar_mics(), 50_000);
    }

    #[test]
    fn test_converges_to_stable_rtt() {
        let mut rtt = RttStats::default();
        for _ in 0..100 {
            rtt.on_sample(50_000);
        }
        assert_eq!(rtt.srtt_mics(), 50_000);
        assert_eq!(rtt.rttvar_mics(), 0);
    }

    #[test]
    fn test_retransmission_timeout() {
        let mut rtt = RttStats::default();
        rtt.on_sample(80_000);

        // 80000 + 20000 + 4*40000 + 2000
        assert_eq!(rtt.retransmission_timeout_mics(2_000), 262_000);
    }

    #[test]
    fn test_seed_only_before_first_sample() {
        let mut rtt = RttStats::default();
        rtt.seed(60_000);
        assert_eq!(rtt.srtt_mics(), 60_000);
        assert!(!rtt.has_sample());

        rtt.on_sample(100_000);
        rtt.seed(10_000);
        assert_eq!(rtt.srtt_mics(), 100_000);
    }

    #[test]
    fn test_seed_is_clamped() {
        let mut rtt = RttStats::default();
        rtt.seed(2);
        assert_eq!(rtt.srtt_mics(), RTT_CLAMP_MIN_MICS);
    }
}

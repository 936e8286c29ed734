//! Hop Metric — coarse per-hop response time estimate
//!
//! PakBus describes the cost of a link with a 3-bit code. Each code names a
//! response time bucket; route computation adds up the decoded bucket values
//! to rank paths.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound (inclusive) of each encodable bucket in milliseconds.
const BUCKET_LIMITS: [u32; 7] = [200, 1_000, 5_000, 10_000, 20_000, 60_000, 300_000];

/// Response time reported for the top bucket (30 minutes).
pub const MAX_RESPONSE_TIME_MSEC: u32 = 1_800_000;

/// A 3-bit hop metric code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct HopMetric(u8);

impl HopMetric {
    /// Largest code value
    pub const MAX_CODE: u8 = 7;

    /// Encode a response time, rounding up to the smallest bucket that holds it.
    ///
    /// Anything above 300 seconds saturates at code 7.
    pub fn from_response_time(response_time_msec: u32) -> Self {
        let code = BUCKET_LIMITS
            .iter()
            .position(|&limit| response_time_msec <= limit)
            .unwrap_or(BUCKET_LIMITS.len());
        HopMetric(code as u8)
    }

    /// Wrap a raw code; only the low three bits are significant.
    pub fn from_code(code: u8) -> Self {
        HopMetric(code & Self::MAX_CODE)
    }

    /// Raw 3-bit code
    pub fn code(self) -> u8 {
        self.0
    }

    /// Decode to milliseconds. Code 7 decodes to 30 minutes, not 300 seconds.
    pub fn response_time_msec(self) -> u32 {
        BUCKET_LIMITS
            .get(self.0 as usize)
            .copied()
            .unwrap_or(MAX_RESPONSE_TIME_MSEC)
    }
}

impl fmt::Display for HopMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}ms)", self.0, self.response_time_msec())
    }
}

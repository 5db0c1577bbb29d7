//! Bus error and traffic counters

use crate::BusError;

#[cfg(feature = "envelope")]
use serde::{Deserialize, Serialize};

/// Counters kept by the retry layer and the interrupt path
///
/// Every transaction attempt lands in exactly one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "envelope", derive(Serialize, Deserialize))]
pub struct ErrStats {
    /// Successful transactions
    pub round_trips: u32,
    /// Input from the bus that was not a valid interrupt frame
    pub spurious_packets: u32,
    /// Attempts where the node never answered
    pub rx_timeouts: u32,
    /// Attempts where the request could not be written
    pub tx_timeouts: u32,
    /// Attempts with a bad response CRC
    pub crc_errs: u32,
    /// Attempts with a truncated or malformed frame
    pub framing_errs: u32,
    /// Attempts with an unexpected response header
    pub format_errs: u32,
    /// Attempts the node rejected
    pub naks: u32,
}

impl ErrStats {
    /// Count the outcome of one attempt
    pub fn record(&mut self, res: Result<(), BusError>) {
        let ctr = match res {
            Ok(()) => &mut self.round_trips,
            Err(BusError::RxTimeout) => &mut self.rx_timeouts,
            Err(BusError::TxTimeout) => &mut self.tx_timeouts,
            Err(BusError::Crc) => &mut self.crc_errs,
            Err(BusError::Framing) => &mut self.framing_errs,
            Err(BusError::Format) => &mut self.format_errs,
            Err(BusError::Nak) => &mut self.naks,
            // Rejected before anything reached the bus
            Err(BusError::InvalidParam) => return,
        };
        *ctr = ctr.wrapping_add(1);
    }

    /// Count a spurious bus input
    pub fn spurious(&mut self) {
        self.spurious_packets = self.spurious_packets.wrapping_add(1);
    }

    /// Return the current counters and zero them
    pub fn take(&mut self) -> Self {
        core::mem::take(self)
    }
}

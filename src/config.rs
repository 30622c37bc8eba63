use std::time::Duration;
use anyhow::bail;


#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// This is the maximum number of *packets* that may be in flight (sent but not acknowledged)
    ///  at any given time. Submissions beyond that are rejected with `WindowFull`.
    pub window_size: u32,

    /// The timer is restarted whenever the window base advances, so this is the time without
    ///  *any* ACK progress after which the whole outstanding window is sent again
    pub retransmission_timeout: Duration,

    /// Number of go-back retransmission rounds allowed without ACK progress. The timeout after
    ///  the last of them fails the session instead. `None` means retrying forever.
    pub max_retransmission_rounds: Option<u32>,

    pub max_payload_len: usize,
}

impl TransportConfig {
    pub fn new() -> TransportConfig {
        TransportConfig {
            window_size: 4,
            retransmission_timeout: Duration::from_millis(400),
            max_retransmission_rounds: None,
            max_payload_len: 64*1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_size == 0 {
            bail!("window size must be at least 1");
        }
        if self.retransmission_timeout.is_zero() {
            bail!("retransmission timeout must be positive");
        }
        if self.max_retransmission_rounds == Some(0) {
            bail!("a retransmission ceiling of 0 would fail every session on its first timeout - use None to retry forever");
        }
        if self.max_payload_len > u32::MAX as usize {
            bail!("max payload length {} does not fit the packet's length field", self.max_payload_len);
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}


/// Fault model of the simulated network. The three chances are checked in the order drop,
///  corrupt, delay, and the first one that applies decides the packet's fate.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub drop_chance: f64,
    pub corrupt_chance: f64,
    pub delay_chance: f64,
    pub delay_amount: Duration,

    /// Packets with a bigger payload are rejected as malformed
    pub max_payload_len: usize,
}

impl NetworkConfig {
    /// a network that does not inject any faults
    pub fn new() -> NetworkConfig {
        NetworkConfig {
            drop_chance: 0.0,
            corrupt_chance: 0.0,
            delay_chance: 0.0,
            delay_amount: Duration::from_secs(1),
            max_payload_len: 64*1024,
        }
    }

    pub fn lossy() -> NetworkConfig {
        NetworkConfig {
            drop_chance: 0.1,
            corrupt_chance: 0.1,
            delay_chance: 0.1,
            ..Self::new()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, chance) in [("drop", self.drop_chance), ("corrupt", self.corrupt_chance), ("delay", self.delay_chance)] {
            if !(0.0..=1.0).contains(&chance) {
                bail!("{} chance must be between 0.0 and 1.0, was {}", name, chance);
            }
        }
        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::new()
    }
}

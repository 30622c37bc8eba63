use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::config::NetworkConfig;
use crate::packet::Packet;
use crate::util::random::Random;


/// Something that packets can be handed to for processing - the inbound side of a layer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketSink: Send + Sync + 'static {
    async fn receive(&self, packet: Packet);
}

/// The transport layer's view of the network below it: fire-and-forget, with no feedback on
///  whether a packet actually arrived.
///
/// An `Err` signals a malformed packet, i.e. a bug in the caller - it never signals a network
///  fault.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkSend: Send + Sync + 'static {
    /// Rejects packets that `send` would reject as malformed, without sending anything
    fn check_packet(&self, packet: &Packet) -> anyhow::Result<()>;

    async fn send(&self, packet: &Packet) -> anyhow::Result<()>;
}


#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct NetworkStats {
    pub sent: u64,
    pub dropped: u64,
    pub corrupted: u64,
    pub delayed: u64,
    pub delivered: u64,
}

#[derive(Default)]
struct NetworkCounters {
    sent: AtomicU64,
    dropped: AtomicU64,
    corrupted: AtomicU64,
    delayed: AtomicU64,
    delivered: AtomicU64,
}

enum Fate {
    Drop,
    Corrupt,
    Delay,
    Deliver,
}


/// A deliberately unreliable channel between two transport layers. Each packet is either
///  dropped, corrupted, delayed or delivered as-is - never more than one of these.
///
/// The network layer holds no session state. References to the layer above and to the peer are
///  weak, so packets still in flight when a peer is torn down just disappear.
pub struct NetworkLayer {
    config: Arc<NetworkConfig>,
    random: Arc<dyn Random>,
    above: OnceLock<Weak<dyn PacketSink>>,
    peer: OnceLock<Weak<dyn PacketSink>>,
    counters: Arc<NetworkCounters>,
}

impl NetworkLayer {
    pub fn new(config: Arc<NetworkConfig>, random: Arc<dyn Random>) -> anyhow::Result<NetworkLayer> {
        config.validate()?;

        Ok(NetworkLayer {
            config,
            random,
            above: OnceLock::new(),
            peer: OnceLock::new(),
            counters: Default::default(),
        })
    }

    /// the local transport layer that inbound packets are passed up to
    pub fn register_above(&self, above: Weak<dyn PacketSink>) -> anyhow::Result<()> {
        self.above.set(above)
            .map_err(|_| anyhow!("layer above is already registered"))
    }

    /// the peer's receive entry point, i.e. the other end of the simulated wire
    pub fn register_peer(&self, peer: Weak<dyn PacketSink>) -> anyhow::Result<()> {
        self.peer.set(peer)
            .map_err(|_| anyhow!("peer is already registered"))
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            corrupted: self.counters.corrupted.load(Ordering::Relaxed),
            delayed: self.counters.delayed.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
        }
    }

    fn should(&self, chance: f64) -> bool {
        self.random.gen_f64() < chance
    }

    fn decide_fate(&self) -> Fate {
        if self.should(self.config.drop_chance) {
            Fate::Drop
        }
        else if self.should(self.config.corrupt_chance) {
            Fate::Corrupt
        }
        else if self.should(self.config.delay_chance) {
            Fate::Delay
        }
        else {
            Fate::Deliver
        }
    }

    fn corrupt(&self, packet: &mut Packet) {
        let mut garbage = vec![0u8; packet.payload().len()];
        self.random.fill_bytes(&mut garbage);

        // random bytes identical to the original would not be corruption at all
        if garbage.as_slice() == packet.payload() {
            if let Some(first) = garbage.first_mut() {
                *first = !*first;
            }
        }
        packet.corrupt_payload(Bytes::from(garbage));
    }

    fn peer(&self) -> anyhow::Result<Weak<dyn PacketSink>> {
        self.peer.get()
            .cloned()
            .ok_or_else(|| anyhow!("network layer is not connected to a peer"))
    }

    async fn deliver(peer: &Weak<dyn PacketSink>, counters: &NetworkCounters, packet: Packet) {
        match peer.upgrade() {
            Some(peer) => {
                trace!("delivering {}", packet);
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                peer.receive(packet).await
            }
            None => debug!("peer is gone - discarding {}", packet),
        }
    }
}

#[async_trait]
impl NetworkSend for NetworkLayer {
    fn check_packet(&self, packet: &Packet) -> anyhow::Result<()> {
        if packet.payload().len() > self.config.max_payload_len {
            bail!("malformed packet #{}: payload of {} bytes exceeds the maximum of {}", packet.sequence_number(), packet.payload().len(), self.config.max_payload_len);
        }
        if !packet.verify() {
            bail!("malformed packet {}: digest does not match its content before it even reached the network", packet);
        }
        Ok(())
    }

    async fn send(&self, packet: &Packet) -> anyhow::Result<()> {
        self.check_packet(packet)?;
        let peer = self.peer()?;

        // the caller keeps its own copy for retransmission, so mutations must not leak back
        let mut packet = packet.clone();
        self.counters.sent.fetch_add(1, Ordering::Relaxed);

        match self.decide_fate() {
            Fate::Drop => {
                warn!("dropping {}", packet);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Fate::Corrupt => {
                warn!("corrupting {}", packet);
                self.corrupt(&mut packet);
                self.counters.corrupted.fetch_add(1, Ordering::Relaxed);
                Self::deliver(&peer, &self.counters, packet).await;
            }
            Fate::Delay => {
                warn!("delaying {} by {:?}", packet, self.config.delay_amount);
                self.counters.delayed.fetch_add(1, Ordering::Relaxed);

                let delay = self.config.delay_amount;
                let counters = self.counters.clone();
                tokio::spawn(async move {
                    time::sleep(delay).await;
                    Self::deliver(&peer, &counters, packet).await;
                });
            }
            Fate::Deliver => {
                Self::deliver(&peer, &self.counters, packet).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PacketSink for NetworkLayer {
    async fn receive(&self, packet: Packet) {
        match self.above.get().and_then(|above| above.upgrade()) {
            Some(above) => above.receive(packet).await,
            None => error!("no layer above to pass {} to - discarding", packet),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_util::{RecordingSink, ScriptedRandom};
    use crate::util::random::MockRandom;
    use rstest::*;

    const NO: f64 = 0.99;
    const YES: f64 = 0.0;

    fn faulty_config() -> Arc<NetworkConfig> {
        Arc::new(NetworkConfig {
            drop_chance: 0.5,
            corrupt_chance: 0.5,
            delay_chance: 0.5,
            delay_amount: Duration::from_secs(1),
            max_payload_len: 16,
        })
    }

    fn network_with_peer(random: Arc<dyn Random>) -> (NetworkLayer, Arc<RecordingSink>) {
        let network = NetworkLayer::new(faulty_config(), random).unwrap();
        let peer = Arc::new(RecordingSink::new());
        let peer_dyn: Arc<dyn PacketSink> = peer.clone();
        network.register_peer(Arc::downgrade(&peer_dyn)).unwrap();
        (network, peer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_delivery_is_immediate() {
        let (network, peer) = network_with_peer(Arc::new(ScriptedRandom::new(vec![NO, NO, NO])));

        let packet = Packet::data(&b"abc"[..], 3);
        network.send(&packet).await.unwrap();

        assert_eq!(peer.received(), vec![packet]);
        assert_eq!(network.stats(), NetworkStats { sent: 1, delivered: 1, ..Default::default() });
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop() {
        let mut random = MockRandom::new();
        random.expect_gen_f64()
            .times(1)
            .return_const(YES);
        random.expect_fill_bytes().never();
        let (network, peer) = network_with_peer(Arc::new(random));

        network.send(&Packet::data(&b"abc"[..], 0)).await.unwrap();
        time::sleep(Duration::from_secs(5)).await;

        assert!(peer.received().is_empty());
        assert_eq!(network.stats(), NetworkStats { sent: 1, dropped: 1, ..Default::default() });
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_is_delivered_immediately_and_fails_verification() {
        let mut random = MockRandom::new();
        let mut rolls = vec![NO, YES].into_iter();
        random.expect_gen_f64()
            .times(2)
            .returning(move || rolls.next().unwrap());
        random.expect_fill_bytes()
            .times(1)
            .returning(|buf: &mut [u8]| buf.fill(b'x'));
        let (network, peer) = network_with_peer(Arc::new(random));

        let original = Packet::data(&b"abc"[..], 7);
        network.send(&original).await.unwrap();

        let received = peer.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].sequence_number(), 7);
        assert_eq!(received[0].payload(), b"xxx");
        assert!(!received[0].verify());

        // the caller's copy is untouched
        assert!(original.verify());
        assert_eq!(original.payload(), b"abc");
        assert_eq!(network.stats(), NetworkStats { sent: 1, corrupted: 1, delivered: 1, ..Default::default() });
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_with_identical_random_bytes_still_corrupts() {
        let random = ScriptedRandom::new(vec![NO, YES])
            .with_fill_byte(b'a');
        let (network, peer) = network_with_peer(Arc::new(random));

        network.send(&Packet::data(&b"aaa"[..], 1)).await.unwrap();

        let received = peer.received();
        assert_ne!(received[0].payload(), b"aaa");
        assert!(!received[0].verify());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_delivers_later_and_out_of_order() {
        let (network, peer) = network_with_peer(Arc::new(ScriptedRandom::new(vec![NO, NO, YES, NO, NO, NO])));

        let delayed = Packet::data(&b"first"[..], 0);
        let immediate = Packet::data(&b"second"[..], 1);
        network.send(&delayed).await.unwrap();
        network.send(&immediate).await.unwrap();

        assert_eq!(peer.received(), vec![immediate.clone()]);

        time::sleep(Duration::from_millis(999)).await;
        assert_eq!(peer.received().len(), 1);
        assert_eq!(network.stats().delivered, 1);

        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(peer.received(), vec![immediate, delayed]);
        assert_eq!(network.stats(), NetworkStats { sent: 2, delayed: 1, delivered: 2, ..Default::default() });
    }

    #[rstest]
    #[case::drop_wins(vec![YES], 0, 0)]
    #[case::corrupt_wins_over_delay(vec![NO, YES], 1, 0)]
    #[case::delay_only(vec![NO, NO, YES], 0, 1)]
    #[case::clean(vec![NO, NO, NO], 0, 0)]
    fn test_faults_are_mutually_exclusive(#[case] rolls: Vec<f64>, #[case] expected_corrupted: u64, #[case] expected_delayed: u64) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async move {
            let random = Arc::new(ScriptedRandom::new(rolls));
            let (network, _peer) = network_with_peer(random.clone());

            network.send(&Packet::data(&b"abc"[..], 0)).await.unwrap();

            assert!(random.is_exhausted());
            let stats = network.stats();
            assert_eq!(stats.corrupted, expected_corrupted);
            assert_eq!(stats.delayed, expected_delayed);
        });
    }

    #[tokio::test]
    async fn test_oversized_packet_is_rejected() {
        let mut random = MockRandom::new();
        random.expect_gen_f64().never();
        let (network, peer) = network_with_peer(Arc::new(random));

        let result = network.send(&Packet::data(vec![0u8; 17], 0)).await;

        assert!(result.is_err());
        assert!(peer.received().is_empty());
        assert_eq!(network.stats(), NetworkStats::default());
    }

    #[rstest]
    #[case::fits(Packet::data(vec![0u8; 16], 0), true)]
    #[case::oversized(Packet::data(vec![0u8; 17], 0), false)]
    #[case::ack(Packet::ack(3), true)]
    fn test_check_packet_matches_send(#[case] packet: Packet, #[case] expected_ok: bool) {
        let network = NetworkLayer::new(faulty_config(), Arc::new(ScriptedRandom::new(vec![]))).unwrap();
        assert_eq!(network.check_packet(&packet).is_ok(), expected_ok);
        assert_eq!(network.stats(), NetworkStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_packet_to_vanished_peer_is_not_delivered() {
        let network = NetworkLayer::new(faulty_config(), Arc::new(ScriptedRandom::new(vec![NO, NO, YES]))).unwrap();
        let peer: Arc<dyn PacketSink> = Arc::new(RecordingSink::new());
        network.register_peer(Arc::downgrade(&peer)).unwrap();

        network.send(&Packet::ack(0)).await.unwrap();
        drop(peer);
        time::sleep(Duration::from_millis(1001)).await;

        assert_eq!(network.stats(), NetworkStats { sent: 1, delayed: 1, ..Default::default() });
    }

    #[tokio::test]
    async fn test_packet_corrupted_before_sending_is_rejected() {
        let (network, _peer) = network_with_peer(Arc::new(ScriptedRandom::new(vec![])));

        let mut packet = Packet::data(&b"abc"[..], 0);
        packet.corrupt_payload(Bytes::from_static(b"abd"));

        assert!(network.send(&packet).await.is_err());
    }

    #[tokio::test]
    async fn test_send_without_peer_fails() {
        let network = NetworkLayer::new(faulty_config(), Arc::new(ScriptedRandom::new(vec![]))).unwrap();
        assert!(network.send(&Packet::ack(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_receive_forwards_unchanged() {
        let network = NetworkLayer::new(faulty_config(), Arc::new(ScriptedRandom::new(vec![]))).unwrap();

        let mut above = MockPacketSink::new();
        let mut packet = Packet::data(&b"abc"[..], 5);
        packet.corrupt_payload(Bytes::from_static(b"zzz"));
        let expected = packet.clone();
        above.expect_receive()
            .withf(move |p| p == &expected)
            .times(1)
            .return_const(());
        let above: Arc<dyn PacketSink> = Arc::new(above);
        network.register_above(Arc::downgrade(&above)).unwrap();

        network.receive(packet).await;
    }

    #[tokio::test]
    async fn test_delivery_to_dropped_peer_is_silent() {
        let network = NetworkLayer::new(Arc::new(NetworkConfig::new()), Arc::new(ScriptedRandom::new(vec![]))).unwrap();
        {
            let peer: Arc<dyn PacketSink> = Arc::new(RecordingSink::new());
            network.register_peer(Arc::downgrade(&peer)).unwrap();
        }

        network.send(&Packet::ack(1)).await.unwrap();
        assert_eq!(network.stats(), NetworkStats { sent: 1, ..Default::default() });
    }

    #[test]
    fn test_double_registration_fails() {
        let network = NetworkLayer::new(Arc::new(NetworkConfig::new()), Arc::new(ScriptedRandom::new(vec![]))).unwrap();
        let sink: Arc<dyn PacketSink> = Arc::new(RecordingSink::new());

        assert!(network.register_peer(Arc::downgrade(&sink)).is_ok());
        assert!(network.register_peer(Arc::downgrade(&sink)).is_err());
        assert!(network.register_above(Arc::downgrade(&sink)).is_ok());
        assert!(network.register_above(Arc::downgrade(&sink)).is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = NetworkConfig { drop_chance: 2.0, ..NetworkConfig::new() };
        assert!(NetworkLayer::new(Arc::new(config), Arc::new(ScriptedRandom::new(vec![]))).is_err());
    }
}

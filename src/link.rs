use std::sync::Arc;

use crate::config::{NetworkConfig, TransportConfig};
use crate::network::{NetworkLayer, PacketSink};
use crate::transport::{Application, TransportLayer};
use crate::util::random::{Random, RngRandom};


/// One side of a simulated connection: a transport layer and the network layer below it
#[derive(Clone)]
pub struct Endpoint {
    pub transport: Arc<TransportLayer>,
    pub network: Arc<NetworkLayer>,
}


/// Wires up two endpoints whose network layers deliver to each other, using real randomness
///  for fault injection
pub fn connect_pair(
    transport_config: Arc<TransportConfig>,
    network_config: Arc<NetworkConfig>,
    application_a: Arc<dyn Application>,
    application_b: Arc<dyn Application>,
) -> anyhow::Result<(Endpoint, Endpoint)> {
    connect_pair_with_random(
        transport_config,
        network_config,
        application_a,
        application_b,
        Arc::new(RngRandom {}),
        Arc::new(RngRandom {}),
    )
}

pub fn connect_pair_with_random(
    transport_config: Arc<TransportConfig>,
    network_config: Arc<NetworkConfig>,
    application_a: Arc<dyn Application>,
    application_b: Arc<dyn Application>,
    random_a: Arc<dyn Random>,
    random_b: Arc<dyn Random>,
) -> anyhow::Result<(Endpoint, Endpoint)> {
    let a = endpoint(transport_config.clone(), network_config.clone(), application_a, random_a)?;
    let b = endpoint(transport_config, network_config, application_b, random_b)?;

    let network_a: Arc<dyn PacketSink> = a.network.clone();
    let network_b: Arc<dyn PacketSink> = b.network.clone();
    a.network.register_peer(Arc::downgrade(&network_b))?;
    b.network.register_peer(Arc::downgrade(&network_a))?;

    Ok((a, b))
}

fn endpoint(
    transport_config: Arc<TransportConfig>,
    network_config: Arc<NetworkConfig>,
    application: Arc<dyn Application>,
    random: Arc<dyn Random>,
) -> anyhow::Result<Endpoint> {
    let network = Arc::new(NetworkLayer::new(network_config, random)?);
    let transport = Arc::new(TransportLayer::new(transport_config, network.clone(), application)?);

    let above: Arc<dyn PacketSink> = transport.clone();
    network.register_above(Arc::downgrade(&above))?;

    Ok(Endpoint { transport, network })
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use super::*;
    use crate::test_util::RecordingApplication;
    use crate::transport::{SubmitOutcome, TransportState};

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_on_clean_network() {
        let app_a = Arc::new(RecordingApplication::new());
        let app_b = Arc::new(RecordingApplication::new());
        let (a, b) = connect_pair(
            Arc::new(TransportConfig::new()),
            Arc::new(NetworkConfig::new()),
            app_a.clone(),
            app_b.clone(),
        ).unwrap();

        assert_eq!(a.transport.submit_from_application("ping").await.unwrap(), SubmitOutcome::Accepted { sequence_number: 0 });
        assert_eq!(b.transport.submit_from_application("pong").await.unwrap(), SubmitOutcome::Accepted { sequence_number: 0 });

        // immediate delivery means the ACK is already back
        assert_eq!(a.transport.state().await, TransportState::Idle);
        assert_eq!(b.transport.state().await, TransportState::Idle);
        assert_eq!(app_b.received(), vec![Bytes::from_static(b"ping")]);
        assert_eq!(app_a.received(), vec![Bytes::from_static(b"pong")]);

        assert_eq!(a.network.stats().sent, 2);
        assert_eq!(b.network.stats().sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transports_outlive_dropped_peer() {
        let (a, b) = connect_pair(
            Arc::new(TransportConfig::new()),
            Arc::new(NetworkConfig::new()),
            Arc::new(RecordingApplication::new()),
            Arc::new(RecordingApplication::new()),
        ).unwrap();
        drop(b);

        a.transport.submit_from_application("into the void").await.unwrap();
        tokio::time::sleep(Duration::from_millis(401)).await;

        assert_eq!(a.transport.state().await, TransportState::AwaitingAck);
        assert_eq!(a.transport.stats().await.retransmitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_torn_down_pair_goes_quiet() {
        let (a, b) = connect_pair(
            Arc::new(TransportConfig::new()),
            Arc::new(NetworkConfig { drop_chance: 1.0, ..NetworkConfig::new() }),
            Arc::new(RecordingApplication::new()),
            Arc::new(RecordingApplication::new()),
        ).unwrap();

        a.transport.submit_from_application("hello").await.unwrap();
        let network_a = Arc::downgrade(&a.network);
        let network_b = Arc::downgrade(&b.network);
        drop(a);
        drop(b);

        tokio::time::sleep(Duration::from_secs(4)).await;

        assert!(network_a.upgrade().is_none());
        assert!(network_b.upgrade().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_too_big_for_the_network_is_not_committed() {
        let (a, _b) = connect_pair(
            Arc::new(TransportConfig::new()),
            Arc::new(NetworkConfig { max_payload_len: 16, ..NetworkConfig::new() }),
            Arc::new(RecordingApplication::new()),
            Arc::new(RecordingApplication::new()),
        ).unwrap();

        assert!(a.transport.submit_from_application(vec![0u8; 17]).await.is_err());
        assert_eq!(a.transport.next_sequence_number().await, 0);
        assert_eq!(a.transport.outstanding_len().await, 0);
        assert_eq!(a.transport.state().await, TransportState::Idle);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(a.transport.stats().await.timeouts, 0);
        assert_eq!(a.network.stats().sent, 0);

        assert_eq!(a.transport.submit_from_application(vec![0u8; 16]).await.unwrap(), SubmitOutcome::Accepted { sequence_number: 0 });
    }
}

use std::cmp::min;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::config::TransportConfig;
use crate::network::{NetworkSend, PacketSink};
use crate::packet::{Frame, Packet};


/// The application sitting on top of the transport layer, receiving payloads as they arrive
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Application: Send + Sync + 'static {
    async fn receive_from_transport(&self, payload: Bytes);
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SubmitOutcome {
    Accepted { sequence_number: u64 },
    /// `window_size` packets are in flight already - the application should retry after some
    ///  ACKs have come in
    WindowFull,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportState {
    /// no outstanding packets, timer disarmed
    Idle,
    /// at least one outstanding packet, timer armed
    AwaitingAck,
    /// the retransmission ceiling was hit without ACK progress, the sender gave up
    Failed,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TransportStats {
    pub data_sent: u64,
    pub retransmitted: u64,
    pub acks_received: u64,
    pub duplicate_acks: u64,
    pub corrupt_dropped: u64,
    pub delivered: u64,
    pub window_full_rejections: u64,
    pub timeouts: u64,
}


struct TransportInner {
    /// sequence number of the oldest unacknowledged packet
    window_base: u64,
    next_sequence_number: u64,
    /// sent packets retained for retransmission, keyed by sequence number. Everything below
    ///  `window_base` is removed as soon as the base moves past it.
    outstanding: BTreeMap<u64, Packet>,

    timer: Option<JoinHandle<()>>,
    /// incremented on every arm / disarm, so a timer task that fires after being superseded
    ///  can tell and does nothing
    timer_generation: u64,
    consecutive_timeouts: u32,
    failed: bool,

    stats: TransportStats,
}
impl TransportInner {
    fn in_flight(&self) -> u64 {
        self.next_sequence_number - self.window_base
    }

    fn is_window_empty(&self) -> bool {
        self.window_base == self.next_sequence_number
    }

    fn state(&self) -> TransportState {
        if self.failed {
            TransportState::Failed
        }
        else if self.is_window_empty() {
            TransportState::Idle
        }
        else {
            TransportState::AwaitingAck
        }
    }

    fn disarm_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            trace!("disarming retransmission timer");
            handle.abort();
        }
        self.timer_generation += 1;
    }
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }
}


/// Go-Back-N sender and receiver for one side of a connection.
///
/// All session state lives behind a single mutex, no matter whether a change is triggered by
///  the application, by a packet coming up from the network (possibly from a delayed-delivery
///  task), or by the retransmission timer. The lock is never held while calling into the
///  network: with immediate delivery, a send can synchronously come back to this very session
///  as an ACK.
#[derive(Clone)]
pub struct TransportLayer {
    config: Arc<TransportConfig>,
    inner: Arc<Mutex<TransportInner>>,
    network: Arc<dyn NetworkSend>,
    application: Arc<dyn Application>,
    /// notified whenever the window base advances or the session fails
    window_changed: Arc<Notify>,
}

/// The retransmission timer's handle on its session. It does not keep the session state alive,
///  and dropping the state aborts the timer task.
struct WeakTransportLayer {
    config: Arc<TransportConfig>,
    inner: Weak<Mutex<TransportInner>>,
    network: Arc<dyn NetworkSend>,
    application: Arc<dyn Application>,
    window_changed: Arc<Notify>,
}
impl WeakTransportLayer {
    fn upgrade(&self) -> Option<TransportLayer> {
        Some(TransportLayer {
            config: self.config.clone(),
            inner: self.inner.upgrade()?,
            network: self.network.clone(),
            application: self.application.clone(),
            window_changed: self.window_changed.clone(),
        })
    }
}

impl TransportLayer {
    pub fn new(config: Arc<TransportConfig>, network: Arc<dyn NetworkSend>, application: Arc<dyn Application>) -> anyhow::Result<TransportLayer> {
        config.validate()?;

        Ok(TransportLayer {
            config,
            inner: Arc::new(Mutex::new(TransportInner {
                window_base: 0,
                next_sequence_number: 0,
                outstanding: BTreeMap::default(),
                timer: None,
                timer_generation: 0,
                consecutive_timeouts: 0,
                failed: false,
                stats: TransportStats::default(),
            })),
            network,
            application,
            window_changed: Arc::new(Notify::new()),
        })
    }

    pub async fn window_base(&self) -> u64 {
        self.inner.lock().await.window_base
    }

    pub async fn next_sequence_number(&self) -> u64 {
        self.inner.lock().await.next_sequence_number
    }

    pub async fn outstanding_len(&self) -> usize {
        self.inner.lock().await.outstanding.len()
    }

    pub async fn state(&self) -> TransportState {
        self.inner.lock().await.state()
    }

    pub async fn stats(&self) -> TransportStats {
        self.inner.lock().await.stats.clone()
    }

    /// Sends a payload as the next data packet if the window has room for it.
    ///
    /// A full window is not an error: it is reported as [SubmitOutcome::WindowFull], and nothing
    ///  is sent. `Err` is reserved for contract violations (oversized payload, malformed packet)
    ///  and for a session that has given up.
    pub async fn submit_from_application(&self, payload: impl Into<Bytes>) -> anyhow::Result<SubmitOutcome> {
        let payload = payload.into();
        if payload.len() > self.config.max_payload_len {
            bail!("payload of {} bytes exceeds the maximum of {}", payload.len(), self.config.max_payload_len);
        }

        let packet = {
            let mut inner = self.inner.lock().await;
            if inner.failed {
                bail!("session has failed: retransmission ceiling exhausted without ACK progress");
            }

            if inner.in_flight() >= self.config.window_size as u64 {
                debug!("window is full ({} packets in flight) - rejecting payload", inner.in_flight());
                inner.stats.window_full_rejections += 1;
                return Ok(SubmitOutcome::WindowFull);
            }

            let sequence_number = inner.next_sequence_number;
            let packet = Packet::data(payload, sequence_number);
            self.network.check_packet(&packet)?;
            inner.outstanding.insert(sequence_number, packet.clone());

            if inner.is_window_empty() {
                debug!("first packet in an empty window - starting retransmission timer");
                self.arm_timer(&mut inner);
            }
            inner.next_sequence_number += 1;
            inner.stats.data_sent += 1;
            packet
        };

        // the lock is released here, so concurrent submitters may reach the network out of sequence order
        trace!("sending {}", packet);
        if let Err(e) = self.network.send(&packet).await {
            self.take_back(packet.sequence_number()).await;
            return Err(e);
        }
        Ok(SubmitOutcome::Accepted { sequence_number: packet.sequence_number() })
    }

    /// Undoes the bookkeeping for a packet that the network refused to send
    async fn take_back(&self, sequence_number: u64) {
        let mut inner = self.inner.lock().await;
        inner.outstanding.remove(&sequence_number);

        if inner.next_sequence_number == sequence_number + 1 {
            inner.next_sequence_number = sequence_number;
            inner.stats.data_sent -= 1;
            if inner.is_window_empty() {
                inner.disarm_timer();
            }
        }
        else {
            warn!("packet #{} was refused by the network after later packets were sent - leaving a gap", sequence_number);
        }
        drop(inner);

        self.window_changed.notify_waiters();
    }

    /// Like [TransportLayer::submit_from_application], but waits for room in the window instead
    ///  of rejecting the payload. Returns the payload's sequence number.
    pub async fn submit_waiting(&self, payload: impl Into<Bytes>) -> anyhow::Result<u64> {
        let payload = payload.into();
        loop {
            let notified = self.window_changed.notified();
            tokio::pin!(notified);
            // register before checking, so a window change in between is not lost
            notified.as_mut().enable();

            match self.submit_from_application(payload.clone()).await? {
                SubmitOutcome::Accepted { sequence_number } => return Ok(sequence_number),
                SubmitOutcome::WindowFull => notified.await,
            }
        }
    }

    /// Waits until every packet sent so far is acknowledged, or the session has failed
    pub async fn wait_until_idle(&self) -> TransportState {
        loop {
            let notified = self.window_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state().await {
                TransportState::AwaitingAck => notified.await,
                other => return other,
            }
        }
    }

    pub async fn handle_from_network(&self, packet: Packet) {
        if !packet.verify() {
            warn!("packet #{} is corrupted - dropping it", packet.sequence_number());
            self.inner.lock().await.stats.corrupt_dropped += 1;
            return;
        }

        match packet.frame() {
            Frame::Ack => self.on_ack(packet.sequence_number()).await,
            Frame::Data { payload } => {
                trace!("received {}", packet);
                self.application.receive_from_transport(payload.clone()).await;
                self.inner.lock().await.stats.delivered += 1;

                let ack = packet.into_ack();
                trace!("sending {}", ack);
                if let Err(e) = self.network.send(&ack).await {
                    error!("error sending ACK #{}: {}", ack.sequence_number(), e);
                }
            }
        }
    }

    async fn on_ack(&self, sequence_number: u64) {
        let mut inner = self.inner.lock().await;
        inner.stats.acks_received += 1;

        if sequence_number < inner.window_base {
            debug!("duplicate or stale ACK #{} (window base is {}) - ignoring", sequence_number, inner.window_base);
            inner.stats.duplicate_acks += 1;
            return;
        }
        if sequence_number >= inner.next_sequence_number {
            warn!("ACK #{} for a packet that was never sent (next is {}) - ignoring", sequence_number, inner.next_sequence_number);
            return;
        }

        // cumulative: everything up to and including this sequence number is acknowledged
        let new_base = sequence_number + 1;
        inner.window_base = new_base;
        inner.outstanding = inner.outstanding.split_off(&new_base);
        inner.consecutive_timeouts = 0;
        debug!("ACK #{} - window base moved to {}", sequence_number, new_base);

        if inner.is_window_empty() || inner.failed {
            debug!("all packets acknowledged - stopping retransmission timer");
            inner.disarm_timer();
        }
        else {
            self.arm_timer(&mut inner);
        }
        drop(inner);

        self.window_changed.notify_waiters();
    }

    /// Resends every outstanding packet and rearms the timer. This is what the retransmission
    ///  timer does when it fires, but it can be triggered explicitly as well.
    pub async fn on_timeout(&self) {
        let resend = {
            let mut inner = self.inner.lock().await;
            self.do_timeout(&mut inner)
        };
        self.resend_all(resend).await;
    }

    async fn on_timer_fired(&self, generation: u64) {
        let resend = {
            let mut inner = self.inner.lock().await;
            if inner.timer_generation != generation {
                trace!("superseded retransmission timer fired - ignoring");
                return;
            }
            // this is the running task's own handle: re-arming must not abort it
            inner.timer = None;
            self.do_timeout(&mut inner)
        };
        self.resend_all(resend).await;
    }

    fn do_timeout(&self, inner: &mut TransportInner) -> Vec<Packet> {
        if inner.failed {
            return Vec::new();
        }
        if inner.is_window_empty() {
            debug!("timeout with an empty window - nothing to resend");
            inner.disarm_timer();
            return Vec::new();
        }

        inner.stats.timeouts += 1;
        inner.consecutive_timeouts += 1;

        if let Some(max_rounds) = self.config.max_retransmission_rounds {
            if inner.consecutive_timeouts > max_rounds {
                error!("no ACK progress after {} retransmission rounds - giving up with {} packets outstanding", max_rounds, inner.in_flight());
                inner.failed = true;
                inner.disarm_timer();
                self.window_changed.notify_waiters();
                return Vec::new();
            }
        }

        let end = min(inner.next_sequence_number, inner.window_base + self.config.window_size as u64);
        warn!("timeout: retransmitting packets {}..{}", inner.window_base, end);

        let resend = inner.outstanding
            .range(inner.window_base..end)
            .map(|(_, packet)| packet.clone())
            .collect::<Vec<_>>();
        inner.stats.retransmitted += resend.len() as u64;

        self.arm_timer(inner);
        resend
    }

    async fn resend_all(&self, packets: Vec<Packet>) {
        for packet in packets {
            trace!("retransmitting {}", packet);
            if let Err(e) = self.network.send(&packet).await {
                error!("error retransmitting packet #{}: {}", packet.sequence_number(), e);
            }
        }
    }

    /// (Re)starts the retransmission timer, cancelling any timer that is currently armed
    fn arm_timer(&self, inner: &mut TransportInner) {
        inner.disarm_timer();

        let generation = inner.timer_generation;
        let timeout = self.config.retransmission_timeout;
        let this = self.downgrade();

        inner.timer = Some(tokio::spawn(async move {
            time::sleep(timeout).await;
            if let Some(this) = this.upgrade() {
                this.on_timer_fired(generation).await;
            }
        }));
    }

    fn downgrade(&self) -> WeakTransportLayer {
        WeakTransportLayer {
            config: self.config.clone(),
            inner: Arc::downgrade(&self.inner),
            network: self.network.clone(),
            application: self.application.clone(),
            window_changed: self.window_changed.clone(),
        }
    }
}

#[async_trait]
impl PacketSink for TransportLayer {
    async fn receive(&self, packet: Packet) {
        self.handle_from_network(packet).await
    }
}

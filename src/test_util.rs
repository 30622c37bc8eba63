//! Test doubles for the seams between the layers. They are part of the regular (non-test) code
//!  so that integration tests and applications built on this crate can use them as well.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::network::{NetworkSend, PacketSink};
use crate::packet::Packet;
use crate::transport::Application;
use crate::util::random::Random;


/// Records every packet it is handed, either as the peer of a network layer or as the network
///  below a transport layer
#[derive(Default)]
pub struct RecordingSink {
    packets: Mutex<Vec<Packet>>,
}
impl RecordingSink {
    pub fn new() -> RecordingSink {
        Default::default()
    }

    pub fn received(&self) -> Vec<Packet> {
        self.packets.lock().unwrap().clone()
    }

    pub fn sequence_numbers(&self) -> Vec<(u64, bool)> {
        self.packets.lock().unwrap()
            .iter()
            .map(|p| (p.sequence_number(), p.is_ack()))
            .collect()
    }

    pub fn clear(&self) {
        self.packets.lock().unwrap().clear();
    }
}

#[async_trait]
impl PacketSink for RecordingSink {
    async fn receive(&self, packet: Packet) {
        self.packets.lock().unwrap().push(packet);
    }
}

#[async_trait]
impl NetworkSend for RecordingSink {
    fn check_packet(&self, _packet: &Packet) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send(&self, packet: &Packet) -> anyhow::Result<()> {
        self.packets.lock().unwrap().push(packet.clone());
        Ok(())
    }
}


#[derive(Default)]
pub struct RecordingApplication {
    payloads: Mutex<Vec<Bytes>>,
}
impl RecordingApplication {
    pub fn new() -> RecordingApplication {
        Default::default()
    }

    pub fn received(&self) -> Vec<Bytes> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Application for RecordingApplication {
    async fn receive_from_transport(&self, payload: Bytes) {
        self.payloads.lock().unwrap().push(payload);
    }
}


/// Plays back a fixed sequence of rolls, and rolls 'no fault' once the script is used up
pub struct ScriptedRandom {
    rolls: Mutex<VecDeque<f64>>,
    fill_byte: u8,
}
impl ScriptedRandom {
    pub const NO_FAULT: f64 = 0.999;

    pub fn new(rolls: Vec<f64>) -> ScriptedRandom {
        ScriptedRandom {
            rolls: Mutex::new(rolls.into()),
            fill_byte: 0,
        }
    }

    pub fn with_fill_byte(self, fill_byte: u8) -> ScriptedRandom {
        ScriptedRandom {
            fill_byte,
            ..self
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.rolls.lock().unwrap().is_empty()
    }
}

impl Random for ScriptedRandom {
    fn gen_f64(&self) -> f64 {
        self.rolls.lock().unwrap()
            .pop_front()
            .unwrap_or(Self::NO_FAULT)
    }

    fn fill_bytes(&self, buf: &mut [u8]) {
        buf.fill(self.fill_byte);
    }
}

//! Wake-on-LAN magic packets.

use crate::config::MacAddress;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;

/// Discard port, the conventional wake-on-lan destination.
pub const WAKE_PORT: u16 = 9;

/// Sends a wake signal for a hardware address. Fire-and-forget.
#[async_trait]
pub trait WakeSender: Send + Sync {
    async fn wake(&self, mac: &MacAddress) -> std::io::Result<()>;
}

/// Six `0xff` bytes followed by the address repeated sixteen times.
pub fn magic_packet(mac: &MacAddress) -> [u8; 102] {
    let mut packet = [0xffu8; 102];
    let octets = mac.octets();
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&octets);
    }
    packet
}

/// UDP broadcast sender.
#[derive(Debug, Clone)]
pub struct UdpWake {
    target: SocketAddr,
}

impl UdpWake {
    pub fn broadcast() -> Self {
        Self::with_target(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, WAKE_PORT)))
    }

    pub fn with_target(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl Default for UdpWake {
    fn default() -> Self {
        Self::broadcast()
    }
}

#[async_trait]
impl WakeSender for UdpWake {
    async fn wake(&self, mac: &MacAddress) -> std::io::Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        socket.send_to(&magic_packet(mac), self.target).await?;
        Ok(())
    }
}

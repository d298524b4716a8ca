//! A virtual L2 endpoint: one logical interface bound to `{MAC, VLAN
//! stack, EtherType}` on top of the shared relay.

use std::time::Duration;

use mac_address::MacAddress;
use tokio::sync::{mpsc, Mutex};

use super::frame::{build_frame, EndpointKey, RxFrame, VlanStack};
use super::relay::{PacketRelay, Registration, RelayError};

pub struct L2Endpoint {
    mac: MacAddress,
    vlans: VlanStack,
    ethertype: u16,
    rx: Mutex<mpsc::Receiver<RxFrame>>,
    tx: mpsc::Sender<Vec<u8>>,
}

impl L2Endpoint {
    /// Registers on the relay under the endpoint's key. `multicast` opts
    /// the endpoint into broadcast/multicast delivery (DHCP clients want
    /// this, a release-only endpoint may not).
    pub fn new(
        relay: &dyn PacketRelay,
        mac: MacAddress,
        vlans: VlanStack,
        ethertype: u16,
        multicast: bool,
    ) -> Result<Self, RelayError> {
        let key = EndpointKey::new(mac, &vlans, ethertype);
        let chans = relay.register(Registration::keyed(key, multicast))?;
        Ok(Self {
            mac,
            vlans,
            ethertype,
            rx: Mutex::new(chans.rx),
            tx: chans.tx,
        })
    }

    /// Wraps the relay's default-receiver channels. The all-zero MAC is a
    /// placeholder; senders on this endpoint always address frames
    /// explicitly via [`write_ip_pkt_to_from`](Self::write_ip_pkt_to_from).
    pub fn from_default_channels(chans: super::relay::EndpointChannels) -> Self {
        Self {
            mac: MacAddress::new([0; 6]),
            vlans: VlanStack::new(),
            ethertype: 0,
            rx: Mutex::new(chans.rx),
            tx: chans.tx,
        }
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn vlans(&self) -> &VlanStack {
        &self.vlans
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey::new(self.mac, &self.vlans, self.ethertype)
    }

    /// Next frame delivered to this endpoint. `Closed` once the relay is
    /// gone.
    pub async fn read_pkt(&self) -> Result<RxFrame, RelayError> {
        self.rx.lock().await.recv().await.ok_or(RelayError::Closed)
    }

    /// Like [`read_pkt`](Self::read_pkt) but bounded; expiry surfaces as
    /// `Timeout` so callers can loop without treating idleness as fatal.
    pub async fn read_pkt_deadline(&self, deadline: Duration) -> Result<RxFrame, RelayError> {
        match tokio::time::timeout(deadline, self.read_pkt()).await {
            Ok(r) => r,
            Err(_) => Err(RelayError::Timeout),
        }
    }

    /// Wraps an L3 packet in this endpoint's Ethernet/VLAN headers and
    /// queues it on the relay.
    pub async fn send_ip_pkt(&self, dst_mac: [u8; 6], payload: &[u8]) -> Result<(), RelayError> {
        let frame = build_frame(
            dst_mac,
            self.mac.bytes(),
            &self.vlans,
            self.ethertype,
            payload,
        );
        self.tx.send(frame).await.map_err(|_| RelayError::Closed)
    }

    /// Transmit with arbitrary addressing, so a responder can answer on
    /// behalf of another client's MAC and VLAN stack without registering.
    pub async fn write_ip_pkt_to_from(
        &self,
        payload: &[u8],
        src_mac: [u8; 6],
        dst_mac: [u8; 6],
        vlans: &VlanStack,
        ethertype: u16,
    ) -> Result<(), RelayError> {
        let frame = build_frame(dst_mac, src_mac, vlans, ethertype, payload);
        self.tx.send(frame).await.map_err(|_| RelayError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netio::frame::{VlanTag, ETHERTYPE_IPV4};
    use crate::netio::relay::testutil::ChannelRelay;

    #[tokio::test]
    async fn endpoints_on_same_relay_reach_each_other() {
        let relay = ChannelRelay::new();
        let a = L2Endpoint::new(
            relay.as_ref(),
            MacAddress::new([2, 0, 0, 0, 0, 1]),
            vec![VlanTag::dot1q(100)],
            ETHERTYPE_IPV4,
            true,
        )
        .unwrap();
        let b = L2Endpoint::new(
            relay.as_ref(),
            MacAddress::new([2, 0, 0, 0, 0, 2]),
            vec![VlanTag::dot1q(100)],
            ETHERTYPE_IPV4,
            true,
        )
        .unwrap();

        a.send_ip_pkt(b.mac().bytes(), &[0xab, 0xcd]).await.unwrap();
        let rx = b.read_pkt_deadline(Duration::from_secs(1)).await.unwrap();
        assert_eq!(rx.src, a.mac().bytes());
        assert_eq!(rx.payload, vec![0xab, 0xcd]);
        assert_eq!(rx.vlans, vec![VlanTag::dot1q(100)]);
    }

    #[tokio::test]
    async fn deadline_read_reports_timeout() {
        let relay = ChannelRelay::new();
        let ep = L2Endpoint::new(
            relay.as_ref(),
            MacAddress::new([2, 0, 0, 0, 0, 3]),
            vec![],
            ETHERTYPE_IPV4,
            false,
        )
        .unwrap();
        assert!(matches!(
            ep.read_pkt_deadline(Duration::from_millis(20)).await,
            Err(RelayError::Timeout)
        ));
    }

    #[tokio::test]
    async fn stopped_relay_closes_reads() {
        let relay = ChannelRelay::new();
        let ep = L2Endpoint::new(
            relay.as_ref(),
            MacAddress::new([2, 0, 0, 0, 0, 4]),
            vec![],
            ETHERTYPE_IPV4,
            false,
        )
        .unwrap();
        relay.stop();
        assert!(matches!(ep.read_pkt().await, Err(RelayError::Closed)));
    }
}

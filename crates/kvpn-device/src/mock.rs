//! In-memory device double used by this crate's and downstream crates'
//! tests: a channel-backed loopback so packet round-trips and the
//! close-unblock contract can be exercised without a real kernel TUN
//! driver or root.

use crate::device::{DeviceState, TunDevice};
use crate::error::{DeviceError, DeviceResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

pub struct MockDevice {
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    closed: AtomicBool,
    closed_notify: Arc<Notify>,
    subnets: Mutex<Vec<String>>,
    dns: Mutex<Option<(String, Vec<String>)>>,
}

pub struct MockPeer {
    pub to_device: mpsc::Sender<Vec<u8>>,
    pub from_device: mpsc::Receiver<Vec<u8>>,
}

impl MockDevice {
    /// Returns the device plus the peer handles a test uses to feed it
    /// inbound packets and observe outbound ones — the loopback side of
    /// the packet round-trip property.
    pub fn new() -> (Self, MockPeer) {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let device = Self {
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound_tx,
            closed: AtomicBool::new(false),
            closed_notify: Arc::new(Notify::new()),
            subnets: Mutex::new(Vec::new()),
            dns: Mutex::new(None),
        };
        let peer = MockPeer {
            to_device: inbound_tx,
            from_device: outbound_rx,
        };
        (device, peer)
    }
}

#[allow(async_fn_in_trait)]
impl TunDevice for MockDevice {
    async fn read_packet(&self, buf: &mut [u8]) -> DeviceResult<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeviceError::Closed);
        }
        let mut rx = self.inbound_rx.lock().await;
        let packet = tokio::select! {
            biased;
            _ = self.closed_notify.notified() => None,
            packet = rx.recv() => packet,
        };
        match packet {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Err(DeviceError::Closed),
        }
    }

    async fn write_packet(&self, buf: &[u8]) -> DeviceResult<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeviceError::Closed);
        }
        self.outbound_tx
            .send(buf.to_vec())
            .await
            .map_err(|_| DeviceError::Closed)?;
        Ok(buf.len())
    }

    fn add_subnet(&self, cidr: &str) -> DeviceResult<()> {
        self.subnets
            .lock()
            .expect("subnets mutex poisoned")
            .push(cidr.to_string());
        Ok(())
    }

    fn remove_subnet(&self, cidr: &str) -> DeviceResult<()> {
        self.subnets
            .lock()
            .expect("subnets mutex poisoned")
            .retain(|s| s != cidr);
        Ok(())
    }

    fn set_dns(&self, ip: &str, search_domains: &[String]) -> DeviceResult<()> {
        *self.dns.lock().expect("dns mutex poisoned") =
            Some((ip.to_string(), search_domains.to_vec()));
        Ok(())
    }

    fn set_mtu(&self, _mtu: u16) -> DeviceResult<()> {
        Err(DeviceError::Unsupported("mock device has no mtu".into()))
    }

    async fn close(&self) -> DeviceResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.closed_notify.notify_waiters();
        Ok(())
    }

    fn state(&self) -> DeviceState {
        if self.closed.load(Ordering::SeqCst) {
            DeviceState::Closed
        } else {
            DeviceState::Open
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_1200_byte_packet() {
        let (device, mut peer) = MockDevice::new();
        let packet: Vec<u8> = (0..1200u32).map(|i| (i % 256) as u8).collect();

        peer.to_device.send(packet.clone()).await.unwrap();
        let mut buf = vec![0u8; 2048];
        let n = device.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], packet.as_slice());

        device.write_packet(&packet).await.unwrap();
        let echoed = peer.from_device.recv().await.unwrap();
        assert_eq!(echoed, packet);
    }

    #[tokio::test]
    async fn close_unblocks_pending_read_within_two_seconds() {
        let (device, _peer) = MockDevice::new();
        let mut buf = vec![0u8; 64];
        let read_fut = device.read_packet(&mut buf);
        let close_fut = device.close();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            tokio::join!(read_fut, close_fut)
        })
        .await;

        assert!(result.is_ok(), "close did not unblock the reader in time");
        let (read_result, close_result) = result.unwrap();
        assert!(read_result.is_err());
        assert!(close_result.is_ok());
    }

    #[tokio::test]
    async fn read_and_write_after_close_yield_errors() {
        let (device, _peer) = MockDevice::new();
        device.close().await.unwrap();
        let mut buf = vec![0u8; 16];
        assert!(matches!(
            device.read_packet(&mut buf).await,
            Err(DeviceError::Closed)
        ));
        assert!(matches!(
            device.write_packet(&buf).await,
            Err(DeviceError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (device, _peer) = MockDevice::new();
        device.close().await.unwrap();
        device.close().await.unwrap();
    }

    #[test]
    fn add_and_remove_subnet_round_trips() {
        let (device, _peer) = MockDevice::new();
        device.add_subnet("10.0.0.0/24").unwrap();
        assert_eq!(device.subnets.lock().unwrap().len(), 1);
        device.remove_subnet("10.0.0.0/24").unwrap();
        assert!(device.subnets.lock().unwrap().is_empty());
    }
}

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::Context;
use log::{debug, error};
use motion_power_common::MotionDetectPacket;
use tokio::net::{lookup_host, UdpSocket};

/// Tells a remote listener about detected motion. Nothing is retried.
pub struct Notifier {
    socket: UdpSocket,
    remote: SocketAddr,
}

impl Notifier {
    /// Resolves `remote` (`host:port`) once, up front
    pub async fn bind(remote: &str) -> anyhow::Result<Self> {
        let remote = lookup_host(remote)
            .await
            .with_context(|| format!("Error resolving {remote:?}"))?
            .next()
            .with_context(|| format!("{remote:?} has no address"))?;
        let local: SocketAddr = match remote {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local)
            .await
            .context("Error binding notification socket")?;
        Ok(Self { socket, remote })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Errors are logged and dropped
    pub async fn notify(&self, count: u32) {
        debug!("Sending motion count {count} to {}", self.remote);
        let packet = MotionDetectPacket { count };
        if let Err(e) = self.socket.send_to(&packet.to_bytes(), self.remote).await {
            error!("Error sending motion packet to {}: {e}", self.remote);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_count_as_one_datagram() {
        let listener = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let notifier = Notifier::bind(&listener.local_addr().unwrap().to_string())
            .await
            .unwrap();
        notifier.notify(70).await;
        notifier.notify(4242).await;

        let mut buf = [0u8; 16];
        let (len, _) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(
            MotionDetectPacket::from_bytes(&buf[..len]),
            Some(MotionDetectPacket { count: 70 })
        );
        let (len, _) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &4242u32.to_le_bytes());
    }

    #[tokio::test]
    async fn nobody_listening_is_not_an_error() {
        // Grab a free port, then close it again
        let port = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let notifier = Notifier::bind(&port.to_string()).await.unwrap();
        notifier.notify(1).await;
        notifier.notify(2).await;
        assert_eq!(notifier.remote(), port);
    }

    #[tokio::test]
    async fn resolves_host_names() {
        let listener = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let notifier = Notifier::bind(&format!("localhost:{port}")).await.unwrap();
        assert_eq!(notifier.remote().port(), port);
        assert!(notifier.remote().ip().is_loopback());

        assert!(Notifier::bind("no port here").await.is_err());
    }
}

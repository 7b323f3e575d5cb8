//! TCP reachability checks.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Ports whose embedded stacks are often slow to accept under load; a failed
/// dial is retried once at double the timeout.
pub const CRITICAL_PORTS: [u16; 3] = [80, 443, 4028];

const RETRY_PAUSE: Duration = Duration::from_millis(25);

/// Why a port did not count as open. Never escapes a scan.
#[derive(Error, Debug)]
pub enum DialError {
    #[error("port closed: {0}")]
    PortClosed(#[source] io::Error),

    #[error("dial timeout")]
    DialTimeout,
}

/// Single connect attempt.
pub async fn dial(ip: Ipv4Addr, port: u16, dial_timeout: Duration) -> Result<(), DialError> {
    let addr = SocketAddr::from((ip, port));
    match timeout(dial_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(DialError::PortClosed(e)),
        Err(_) => Err(DialError::DialTimeout),
    }
}

/// Whether `port` accepts connections, retrying critical ports once.
pub async fn port_open(ip: Ipv4Addr, port: u16, dial_timeout: Duration) -> bool {
    if CRITICAL_PORTS.contains(&port) {
        return dial_with_retry(ip, port, dial_timeout).await;
    }
    dial(ip, port, dial_timeout).await.is_ok()
}

/// Dial, and on failure dial once more at double the timeout.
pub async fn dial_with_retry(ip: Ipv4Addr, port: u16, dial_timeout: Duration) -> bool {
    match dial(ip, port, dial_timeout).await {
        Ok(()) => true,
        Err(e) => {
            tracing::trace!(ip = %ip, port, error = %e, "Retrying critical port");
            sleep(RETRY_PAUSE).await;
            dial(ip, port, dial_timeout * 2).await.is_ok()
        }
    }
}

/// The subset of `ports` that is open, in the given order.
pub async fn open_ports(ip: Ipv4Addr, ports: &[u16], dial_timeout: Duration) -> Vec<u16> {
    let mut open = Vec::with_capacity(ports.len());
    for &port in ports {
        if port_open(ip, port, dial_timeout).await {
            open.push(port);
        }
    }
    open
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_open_and_closed_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = closed_port().await;

        let found = open_ports(Ipv4Addr::LOCALHOST, &[closed, open], Duration::from_millis(500)).await;
        assert_eq!(found, vec![open]);
    }

    #[tokio::test]
    async fn test_dial_error_kinds() {
        let closed = closed_port().await;
        let err = dial(Ipv4Addr::LOCALHOST, closed, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::PortClosed(_)));
    }

    #[tokio::test]
    async fn test_retry_catches_late_listener() {
        let port = closed_port().await;
        let late = tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            sleep(Duration::from_secs(2)).await;
            drop(listener);
        });

        assert!(dial(Ipv4Addr::LOCALHOST, port, Duration::from_millis(200)).await.is_err());
        assert!(dial_with_retry(Ipv4Addr::LOCALHOST, port, Duration::from_millis(200)).await);
        late.abort();
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_closed_port() {
        let port = closed_port().await;
        assert!(!dial_with_retry(Ipv4Addr::LOCALHOST, port, Duration::from_millis(200)).await);
    }
}

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, instrument};

use crate::{BridgeConfig, BridgeError};

/// A bound listener waiting for the one agent connection of a session.
#[derive(Debug)]
pub struct BridgeListener {
    listener: TcpListener,
    address: String,
    accept_timeout: Duration,
}

/// Run `attempt` until it yields anything other than `AddrInUse`, sleeping
/// `delay` between tries. Every other error is returned on first sight.
pub async fn retry_on_addr_in_use<T, F, Fut>(delay: Duration, mut attempt: F) -> io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut retries: u64 = 0;
    loop {
        match attempt().await {
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                retries += 1;
                if retries == 1 || retries % 40 == 0 {
                    debug!("Address in use, retrying bind ({} attempts so far)", retries);
                }
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[instrument(skip(config), fields(endpoint = %config.endpoint()))]
pub async fn bind_listener(config: &BridgeConfig) -> Result<BridgeListener, BridgeError> {
    let address = config.endpoint();
    let listener = retry_on_addr_in_use(config.bind_retry_delay, || {
        bind_once(&config.address, config.port)
    })
    .await
    .map_err(|source| BridgeError::Bind {
        address: address.clone(),
        source,
    })?;

    debug!("Listening for agent on {}", address);

    Ok(BridgeListener {
        listener,
        address,
        accept_timeout: config.accept_timeout,
    })
}

async fn bind_once(host: &str, port: u16) -> io::Result<TcpListener> {
    let addr = lookup_host((host, port)).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{} did not resolve to an address", host),
        )
    })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1)
}

impl BridgeListener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Wait for the agent to connect, then stop listening for good.
    pub async fn accept(self) -> Result<TcpStream, BridgeError> {
        let Self {
            listener,
            address,
            accept_timeout,
        } = self;

        let accepted = tokio::time::timeout(accept_timeout, listener.accept()).await;
        drop(listener);

        let (stream, peer) = match accepted {
            Err(_) => {
                return Err(BridgeError::AcceptTimeout {
                    address,
                    timeout: accept_timeout,
                })
            }
            Ok(Err(source)) => return Err(BridgeError::Accept { address, source }),
            Ok(Ok(accepted)) => accepted,
        };

        stream
            .set_nodelay(true)
            .map_err(|source| BridgeError::Accept {
                address: address.clone(),
                source,
            })?;

        info!("Agent connected from {}", peer);
        Ok(stream)
    }
}

use std::{io, net::SocketAddr, sync::Arc, time::Instant};

use proto::{
    BindingHandle, ForwardError, Message, Proxy, ProxyEvent, RequestId, TransmissionConfig,
};
use rustc_hash::FxHashMap;
use tokio::{
    net::{lookup_host, UdpSocket},
    sync::{mpsc, oneshot},
    time::sleep_until,
};
use tracing::{debug, info_span, trace, warn, Instrument};

/// Largest datagram the proxy will accept from the socket
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Handle to a running forwarding proxy
///
/// A proxy corresponds to a single UDP socket serving any number of clients.
/// The socket and all protocol state live on a background task spawned by
/// [`bind`](Self::bind); the task stops when [`close`](Self::close) is called
/// or every handle to it has been dropped, cancelling all exchanges in flight.
///
/// May be cloned to obtain another handle to the same proxy.
#[derive(Clone)]
pub struct ProxyEndpoint {
    commands: mpsc::UnboundedSender<Command>,
    local_addr: SocketAddr,
}

impl ProxyEndpoint {
    /// Start a proxy on `addr` with default transmission parameters
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Self::with_config(addr, TransmissionConfig::default()).await
    }

    /// Start a proxy on `addr` with custom transmission parameters
    pub async fn with_config(addr: SocketAddr, config: TransmissionConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (resolved_tx, resolved_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            socket,
            proxy: Proxy::new(Arc::new(config)),
            commands: command_rx,
            resolved_tx,
            resolved: resolved_rx,
            completions: FxHashMap::default(),
        };
        tokio::spawn(driver.run().instrument(info_span!("proxy", %local_addr)));
        Ok(Self {
            commands,
            local_addr,
        })
    }

    /// The address the proxy's socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Forward `request` to the origin it names and await the outcome
    ///
    /// The request must carry a Proxy-Uri option, or Proxy-Scheme with
    /// Uri-Host, naming a `coap` origin. Yields exactly one origin response or
    /// failure, within the bound the transmission parameters put on
    /// retransmission; the response carries the token `request` was submitted
    /// with.
    pub async fn forward(&self, request: Message) -> Result<Message, ForwardError> {
        let (completion, outcome) = oneshot::channel();
        self.commands
            .send(Command::Forward {
                request,
                completion,
            })
            .map_err(|_| ForwardError::Closed)?;
        outcome.await.map_err(|_| ForwardError::Closed)?
    }

    /// Shut the proxy down
    ///
    /// Pending [`forward`](Self::forward) calls fail with
    /// [`ForwardError::Closed`]; network clients are not notified. The socket
    /// is released once the background task has wound down.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

enum Command {
    Forward {
        request: Message,
        completion: oneshot::Sender<Result<Message, ForwardError>>,
    },
    Close,
}

/// The background task owning the socket and the protocol state
///
/// All events for all exchanges pass through this one loop, which only ever
/// suspends awaiting the socket, the next protocol timer, a command, or a
/// finished name lookup.
struct Driver {
    socket: UdpSocket,
    proxy: Proxy,
    commands: mpsc::UnboundedReceiver<Command>,
    resolved_tx: mpsc::UnboundedSender<(BindingHandle, Option<SocketAddr>)>,
    resolved: mpsc::UnboundedReceiver<(BindingHandle, Option<SocketAddr>)>,
    completions: FxHashMap<RequestId, oneshot::Sender<Result<Message, ForwardError>>>,
}

impl Driver {
    async fn run(mut self) {
        let mut buf = vec![0; MAX_DATAGRAM_SIZE];
        loop {
            self.flush().await;
            let deadline = self.proxy.next_timeout().map(tokio::time::Instant::from_std);
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, remote)) => {
                        self.proxy.handle_datagram(Instant::now(), remote, &buf[..len]);
                    }
                    Err(e) if transient(&e) => trace!("ignoring receive error: {e}"),
                    Err(e) => {
                        warn!("socket failed: {e}");
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Forward { request, completion }) => {
                        match self.proxy.submit(Instant::now(), request) {
                            Ok(id) => {
                                self.completions.insert(id, completion);
                            }
                            Err(e) => {
                                let _ = completion.send(Err(e));
                            }
                        }
                    }
                    Some(Command::Close) | None => break,
                },
                Some((binding, address)) = self.resolved.recv() => {
                    self.proxy.origin_resolved(Instant::now(), binding, address);
                },
                _ = sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if deadline.is_some() =>
                {
                    self.proxy.handle_timeout(Instant::now());
                },
            }
        }
        self.proxy.close(Instant::now());
        self.flush().await;
        debug!("driver exiting");
    }

    /// Put queued datagrams on the wire and act on queued events
    async fn flush(&mut self) {
        self.dispatch_events();
        while let Some(transmit) = self.proxy.poll_transmit() {
            match self
                .socket
                .send_to(&transmit.contents, transmit.destination)
                .await
            {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    // the network already knows nothing is listening there
                    debug!(remote = %transmit.destination, "destination unreachable");
                    self.proxy
                        .transport_error(Instant::now(), transmit.destination);
                }
                Err(e) => warn!(remote = %transmit.destination, "send failed: {e}"),
            }
        }
        self.dispatch_events();
    }

    fn dispatch_events(&mut self) {
        while let Some(event) = self.proxy.poll_event() {
            match event {
                ProxyEvent::ResolveOrigin {
                    binding,
                    host,
                    port,
                } => {
                    let outcomes = self.resolved_tx.clone();
                    tokio::spawn(async move {
                        let address = match lookup_host((host.as_str(), port)).await {
                            Ok(mut addresses) => addresses.next(),
                            Err(e) => {
                                debug!(host, "resolution failed: {e}");
                                None
                            }
                        };
                        let _ = outcomes.send((binding, address));
                    });
                }
                ProxyEvent::Completed { request, result } => {
                    if let Some(completion) = self.completions.remove(&request) {
                        let _ = completion.send(result);
                    }
                }
            }
        }
    }
}

/// Receive errors that do not indicate the socket itself is unusable
///
/// Some platforms surface ICMP errors from earlier sends as receive errors;
/// those concern one destination, not the socket.
fn transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
    )
}

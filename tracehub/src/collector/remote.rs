//! Client side of the collector wire protocol.

use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, PoisonError};

use rustls::{ClientConfig, ClientConnection, ServerName, StreamOwned};
use tracing::debug;

use crate::collector::wire::{self, CollectPacket};
use crate::collector::Collector;
use crate::error::CollectError;
use crate::span::{Annotations, SpanId};

/// Sends submissions to a remote [`CollectorServer`] over TCP, optionally
/// under TLS.
///
/// The connection is dialed lazily on first use. A failed write closes the
/// connection, redials once, and retries the same packet; only persistent
/// failure surfaces to the caller. A single mutex serializes both the
/// connection and the write sequence, so frames are never interleaved on
/// the wire.
///
/// [`CollectorServer`]: crate::collector::CollectorServer
pub struct RemoteCollector {
    addr: String,
    tls: Option<TlsClient>,
    conn: Mutex<Option<Conn>>,
}

struct TlsClient {
    config: Arc<ClientConfig>,
    server_name: ServerName,
}

enum Conn {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Conn {
    fn write_packet(&mut self, packet: &CollectPacket) -> io::Result<()> {
        match self {
            Conn::Plain(stream) => {
                wire::write_packet(stream, packet)?;
                stream.flush()
            }
            Conn::Tls(stream) => {
                wire::write_packet(stream.as_mut(), packet)?;
                stream.flush()
            }
        }
    }
}

impl RemoteCollector {
    /// A collector that dials `addr` over plain TCP.
    pub fn new(addr: impl Into<String>) -> RemoteCollector {
        RemoteCollector {
            addr: addr.into(),
            tls: None,
            conn: Mutex::new(None),
        }
    }

    /// A collector that dials `addr` under TLS. `server_name` must match
    /// the certificate presented by the server.
    pub fn with_tls(
        addr: impl Into<String>,
        server_name: ServerName,
        config: Arc<ClientConfig>,
    ) -> RemoteCollector {
        RemoteCollector {
            addr: addr.into(),
            tls: Some(TlsClient {
                config,
                server_name,
            }),
            conn: Mutex::new(None),
        }
    }

    /// Closes the connection, if any; the next submission redials.
    /// Idempotent.
    pub fn close(&self) {
        *self.conn.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn dial(&self) -> io::Result<Conn> {
        debug!(addr = %self.addr, "dialing collector server");
        let stream = TcpStream::connect(&self.addr)?;
        match &self.tls {
            None => Ok(Conn::Plain(stream)),
            Some(tls) => {
                let session =
                    ClientConnection::new(Arc::clone(&tls.config), tls.server_name.clone())
                        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
                Ok(Conn::Tls(Box::new(StreamOwned::new(session, stream))))
            }
        }
    }
}

impl Collector for RemoteCollector {
    fn collect(&self, id: SpanId, anns: Annotations) -> Result<(), CollectError> {
        let packet = CollectPacket::new(id, anns);
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        if guard.is_none() {
            *guard = Some(self.dial()?);
        }
        if let Some(conn) = guard.as_mut() {
            match conn.write_packet(&packet) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(error = %err, "collector write failed, reconnecting");
                    *guard = None;
                }
            }
        }

        // One reconnect per submission; a second failure is the caller's.
        let mut conn = self.dial()?;
        match conn.write_packet(&packet) {
            Ok(()) => {
                *guard = Some(conn);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

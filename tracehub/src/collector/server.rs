//! Server side of the collector wire protocol.

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::collector::{wire, Collector};

/// Accepts framed packet streams and forwards every decoded packet to the
/// wrapped collector.
///
/// Each connection is decoded on its own task until EOF. Accept errors
/// other than shutdown are logged and the loop continues. The server does
/// no authentication or integrity checking of its own; configure TLS for
/// both.
pub struct CollectorServer {
    collector: Arc<dyn Collector>,
    tls: Option<TlsAcceptor>,
    shutdown_tx: watch::Sender<bool>,
}

impl CollectorServer {
    pub fn new(collector: Arc<dyn Collector>) -> CollectorServer {
        let (shutdown_tx, _) = watch::channel(false);
        CollectorServer {
            collector,
            tls: None,
            shutdown_tx,
        }
    }

    /// Terminates every connection handshake with TLS.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> CollectorServer {
        self.tls = Some(acceptor);
        self
    }

    /// Runs the accept loop until [`CollectorServer::shutdown`] is called.
    ///
    /// Connections accepted before shutdown drain to EOF on their own
    /// tasks.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }
        info!(addr = %listener.local_addr()?, "collector server listening");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!("collector server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted collector connection");
                            let collector = Arc::clone(&self.collector);
                            match self.tls.clone() {
                                None => {
                                    tokio::spawn(async move {
                                        handle_conn(stream, collector).await;
                                    });
                                }
                                Some(acceptor) => {
                                    tokio::spawn(async move {
                                        match acceptor.accept(stream).await {
                                            Ok(tls_stream) => handle_conn(tls_stream, collector).await,
                                            Err(err) => {
                                                warn!(%peer, error = %err, "TLS handshake failed")
                                            }
                                        }
                                    });
                                }
                            }
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
            }
        }
    }

    /// Signals the accept loop to stop.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

async fn handle_conn<S: AsyncRead + Unpin>(mut stream: S, collector: Arc<dyn Collector>) {
    loop {
        match wire::read_packet(&mut stream).await {
            Ok(Some(packet)) => match packet.into_parts() {
                Ok((id, anns)) => {
                    if let Err(err) = collector.collect(id, anns) {
                        error!(%id, error = %err, "collect failed");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "malformed collect packet, dropping connection");
                    return;
                }
            },
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "collector connection read failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::collector::testing::RecordingCollector;
    use crate::collector::RemoteCollector;
    use crate::span::{Annotation, Annotations, Id, SpanId};

    fn span_id(trace: u64, span: u64, parent: u64) -> SpanId {
        SpanId {
            trace: Id(trace),
            span: Id(span),
            parent: Id(parent),
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forwards_packets_to_collector() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let sink = Arc::new(RecordingCollector::new());
        let server = Arc::new(CollectorServer::new(sink.clone()));
        let serving = Arc::clone(&server);
        tokio::spawn(async move {
            serving.serve(listener).await.unwrap();
        });

        let client = RemoteCollector::new(addr.to_string());
        tokio::task::spawn_blocking(move || {
            let anns: Annotations = vec![Annotation::new("k1", "v1")].into();
            client.collect(span_id(1, 2, 3), anns).unwrap();
            client
                .collect(span_id(2, 3, 4), vec![Annotation::new("k2", "v2")].into())
                .unwrap();
            client.close();
        })
        .await
        .unwrap();

        wait_for(|| sink.packets().len() == 2).await;
        let packets = sink.packets();
        assert_eq!(packets[0].0, span_id(1, 2, 3));
        assert_eq!(packets[0].1.get("k1"), Some(&b"v1"[..]));
        assert_eq!(packets[1].0, span_id(2, 3, 4));

        server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_reconnects_after_server_side_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let sink = Arc::new(RecordingCollector::new());
        let server = Arc::new(CollectorServer::new(sink.clone()));
        let serving = Arc::clone(&server);
        tokio::spawn(async move {
            serving.serve(listener).await.unwrap();
        });

        let client = Arc::new(RemoteCollector::new(addr.to_string()));
        let submit = Arc::clone(&client);
        tokio::task::spawn_blocking(move || {
            submit.collect(span_id(1, 2, 3), Annotations::new()).unwrap();
        })
        .await
        .unwrap();
        wait_for(|| sink.packets().len() == 1).await;

        // Simulate the server dropping the connection under the client.
        client.close();
        let submit = Arc::clone(&client);
        tokio::task::spawn_blocking(move || {
            submit.collect(span_id(2, 3, 4), Annotations::new()).unwrap();
        })
        .await
        .unwrap();

        wait_for(|| sink.packets().len() == 2).await;
        server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_submissions_all_arrive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let sink = Arc::new(RecordingCollector::new());
        let server = Arc::new(CollectorServer::new(sink.clone()));
        let serving = Arc::clone(&server);
        tokio::spawn(async move {
            serving.serve(listener).await.unwrap();
        });

        const N: usize = 500;
        let client = Arc::new(RemoteCollector::new(addr.to_string()));
        let submit = Arc::clone(&client);
        let sent = tokio::task::spawn_blocking(move || {
            let mut sent = Vec::with_capacity(N);
            for _ in 0..N {
                let id = SpanId::new_root();
                submit.collect(id, Annotations::new()).unwrap();
                sent.push(id);
            }
            sent
        })
        .await
        .unwrap();
        client.close();

        wait_for(|| sink.packets().len() == N).await;
        let got: std::collections::HashSet<SpanId> =
            sink.packets().into_iter().map(|(id, _)| id).collect();
        assert_eq!(got.len(), N);
        assert!(sent.iter().all(|id| got.contains(id)));

        server.shutdown();
    }
}

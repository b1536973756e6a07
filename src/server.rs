use crate::log_channels;
use crate::receiver::{handle_connection, Session, SessionContext};

/// The SMTP listener: accepts connections and serves each one from its
/// own task.
pub struct ServerOxmail {
    listener: tokio::net::TcpListener,
    ctx: SessionContext,
    counter_tx: tokio::sync::mpsc::UnboundedSender<i64>,
}

/// Decrements the live session count when the serving task ends, on every
/// exit path.
struct SessionCountGuard {
    tx: tokio::sync::mpsc::UnboundedSender<i64>,
}

impl Drop for SessionCountGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(-1);
    }
}

impl ServerOxmail {
    pub async fn new(
        config: std::sync::Arc<crate::config::Config>,
        db: crate::db::Db,
        store: std::sync::Arc<dyn crate::store::Storer>,
        publisher: std::sync::Arc<dyn crate::publish::QueuePublisher>,
        resolver: std::sync::Arc<dyn crate::resolver::Lookup>,
        scanner: Option<std::sync::Arc<dyn crate::scanner::Scanner>>,
    ) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind(&config.server.addr).await?;

        // the counter has a single owner task fed by a channel; everybody
        // else reads a weakly consistent snapshot
        let sessions = std::sync::Arc::new(std::sync::atomic::AtomicI64::new(0));
        let (counter_tx, mut counter_rx) = tokio::sync::mpsc::unbounded_channel::<i64>();
        let owned = sessions.clone();
        tokio::spawn(async move {
            while let Some(delta) = counter_rx.recv().await {
                owned.fetch_add(delta, std::sync::atomic::Ordering::Relaxed);
            }
        });

        Ok(Self {
            listener,
            ctx: SessionContext {
                config,
                db,
                store,
                publisher,
                resolver,
                scanner,
                sessions,
            },
            counter_tx,
        })
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.listener
            .local_addr()
            .expect("cannot retrieve local address")
    }

    pub async fn listen_and_serve(&self) -> std::io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, client_addr)) => {
                    log::info!(target: log_channels::SERVER, "connection from {}", client_addr);
                    let local_addr = match stream.local_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            log::error!(
                                target: log_channels::SERVER,
                                "cannot read the local address of {}: {}",
                                client_addr,
                                e
                            );
                            continue;
                        }
                    };

                    let ctx = self.ctx.clone();
                    let counter_tx = self.counter_tx.clone();
                    // counted before the greeting so admission sees itself
                    let _ = counter_tx.send(1);

                    tokio::spawn(async move {
                        let _guard = SessionCountGuard { tx: counter_tx };
                        let begin = std::time::Instant::now();
                        let session = Session::new(ctx, stream, client_addr, local_addr);
                        let uuid = session.uuid.clone();
                        match handle_connection(session).await {
                            Ok(()) => log::info!(
                                target: log_channels::SERVER,
                                "{{ elapsed: {:?} }} connection {} ({}) closed cleanly",
                                begin.elapsed(),
                                client_addr,
                                uuid,
                            ),
                            Err(e) => log::error!(
                                target: log_channels::SERVER,
                                "{{ elapsed: {:?} }} connection {} ({}) closed with an error: {:#}",
                                begin.elapsed(),
                                client_addr,
                                uuid,
                                e,
                            ),
                        }
                    });
                }
                Err(e) => {
                    log::error!(target: log_channels::SERVER, "error accepting socket; error = {:?}", e);
                }
            }
        }
    }
}

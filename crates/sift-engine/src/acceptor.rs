use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::{session, session_tls, EngineShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenerKind {
    Http,
    Tls,
}

/// Accept loop for one listener. Each accepted connection becomes its own
/// session task; a session failing never disturbs its siblings. The loop
/// exits when the shutdown signal flips.
pub(crate) async fn run_accept_loop(
    shared: Arc<EngineShared>,
    listener: TcpListener,
    kind: ListenerKind,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow() {
        return;
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, client_addr)) => {
                        let shared = Arc::clone(&shared);
                        tokio::spawn(async move {
                            let result = match kind {
                                ListenerKind::Http => {
                                    session::run_plain_session(Arc::clone(&shared), stream, client_addr).await
                                }
                                ListenerKind::Tls => {
                                    session_tls::run_tls_session(Arc::clone(&shared), stream, client_addr).await
                                }
                            };
                            if let Err(error) = result {
                                shared
                                    .reporter
                                    .warn(&format!("session for {client_addr} ended with error: {error}"));
                            }
                        });
                    }
                    Err(error) => {
                        shared.reporter.warn(&format!("accept failed: {error}"));
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

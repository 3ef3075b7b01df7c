use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use sift_http::{build_text_response, BufferedStream};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};

use crate::session::{connect_upstream, run_exchange_loop, with_deadline, ExchangeParams};
use crate::EngineShared;

/// TLS-terminated session: read SNI, acquire the spoofed leaf, complete both
/// handshakes, then run the same exchange loop as the plaintext variant over
/// the decrypted pipes.
pub(crate) async fn run_tls_session(
    shared: Arc<EngineShared>,
    stream: TcpStream,
    client_addr: SocketAddr,
) -> io::Result<()> {
    let original_destination = shared.diverter.lookup_original_destination(client_addr);

    // AwaitingSNI: the ClientHello names the origin; leaf selection cannot
    // happen before it arrives.
    let start = with_deadline(
        shared.config.handshake_timeout,
        "client hello read",
        LazyConfigAcceptor::new(Acceptor::default(), stream),
    )
    .await?;
    let sni = start.client_hello().server_name().map(str::to_string);

    let host = match sni.or_else(|| {
        original_destination
            .as_ref()
            .map(|(host, _)| host.clone())
    }) {
        Some(host) => host,
        None => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "TLS client sent no SNI and the diverter has no destination for it",
            ))
        }
    };
    let (upstream_host, upstream_port) = original_destination
        .unwrap_or_else(|| (host.clone(), 443));

    // AcquiringLeaf: singleflighted per host inside the store.
    let leaf = shared
        .cert_store
        .server_config_for(&host)
        .await
        .map_err(|error| {
            io::Error::other(format!("leaf issuance for {host} failed: {error}"))
        })?;

    let client_tls = with_deadline(
        shared.config.handshake_timeout,
        "client handshake",
        start.into_stream(Arc::clone(&leaf.server_config)),
    )
    .await?;
    let mut client = BufferedStream::new(client_tls);

    let upstream_tcp = match connect_upstream(&shared, &upstream_host, upstream_port).await {
        Ok(stream) => stream,
        Err(error) => {
            let response =
                build_text_response("502 Bad Gateway", &format!("upstream connect failed: {error}"));
            let _ = client.stream.write_all(&response).await;
            let _ = client.stream.shutdown().await;
            return Err(error);
        }
    };

    // Upstream TLS is verified against the configured CA bundle; a failed
    // validation surfaces to the client as an interstitial over the already
    // established client TLS, never as a silently bridged connection.
    let server_name = match ServerName::try_from(host.clone()) {
        Ok(name) => name,
        Err(_) => {
            let response = build_text_response("502 Bad Gateway", "invalid upstream server name");
            let _ = client.stream.write_all(&response).await;
            let _ = client.stream.shutdown().await;
            return Ok(());
        }
    };
    let connector = TlsConnector::from(Arc::clone(&shared.upstream_tls));
    let upstream_tls = match with_deadline(
        shared.config.handshake_timeout,
        "upstream handshake",
        connector.connect(server_name, upstream_tcp),
    )
    .await
    {
        Ok(stream) => stream,
        Err(error) => {
            shared.reporter.warn(&format!(
                "upstream TLS validation for {host} failed: {error}"
            ));
            let interstitial =
                build_upstream_failure_page(&shared.config.blocked_html_page, &host);
            let _ = client.stream.write_all(&interstitial).await;
            let _ = client.stream.shutdown().await;
            return Ok(());
        }
    };
    let mut upstream = BufferedStream::new(upstream_tls);

    let params = ExchangeParams {
        scheme: "https",
        default_port: 443,
        fallback_host: host,
    };
    run_exchange_loop(shared, &mut client, &mut upstream, params, None).await
}

fn build_upstream_failure_page(block_page_html: &str, host: &str) -> Vec<u8> {
    if block_page_html.is_empty() {
        return build_text_response(
            "502 Bad Gateway",
            &format!("upstream certificate for {host} could not be validated"),
        );
    }
    let mut response = format!(
        "HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
        block_page_html.len()
    )
    .into_bytes();
    response.extend_from_slice(block_page_html.as_bytes());
    response
}

#[cfg(test)]
mod tests {
    use super::build_upstream_failure_page;

    #[test]
    fn failure_page_prefers_the_configured_block_page() {
        let page = "<html><body>blocked</body></html>";
        let response =
            String::from_utf8(build_upstream_failure_page(page, "x.example.com")).expect("utf8");
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(response.contains("text/html"));
        assert!(response.ends_with(page));

        let bare =
            String::from_utf8(build_upstream_failure_page("", "x.example.com")).expect("utf8");
        assert!(bare.contains("x.example.com"));
    }
}

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use sift_http::{
    build_block_response, build_text_response, normalize_for_upstream, remove_elements, url_host,
    BodyReader, BufferedStream, RequestHead, ResponseHead,
};
use sift_policy::{
    infer_request_type, is_html_content_type, RequestContext, ResponseInspection, Verdict,
    OPTION_BLOCK_ON_SCAN_OVERFLOW,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::EngineShared;

const STREAM_CHUNK_SIZE: usize = 8 * 1024;

pub(crate) struct ExchangeParams {
    pub scheme: &'static str,
    /// Used for URLs when the request names no port of its own; the diverted
    /// transport port stays out of the URL.
    pub default_port: u16,
    /// Host from SNI or diversion, used when a request carries no usable
    /// Host of its own.
    pub fallback_host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExchangeEnd {
    KeepAlive,
    Close,
}

pub(crate) async fn with_deadline<T, F>(
    duration: std::time::Duration,
    what: &'static str,
    future: F,
) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{what} timed out"),
        )),
    }
}

/// Plaintext session: read client headers, decide, bridge to the diverted
/// upstream. CONNECT callers on this listener get a policy-checked blind
/// tunnel instead of interception.
pub(crate) async fn run_plain_session(
    shared: Arc<EngineShared>,
    stream: TcpStream,
    client_addr: SocketAddr,
) -> io::Result<()> {
    let original_destination = shared.diverter.lookup_original_destination(client_addr);
    let mut client = BufferedStream::new(stream);

    let head_raw = match with_deadline(
        shared.config.idle_keepalive_timeout,
        "client header read",
        client.read_head(shared.config.max_head_bytes),
    )
    .await?
    {
        Some(raw) => raw,
        None => return Ok(()),
    };

    let request = match RequestHead::parse(&head_raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            let response = build_text_response("400 Bad Request", "malformed request");
            let _ = client.stream.write_all(&response).await;
            return Err(error.into());
        }
    };

    if request.is_connect() {
        return run_connect_tunnel(shared, client, request).await;
    }

    // ResolvingUpstream: the diverted destination is authoritative; the Host
    // header only fills in when the diverter has no mapping for this client.
    let (request_host, request_port) = match request.host() {
        Some((host, port)) => (host, port),
        None => match &original_destination {
            Some((host, port)) => (host.clone(), Some(*port)),
            None => {
                let response =
                    build_text_response("400 Bad Request", "request has no resolvable host");
                let _ = client.stream.write_all(&response).await;
                return Ok(());
            }
        },
    };

    let (upstream_host, upstream_port) = original_destination
        .unwrap_or_else(|| (request_host.clone(), request_port.unwrap_or(80)));

    let params = ExchangeParams {
        scheme: "http",
        default_port: 80,
        fallback_host: request_host.clone(),
    };

    // The request decision runs before any upstream connection so blocked
    // requests never generate upstream traffic.
    let ctx = build_request_context(&request, &params);
    let verdict = shared.decision.decide_request(&ctx);
    if let Verdict::Block(category) = verdict {
        write_request_blocked(&shared, &mut client.stream, &request, category, &ctx.url).await?;
        return Ok(());
    }

    let upstream_stream = match connect_upstream(&shared, &upstream_host, upstream_port).await {
        Ok(stream) => stream,
        Err(error) => {
            let response =
                build_text_response("502 Bad Gateway", &format!("upstream connect failed: {error}"));
            let _ = client.stream.write_all(&response).await;
            return Err(error);
        }
    };
    let mut upstream = BufferedStream::new(upstream_stream);

    run_exchange_loop(
        shared,
        &mut client,
        &mut upstream,
        params,
        Some((request, verdict)),
    )
    .await
}

pub(crate) async fn connect_upstream(
    shared: &EngineShared,
    host: &str,
    port: u16,
) -> io::Result<TcpStream> {
    with_deadline(
        shared.config.connect_timeout,
        "upstream connect",
        TcpStream::connect((host, port)),
    )
    .await
}

/// Keep-alive exchange driver shared by the plaintext and TLS variants.
/// `first` carries the request (and its verdict) that the caller already
/// parsed while setting the bridge up. Both pipes get a graceful shutdown on
/// the way out so TLS peers see close_notify rather than a truncated stream.
pub(crate) async fn run_exchange_loop<C, U>(
    shared: Arc<EngineShared>,
    client: &mut BufferedStream<C>,
    upstream: &mut BufferedStream<U>,
    params: ExchangeParams,
    first: Option<(RequestHead, Verdict)>,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let result = exchange_loop_inner(&shared, client, upstream, &params, first).await;
    let _ = client.stream.shutdown().await;
    let _ = upstream.stream.shutdown().await;
    result
}

async fn exchange_loop_inner<C, U>(
    shared: &Arc<EngineShared>,
    client: &mut BufferedStream<C>,
    upstream: &mut BufferedStream<U>,
    params: &ExchangeParams,
    mut first: Option<(RequestHead, Verdict)>,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let (mut request, verdict) = match first.take() {
            Some(pending) => pending,
            None => {
                let head_raw = match with_deadline(
                    shared.config.idle_keepalive_timeout,
                    "client header read",
                    client.read_head(shared.config.max_head_bytes),
                )
                .await?
                {
                    Some(raw) => raw,
                    None => return Ok(()),
                };
                let request = RequestHead::parse(&head_raw)?;
                let ctx = build_request_context(&request, params);
                let verdict = shared.decision.decide_request(&ctx);
                (request, verdict)
            }
        };

        let ctx = build_request_context(&request, params);
        if let Verdict::Block(category) = verdict {
            return write_request_blocked(shared, &mut client.stream, &request, category, &ctx.url)
                .await;
        }

        let allowlisted = verdict == Verdict::Allow;
        let may_filter = !allowlisted && shared.decision.may_filter_response(&ctx.host);
        let request_close = request.connection_close;
        let request_method = request.method.clone();
        let request_body_mode = request.body_mode;

        normalize_for_upstream(&mut request, may_filter);
        if request.header("host").is_none() {
            request.set_header("host", &ctx.host);
        }
        upstream.stream.write_all(&request.serialize()).await?;
        BodyReader::new(client, request_body_mode)
            .copy_raw_to(&mut upstream.stream)
            .await?;

        let response_raw = match with_deadline(
            shared.config.idle_keepalive_timeout,
            "upstream header read",
            upstream.read_head(shared.config.max_head_bytes),
        )
        .await?
        {
            Some(raw) => raw,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upstream closed before response headers",
                ))
            }
        };
        let mut response = ResponseHead::parse(&response_raw, &request_method)?;
        let response_close = response.connection_close;

        let end = forward_response(shared, client, upstream, &mut response, &ctx, allowlisted)
            .await?;

        if request_close || response_close || end == ExchangeEnd::Close {
            return Ok(());
        }
    }
}

/// Response tap: stream through untouched, or buffer for trigger scan,
/// classifier and element rewrite, then re-frame.
async fn forward_response<C, U>(
    shared: &Arc<EngineShared>,
    client: &mut BufferedStream<C>,
    upstream: &mut BufferedStream<U>,
    response: &mut ResponseHead,
    ctx: &RequestContext,
    allowlisted: bool,
) -> io::Result<ExchangeEnd>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    // Allowlist verdicts veto every later decision point, the classifier
    // included.
    let inspection = if allowlisted {
        ResponseInspection::stream_through()
    } else {
        shared
            .decision
            .response_inspection(&ctx.host, response.content_type())
    };

    if !inspection.needs_body() {
        client.stream.write_all(&response.serialize()).await?;
        let body_mode = response.body_mode;
        BodyReader::new(upstream, body_mode)
            .copy_raw_to(&mut client.stream)
            .await?;
        return Ok(ExchangeEnd::KeepAlive);
    }

    let body_mode = response.body_mode;
    let mut reader = BodyReader::new(upstream, body_mode);
    let body = reader.read_to_cap(shared.config.max_scan_body_bytes).await?;

    if !body.complete {
        if shared
            .decision
            .options()
            .option_enabled(OPTION_BLOCK_ON_SCAN_OVERFLOW)
        {
            shared.reporter.warn(&format!(
                "response for {} exceeded the scan cap; blocking per policy",
                ctx.url
            ));
            let blocked = build_block_response(
                &shared.config.blocked_html_page,
                is_html_content_type(response.content_type()),
            );
            client.stream.write_all(&blocked).await?;
            return Ok(ExchangeEnd::Close);
        }

        shared.reporter.warn(&format!(
            "response for {} exceeded the scan cap; streaming unfiltered",
            ctx.url
        ));
        // Re-frame as close-delimited: part of the body is already decoded
        // in memory and the original framing no longer applies.
        response.remove_header("content-length");
        response.remove_header("transfer-encoding");
        response.set_header("connection", "close");
        client.stream.write_all(&response.serialize()).await?;
        client.stream.write_all(&body.bytes).await?;

        let mut chunk = [0_u8; STREAM_CHUNK_SIZE];
        loop {
            let read = reader.read_decoded(&mut chunk).await?;
            if read == 0 {
                break;
            }
            client.stream.write_all(&chunk[..read]).await?;
        }
        return Ok(ExchangeEnd::Close);
    }

    let mut body_bytes = body.bytes;

    if inspection.scan_text {
        if let Verdict::Block(category) = shared
            .decision
            .decide_response_body(&body_bytes, response.content_type())
        {
            shared
                .reporter
                .request_blocked(category, body_bytes.len() as u64, &ctx.url);
            let blocked = build_block_response(
                &shared.config.blocked_html_page,
                is_html_content_type(response.content_type()),
            );
            client.stream.write_all(&blocked).await?;
            return Ok(ExchangeEnd::Close);
        }
    }

    if !inspection.rewrite_selectors.is_empty() {
        match remove_elements(&body_bytes, &inspection.rewrite_selectors) {
            Ok(outcome) => {
                if outcome.invalid_selectors > 0 {
                    shared.reporter.warn(&format!(
                        "{} element selector(s) for {} failed to parse and were skipped",
                        outcome.invalid_selectors, ctx.host
                    ));
                }
                if outcome.removed > 0 {
                    shared.reporter.elements_blocked(outcome.removed, &ctx.url);
                    body_bytes = outcome.html;
                }
            }
            Err(error) => {
                shared.reporter.warn(&format!(
                    "element rewrite for {} failed, forwarding original body: {error}",
                    ctx.url
                ));
            }
        }
    }

    response.set_identity_body(body_bytes.len() as u64);
    client.stream.write_all(&response.serialize()).await?;
    client.stream.write_all(&body_bytes).await?;
    Ok(ExchangeEnd::KeepAlive)
}

/// CONNECT on the plain listener: policy check against the authority, then a
/// blind byte tunnel. Interception of TLS flows happens on the TLS listener,
/// not here.
async fn run_connect_tunnel(
    shared: Arc<EngineShared>,
    mut client: BufferedStream<TcpStream>,
    request: RequestHead,
) -> io::Result<()> {
    let (host, port) = match request.host() {
        Some((host, port)) => (host, port.unwrap_or(443)),
        None => {
            let response = build_text_response("400 Bad Request", "invalid CONNECT authority");
            let _ = client.stream.write_all(&response).await;
            return Ok(());
        }
    };

    let url = format!("https://{host}:{port}/");
    let ctx = RequestContext::new(url.clone(), host.clone()).with_method("CONNECT");
    if let Verdict::Block(category) = shared.decision.decide_request(&ctx) {
        return write_request_blocked(&shared, &mut client.stream, &request, category, &url).await;
    }

    let mut upstream = match connect_upstream(&shared, &host, port).await {
        Ok(stream) => stream,
        Err(error) => {
            let response =
                build_text_response("502 Bad Gateway", &format!("upstream connect failed: {error}"));
            let _ = client.stream.write_all(&response).await;
            return Err(error);
        }
    };

    client
        .stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    if !client.read_buf.is_empty() {
        upstream.write_all(&client.read_buf).await?;
        client.read_buf.clear();
    }

    tokio::io::copy_bidirectional(&mut client.stream, &mut upstream)
        .await
        .map(|_| ())
}

pub(crate) async fn write_request_blocked<W: AsyncWrite + Unpin>(
    shared: &EngineShared,
    sink: &mut W,
    request: &RequestHead,
    category: u8,
    url: &str,
) -> io::Result<()> {
    let wants_html = request
        .header("accept")
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false);
    let response = build_block_response(&shared.config.blocked_html_page, wants_html);
    sink.write_all(&response).await?;
    shared.reporter.request_blocked(category, 0, url);
    Ok(())
}

pub(crate) fn build_request_context(request: &RequestHead, params: &ExchangeParams) -> RequestContext {
    let (host, port) = request
        .host()
        .map(|(host, port)| (host, port.unwrap_or(params.default_port)))
        .unwrap_or_else(|| (params.fallback_host.clone(), params.default_port));

    let target = request.origin_form_target();
    let url = if port == params.default_port {
        format!("{}://{}{}", params.scheme, host, target)
    } else {
        format!("{}://{}:{}{}", params.scheme, host, port, target)
    };

    let referer_host = request.header("referer").and_then(url_host);
    let third_party = referer_host
        .as_deref()
        .map(|referer| !same_site(referer, &host))
        .unwrap_or(false);
    let request_type = infer_request_type(&target, request.header("accept"));

    let mut ctx = RequestContext::new(url, host)
        .with_method(request.method.clone())
        .with_request_type(request_type)
        .with_third_party(third_party);
    if let Some(referer_host) = referer_host {
        ctx = ctx.with_referer_host(referer_host);
    }
    ctx
}

/// Same registrable site, approximated by the last two host labels; no
/// public-suffix list is consulted.
pub(crate) fn same_site(a: &str, b: &str) -> bool {
    fn site_of(host: &str) -> &str {
        let mut labels = host.rsplitn(3, '.');
        let tld = labels.next().unwrap_or(host);
        match labels.next() {
            Some(second) => &host[host.len() - tld.len() - second.len() - 1..],
            None => host,
        }
    }
    site_of(a).eq_ignore_ascii_case(site_of(b))
}

#[cfg(test)]
mod tests {
    use sift_http::RequestHead;
    use sift_policy::RequestTypeMask;

    use super::{build_request_context, same_site, ExchangeParams};

    fn params() -> ExchangeParams {
        ExchangeParams {
            scheme: "http",
            default_port: 80,
            fallback_host: "fallback.example.com".to_string(),
        }
    }

    #[test]
    fn same_site_compares_registrable_suffix() {
        assert!(same_site("www.example.com", "cdn.example.com"));
        assert!(same_site("example.com", "example.com"));
        assert!(!same_site("example.com", "example.org"));
        assert!(!same_site("ads.tracker.net", "example.com"));
    }

    #[test]
    fn context_carries_url_host_and_third_party_bit() {
        let raw = b"GET /ad.js HTTP/1.1\r\nHost: cdn.net\r\nReferer: http://www.example.com/page\r\nAccept: */*\r\n\r\n";
        let request = RequestHead::parse(raw).expect("parse");
        let ctx = build_request_context(&request, &params());

        assert_eq!(ctx.url, "http://cdn.net/ad.js");
        assert_eq!(ctx.host, "cdn.net");
        assert_eq!(ctx.referer_host.as_deref(), Some("www.example.com"));
        assert!(ctx.third_party);
        assert_eq!(ctx.request_type, RequestTypeMask::SCRIPT);
    }

    #[test]
    fn context_includes_nonstandard_port_in_url() {
        let raw = b"GET /x HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        let request = RequestHead::parse(raw).expect("parse");
        let ctx = build_request_context(&request, &params());
        assert_eq!(ctx.url, "http://example.com:8080/x");
    }

    #[test]
    fn context_falls_back_to_diverted_host_without_host_header() {
        let raw = b"GET /x HTTP/1.0\r\n\r\n";
        let request = RequestHead::parse(raw).expect("parse");
        let ctx = build_request_context(&request, &params());
        assert_eq!(ctx.host, "fallback.example.com");
        assert_eq!(ctx.url, "http://fallback.example.com/x");
    }
}

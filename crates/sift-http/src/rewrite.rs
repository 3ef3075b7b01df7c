use std::borrow::Cow;
use std::cell::Cell;
use std::rc::Rc;

use lol_html::{ElementContentHandlers, HtmlRewriter, Selector, Settings};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("html rewrite failed: {0}")]
    Rewrite(#[from] lol_html::errors::RewritingError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub html: Vec<u8>,
    /// Number of subtrees removed.
    pub removed: u32,
    /// Selectors that failed to parse and were skipped.
    pub invalid_selectors: u32,
}

/// Remove every subtree matching one of `selectors` from `html` and re-emit
/// the document. The rewriter is error-tolerant: malformed markup passes
/// through untouched instead of failing the response.
pub fn remove_elements(html: &[u8], selectors: &[String]) -> Result<RewriteOutcome, RewriteError> {
    let removed = Rc::new(Cell::new(0_u32));
    let mut invalid_selectors = 0_u32;

    let mut handlers: Vec<(Cow<'_, Selector>, ElementContentHandlers<'_>)> = Vec::new();
    for selector in selectors {
        let parsed = match selector.parse::<Selector>() {
            Ok(parsed) => parsed,
            Err(_) => {
                invalid_selectors += 1;
                continue;
            }
        };
        let counter = Rc::clone(&removed);
        handlers.push((
            Cow::Owned(parsed),
            ElementContentHandlers::default().element(move |element| {
                element.remove();
                counter.set(counter.get() + 1);
                Ok(())
            }),
        ));
    }

    if handlers.is_empty() {
        return Ok(RewriteOutcome {
            html: html.to_vec(),
            removed: 0,
            invalid_selectors,
        });
    }

    let mut output = Vec::with_capacity(html.len());
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            ..Settings::default()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );
    rewriter.write(html)?;
    rewriter.end()?;

    Ok(RewriteOutcome {
        html: output,
        removed: removed.get(),
        invalid_selectors,
    })
}

/// The 403 sent in place of blocked content: the configured block page for
/// clients that asked for HTML, an empty body for everything else.
pub fn build_block_response(block_page_html: &str, client_accepts_html: bool) -> Vec<u8> {
    let body = if client_accepts_html {
        block_page_html
    } else {
        ""
    };
    let mut response = String::from("HTTP/1.1 403 Forbidden\r\nConnection: close\r\n");
    if !body.is_empty() {
        response.push_str("Content-Type: text/html; charset=utf-8\r\n");
    }
    response.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body.as_bytes());
    bytes
}

/// Small plain-text response for proxy-level failures (502 and friends).
pub fn build_text_response(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

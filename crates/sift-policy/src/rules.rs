use bitflags::bitflags;
use thiserror::Error;

use crate::RequestContext;

bitflags! {
    /// Request classes a filter can be scoped to with `$script,image,...`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestTypeMask: u32 {
        const SCRIPT = 1 << 0;
        const IMAGE = 1 << 1;
        const STYLESHEET = 1 << 2;
        const OBJECT = 1 << 3;
        const SUBDOCUMENT = 1 << 4;
        const DOCUMENT = 1 << 5;
        const XMLHTTPREQUEST = 1 << 6;
        const FONT = 1 << 7;
        const MEDIA = 1 << 8;
        const WEBSOCKET = 1 << 9;
        const PING = 1 << 10;
        const OTHER = 1 << 11;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PartyMask: u8 {
        const FIRST_PARTY = 1 << 0;
        const THIRD_PARTY = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RulePattern {
    /// `||host^rest`: anchored at a host label boundary, remainder pattern
    /// applied to the URL after the matched host.
    HostAnchor { host: String, remainder: String },
    /// `|prefix`: anchored at the start of the URL.
    LeftAnchor(String),
    /// Free substring, `*` and `^` wildcards.
    Substring(String),
}

/// One parsed Adblock-Plus filter entry. Immutable after parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub pattern: RulePattern,
    pub allow: bool,
    pub category: u8,
    /// Empty mask means the rule applies to every request type.
    pub type_mask: RequestTypeMask,
    /// Empty mask means the rule applies to both parties.
    pub party_mask: PartyMask,
    pub match_case: bool,
    pub include_domains: Vec<String>,
    pub exclude_domains: Vec<String>,
}

/// A CSS element-hiding entry: `##selector` or `a.com,b.com##selector`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRule {
    pub selector: String,
    /// Empty means the selector applies on every domain.
    pub domains: Vec<String>,
    pub category: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Comment,
    Filter(FilterRule),
    Element(ElementRule),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("unknown filter option: {0}")]
    UnknownOption(String),
    #[error("unsupported selector syntax: {0}")]
    UnsupportedSelector(String),
    #[error("selector is empty")]
    EmptySelector,
    #[error("filter pattern is empty")]
    EmptyPattern,
    #[error("host anchor has no usable host: {0}")]
    InvalidHostAnchor(String),
}

pub fn parse_rule_line(raw_line: &str, category: u8) -> Result<ParsedLine, RuleParseError> {
    let line = raw_line.trim();
    if line.is_empty() || line.starts_with('!') {
        return Ok(ParsedLine::Comment);
    }

    if line.contains("#@#") || line.contains("#?#") {
        return Err(RuleParseError::UnsupportedSelector(line.to_string()));
    }

    if let Some(separator) = line.find("##") {
        let selector = line[separator + 2..].trim();
        if selector.is_empty() {
            return Err(RuleParseError::EmptySelector);
        }
        let domains = line[..separator]
            .split(',')
            .map(|domain| domain.trim().to_ascii_lowercase())
            .filter(|domain| !domain.is_empty())
            .collect();
        return Ok(ParsedLine::Element(ElementRule {
            selector: selector.to_string(),
            domains,
            category,
        }));
    }

    let (allow, line) = match line.strip_prefix("@@") {
        Some(rest) => (true, rest.trim_start()),
        None => (false, line),
    };

    let (pattern_text, options_text) = match line.find('$') {
        Some(position) => (&line[..position], Some(&line[position + 1..])),
        None => (line, None),
    };

    let options = match options_text {
        Some(text) => parse_filter_options(text)?,
        None => FilterOptions::default(),
    };

    let pattern = parse_pattern(pattern_text.trim(), options.match_case)?;

    Ok(ParsedLine::Filter(FilterRule {
        pattern,
        allow,
        category,
        type_mask: options.type_mask,
        party_mask: options.party_mask,
        match_case: options.match_case,
        include_domains: options.include_domains,
        exclude_domains: options.exclude_domains,
    }))
}

#[derive(Debug, Default)]
struct FilterOptions {
    type_mask: RequestTypeMask,
    party_mask: PartyMask,
    match_case: bool,
    include_domains: Vec<String>,
    exclude_domains: Vec<String>,
}

fn parse_filter_options(text: &str) -> Result<FilterOptions, RuleParseError> {
    let mut options = FilterOptions::default();
    let mut excluded_types = RequestTypeMask::empty();

    for raw in text.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let lower = raw.to_ascii_lowercase();

        if lower == "match-case" {
            options.match_case = true;
            continue;
        }
        if lower == "third-party" {
            options.party_mask |= PartyMask::THIRD_PARTY;
            continue;
        }
        if lower == "~third-party" {
            options.party_mask |= PartyMask::FIRST_PARTY;
            continue;
        }
        if let Some(domains) = lower.strip_prefix("domain=") {
            for entry in domains.split('|') {
                let entry = entry.trim();
                if entry.is_empty() {
                    continue;
                }
                match entry.strip_prefix('~') {
                    Some(excluded) => options.exclude_domains.push(excluded.to_string()),
                    None => options.include_domains.push(entry.to_string()),
                }
            }
            continue;
        }

        let (negated, name) = match lower.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, lower.as_str()),
        };
        match request_type_for_option(name) {
            Some(mask) if negated => excluded_types |= mask,
            Some(mask) => options.type_mask |= mask,
            None => return Err(RuleParseError::UnknownOption(raw.to_string())),
        }
    }

    if !excluded_types.is_empty() {
        let base = if options.type_mask.is_empty() {
            RequestTypeMask::all()
        } else {
            options.type_mask
        };
        options.type_mask = base - excluded_types;
    }

    Ok(options)
}

fn request_type_for_option(name: &str) -> Option<RequestTypeMask> {
    match name {
        "script" => Some(RequestTypeMask::SCRIPT),
        "image" => Some(RequestTypeMask::IMAGE),
        "stylesheet" => Some(RequestTypeMask::STYLESHEET),
        "object" => Some(RequestTypeMask::OBJECT),
        "subdocument" => Some(RequestTypeMask::SUBDOCUMENT),
        "document" => Some(RequestTypeMask::DOCUMENT),
        "xmlhttprequest" => Some(RequestTypeMask::XMLHTTPREQUEST),
        "font" => Some(RequestTypeMask::FONT),
        "media" => Some(RequestTypeMask::MEDIA),
        "websocket" => Some(RequestTypeMask::WEBSOCKET),
        "ping" => Some(RequestTypeMask::PING),
        "other" => Some(RequestTypeMask::OTHER),
        _ => None,
    }
}

fn parse_pattern(text: &str, match_case: bool) -> Result<RulePattern, RuleParseError> {
    if text.is_empty() {
        return Err(RuleParseError::EmptyPattern);
    }

    if let Some(rest) = text.strip_prefix("||") {
        let rest = rest.strip_prefix('.').unwrap_or(rest);
        let host_end = rest
            .find(|c: char| matches!(c, '^' | '/' | '*' | '?' | ':' | '|' | '#'))
            .unwrap_or(rest.len());
        let host = rest[..host_end].to_ascii_lowercase();
        if host.is_empty() || !is_plausible_host(&host) {
            return Err(RuleParseError::InvalidHostAnchor(text.to_string()));
        }
        let remainder = rest[host_end..].trim_end_matches('|');
        let remainder = if match_case {
            remainder.to_string()
        } else {
            remainder.to_ascii_lowercase()
        };
        return Ok(RulePattern::HostAnchor { host, remainder });
    }

    let (left_anchor, body) = match text.strip_prefix('|') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let body = body.trim_end_matches('|');
    if body.is_empty() {
        return Err(RuleParseError::EmptyPattern);
    }
    let body = if match_case {
        body.to_string()
    } else {
        body.to_ascii_lowercase()
    };

    Ok(if left_anchor {
        RulePattern::LeftAnchor(body)
    } else {
        RulePattern::Substring(body)
    })
}

fn is_plausible_host(host: &str) -> bool {
    host.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
}

impl FilterRule {
    /// Whether this rule matches the given request. `url_lower` must be the
    /// lowercased form of `ctx.url`; callers compute it once per query.
    pub fn matches(&self, ctx: &RequestContext, url_lower: &str) -> bool {
        if !self.type_matches(ctx) || !self.party_matches(ctx) || !self.domain_matches(ctx) {
            return false;
        }

        let haystack = if self.match_case {
            ctx.url.as_str()
        } else {
            url_lower
        };

        match &self.pattern {
            RulePattern::HostAnchor { host, remainder } => {
                if !host_matches(host, &ctx.host) {
                    return false;
                }
                if remainder.is_empty() {
                    return true;
                }
                match url_host_end(haystack) {
                    Some(host_end) => {
                        pattern_matches_at(remainder.as_bytes(), &haystack.as_bytes()[host_end..])
                    }
                    None => false,
                }
            }
            RulePattern::LeftAnchor(pattern) => {
                pattern_matches_at(pattern.as_bytes(), haystack.as_bytes())
            }
            RulePattern::Substring(pattern) => {
                pattern_matches_anywhere(pattern.as_bytes(), haystack.as_bytes())
            }
        }
    }

    fn type_matches(&self, ctx: &RequestContext) -> bool {
        self.type_mask.is_empty() || self.type_mask.intersects(ctx.request_type)
    }

    fn party_matches(&self, ctx: &RequestContext) -> bool {
        if self.party_mask.is_empty() {
            return true;
        }
        if ctx.third_party {
            self.party_mask.contains(PartyMask::THIRD_PARTY)
        } else {
            self.party_mask.contains(PartyMask::FIRST_PARTY)
        }
    }

    fn domain_matches(&self, ctx: &RequestContext) -> bool {
        let page_host = ctx.referer_host.as_deref().unwrap_or(&ctx.host);
        if !self.include_domains.is_empty()
            && !self
                .include_domains
                .iter()
                .any(|domain| host_matches(domain, page_host))
        {
            return false;
        }
        !self
            .exclude_domains
            .iter()
            .any(|domain| host_matches(domain, page_host))
    }
}

/// Exact host or dot-separated subdomain of `rule_host`.
pub fn host_matches(rule_host: &str, host: &str) -> bool {
    if host == rule_host {
        return true;
    }
    host.len() > rule_host.len()
        && host.ends_with(rule_host)
        && host.as_bytes()[host.len() - rule_host.len() - 1] == b'.'
}

/// Byte offset just past the host portion of `scheme://host[:port]/...`.
fn url_host_end(url: &str) -> Option<usize> {
    let authority_start = url.find("://")? + 3;
    let authority = &url[authority_start..];
    let host_len = authority
        .find(|c: char| matches!(c, ':' | '/' | '?' | '#'))
        .unwrap_or(authority.len());
    Some(authority_start + host_len)
}

/// `*` matches any run of characters; `^` matches one separator character
/// (anything that is not alphanumeric, `_`, `-`, `.` or `%`) or the end of
/// the input.
fn pattern_matches_at(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.first() {
        None => true,
        Some(b'*') => (0..=text.len()).any(|skip| pattern_matches_at(&pattern[1..], &text[skip..])),
        Some(b'^') => match text.first() {
            None => pattern_matches_at(&pattern[1..], text),
            Some(&byte) if is_separator(byte) => pattern_matches_at(&pattern[1..], &text[1..]),
            Some(_) => false,
        },
        Some(&expected) => {
            text.first() == Some(&expected) && pattern_matches_at(&pattern[1..], &text[1..])
        }
    }
}

fn pattern_matches_anywhere(pattern: &[u8], text: &[u8]) -> bool {
    (0..=text.len()).any(|start| pattern_matches_at(pattern, &text[start..]))
}

fn is_separator(byte: u8) -> bool {
    !(byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.' | b'%'))
}

/// Best-effort request classification from the URL path and Accept header,
/// used to evaluate `$script`-style options against intercepted traffic.
pub fn infer_request_type(path: &str, accept: Option<&str>) -> RequestTypeMask {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let extension = path
        .rsplit('/')
        .next()
        .and_then(|segment| segment.rsplit_once('.'))
        .map(|(_, extension)| extension.to_ascii_lowercase());

    if let Some(extension) = extension {
        match extension.as_str() {
            "js" | "mjs" => return RequestTypeMask::SCRIPT,
            "css" => return RequestTypeMask::STYLESHEET,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "ico" | "svg" | "bmp" | "avif" => {
                return RequestTypeMask::IMAGE
            }
            "woff" | "woff2" | "ttf" | "otf" | "eot" => return RequestTypeMask::FONT,
            "mp4" | "webm" | "ogg" | "mp3" | "m4a" | "aac" | "wav" => {
                return RequestTypeMask::MEDIA
            }
            "swf" => return RequestTypeMask::OBJECT,
            _ => {}
        }
    }

    if let Some(accept) = accept {
        if accept.contains("text/html") || accept.contains("application/xhtml") {
            return RequestTypeMask::DOCUMENT;
        }
        if accept.contains("text/css") {
            return RequestTypeMask::STYLESHEET;
        }
        if accept.starts_with("image/") {
            return RequestTypeMask::IMAGE;
        }
        if accept.contains("application/json") {
            return RequestTypeMask::XMLHTTPREQUEST;
        }
    }

    RequestTypeMask::OTHER
}

#[cfg(test)]
mod tests {
    use super::{
        host_matches, infer_request_type, parse_rule_line, ElementRule, ParsedLine, PartyMask,
        RequestTypeMask, RuleParseError, RulePattern,
    };
    use crate::RequestContext;

    fn parse_filter(line: &str) -> super::FilterRule {
        match parse_rule_line(line, 1).expect("rule must parse") {
            ParsedLine::Filter(rule) => rule,
            other => panic!("expected filter rule, got {other:?}"),
        }
    }

    #[test]
    fn blank_and_bang_lines_are_comments() {
        assert_eq!(parse_rule_line("", 1), Ok(ParsedLine::Comment));
        assert_eq!(parse_rule_line("   ", 1), Ok(ParsedLine::Comment));
        assert_eq!(
            parse_rule_line("! EasyList comment", 1),
            Ok(ParsedLine::Comment)
        );
    }

    #[test]
    fn parses_host_anchor_rule() {
        let rule = parse_filter("||ads.example.com^");
        assert!(!rule.allow);
        assert_eq!(
            rule.pattern,
            RulePattern::HostAnchor {
                host: "ads.example.com".to_string(),
                remainder: "^".to_string(),
            }
        );
    }

    #[test]
    fn parses_allowlist_rule_with_options() {
        let rule = parse_filter("@@||example.com/allowed^$script,third-party");
        assert!(rule.allow);
        assert_eq!(rule.type_mask, RequestTypeMask::SCRIPT);
        assert_eq!(rule.party_mask, PartyMask::THIRD_PARTY);
    }

    #[test]
    fn parses_domain_option_with_exclusions() {
        let rule = parse_filter("/banner/*$domain=example.com|~shop.example.com");
        assert_eq!(rule.include_domains, vec!["example.com".to_string()]);
        assert_eq!(rule.exclude_domains, vec!["shop.example.com".to_string()]);
    }

    #[test]
    fn negated_type_options_subtract_from_all() {
        let rule = parse_filter("||example.com^$~image");
        assert!(rule.type_mask.contains(RequestTypeMask::SCRIPT));
        assert!(!rule.type_mask.contains(RequestTypeMask::IMAGE));
    }

    #[test]
    fn unknown_option_fails_the_rule() {
        assert_eq!(
            parse_rule_line("||example.com^$frobnicate", 1),
            Err(RuleParseError::UnknownOption("frobnicate".to_string()))
        );
    }

    #[test]
    fn parses_global_element_selector() {
        assert_eq!(
            parse_rule_line("##.ad-banner", 2),
            Ok(ParsedLine::Element(ElementRule {
                selector: ".ad-banner".to_string(),
                domains: vec![],
                category: 2,
            }))
        );
    }

    #[test]
    fn parses_domain_scoped_element_selector() {
        assert_eq!(
            parse_rule_line("example.com,news.example.org##.ad-slot", 1),
            Ok(ParsedLine::Element(ElementRule {
                selector: ".ad-slot".to_string(),
                domains: vec!["example.com".to_string(), "news.example.org".to_string()],
                category: 1,
            }))
        );
    }

    #[test]
    fn exception_selectors_are_unsupported() {
        assert!(matches!(
            parse_rule_line("example.com#@#.ad-slot", 1),
            Err(RuleParseError::UnsupportedSelector(_))
        ));
    }

    #[test]
    fn host_anchor_matches_host_and_subdomains() {
        let rule = parse_filter("||example.com^");
        let ctx = RequestContext::new("http://example.com/index.html", "example.com");
        assert!(rule.matches(&ctx, &ctx.url.to_ascii_lowercase()));

        let sub = RequestContext::new("http://ads.example.com/banner.gif", "ads.example.com");
        assert!(rule.matches(&sub, &sub.url.to_ascii_lowercase()));

        let other = RequestContext::new("http://notexample.com/", "notexample.com");
        assert!(!rule.matches(&other, &other.url.to_ascii_lowercase()));
    }

    #[test]
    fn host_anchor_remainder_constrains_the_path() {
        let rule = parse_filter("||example.com/allowed^");
        let hit = RequestContext::new("http://example.com/allowed/x", "example.com");
        assert!(rule.matches(&hit, &hit.url.to_ascii_lowercase()));

        let miss = RequestContext::new("http://example.com/other/x", "example.com");
        assert!(!rule.matches(&miss, &miss.url.to_ascii_lowercase()));
    }

    #[test]
    fn separator_matches_port_boundary_and_end_of_input() {
        let rule = parse_filter("||example.com^");
        let with_port = RequestContext::new("http://example.com:8080/x", "example.com");
        assert!(rule.matches(&with_port, &with_port.url.to_ascii_lowercase()));

        let bare = RequestContext::new("http://example.com", "example.com");
        assert!(rule.matches(&bare, &bare.url.to_ascii_lowercase()));
    }

    #[test]
    fn substring_pattern_with_wildcard_matches_across_segments() {
        let rule = parse_filter("/banner/*/ad.");
        let ctx = RequestContext::new(
            "http://cdn.example.com/banner/2024/ad.png",
            "cdn.example.com",
        );
        assert!(rule.matches(&ctx, &ctx.url.to_ascii_lowercase()));
    }

    #[test]
    fn left_anchor_only_matches_url_prefix() {
        let rule = parse_filter("|http://tracker.");
        let hit = RequestContext::new("http://tracker.example.net/p", "tracker.example.net");
        assert!(rule.matches(&hit, &hit.url.to_ascii_lowercase()));

        let miss = RequestContext::new("http://example.net/tracker.js", "example.net");
        assert!(!rule.matches(&miss, &miss.url.to_ascii_lowercase()));
    }

    #[test]
    fn matching_is_case_insensitive_unless_match_case() {
        let insensitive = parse_filter("/Banner/");
        let ctx = RequestContext::new("http://example.com/BANNER/x", "example.com");
        assert!(insensitive.matches(&ctx, &ctx.url.to_ascii_lowercase()));

        let sensitive = parse_filter("/Banner/$match-case");
        assert!(!sensitive.matches(&ctx, &ctx.url.to_ascii_lowercase()));
    }

    #[test]
    fn third_party_option_respects_context_bit() {
        let rule = parse_filter("||cdn.example.com^$third-party");
        let ctx = RequestContext::new("http://cdn.example.com/lib.js", "cdn.example.com")
            .with_third_party(true);
        assert!(rule.matches(&ctx, &ctx.url.to_ascii_lowercase()));

        let first_party = ctx.clone().with_third_party(false);
        assert!(!rule.matches(&first_party, &first_party.url.to_ascii_lowercase()));
    }

    #[test]
    fn typed_rule_does_not_match_untyped_request() {
        let rule = parse_filter("||example.com^$script");
        let untyped = RequestContext::new("http://example.com/x", "example.com");
        assert!(!rule.matches(&untyped, &untyped.url.to_ascii_lowercase()));

        let scripted = untyped
            .clone()
            .with_request_type(RequestTypeMask::SCRIPT);
        assert!(rule.matches(&scripted, &scripted.url.to_ascii_lowercase()));
    }

    #[test]
    fn domain_option_applies_to_the_referring_page() {
        let rule = parse_filter("/ad.js$domain=example.com");
        let from_example = RequestContext::new("http://cdn.net/ad.js", "cdn.net")
            .with_referer_host("www.example.com");
        assert!(rule.matches(&from_example, &from_example.url.to_ascii_lowercase()));

        let from_elsewhere =
            RequestContext::new("http://cdn.net/ad.js", "cdn.net").with_referer_host("other.org");
        assert!(!rule.matches(&from_elsewhere, &from_elsewhere.url.to_ascii_lowercase()));
    }

    #[test]
    fn host_matches_requires_label_boundary() {
        assert!(host_matches("example.com", "example.com"));
        assert!(host_matches("example.com", "ads.example.com"));
        assert!(!host_matches("example.com", "notexample.com"));
        assert!(!host_matches("ads.example.com", "example.com"));
    }

    #[test]
    fn infers_request_types_from_extension_and_accept() {
        assert_eq!(
            infer_request_type("/static/app.js", None),
            RequestTypeMask::SCRIPT
        );
        assert_eq!(
            infer_request_type("/img/logo.png?v=2", None),
            RequestTypeMask::IMAGE
        );
        assert_eq!(
            infer_request_type("/page", Some("text/html,application/xhtml+xml")),
            RequestTypeMask::DOCUMENT
        );
        assert_eq!(infer_request_type("/data", None), RequestTypeMask::OTHER);
    }

    mod pattern_properties {
        use proptest::prelude::*;

        use super::super::{pattern_matches_anywhere, pattern_matches_at};

        proptest! {
            #[test]
            fn literal_patterns_agree_with_substring_search(
                pattern in "[a-z0-9/]{1,8}",
                text in "[a-z0-9/]{0,32}",
            ) {
                let expected = text.contains(&pattern);
                prop_assert_eq!(
                    pattern_matches_anywhere(pattern.as_bytes(), text.as_bytes()),
                    expected
                );
            }

            #[test]
            fn every_text_matches_itself_anchored(text in "[a-z0-9/._-]{0,32}") {
                prop_assert!(pattern_matches_at(text.as_bytes(), text.as_bytes()));
            }

            #[test]
            fn lone_star_matches_everything(text in ".{0,32}") {
                prop_assert!(pattern_matches_at(b"*", text.as_bytes()));
            }
        }
    }
}

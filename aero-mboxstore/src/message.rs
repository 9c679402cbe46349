//! RFC 5322/2046/2231 message parser (§4.8).
//!
//! Feeds the cache manager: given the raw bytes of a spool message, produce
//! a [`Body`] tree plus, for the top-level call, the envelope-ish fields
//! (`from`/`to`/address lists, subject, message-id, references...) and the
//! concatenated "cache headers" buffer IMAP's `BODY.PEEK[HEADER]` serves
//! out of the index/cache rather than re-reading the spool file.
//!
//! Address-list parsing is delegated to `eml_codec::parse_imf`, already
//! used for exactly this purpose elsewhere in this codebase; everything
//! this engine's own invariants depend on byte-for-byte — Content-Type/
//! Content-Disposition parameter parsing (RFC 2231 continuations,
//! attribute case-folding), References concatenation, received-date
//! selection and cache-header selection — is parsed directly off the raw
//! header bytes here, so this crate's behavior does not drift if the MIME
//! library changes how it represents those fields internally.

use crate::ident::MessageGuid;

/// A single RFC 5322 mailbox reference (§4.8 "parsed RFC 5322 addresses").
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Address {
    pub name: Option<String>,
    pub route: Option<String>,
    pub mailbox: Option<String>,
    pub domain: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Disposition {
    pub kind: String,
    pub params: Vec<Param>,
}

/// A node of the MIME body tree (§4.8: "type, subtype, parameter map...").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Body {
    pub type_: String,
    pub subtype: String,
    pub params: Vec<Param>,
    pub disposition: Option<Disposition>,
    pub language: Vec<String>,
    pub transfer_encoding: String,
    pub id: Option<String>,
    pub description: Option<String>,
    pub md5: Option<String>,
    pub lines: Option<u32>,
    pub length: u32,
    pub subparts: Vec<Body>,
    /// Byte offset ranges of each subpart's content within this part's
    /// body, in subpart order (§4.8 "boundary offsets").
    pub boundary_offsets: Vec<(usize, usize)>,
}

/// The top-level parse result for a whole message (§4.8).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedMessage {
    pub body: Body,
    pub from: Vec<Address>,
    pub sender: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub date: Option<String>,
    pub subject: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: String,
    pub message_id: Option<String>,
    pub x_me_message_id: Option<String>,
    pub received_date: Option<String>,
    pub cache_headers: Vec<u8>,
    pub guid: MessageGuid,
}

/// Minimum index-record `cache_version` a header name belongs in the
/// cache-headers buffer for (§4.8 "Cache-header selection"). Anything not
/// listed, and any `X-` header not explicitly listed, is dropped.
const CACHE_HEADERS: &[(&str, u32)] = &[
    ("subject", 0),
    ("from", 0),
    ("to", 0),
    ("cc", 0),
    ("bcc", 0),
    ("in-reply-to", 0),
    ("message-id", 0),
    ("date", 0),
    ("priority", 0),
    ("x-priority", 1),
    ("references", 1),
    ("newsgroups", 1),
    ("content-type", 1),
    ("x-mailer", 1),
    ("x-me-message-id", 1),
];

/// Raw, order-preserving header lines, unfolded (continuation lines
/// joined to their parent with a single space) but otherwise untouched.
struct RawHeader {
    name: String,
    /// Lowercased `name`, for case-insensitive lookups.
    name_lower: String,
    value: String,
}

fn split_header_body(raw: &[u8]) -> (&[u8], &[u8]) {
    for idx in 0..raw.len() {
        if raw[idx..].starts_with(b"\r\n\r\n") {
            return (&raw[..idx + 2], &raw[idx + 4..]);
        }
        if raw[idx..].starts_with(b"\n\n") {
            return (&raw[..idx + 1], &raw[idx + 2..]);
        }
    }
    (raw, &[])
}

fn unfold_headers(header_block: &[u8]) -> Vec<RawHeader> {
    let text = String::from_utf8_lossy(header_block);
    let mut out: Vec<(String, String)> = Vec::new();
    for line in text.split("\r\n").flat_map(|l| l.split('\n')) {
        if line.is_empty() {
            continue;
        }
        if (line.starts_with(' ') || line.starts_with('\t')) && !out.is_empty() {
            let last = out.last_mut().unwrap();
            last.1.push(' ');
            last.1.push_str(line.trim_start());
        } else if let Some((name, value)) = line.split_once(':') {
            out.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    out.into_iter()
        .map(|(name, value)| RawHeader {
            name_lower: name.to_ascii_lowercase(),
            name,
            value,
        })
        .collect()
}

fn header_values<'a>(headers: &'a [RawHeader], name: &str) -> Vec<&'a str> {
    headers
        .iter()
        .filter(|h| h.name_lower == name)
        .map(|h| h.value.as_str())
        .collect()
}

fn header_value<'a>(headers: &'a [RawHeader], name: &str) -> Option<&'a str> {
    header_values(headers, name).into_iter().next()
}

/// Received-date selection (§4.8 "Received_date selection").
fn received_date(headers: &[RawHeader]) -> Option<String> {
    if let Some(v) = header_value(headers, "x-deliveredinternaldate") {
        return Some(v.to_string());
    }
    let received = header_value(headers, "received")?;
    received.rsplit_once(';').map(|(_, ts)| ts.trim().to_string())
}

/// Strip RFC 5322 comments `(...)` (non-nested-aware but handles one level
/// of nesting, sufficient for realistic `References` headers) and collapse
/// folding whitespace, then concatenate all `<id>` tokens in order (§4.8
/// "References").
fn concat_references(headers: &[RawHeader]) -> String {
    let mut ids = Vec::new();
    for raw in header_values(headers, "references") {
        let stripped = strip_comments(raw);
        let mut depth = 0usize;
        let mut current = String::new();
        for c in stripped.chars() {
            match c {
                '<' => {
                    depth += 1;
                    current.push(c);
                }
                '>' => {
                    current.push(c);
                    if depth > 0 {
                        depth -= 1;
                        if depth == 0 {
                            ids.push(current.clone());
                            current.clear();
                        }
                    }
                }
                _ if depth > 0 => current.push(c),
                _ => {}
            }
        }
    }
    ids.join(" ")
}

fn strip_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth = 0usize;
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Parsed `Content-Type`/`Content-Disposition`-shaped header: a leading
/// token (type/subtype or disposition kind) then `; name=value` pairs,
/// with RFC 2231 continuation support (§4.8 "RFC 2231 continuations").
struct ParamHeader {
    leading: String,
    params: Vec<Param>,
}

fn parse_param_header(raw: &str) -> ParamHeader {
    let mut parts = raw.splitn(2, ';');
    let leading = parts.next().unwrap_or("").trim().to_string();
    let rest = parts.next().unwrap_or("");

    // Collect raw `attr[*n][*]=value` segments, tolerating quoted values
    // containing semicolons.
    let mut segments: Vec<(String, Option<u32>, bool, String)> = Vec::new();
    for piece in split_params(rest) {
        let Some((attr_raw, value_raw)) = piece.split_once('=') else {
            continue;
        };
        let attr_raw = attr_raw.trim();
        let value = unquote(value_raw.trim());

        let (base, star_n, extended) = if let Some(stripped) = attr_raw.strip_suffix('*') {
            // Either `attr*` (single extended value) or `attr*N*`.
            if let Some((b, n)) = stripped.rsplit_once('*') {
                if let Ok(n) = n.parse::<u32>() {
                    (b.to_string(), Some(n), true)
                } else {
                    (stripped.to_string(), None, true)
                }
            } else {
                (stripped.to_string(), None, true)
            }
        } else if let Some((b, n)) = attr_raw.rsplit_once('*') {
            match n.parse::<u32>() {
                Ok(n) => (b.to_string(), Some(n), false),
                Err(_) => (attr_raw.to_string(), None, false),
            }
        } else {
            (attr_raw.to_string(), None, false)
        };

        segments.push((base.to_ascii_uppercase(), star_n, extended, value));
    }

    // Group by attribute name, concatenating numbered continuations in
    // order; an attribute keeps the literal `%xx` bytes of extended
    // segments rather than percent-decoding them (§4.8: "this parser
    // preserves the literal %xx and concatenates as-is").
    let mut order: Vec<String> = Vec::new();
    let mut grouped: std::collections::HashMap<String, (Vec<(u32, String)>, bool, Option<String>)> =
        std::collections::HashMap::new();

    for (name, n, extended, value) in segments {
        let entry = grouped.entry(name.clone()).or_insert_with(|| {
            order.push(name.clone());
            (Vec::new(), false, None)
        });
        match n {
            Some(n) => entry.0.push((n, value)),
            None => entry.2 = Some(value),
        }
        if extended {
            entry.1 = true;
        }
    }

    let mut params = Vec::new();
    for name in order {
        let (mut numbered, any_extended, plain) = grouped.remove(&name).unwrap();
        let value = if numbered.is_empty() {
            plain.unwrap_or_default()
        } else {
            numbered.sort_by_key(|(n, _)| *n);
            numbered.into_iter().map(|(_, v)| v).collect::<String>()
        };
        let mut name = name;
        if any_extended && !name.ends_with('*') {
            name.push('*');
        }
        params.push(Param { name, value });
    }

    ParamHeader { leading, params }
}

/// Split a `; a=b; c="d;e"` parameter tail on top-level `;`, respecting
/// double-quoted values.
fn split_params(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                let piece = s[start..i].trim();
                if !piece.is_empty() {
                    out.push(piece);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = s[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn unquote(s: &str) -> String {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Default content-type per RFC 2046 (§4.8).
fn default_content_type() -> (String, String, Vec<Param>) {
    (
        "TEXT".to_string(),
        "PLAIN".to_string(),
        vec![Param {
            name: "CHARSET".to_string(),
            value: "us-ascii".to_string(),
        }],
    )
}

fn count_lines(body: &[u8]) -> u32 {
    body.iter().filter(|&&b| b == b'\n').count() as u32
}

/// Recursively build the body tree for one MIME part's raw bytes
/// (header block + content), without consulting address/subject/etc.
/// headers — those only apply at the top level (§4.8).
fn parse_part(raw: &[u8]) -> Body {
    let (header_block, content) = split_header_body(raw);
    let headers = unfold_headers(header_block);

    let ct_raw = header_value(&headers, "content-type");
    let (mut type_, mut subtype, mut params) = default_content_type();
    if let Some(ct_raw) = ct_raw {
        let parsed = parse_param_header(ct_raw);
        if let Some((t, s)) = parsed.leading.split_once('/') {
            type_ = t.trim().to_ascii_uppercase();
            subtype = s.trim().to_ascii_uppercase();
        }
        if !parsed.params.is_empty() {
            params = parsed.params;
        }
    }

    let disposition = header_value(&headers, "content-disposition").map(|raw| {
        let parsed = parse_param_header(raw);
        Disposition {
            kind: parsed.leading.to_ascii_uppercase(),
            params: parsed.params,
        }
    });

    let language = header_value(&headers, "content-language")
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();

    let transfer_encoding = header_value(&headers, "content-transfer-encoding")
        .map(|v| v.trim().to_ascii_uppercase())
        .unwrap_or_else(|| "7BIT".to_string());

    let id = header_value(&headers, "content-id").map(|s| s.to_string());
    let description = header_value(&headers, "content-description").map(|s| s.to_string());
    let md5 = header_value(&headers, "content-md5").map(|s| s.to_string());

    let mut subparts = Vec::new();
    let mut boundary_offsets = Vec::new();

    if type_ == "MULTIPART" {
        if let Some(boundary) = params.iter().find(|p| p.name == "BOUNDARY") {
            let delim = format!("--{}", boundary.value);
            for (start, end) in split_multipart(content, delim.as_bytes()) {
                subparts.push(parse_part(&content[start..end]));
                boundary_offsets.push((start, end));
            }
        }
    }

    Body {
        type_,
        subtype,
        params,
        disposition,
        language,
        transfer_encoding,
        id,
        description,
        md5,
        lines: if subparts.is_empty() {
            Some(count_lines(content))
        } else {
            None
        },
        length: content.len() as u32,
        subparts,
        boundary_offsets,
    }
}

/// Split a multipart body on its boundary delimiter, returning the byte
/// range of each part's raw bytes (headers + content), excluding the
/// delimiter lines themselves and the closing `--boundary--`.
fn split_multipart(content: &[u8], delim: &[u8]) -> Vec<(usize, usize)> {
    let mut marks = Vec::new();
    let mut i = 0usize;
    while let Some(pos) = find_subslice(&content[i..], delim) {
        marks.push(i + pos);
        i += pos + delim.len();
    }
    let mut ranges = Vec::new();
    for w in marks.windows(2) {
        let after_delim = w[0] + delim.len();
        let start = skip_line_end(content, after_delim);
        if start >= w[1] {
            continue;
        }
        // trim the trailing CRLF/LF that precedes the next boundary line
        let mut end = w[1];
        if end > start && content[end - 1] == b'\n' {
            end -= 1;
        }
        if end > start && content[end - 1] == b'\r' {
            end -= 1;
        }
        ranges.push((start, end));
    }
    ranges
}

fn skip_line_end(content: &[u8], mut pos: usize) -> usize {
    if content.get(pos) == Some(&b'-') && content.get(pos + 1) == Some(&b'-') {
        return content.len();
    }
    if content.get(pos) == Some(&b'\r') {
        pos += 1;
    }
    if content.get(pos) == Some(&b'\n') {
        pos += 1;
    }
    pos
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len().max(1))
        .position(|w| w == needle)
}

/// Parse a whole raw message into a [`ParsedMessage`] (§4.8).
pub fn parse(raw: &[u8]) -> ParsedMessage {
    let (header_block, _content) = split_header_body(raw);
    let headers = unfold_headers(header_block);

    let (from, sender, reply_to, to, cc, bcc) = parse_addresses(header_block);

    let date = header_value(&headers, "date").map(|s| s.to_string());
    let subject = header_value(&headers, "subject").map(|s| s.to_string());
    let in_reply_to = header_value(&headers, "in-reply-to").map(|s| s.to_string());
    let message_id = header_value(&headers, "message-id").map(|s| s.to_string());
    let x_me_message_id = header_value(&headers, "x-me-message-id").map(|s| s.to_string());
    let references = concat_references(&headers);
    let received = received_date(&headers);

    let cache_headers = build_cache_headers(&headers);
    let body = parse_part(raw);
    let guid = MessageGuid::compute(raw);

    ParsedMessage {
        body,
        from,
        sender,
        reply_to,
        to,
        cc,
        bcc,
        date,
        subject,
        in_reply_to,
        references,
        message_id,
        x_me_message_id,
        received_date: received,
        cache_headers,
        guid,
    }
}

/// Concatenate the headers this engine caches for `BODY.PEEK[HEADER]`-style
/// access without a spool re-read (§4.8 "Cache-header selection"), at
/// [`CURRENT_CACHE_VERSION`].
pub const CURRENT_CACHE_VERSION: u32 = 1;

fn build_cache_headers(headers: &[RawHeader]) -> Vec<u8> {
    let mut out = Vec::new();
    for h in headers {
        let listed = CACHE_HEADERS
            .iter()
            .find(|entry| entry.0 == h.name_lower.as_str());
        let keep = match listed {
            Some((_, min_version)) => *min_version <= CURRENT_CACHE_VERSION,
            None => false,
        };
        if keep {
            out.extend_from_slice(h.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(h.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    out
}

fn parse_addresses(
    header_block: &[u8],
) -> (
    Vec<Address>,
    Vec<Address>,
    Vec<Address>,
    Vec<Address>,
    Vec<Address>,
    Vec<Address>,
) {
    match eml_codec::parse_imf(header_block) {
        Ok((_, imf)) => {
            let from: Vec<Address> = imf.from.iter().map(convert_mbx).collect();
            let reply_to = if imf.reply_to.is_empty() {
                from.clone()
            } else {
                convert_addresses(&imf.reply_to)
            };
            (
                from,
                imf.sender.as_ref().map(convert_mbx).into_iter().collect(),
                reply_to,
                convert_addresses(&imf.to),
                convert_addresses(&imf.cc),
                convert_addresses(&imf.bcc),
            )
        }
        Err(_) => Default::default(),
    }
}

fn convert_addresses(addrlist: &[eml_codec::imf::address::AddressRef]) -> Vec<Address> {
    let mut acc = Vec::new();
    for item in addrlist {
        match item {
            eml_codec::imf::address::AddressRef::Single(a) => acc.push(convert_mbx(a)),
            eml_codec::imf::address::AddressRef::Many(l) => {
                acc.extend(l.participants.iter().map(convert_mbx))
            }
        }
    }
    acc
}

fn convert_mbx(addr: &eml_codec::imf::mailbox::MailboxRef) -> Address {
    Address {
        name: addr.name.as_ref().map(|x| x.to_string()),
        route: None,
        mailbox: Some(addr.addrspec.local_part.to_string()),
        domain: Some(addr.addrspec.domain.to_string()),
    }
}

impl ParsedMessage {
    /// Build this message's cache record for the cache manager (§3.1
    /// "cache record", §4.3). Item order: date, subject, then each address
    /// list (from/sender/reply_to/to/cc/bcc) nstring-encoded, in_reply_to,
    /// message_id, references, then the concatenated cache-headers buffer.
    pub fn to_cache_items(&self) -> crate::cache::CacheItems {
        fn addr_list(addrs: &[Address]) -> Vec<u8> {
            let joined = addrs
                .iter()
                .map(|a| {
                    format!(
                        "{}\0{}\0{}\0{}",
                        a.name.clone().unwrap_or_default(),
                        a.route.clone().unwrap_or_default(),
                        a.mailbox.clone().unwrap_or_default(),
                        a.domain.clone().unwrap_or_default(),
                    )
                })
                .collect::<Vec<_>>()
                .join("\x1e");
            write_nstring(Some(joined.as_bytes()))
        }

        crate::cache::CacheItems {
            items: vec![
                write_nstring(self.date.as_deref().map(str::as_bytes)),
                write_nstring(self.subject.as_deref().map(str::as_bytes)),
                addr_list(&self.from),
                addr_list(&self.sender),
                addr_list(&self.reply_to),
                addr_list(&self.to),
                addr_list(&self.cc),
                addr_list(&self.bcc),
                write_nstring(self.in_reply_to.as_deref().map(str::as_bytes)),
                write_nstring(self.message_id.as_deref().map(str::as_bytes)),
                write_nstring(Some(self.references.as_bytes())),
                self.cache_headers.clone(),
            ],
        }
    }
}

/// IMAP `nstring` wire encoding (§4.8 "Output wire encoding").
pub fn write_nstring(value: Option<&[u8]>) -> Vec<u8> {
    match value {
        None => b"NIL".to_vec(),
        Some(bytes) => write_nstring_len(bytes, bytes.len()),
    }
}

/// As [`write_nstring`], but with an explicit byte length so an embedded
/// NUL doesn't truncate the literal (§4.8 "length-aware variant").
pub fn write_nstring_len(bytes: &[u8], len: usize) -> Vec<u8> {
    let bytes = &bytes[..len];
    let needs_literal = bytes
        .iter()
        .any(|&b| matches!(b, b'\r' | b'\n' | b'"' | b'\\' | b'%' | 0));
    if needs_literal {
        let mut out = format!("{{{}}}\r\n", len).into_bytes();
        out.extend_from_slice(bytes);
        out
    } else {
        let mut out = Vec::with_capacity(len + 2);
        out.push(b'"');
        out.extend_from_slice(bytes);
        out.push(b'"');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(headers: &str, body: &str) -> Vec<u8> {
        format!("{headers}\r\n\r\n{body}").into_bytes()
    }

    #[test]
    fn trivial_parse_s1() {
        let raw = msg(
            "From: Fred Bloggs <fbloggs@fastmail.fm>\r\n\
To: Sarah Jane Smith <sjsmith@gmail.com>\r\n\
Date: Wed, 27 Oct 2010 18:37:26 +1100\r\n\
Subject: Trivial testing email\r\n\
Message-ID: <fake800@fastmail.fm>\r\n\
X-Mailer: Norman",
            "Hello, World",
        );
        let parsed = parse(&raw);
        assert_eq!(parsed.body.type_, "TEXT");
        assert_eq!(parsed.body.subtype, "PLAIN");
        assert_eq!(
            parsed.body.params,
            vec![Param {
                name: "CHARSET".into(),
                value: "us-ascii".into()
            }]
        );
        assert_eq!(parsed.from[0].mailbox.as_deref(), Some("fbloggs"));
        assert_eq!(parsed.from[0].domain.as_deref(), Some("fastmail.fm"));
        assert_eq!(parsed.received_date, None);
        assert_eq!(parsed.subject.as_deref(), Some("Trivial testing email"));
        assert_eq!(parsed.message_id.as_deref(), Some("<fake800@fastmail.fm>"));
        assert!(String::from_utf8_lossy(&parsed.cache_headers).contains("Norman"));
    }

    #[test]
    fn received_date_prefers_x_delivered_s2() {
        let raw = msg(
            "X-DeliveredInternalDate: Fri, 29 Oct 2010 13:07:07 +1100\r\n\
Received: from c.example (c.example [10.0.0.3]); Fri, 29 Oct 2010 13:07:09 +1100\r\n\
Received: from b.example (b.example [10.0.0.2]); Fri, 29 Oct 2010 13:07:08 +1100\r\n\
Received: from a.example (a.example [10.0.0.1]); Fri, 29 Oct 2010 13:07:06 +1100\r\n\
Subject: hi",
            "body",
        );
        let parsed = parse(&raw);
        assert_eq!(
            parsed.received_date.as_deref(),
            Some("Fri, 29 Oct 2010 13:07:07 +1100")
        );
    }

    #[test]
    fn mime_tree_s3() {
        let boundary = "7225e";
        let raw = format!(
            "Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\r\n\
--{boundary}\r\n\
Content-Type: text/plain\r\n\r\n\
plain part\r\n\
--{boundary}\r\n\
Content-Type: text/html\r\n\r\n\
<b>html part</b>\r\n\
--{boundary}\r\n\
Content-Type: image/png\r\n\
Content-Transfer-Encoding: base64\r\n\
Content-Disposition: attachment; filename=cyrus-favicon.png\r\n\r\n\
iVBORw0KGgo=\r\n\
--{boundary}--\r\n"
        );
        let parsed = parse(raw.as_bytes());
        assert_eq!(parsed.body.type_, "MULTIPART");
        assert_eq!(parsed.body.subparts.len(), 3);
        assert_eq!(parsed.body.subparts[0].subtype, "PLAIN");
        assert_eq!(parsed.body.subparts[1].subtype, "HTML");
        assert_eq!(parsed.body.subparts[2].type_, "IMAGE");
        assert_eq!(parsed.body.subparts[2].subtype, "PNG");
        assert_eq!(
            parsed.body.subparts[2].disposition.as_ref().unwrap().kind,
            "ATTACHMENT"
        );
        assert_eq!(parsed.body.subparts[2].transfer_encoding, "BASE64");
        assert!(parsed.body.subparts[0]
            .length
            .eq(&("plain part".len() as u32)));
    }

    #[test]
    fn rfc2231_concatenation_s4() {
        let raw = msg(
            "Content-Type: message/external-body; access-type=URL;\r\n\
 URL*0=\"ftp://\"; URL*1=\"cs.utk.edu/pub/moore/\";\r\n\
 URL*2=\"bulk-mailer/bulk-mailer.tar\"",
            "",
        );
        let parsed = parse(&raw);
        let url = parsed
            .body
            .params
            .iter()
            .find(|p| p.name.starts_with("URL"))
            .unwrap();
        assert_eq!(url.value, "ftp://cs.utk.edu/pub/moore/bulk-mailer/bulk-mailer.tar");
    }

    #[test]
    fn nstring_encoding_s5() {
        assert_eq!(write_nstring(None), b"NIL");
        assert_eq!(write_nstring(Some(b"")), b"\"\"");
        assert_eq!(write_nstring(Some(b"Hello")), b"\"Hello\"");
        assert_eq!(
            write_nstring(Some(b"Good\rBye\nEarth")),
            b"{14}\r\nGood\rBye\nEarth"
        );
        assert_eq!(
            write_nstring_len(b"Hello\0World", 11),
            b"{11}\r\nHello\0World"
        );
    }

    #[test]
    fn guid_is_pure_function_of_content() {
        let a = parse(b"Subject: a\r\n\r\nbody");
        let b = parse(b"Subject: a\r\n\r\nbody");
        assert_eq!(a.guid, b.guid);
    }
}

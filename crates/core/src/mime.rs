//! MIME parser (C5, §4.5).
//!
//! New relative to the teacher, which only normalizes Gmail's
//! already-parsed JSON payload (`gmail/normalize.rs`) and never sees
//! raw bytes. Built on `mail-parser` for RFC 5322/2045 structural
//! parsing and RFC 2047 decoded-word normalization, enriched from the
//! broader pack's use of the same crate
//! (`sparklive-rustmailer`, `TexasFortress-AI-RustyMail`), with
//! `encoding_rs` supplying the closed-set charset recovery named in
//! the spec.

use base64::Engine;
use mail_parser::{Encoding as TransferEncoding, MessageParser, MessagePartId, MimeHeaders};

use crate::error::{MsgVaultError, Result};

/// One extracted attachment payload.
#[derive(Debug, Clone)]
pub struct ParsedAttachment {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// A normalized address `(display_name, email)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub display_name: Option<String>,
    pub email: String,
}

/// Structural result of parsing one raw RFC 5322 message.
#[derive(Debug, Clone, Default)]
pub struct ParsedMime {
    pub subject: String,
    pub from: Vec<ParsedAddress>,
    pub to: Vec<ParsedAddress>,
    pub cc: Vec<ParsedAddress>,
    pub bcc: Vec<ParsedAddress>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<ParsedAttachment>,
    /// The charset that was actually used to decode text parts, after
    /// recovery; `None` when the declared charset decoded cleanly.
    pub recovered_charset: Option<&'static str>,
    /// The `Date:` header, when present and parseable. Messages without
    /// one are excluded from the analytics cache (§3, §4.8).
    pub sent_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Closed set of fallback charsets tried, in order, when the declared
/// charset fails to decode as valid UTF-8 (§4.5). The multi-byte CJK
/// encodings go first: their decoders reject most byte sequences that
/// aren't actually theirs, so they narrow down correctly. Windows-1252
/// goes last because WHATWG's single-byte decoder assigns nearly every
/// byte value a character and so accepts almost anything — it would
/// otherwise shadow the real encoding. `encoding_rs` has no distinct
/// ISO-8859-1 codec — WHATWG aliases that label to Windows-1252 — so
/// the Windows-1252 entry stands in for both names.
const RECOVERY_CHARSETS: &[&encoding_rs::Encoding] = &[
    encoding_rs::SHIFT_JIS,
    encoding_rs::EUC_JP,
    encoding_rs::EUC_KR,
    encoding_rs::GBK,
    encoding_rs::BIG5,
    encoding_rs::KOI8_R,
    encoding_rs::WINDOWS_1252,
];

/// Parse raw MIME bytes. Fails only on structural parse failure;
/// encoding recovery is never fatal (§4.5).
pub fn parse(raw: &[u8]) -> Result<ParsedMime> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MsgVaultError::MalformedMime("could not parse message structure".into()))?;

    let subject = message.subject().unwrap_or_default().to_string();

    let sent_at = message
        .date()
        .and_then(|d| chrono::DateTime::from_timestamp(d.to_timestamp(), 0));

    let from = addresses_of(message.from());
    let to = addresses_of(message.to());
    let cc = addresses_of(message.cc());
    let bcc = addresses_of(message.bcc());

    let mut recovered_charset = None;

    let body_text = message.body_text(0).map(|cow| {
        let decoded = cow.into_owned();
        match recover_part(&message, &message.text_body) {
            Some((text, charset)) => {
                recovered_charset = charset;
                text
            }
            None => decoded,
        }
    });

    let body_html = message.body_html(0).map(|cow| {
        let decoded = cow.into_owned();
        match recover_part(&message, &message.html_body) {
            Some((text, charset)) => {
                recovered_charset = charset;
                text
            }
            None => decoded,
        }
    });

    let mut attachments = Vec::new();
    for attachment in message.attachments() {
        let filename = attachment
            .attachment_name()
            .unwrap_or("unnamed-attachment")
            .to_string();
        let mime_type = attachment
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());
        attachments.push(ParsedAttachment {
            filename,
            mime_type,
            bytes: attachment.contents().to_vec(),
        });
    }

    Ok(ParsedMime {
        subject,
        from,
        to,
        cc,
        bcc,
        body_text,
        body_html,
        attachments,
        recovered_charset,
        sent_at,
    })
}

fn addresses_of(header: Option<&mail_parser::Address>) -> Vec<ParsedAddress> {
    let Some(header) = header else {
        return Vec::new();
    };
    header
        .iter()
        .filter_map(|addr| {
            let email = addr.address()?.to_string();
            Some(ParsedAddress {
                display_name: addr.name().map(|n| n.to_string()),
                email,
            })
        })
        .collect()
}

/// `mail-parser` flags a part as `is_encoding_problem` when its declared
/// charset failed to decode the body cleanly; only then do we re-derive
/// the part's pre-decode bytes (body span minus content-transfer
/// decoding) and run them through the closed recovery set, per §4.5.
/// Returns `None` when the part decoded cleanly the first time, so the
/// caller keeps `mail-parser`'s own (already correct) string.
fn recover_part(
    message: &mail_parser::Message,
    ids: &[MessagePartId],
) -> Option<(String, Option<&'static str>)> {
    let part = message.parts.get(*ids.first()?)?;
    if !part.is_encoding_problem {
        return None;
    }

    let raw = message.raw_message.get(part.offset_body..part.offset_end)?;
    let declared_charset = part
        .content_type()
        .and_then(|ct| ct.attribute("charset"))
        .unwrap_or("utf-8")
        .to_string();
    let transfer_decoded = decode_transfer_encoding(raw, part.encoding);

    Some(decode_with_recovery(&transfer_decoded, &declared_charset))
}

/// Undo RFC 2045 Content-Transfer-Encoding to recover the octets the
/// declared charset actually applies to; §4.5's recovery chain only
/// makes sense run against these, not against still-base64 bytes.
fn decode_transfer_encoding(raw: &[u8], encoding: TransferEncoding) -> Vec<u8> {
    match encoding {
        TransferEncoding::Base64 => {
            let cleaned: Vec<u8> = raw.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(&cleaned)
                .unwrap_or_else(|_| raw.to_vec())
        }
        TransferEncoding::QuotedPrintable => decode_quoted_printable(raw),
        TransferEncoding::None => raw.to_vec(),
    }
}

fn decode_quoted_printable(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] != b'=' {
            out.push(input[i]);
            i += 1;
            continue;
        }
        if input[i..].starts_with(b"=\r\n") {
            i += 3; // soft line break
            continue;
        }
        if input[i..].starts_with(b"=\n") {
            i += 2; // bare-LF soft line break
            continue;
        }
        let hex = input.get(i + 1..i + 3).and_then(|h| std::str::from_utf8(h).ok());
        match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            None => {
                out.push(input[i]);
                i += 1;
            }
        }
    }
    out
}

/// Try the closed recovery set in order, per §4.5; last resort is a
/// lossy decode with the declared (or UTF-8) encoding, replacing
/// invalid sequences with U+FFFD.
fn decode_with_recovery(raw: &[u8], declared_charset: &str) -> (String, Option<&'static str>) {
    for encoding in RECOVERY_CHARSETS {
        let (text, _, had_errors) = encoding.decode(raw);
        if !had_errors {
            return (text.into_owned(), Some(encoding.name()));
        }
    }

    let declared = encoding_rs::Encoding::for_label(declared_charset.as_bytes()).unwrap_or(encoding_rs::UTF_8);
    let (text, _, _) = declared.decode(raw);
    (text.into_owned(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_message() {
        let raw = b"From: Alice <alice@example.com>\r\nTo: Bob <bob@example.com>\r\nSubject: Hi\r\nContent-Type: text/plain\r\n\r\nHello Bob\r\n";
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.subject, "Hi");
        assert_eq!(parsed.from[0].email, "alice@example.com");
        assert_eq!(parsed.to[0].email, "bob@example.com");
        assert_eq!(parsed.body_text.as_deref(), Some("Hello Bob\r\n"));
    }

    #[test]
    fn decodes_rfc2047_encoded_subject() {
        let raw = b"From: a@example.com\r\nTo: b@example.com\r\nSubject: =?UTF-8?B?SGVsbG8sIFdvcmxkIQ==?=\r\nContent-Type: text/plain\r\n\r\nbody\r\n";
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.subject, "Hello, World!");
    }

    #[test]
    fn extracts_attachment_with_disposition() {
        let raw = b"From: a@example.com\r\nTo: b@example.com\r\nSubject: file\r\nContent-Type: multipart/mixed; boundary=XYZ\r\n\r\n--XYZ\r\nContent-Type: text/plain\r\n\r\nbody text\r\n--XYZ\r\nContent-Type: text/plain\r\nContent-Disposition: attachment; filename=\"a.txt\"\r\n\r\nattachment contents\r\n--XYZ--\r\n";
        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].filename, "a.txt");
    }

    #[test]
    fn malformed_bytes_are_never_fatal_for_encoding() {
        // Invalid UTF-8 body bytes under a declared utf-8 charset
        // should decode via the recovery chain, not error.
        let mut raw = b"From: a@example.com\r\nTo: b@example.com\r\nSubject: s\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n".to_vec();
        raw.extend_from_slice(&[0x93, b'h', b'i', 0x94]); // Windows-1252 smart quotes
        let parsed = parse(&raw).unwrap();
        assert!(parsed.body_text.unwrap().contains("hi"));
        assert!(parsed.recovered_charset.is_some(), "recovery chain should have actually run");
    }

    #[test]
    fn recovers_shift_jis_body_when_declared_charset_is_wrong() {
        let text = encoding_rs::SHIFT_JIS.encode("\u{3053}\u{3093}\u{306b}\u{3061}\u{306f}").0;
        let mut raw =
            b"From: a@example.com\r\nTo: b@example.com\r\nSubject: s\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n".to_vec();
        raw.extend_from_slice(&text);
        let parsed = parse(&raw).unwrap();
        assert_eq!(parsed.body_text.as_deref(), Some("\u{3053}\u{3093}\u{306b}\u{3061}\u{306f}"));
        assert_eq!(parsed.recovered_charset, Some("Shift_JIS"));
    }
}

//! RFC 822 bytes to `InboundEmail`.
use html2text::from_read;
use mailparse::{addrparse, MailAddr, MailHeaderMap, ParsedMail};

use crate::errors::{AppError, AppResult};
use crate::types::InboundEmail;

/// Parse a raw fetched message. `fallback_id` is used as the protocol message
/// id when the message carries no usable `Message-ID` header.
pub fn parse_inbound(raw: &[u8], fallback_id: &str) -> AppResult<InboundEmail> {
    let parsed = mailparse::parse_mail(raw).map_err(|e| AppError::Parse(format!("MIME: {e}")))?;
    let headers = &parsed.headers;

    let message_id = headers
        .get_first_value("Message-ID")
        .and_then(|v| normalize_message_id(&v))
        .unwrap_or_else(|| fallback_id.to_string());

    let from_header = headers
        .get_first_value("From")
        .ok_or_else(|| AppError::Parse(format!("{message_id}: missing From header")))?;
    let (from_name, from) = first_address(&from_header)
        .ok_or_else(|| AppError::Parse(format!("{message_id}: no address in From {from_header:?}")))?;

    let to = headers
        .get_first_value("To")
        .and_then(|v| first_address(&v))
        .map(|(_, addr)| addr)
        .unwrap_or_default();

    let subject = headers
        .get_first_value("Subject")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    // Fall back to the last References entry when In-Reply-To is absent.
    let in_reply_to = headers
        .get_first_value("In-Reply-To")
        .and_then(|v| normalize_message_id(&v))
        .or_else(|| {
            headers
                .get_first_value("References")
                .and_then(|v| v.split_whitespace().last().and_then(normalize_message_id))
        });

    let body = extract_text(&parsed).replace("\r\n", "\n");

    Ok(InboundEmail {
        message_id,
        from,
        from_name,
        to,
        subject,
        body,
        in_reply_to,
    })
}

/// Strip angle brackets and surrounding blanks from a message id.
pub fn normalize_message_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let inner = match (trimmed.find('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if start < end => &trimmed[start + 1..end],
        _ => trimmed,
    };
    let inner = inner.trim();
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}

fn first_address(raw: &str) -> Option<(Option<String>, String)> {
    let list = addrparse(raw).ok()?;
    let single = list.iter().find_map(|addr| match addr {
        MailAddr::Single(info) => Some(info.clone()),
        MailAddr::Group(group) => group.addrs.first().cloned(),
    })?;
    let addr = single.addr.trim().to_ascii_lowercase();
    if addr.is_empty() {
        return None;
    }
    let name = single
        .display_name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());
    Some((name, addr))
}

fn extract_text(parsed: &ParsedMail) -> String {
    if let Some(plain) = find_part(parsed, "text/plain") {
        return plain.get_body().unwrap_or_default();
    }
    if let Some(html) = find_part(parsed, "text/html") {
        return html_to_text(&html.get_body_raw().unwrap_or_default());
    }
    String::new()
}

fn find_part<'a>(parsed: &'a ParsedMail<'a>, mimetype: &str) -> Option<&'a ParsedMail<'a>> {
    if parsed.subparts.is_empty() {
        let is_attachment =
            parsed.get_content_disposition().disposition == mailparse::DispositionType::Attachment;
        if !is_attachment && parsed.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
            return Some(parsed);
        }
        return None;
    }
    parsed.subparts.iter().find_map(|part| find_part(part, mimetype))
}

fn html_to_text(html: &[u8]) -> String {
    from_read(html, 80).unwrap_or_default()
}

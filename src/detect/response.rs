use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Ok,
    /// Status or body looks like an anti-bot interstitial.
    Blocked,
    /// Server trouble or an unexpected status; retrying may help.
    Retryable,
    /// The entity does not exist upstream.
    Missing,
}

/// Body markers of known challenge / block pages.
const BLOCK_MARKERS: &[&str] = &[
    "px-captcha",
    "captcha-delivery",
    "g-recaptcha",
    "cf-chl",
    "cf_chl_opt",
    "_Incapsula_Resource",
    "Access Denied",
    "Request unsuccessful. Incapsula",
    "Please verify you are a human",
];

/// Only the head of the body is sniffed; challenge pages are small.
const SNIFF_LIMIT: usize = 16 * 1024;

/// Classify by status code alone.
pub fn classify_status(status: u16) -> ResponseClass {
    match status {
        200..=299 => ResponseClass::Ok,
        // Auth / precondition rejections and rate limiting are what
        // fingerprinting defenses answer with.
        401 | 403 | 412 | 429 => ResponseClass::Blocked,
        404 | 410 => ResponseClass::Missing,
        _ => ResponseClass::Retryable,
    }
}

/// Find the first block-page marker in the head of `body`.
pub fn find_block_marker(body: &[u8]) -> Option<&'static str> {
    let head = &body[..body.len().min(SNIFF_LIMIT)];
    let text = String::from_utf8_lossy(head);
    BLOCK_MARKERS
        .iter()
        .copied()
        .find(|marker| text.contains(marker))
}

/// Classify a full response: a successful status can still carry a challenge page.
pub fn classify(status: u16, body: &[u8]) -> ResponseClass {
    match classify_status(status) {
        ResponseClass::Ok if find_block_marker(body).is_some() => ResponseClass::Blocked,
        class => class,
    }
}

/// Map a non-`Ok` response to the capture error it implies.
pub fn to_capture_error(status: u16, body: &[u8]) -> Option<CaptureError> {
    match classify(status, body) {
        ResponseClass::Ok => None,
        ResponseClass::Blocked => Some(CaptureError::DetectionSuspected(
            match find_block_marker(body) {
                Some(marker) => format!("HTTP {} with block marker {:?}", status, marker),
                None => format!("HTTP {}", status),
            },
        )),
        ResponseClass::Retryable => Some(CaptureError::Transient(format!("HTTP {}", status))),
        ResponseClass::Missing => Some(CaptureError::NotFound(format!("HTTP {}", status))),
    }
}

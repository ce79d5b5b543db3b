//! Hardened outbound HTTP: SSRF guards, redaction, retry and size caps.

pub mod client;
pub mod guard;
pub mod redact;

pub use client::{header_map, FetchedResponse, RequestPolicy, SecureClient};
pub use guard::{is_ip_safe, validate_url, verify_peer};
pub use redact::{redact_text, redact_url, sanitize_for_log};

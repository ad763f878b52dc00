pub mod asset_store;
pub mod bus;
pub mod config;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod ingestor;
pub mod memory_store;
pub mod model;
pub mod object_store;
pub mod profiles;
pub mod spool;
pub mod worker;

use once_cell::sync::Lazy;
use regex::Regex;
use sha1::{Digest, Sha1};
use std::net::IpAddr;
use url::{Host, Url};

use error::{MediaError, MediaResult};

/// Hard cap on a single source image payload.
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024; // 50 MiB

static OWNER_SEGMENT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]").expect("Failed to compile regex"));

/// 40-hex SHA-1 of a byte payload, the content checksum used for dedup.
pub fn sha1_hex(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

/// Validate an incoming image payload: non-empty, within the size cap, and
/// carrying a recognizable image header. Returns the sniffed MIME type.
pub fn validate_image_bytes(bytes: &[u8]) -> MediaResult<&'static str> {
    if bytes.is_empty() {
        return Err(MediaError::validation("image payload is empty"));
    }
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(MediaError::validation(format!(
            "image payload exceeds {MAX_UPLOAD_BYTES} bytes"
        )));
    }
    sniff_content_type(bytes)
        .ok_or_else(|| MediaError::validation("payload is not a recognized image format"))
}

/// Identify an image payload by its magic bytes.
pub fn sniff_content_type(data: &[u8]) -> Option<&'static str> {
    if data.len() < 12 {
        return None;
    }
    match &data[..12] {
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some("image/png"),
        [0x52, 0x49, 0x46, 0x46, _, _, _, _, 0x57, 0x45, 0x42, 0x50] => Some("image/webp"),
        [0x47, 0x49, 0x46, 0x38, b'7' | b'9', 0x61, ..] => Some("image/gif"),
        _ if &data[4..8] == b"ftyp" && (&data[8..12] == b"avif" || &data[8..12] == b"avis") => {
            Some("image/avif")
        }
        _ => None,
    }
}

/// SSRF guard for remote sources: absolute HTTP(S) URL whose host does not
/// point into loopback, private, or link-local address space. Hostnames are
/// resolved and every returned address is checked before any fetch happens.
pub async fn validate_source_url(raw: &str) -> MediaResult<Url> {
    validate_source_url_allowing(raw, false).await
}

/// As `validate_source_url`, but with the address screening optionally
/// disabled for deployments that fetch from internal hosts. The scheme check
/// always applies.
pub async fn validate_source_url_allowing(raw: &str, allow_private: bool) -> MediaResult<Url> {
    let url = Url::parse(raw)
        .map_err(|_| MediaError::validation(format!("not a valid URL: {raw}")))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(MediaError::validation(format!(
            "unsupported URL scheme '{}'",
            url.scheme()
        )));
    }

    if allow_private {
        return Ok(url);
    }

    let port = url.port_or_known_default().unwrap_or(80);
    match url.host() {
        None => return Err(MediaError::validation("URL has no host")),
        Some(Host::Ipv4(ip)) => {
            if is_blocked_ip(IpAddr::V4(ip)) {
                return Err(MediaError::validation(format!("blocked host address {ip}")));
            }
        }
        Some(Host::Ipv6(ip)) => {
            if is_blocked_ip(IpAddr::V6(ip)) {
                return Err(MediaError::validation(format!("blocked host address {ip}")));
            }
        }
        Some(Host::Domain(domain)) => {
            if domain.eq_ignore_ascii_case("localhost") {
                return Err(MediaError::validation("blocked host 'localhost'"));
            }
            let resolved = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|e| MediaError::validation(format!("cannot resolve {domain}: {e}")))?;
            for addr in resolved {
                if is_blocked_ip(addr.ip()) {
                    return Err(MediaError::validation(format!(
                        "host {domain} resolves to blocked address {}",
                        addr.ip()
                    )));
                }
            }
        }
    }

    Ok(url)
}

fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked_ip(IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (segments[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Replace anything outside `[A-Za-z0-9_-]` in an owner-type segment.
pub fn sanitize_owner_type(owner_type: &str) -> String {
    OWNER_SEGMENT_REGEX.replace_all(owner_type, "_").to_string()
}

/// Object-key base for an owned asset:
/// `{prefix}/{sanitizedOwnerType}/{ownerId}/{assetId}`, with the owner-type
/// segment omitted when it is empty or "_".
pub fn owner_base_key(prefix: &str, owner_type: &str, owner_id: i64, asset_id: i64) -> String {
    let prefix = prefix.trim_end_matches('/');
    let segment = sanitize_owner_type(owner_type);
    if segment.is_empty() || segment == "_" {
        format!("{prefix}/{owner_id}/{asset_id}")
    } else {
        format!("{prefix}/{segment}/{owner_id}/{asset_id}")
    }
}

/// Object-key base for an asset processed without a discoverable owner.
pub fn asset_base_key(prefix: &str, asset_id: i64) -> String {
    format!("{}/_asset/{asset_id}", prefix.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_common_image_headers() {
        assert_eq!(
            sniff_content_type(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Some("image/jpeg")
        );
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&[0; 8]);
        assert_eq!(sniff_content_type(&gif), Some("image/gif"));
        let mut avif = Vec::new();
        avif.extend_from_slice(&[0, 0, 0, 0x1c]);
        avif.extend_from_slice(b"ftypavif");
        avif.extend_from_slice(&[0; 4]);
        assert_eq!(sniff_content_type(&avif), Some("image/avif"));
        assert_eq!(sniff_content_type(b"plain text payload"), None);
    }

    #[test]
    fn rejects_empty_and_oversized_payloads() {
        assert!(validate_image_bytes(&[]).is_err());
        // A giant buffer with a valid header still fails the size cap.
        let mut huge = vec![0u8; MAX_UPLOAD_BYTES + 1];
        huge[..3].copy_from_slice(&[0xFF, 0xD8, 0xFF]);
        assert!(validate_image_bytes(&huge).is_err());
    }

    #[tokio::test]
    async fn url_validation_blocks_ssrf_targets() {
        for bad in [
            "http://127.0.0.1",
            "http://localhost/",
            "http://10.0.0.1/",
            "http://[::1]/",
            "http://192.168.1.10/a.jpg",
            "http://169.254.169.254/latest/meta-data",
            "ftp://example.com/",
            "not a url",
        ] {
            assert!(
                validate_source_url(bad).await.is_err(),
                "expected {bad} to be rejected"
            );
        }
    }

    #[tokio::test]
    async fn url_validation_accepts_public_addresses() {
        // Literal public IPs skip DNS, keeping this test hermetic.
        assert!(validate_source_url("https://93.184.216.34/a.jpg").await.is_ok());
        assert!(validate_source_url("http://8.8.8.8/img.png").await.is_ok());
    }

    #[test]
    fn base_key_layouts() {
        assert_eq!(owner_base_key("p", "Product", 7, 12), "p/Product/7/12");
        assert_eq!(owner_base_key("p/", "App\\Entity\\Post", 2, 5), "p/App_Entity_Post/2/5");
        assert_eq!(owner_base_key("p", "", 7, 12), "p/7/12");
        assert_eq!(owner_base_key("p", "_", 7, 12), "p/7/12");
        assert_eq!(asset_base_key("img/gallery/", 33), "img/gallery/_asset/33");
    }

    #[test]
    fn sha1_is_40_hex() {
        let digest = sha1_hex(b"hello");
        assert_eq!(digest.len(), 40);
        assert_eq!(digest, "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    }
}

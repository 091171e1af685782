//! Magnet URI parsing.
//!
//! Parses the subset of BEP-9 magnet links this engine understands: `xt`
//! (info-hash), `dn` (display name) and any number of `tr` (tracker) entries.
//! Metadata exchange over the peer wire (BEP-9/BEP-10) is not implemented —
//! a magnet link only gets this engine as far as the info-hash and a tracker
//! list, which is enough to announce but not enough to start a download
//! without a matching `.torrent` also being supplied.
use super::TorrentError;
use std::fmt::Write as _;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: [u8; 20],
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

/// Parses a `magnet:?xt=urn:btih:<40-hex>[&dn=...][&tr=...]*` URI.
#[tracing::instrument(level = "debug")]
pub fn parse(uri: &str) -> Result<MagnetLink, TorrentError> {
    if !uri.starts_with("magnet:?") {
        return Err(TorrentError::InvalidFormat(
            "not a magnet URI".to_string(),
        ));
    }

    // `Url` needs a recognized scheme to parse the query string for us; magnet
    // URIs have no authority component so we splice one in rather than hand-roll
    // a query-string splitter.
    let reparsed = format!("magnet://x?{}", &uri["magnet:?".len()..]);
    let parsed = Url::parse(&reparsed)
        .map_err(|e| TorrentError::InvalidFormat(format!("invalid magnet query: {}", e)))?;

    let mut info_hash: Option<[u8; 20]> = None;
    let mut display_name = None;
    let mut trackers = Vec::new();

    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "xt" => {
                let hex = value
                    .strip_prefix("urn:btih:")
                    .ok_or_else(|| TorrentError::InvalidFormat("unsupported xt urn".to_string()))?;
                info_hash = Some(decode_btih(hex)?);
            }
            "dn" => display_name = Some(value.into_owned()),
            "tr" => trackers.push(value.into_owned()),
            _ => {}
        }
    }

    let info_hash = info_hash.ok_or_else(|| TorrentError::InvalidFormat("missing xt".to_string()))?;

    Ok(MagnetLink {
        info_hash,
        display_name,
        trackers,
    })
}

/// Decodes the 40 hex characters of a `btih` urn into a 20-byte info-hash.
/// (BEP-9 also allows a base32 form; this engine only accepts hex, matching
/// what the tracker client and peer handshake both deal in already.)
fn decode_btih(hex_str: &str) -> Result<[u8; 20], TorrentError> {
    if hex_str.len() != 40 {
        return Err(TorrentError::InvalidFormat(format!(
            "info-hash must be 40 hex chars, got {}",
            hex_str.len()
        )));
    }
    let bytes = hex::decode(hex_str.to_lowercase())
        .map_err(|e| TorrentError::InvalidFormat(format!("invalid hex info-hash: {}", e)))?;
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Re-encodes a `MagnetLink` back into a `magnet:?...` URI.
///
/// Tracker ordering is not guaranteed to round-trip (§8 property 7 only
/// requires the same *set* of trackers); this emits them in the link's
/// existing order.
pub fn to_uri(link: &MagnetLink) -> String {
    let mut uri = String::from("magnet:?xt=urn:btih:");
    for byte in link.info_hash {
        let _ = write!(uri, "{:02x}", byte);
    }
    if let Some(name) = &link.display_name {
        uri.push_str("&dn=");
        uri.push_str(&urlencoding::encode(name));
    }
    for tracker in &link.trackers {
        uri.push_str("&tr=");
        uri.push_str(&urlencoding::encode(tracker));
    }
    uri
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_magnet() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";
        let link = parse(uri).unwrap();
        assert_eq!(
            link.info_hash,
            hex::decode("0123456789abcdef0123456789abcdef01234567")
                .unwrap()
                .try_into()
                .unwrap()
        );
        assert_eq!(link.display_name, None);
        assert!(link.trackers.is_empty());
    }

    #[test]
    fn parses_name_and_trackers() {
        let uri = "magnet:?xt=urn:btih:0123456789ABCDEF0123456789ABCDEF01234567&dn=My%20File&tr=http%3A%2F%2Ftracker.example%2Fannounce&tr=udp%3A%2F%2Ftracker2.example%3A80";
        let link = parse(uri).unwrap();
        assert_eq!(link.display_name.as_deref(), Some("My File"));
        assert_eq!(
            link.trackers,
            vec![
                "http://tracker.example/announce".to_string(),
                "udp://tracker2.example:80".to_string(),
            ]
        );
    }

    #[test]
    fn lowercases_info_hash() {
        let uri = "magnet:?xt=urn:btih:ABCDEF0123ABCDEF0123ABCDEF0123ABCDEF0123";
        let link = parse(uri).unwrap();
        assert_eq!(link.info_hash[0], 0xab);
    }

    #[test]
    fn rejects_missing_xt() {
        let uri = "magnet:?dn=no-hash-here";
        assert!(parse(uri).is_err());
    }

    #[test]
    fn rejects_non_magnet_uri() {
        assert!(parse("http://example.com").is_err());
    }

    #[test]
    fn round_trips_through_encode_and_parse() {
        let original = MagnetLink {
            info_hash: [0xAA; 20],
            display_name: Some("Some Name".to_string()),
            trackers: vec!["http://tracker.example/announce".to_string()],
        };
        let uri = to_uri(&original);
        let reparsed = parse(&uri).unwrap();
        assert_eq!(reparsed, original);
    }
}

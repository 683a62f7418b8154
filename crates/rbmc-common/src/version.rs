//! Firmware version digest.
//!
//! Both BMCs must derive the digest identically or redundancy would never
//! see matching code levels: take `VERSION_ID` from /etc/os-release, strip
//! surrounding quotes, SHA-512 the raw string, and render the first four
//! bytes as uppercase hex.

use sha2::{Digest, Sha512};
use std::fs;
use tracing::error;

const OS_RELEASE: &str = "/etc/os-release";

/// Returns the 8-character digest of the local firmware version. An
/// unparseable os-release hashes the empty string rather than failing, so
/// a broken image still publishes a stable (mismatching) digest.
pub fn fw_version_digest() -> String {
    let version = match fs::read_to_string(OS_RELEASE) {
        Ok(text) => parse_version_id(&text).unwrap_or_default(),
        Err(e) => {
            error!(error = %e, "Unable to read {OS_RELEASE}");
            String::new()
        }
    };

    if version.is_empty() {
        error!("Unable to parse VERSION_ID out of {OS_RELEASE}");
    }

    digest_of(&version)
}

/// Extracts the `VERSION_ID` value, with or without surrounding quotes.
pub fn parse_version_id(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .find_map(|line| line.strip_prefix("VERSION_ID="))
        .map(|value| value.trim().trim_matches('"').to_string())
}

/// SHA-512 of the raw string, first four bytes as uppercase hex.
pub fn digest_of(version: &str) -> String {
    let digest = Sha512::digest(version.as_bytes());
    digest[..4].iter().map(|b| format!("{b:02X}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_version_id_with_and_without_quotes() {
        let quoted = "NAME=\"BMC\"\nVERSION_ID=\"2.16.0-dev\"\nID=bmc\n";
        assert_eq!(parse_version_id(quoted), Some("2.16.0-dev".to_string()));

        let bare = "VERSION_ID=2.16.0\n";
        assert_eq!(parse_version_id(bare), Some("2.16.0".to_string()));

        assert_eq!(parse_version_id("NAME=x\n"), None);
    }

    #[test]
    fn digest_is_first_four_sha512_bytes_uppercased() {
        // SHA-512 of the empty string starts cf 83 e1 35.
        assert_eq!(digest_of(""), "CF83E135");
        assert_eq!(digest_of("").len(), 8);
    }

    #[test]
    fn digests_differ_per_version() {
        assert_ne!(digest_of("2.16.0"), digest_of("2.16.1"));
    }
}

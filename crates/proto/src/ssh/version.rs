//! Peer identification string (RFC 4253 Section 4.2).
//!
//! The server announces itself before key exchange:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The session controller only cares about the software part, which decides
//! vendor-specific behavior such as OpenSSH extensions and the OpenSSH 5.x
//! dynamic port reply quirk.
//!
//! # Example
//!
//! ```rust
//! use wisp_proto::ssh::version::Version;
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! assert!(parsed.is_openssh_compatible());
//! ```

use wisp_platform::{WispError, WispResult};

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

const OPENSSH_PREFIX: &str = "OpenSSH_";

/// Parsed peer identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Parses an identification line, with or without the trailing CR LF.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::Protocol`] if the line is too long, contains a
    /// null byte, lacks the `SSH-` prefix, or announces a protocol other
    /// than 2.0 / 1.99.
    pub fn parse(line: &str) -> WispResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(WispError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }
        if line.contains('\0') {
            return Err(WispError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }
        if !line.starts_with("SSH-") {
            return Err(WispError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(WispError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(WispError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match parts[2].split_once(' ') {
            Some((software, comments)) => {
                (software.to_string(), Some(comments.trim().to_string()))
            }
            None => (parts[2].to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "OpenSSH_8.9").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// True for OpenSSH 5 or later, which understands the
    /// `@openssh.com` request extensions.
    pub fn is_openssh_compatible(&self) -> bool {
        self.openssh_major().map_or(false, |major| major >= 5)
    }

    /// OpenSSH 5.x answers a dynamic `tcpip-forward` with the allocated
    /// port but later opens `forwarded-tcpip` channels naming port 0.
    pub fn has_dyn_rport_bug(&self) -> bool {
        self.openssh_major() == Some(5)
    }

    fn openssh_major(&self) -> Option<u32> {
        let rest = self.software_version.strip_prefix(OPENSSH_PREFIX)?;
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

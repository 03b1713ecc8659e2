//! Named SSH channel types, requests, and reason codes.
//!
//! Channel type and request names are listed directly in `packets.rs`
//! derive attributes. Packet numbers are listed in `packets.rs`.
//!
//! [RFC4254](https://tools.ietf.org/html/rfc4254) SSH Connection Protocol
//! and OpenSSH [PROTOCOL](https://cvsweb.openbsd.org/src/usr.bin/ssh/PROTOCOL?annotate=HEAD)
//! for the `@openssh.com` extensions.

/// [RFC4254](https://tools.ietf.org/html/rfc4254)
pub const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Description sent with a forwarded channel open failure when the
/// local target can't be reached.
pub const OPEN_FAILURE_CONNECT: &str = "connect failed";

/// [RFC4254](https://tools.ietf.org/html/rfc4254)
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChanFail {
    SSH_OPEN_ADMINISTRATIVELY_PROHIBITED = 1,
    SSH_OPEN_CONNECT_FAILED = 2,
    SSH_OPEN_UNKNOWN_CHANNEL_TYPE = 3,
    SSH_OPEN_RESOURCE_SHORTAGE = 4,
}

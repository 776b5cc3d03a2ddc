//! Line framing and classification of firmware output.
//!
//! The firmware prints one reading per line as `name(pin): value`, e.g.
//! `v5_main(A1): 731`. Besides readings it prints exactly one other kind of
//! line we care about: the identity token of the role it runs.

use bytes::BytesMut;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

use crate::channel::{ChannelId, channel_by_response_name};
use crate::role::DeviceRole;

static READING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_]+)\s*\(([^()]*)\)\s*:\s*([+-]?[0-9]+)$").expect("reading pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundLine {
    /// A literal identity token
    Identity(DeviceRole),
    /// A reading for a known channel
    Reading { channel: ChannelId, value: i32 },
    /// Anything else; logged and dropped
    Unrecognized,
}

/// Classify one complete line (already stripped of its terminator)
pub fn classify_line(line: &str) -> InboundLine {
    let line = line.trim();

    for role in DeviceRole::ALL {
        if role.matches_line(line) {
            return InboundLine::Identity(role);
        }
    }

    let Some(caps) = READING_RE.captures(line) else {
        debug!(line, "Dropping line outside the reading grammar");
        return InboundLine::Unrecognized;
    };

    let Some(channel) = channel_by_response_name(&caps[1]) else {
        debug!(line, name = &caps[1], "Dropping reading for unknown channel");
        return InboundLine::Unrecognized;
    };

    match caps[3].parse::<i32>() {
        Ok(value) => InboundLine::Reading {
            channel: channel.id,
            value,
        },
        Err(e) => {
            debug!(line, error = %e, "Dropping reading with unparseable value");
            InboundLine::Unrecognized
        }
    }
}

/// Remove every complete `\n`-terminated line from `buf`.
///
/// Trailing `\r` is stripped, empty lines are skipped and invalid UTF-8 is
/// replaced rather than rejected. An unterminated tail stays in the buffer.
pub fn split_lines(buf: &mut BytesMut) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let raw = buf.split_to(pos + 1);
        let mut line = &raw[..pos];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        if line.is_empty() {
            continue;
        }
        lines.push(String::from_utf8_lossy(line).into_owned());
    }
    lines
}

/// Permissively decode probe output and look for either identity token.
///
/// Used by the mode scanner, which matches substrings rather than whole lines
/// because it never frames the stream. When both tokens are present the one
/// that arrived first wins.
pub fn detect_role(bytes: &[u8]) -> Option<DeviceRole> {
    let text = String::from_utf8_lossy(bytes).to_ascii_lowercase();
    DeviceRole::ALL
        .into_iter()
        .filter_map(|role| {
            text.find(&role.identity_token().to_ascii_lowercase())
                .map(|pos| (pos, role))
        })
        .min_by_key(|&(pos, _)| pos)
        .map(|(_, role)| role)
}

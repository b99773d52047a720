use regex_lite::Regex;

use crate::mode::ServerMode;

/// Connection parameters scraped from server output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerAddress {
    pub port: u16,
    pub token: String,
}

/// Scans startup output for the active mode's readiness banner.
///
/// The child does not line-buffer, so a banner can be split across two
/// stream reads. A bounded tail of prior output is kept and rescanned
/// together with each new chunk.
pub(crate) struct ReadinessScanner {
    pattern: Regex,
    carry: String,
}

// Longest sensible banner tail: URL plus a generous token length.
const CARRY_MAX_BYTES: usize = 256;

impl ReadinessScanner {
    pub(crate) fn new(mode: ServerMode) -> Self {
        Self {
            pattern: mode.readiness_pattern(),
            carry: String::new(),
        }
    }

    /// Feeds one output chunk; returns the parsed address on the first
    /// complete match.
    pub(crate) fn scan(&mut self, chunk: &str) -> Option<ServerAddress> {
        self.carry.push_str(chunk);
        let address = self.pattern.captures(&self.carry).and_then(|captures| {
            let port = captures.get(1)?.as_str().parse().ok()?;
            let token = captures.get(2)?.as_str().to_string();
            Some(ServerAddress { port, token })
        });
        match address {
            Some(address) => {
                self.carry.clear();
                Some(address)
            }
            None => {
                self.trim_carry();
                None
            }
        }
    }

    fn trim_carry(&mut self) {
        if self.carry.len() <= CARRY_MAX_BYTES {
            return;
        }
        let mut cut = self.carry.len() - CARRY_MAX_BYTES;
        while !self.carry.is_char_boundary(cut) {
            cut += 1;
        }
        self.carry.drain(..cut);
    }
}

//! Assembles confirmed DTMF keys into command codes.
//!
//! `*` clears, `#` submits, digits append up to four. Anything else clears
//! the buffer: malformed input fails closed instead of being truncated.

use crate::constants::MAX_COMMAND_DIGITS;
use crate::dtmf::DtmfKey;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    /// Operator pressed `*`.
    Star,
    /// No key arrived within the inter-digit timeout.
    Timeout,
    /// A fifth digit was entered.
    Overflow,
    /// A letter key (A-D) was entered.
    InvalidKey,
}

impl fmt::Display for ClearReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ClearReason::Star => "cleared by *",
            ClearReason::Timeout => "inter-digit timeout",
            ClearReason::Overflow => "more than four digits",
            ClearReason::InvalidKey => "invalid key",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Submitted(String),
    Cleared(ClearReason),
}

/// Copyable view of the in-progress buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandSnapshot {
    digits: [u8; MAX_COMMAND_DIGITS],
    len: u8,
}

impl CommandSnapshot {
    pub fn digits(&self) -> &[u8] {
        &self.digits[..self.len as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Packs into a u32 (length above four 4-bit digits) for lock-free publication.
    pub fn pack(&self) -> u32 {
        let mut packed = (self.len as u32) << 16;
        for (i, d) in self.digits().iter().enumerate() {
            packed |= (*d as u32 & 0xf) << (12 - 4 * i);
        }
        packed
    }

    pub fn unpack(packed: u32) -> Self {
        let len = ((packed >> 16) as u8).min(MAX_COMMAND_DIGITS as u8);
        let mut digits = [0u8; MAX_COMMAND_DIGITS];
        for (i, d) in digits.iter_mut().enumerate().take(len as usize) {
            *d = ((packed >> (12 - 4 * i)) & 0xf) as u8;
        }
        Self { digits, len }
    }
}

impl fmt::Display for CommandSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in self.digits() {
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

pub struct CommandAssembler {
    buffer: CommandSnapshot,
    last_key: Duration,
    timeout: Duration,
}

impl CommandAssembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            buffer: CommandSnapshot::default(),
            last_key: Duration::ZERO,
            timeout,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn snapshot(&self) -> CommandSnapshot {
        self.buffer
    }

    /// Expires a stale partial entry.
    pub fn tick(&mut self, now: Duration) -> Option<CommandOutcome> {
        if !self.buffer.is_empty() && now.saturating_sub(self.last_key) >= self.timeout {
            self.clear();
            return Some(CommandOutcome::Cleared(ClearReason::Timeout));
        }
        None
    }

    pub fn push(&mut self, key: DtmfKey, now: Duration) -> Option<CommandOutcome> {
        // A stale partial entry never combines with a new key.
        let expired = self.tick(now);
        self.last_key = now;

        let outcome = match key {
            DtmfKey::Star => {
                let had_digits = !self.buffer.is_empty();
                self.clear();
                had_digits.then_some(CommandOutcome::Cleared(ClearReason::Star))
            }
            DtmfKey::Pound => {
                if self.buffer.is_empty() {
                    None
                } else {
                    let code = self.buffer.to_string();
                    self.clear();
                    Some(CommandOutcome::Submitted(code))
                }
            }
            DtmfKey::Digit(d) => {
                if self.buffer.len as usize >= MAX_COMMAND_DIGITS {
                    self.clear();
                    Some(CommandOutcome::Cleared(ClearReason::Overflow))
                } else {
                    self.buffer.digits[self.buffer.len as usize] = d;
                    self.buffer.len += 1;
                    None
                }
            }
            DtmfKey::Letter(_) => {
                let had_digits = !self.buffer.is_empty();
                self.clear();
                had_digits.then_some(CommandOutcome::Cleared(ClearReason::InvalidKey))
            }
        };
        outcome.or(expired)
    }

    pub fn clear(&mut self) {
        self.buffer = CommandSnapshot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(assembler: &mut CommandAssembler, keys: &str, start_ms: u64) -> Vec<CommandOutcome> {
        keys.chars()
            .enumerate()
            .filter_map(|(i, c)| {
                let now = Duration::from_millis(start_ms + i as u64 * 300);
                assembler.push(DtmfKey::from_char(c).unwrap(), now)
            })
            .collect()
    }

    fn assembler() -> CommandAssembler {
        CommandAssembler::new(Duration::from_secs(5))
    }

    #[test]
    fn test_submit_three_digits() {
        let mut a = assembler();
        let out = feed(&mut a, "123#", 0);
        assert_eq!(out, vec![CommandOutcome::Submitted("123".into())]);
        assert!(a.snapshot().is_empty());
    }

    #[test]
    fn test_fifth_digit_rejected() {
        let mut a = assembler();
        let out = feed(&mut a, "12345", 0);
        assert_eq!(out, vec![CommandOutcome::Cleared(ClearReason::Overflow)]);
        assert!(a.snapshot().is_empty());
    }

    #[test]
    fn test_four_digits_submit() {
        let mut a = assembler();
        let out = feed(&mut a, "0001#", 0);
        assert_eq!(out, vec![CommandOutcome::Submitted("0001".into())]);
    }

    #[test]
    fn test_star_clears() {
        let mut a = assembler();
        let out = feed(&mut a, "12*34#", 0);
        assert_eq!(
            out,
            vec![
                CommandOutcome::Cleared(ClearReason::Star),
                CommandOutcome::Submitted("34".into())
            ]
        );
    }

    #[test]
    fn test_pound_on_empty_is_noop() {
        let mut a = assembler();
        assert!(feed(&mut a, "#", 0).is_empty());
        assert!(feed(&mut a, "*", 1000).is_empty());
    }

    #[test]
    fn test_letter_fails_closed() {
        let mut a = assembler();
        let out = feed(&mut a, "12A3#", 0);
        assert_eq!(
            out,
            vec![
                CommandOutcome::Cleared(ClearReason::InvalidKey),
                CommandOutcome::Submitted("3".into())
            ]
        );
    }

    #[test]
    fn test_inter_digit_timeout() {
        let mut a = assembler();
        feed(&mut a, "12", 0);
        assert_eq!(a.tick(Duration::from_millis(4000)), None);
        assert_eq!(
            a.tick(Duration::from_millis(5400)),
            Some(CommandOutcome::Cleared(ClearReason::Timeout))
        );
        assert!(a.snapshot().is_empty());
    }

    #[test]
    fn test_stale_digits_do_not_combine() {
        let mut a = assembler();
        feed(&mut a, "12", 0);
        // Next key arrives long after the timeout, without an intervening tick.
        let out = feed(&mut a, "3#", 20_000);
        assert_eq!(
            out,
            vec![
                CommandOutcome::Cleared(ClearReason::Timeout),
                CommandOutcome::Submitted("3".into())
            ]
        );
    }

    #[test]
    fn test_snapshot_pack() {
        let mut a = assembler();
        feed(&mut a, "907", 0);
        let snap = a.snapshot();
        assert_eq!(snap.to_string(), "907");
        assert_eq!(CommandSnapshot::unpack(snap.pack()), snap);
    }
}

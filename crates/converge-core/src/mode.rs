//! Permission mode strings
//!
//! A mode string is either octal (`644`, `0755`) or a comma-separated list
//! of symbolic clauses (`u+rwx,go-w`, `a=r`). Both are reduced to a pair of
//! masks: bits that must be set and bits that must be cleared.

use crate::{Error, Result};

const WHO_USER: u32 = 0o4700;
const WHO_GROUP: u32 = 0o2070;
const WHO_OTHER: u32 = 0o0007;
const STICKY: u32 = 0o1000;

/// Bits to add and bits to remove.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeMask {
    pub plus: u32,
    pub minus: u32,
}

impl ModeMask {
    /// An exact mode: every other bit is cleared.
    pub fn exact(mode: u32) -> Self {
        let mode = mode & 0o7777;
        Self {
            plus: mode,
            minus: !mode & 0o7777,
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let invalid = || Error::InvalidMode {
            mode: text.to_string(),
        };

        if text.is_empty() {
            return Err(invalid());
        }

        if text.chars().all(|c| c.is_digit(8)) {
            let value = u32::from_str_radix(text, 8).map_err(|_| invalid())?;
            if value > 0o7777 {
                return Err(invalid());
            }
            return Ok(Self::exact(value));
        }

        let mut mask = Self::default();
        for clause in text.split(',') {
            mask.apply_clause(clause).ok_or_else(invalid)?;
        }
        Ok(mask)
    }

    fn apply_clause(&mut self, clause: &str) -> Option<()> {
        let op_at = clause.find(['+', '-', '='])?;
        let (who_part, rest) = clause.split_at(op_at);

        let mut who = 0;
        for c in who_part.chars() {
            who |= match c {
                'u' => WHO_USER,
                'g' => WHO_GROUP,
                'o' => WHO_OTHER,
                'a' => WHO_USER | WHO_GROUP | WHO_OTHER,
                _ => return None,
            };
        }
        if who == 0 {
            who = WHO_USER | WHO_GROUP | WHO_OTHER;
        }

        let mut chars = rest.chars();
        let op = chars.next()?;

        let mut bits = 0;
        for c in chars {
            bits |= match c {
                'r' => 0o444 & who,
                'w' => 0o222 & who,
                'x' => 0o111 & who,
                's' => 0o6000 & who,
                't' => STICKY,
                _ => return None,
            };
        }

        match op {
            '+' => {
                self.plus |= bits;
                self.minus &= !bits;
            }
            '-' => {
                self.minus |= bits;
                self.plus &= !bits;
            }
            '=' => {
                let scope = who | if bits & STICKY != 0 { STICKY } else { 0 };
                self.plus = (self.plus & !scope) | bits;
                self.minus = (self.minus & !scope) | (scope & !bits);
            }
            _ => return None,
        }
        Some(())
    }

    /// Mode after applying the masks to `mode`.
    pub fn apply(&self, mode: u32) -> u32 {
        ((mode & 0o7777) | self.plus) & !self.minus & 0o7777
    }

    /// Whether `mode` already satisfies the masks.
    pub fn matches(&self, mode: u32) -> bool {
        self.apply(mode) == mode & 0o7777
    }
}

/// Grant execute wherever read is granted, for directories.
pub fn with_rx_for_dirs(mode: u32) -> u32 {
    let mut out = mode;
    for (r, x) in [(0o400, 0o100), (0o040, 0o010), (0o004, 0o001)] {
        if mode & r != 0 {
            out |= x;
        }
    }
    out
}

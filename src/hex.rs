// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wrapper around `pretty-hex` that caps dump length, for packet payloads in
//! log and error output.

use pretty_hex::PrettyHex;

pub(crate) struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub(crate) fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl std::fmt::Debug for LimitedHex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let omitted = self.inner.len().checked_sub(self.max_bytes);
        let print = match omitted {
            Some(_) => &self.inner[..self.max_bytes],
            None => self.inner,
        };
        writeln!(f, "Length: {0} (0x{0:x}) bytes", self.inner.len())?;
        write!(
            f,
            "{:#?}",
            print.hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if let Some(o) = omitted {
            write!(f, "\n...{0} (0x{0:x}) bytes not shown...", o)?;
        }
        Ok(())
    }
}

//! Masked find/replace shared by ACPI and kernel patches.

/// One find/replace directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pattern<'a> {
    /// Bytes to look for
    pub find: &'a [u8],
    /// Bytes to write at each match
    pub replace: &'a [u8],
    /// Bits of `find` compared; empty compares all
    pub mask: &'a [u8],
    /// Bits of `replace` written; empty writes all
    pub replace_mask: &'a [u8],
    /// Maximum replacements; 0 is unlimited
    pub count: u32,
    /// Matches left untouched before the first replacement
    pub skip: u32,
    /// Bytes searched from the start; 0 searches everything
    pub limit: u32,
}

impl Pattern<'_> {
    /// Check the directive is internally consistent.
    pub fn check(&self) -> Result<(), &'static str> {
        if self.find.is_empty() {
            return Err("Find is empty");
        }
        if self.replace.len() != self.find.len() {
            return Err("Replace length differs from Find");
        }
        if !self.mask.is_empty() && self.mask.len() != self.find.len() {
            return Err("Mask length differs from Find");
        }
        if !self.replace_mask.is_empty() && self.replace_mask.len() != self.find.len() {
            return Err("ReplaceMask length differs from Find");
        }
        Ok(())
    }

    fn matches_at(&self, window: &[u8]) -> bool {
        window.iter().enumerate().all(|(i, byte)| {
            let mask = self.mask.get(i).copied().unwrap_or(0xFF);
            byte & mask == self.find[i] & mask
        })
    }

    fn write_at(&self, window: &mut [u8]) {
        for (i, byte) in window.iter_mut().enumerate() {
            let mask = self.replace_mask.get(i).copied().unwrap_or(0xFF);
            *byte = (*byte & !mask) | (self.replace[i] & mask);
        }
    }

    /// Apply to `data` in place and return the number of replacements.
    ///
    /// Matches never overlap; the search resumes after each match.
    pub fn apply(&self, data: &mut [u8]) -> u32 {
        if self.check().is_err() {
            return 0;
        }
        let end = match self.limit {
            0 => data.len(),
            limit => data.len().min(limit as usize),
        };
        let len = self.find.len();

        let mut skipped = 0;
        let mut replaced = 0;
        let mut offset = 0;
        while offset + len <= end {
            if !self.matches_at(&data[offset..offset + len]) {
                offset += 1;
                continue;
            }
            if skipped < self.skip {
                skipped += 1;
            } else {
                self.write_at(&mut data[offset..offset + len]);
                replaced += 1;
                if self.count != 0 && replaced == self.count {
                    break;
                }
            }
            offset += len;
        }
        replaced
    }
}

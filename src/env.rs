//! Environment-block composition (ambient complement to C5's commandline
//! composition step). Deduplicates case-insensitively, last writer wins,
//! and always carries `SYSTEMROOT` (spec §4.5, invariant 9).

/// Builds a process environment one `(key, value)` pair at a time, then
/// renders it either as a sorted `Vec<(String, String)>` or as the
/// NUL-terminated wide-string block `CreateProcessW` expects.
#[derive(Debug, Default, Clone)]
pub struct EnvBlock {
    // Small enough per-process that a linear scan beats a hash map's
    // allocation overhead; insertion order doesn't matter since the final
    // render sorts by key anyway (CreateProcessW does not require any
    // particular order).
    entries: Vec<(String, String)>,
}

impl EnvBlock {
    pub fn new() -> Self {
        EnvBlock { entries: Vec::new() }
    }

    /// Seed from the current process's inherited block (`key=value` pairs,
    /// one per host environment variable).
    pub fn from_current_process() -> Self {
        let mut block = EnvBlock::new();
        for (k, v) in std::env::vars() {
            block.set(&k, &v);
        }
        block
    }

    /// Insert or overwrite `key`, matching case-insensitively against any
    /// existing entry.
    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            existing.1 = value.to_string();
        } else {
            self.entries.push((key.to_string(), value.to_string()));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Overlay `other` onto `self`, `other` winning on key collisions.
    pub fn overlay(&mut self, other: &[(String, String)]) {
        for (k, v) in other {
            self.set(k, v);
        }
    }

    /// Append `value` to a `;`-delimited variable, creating it if absent.
    pub fn append_path_like(&mut self, key: &str, value: &str) {
        match self.get(key) {
            Some(existing) if !existing.is_empty() => {
                let combined = format!("{existing};{value}");
                self.set(key, &combined);
            }
            _ => self.set(key, value),
        }
    }

    /// Ensure `SYSTEMROOT` is present, pulling it from the current process
    /// if the caller's composition didn't set it.
    pub fn ensure_systemroot(&mut self) {
        if !self.contains_key("SYSTEMROOT") {
            if let Ok(value) = std::env::var("SYSTEMROOT") {
                self.set("SYSTEMROOT", &value);
            }
        }
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Render as the NUL-terminated wide-string records `CreateProcessW`'s
    /// `lpEnvironment` expects, terminated by an empty record.
    #[cfg(windows)]
    pub fn to_wide_block(&self) -> Vec<u16> {
        let mut sorted = self.entries.clone();
        sorted.sort_by(|a, b| a.0.to_ascii_uppercase().cmp(&b.0.to_ascii_uppercase()));

        let mut block = Vec::new();
        for (k, v) in &sorted {
            block.extend(format!("{k}={v}").encode_utf16());
            block.push(0);
        }
        block.push(0);
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_case_insensitive_last_writer_wins() {
        let mut block = EnvBlock::new();
        block.set("Path", "a");
        block.set("PATH", "b");
        assert_eq!(block.entries().len(), 1);
        assert_eq!(block.get("path"), Some("b"));
    }

    #[test]
    fn overlay_preserves_unrelated_keys() {
        let mut block = EnvBlock::new();
        block.set("FOO", "1");
        block.overlay(&[("BAR".to_string(), "2".to_string())]);
        assert_eq!(block.get("FOO"), Some("1"));
        assert_eq!(block.get("BAR"), Some("2"));
    }

    #[test]
    fn append_path_like_joins_with_semicolon() {
        let mut block = EnvBlock::new();
        block.set("PATH", "C:\\a");
        block.append_path_like("PATH", "C:\\b");
        assert_eq!(block.get("PATH"), Some("C:\\a;C:\\b"));
    }

    #[test]
    fn ensure_systemroot_is_idempotent_when_already_set() {
        let mut block = EnvBlock::new();
        block.set("SYSTEMROOT", "C:\\Windows");
        block.ensure_systemroot();
        assert_eq!(block.get("SYSTEMROOT"), Some("C:\\Windows"));
    }
}

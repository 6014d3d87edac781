//! Filter / selection.
//!
//! Glob include/exclude rules applied along three independent dimensions:
//! disk name, path within a disk, and error state (`-e <error>`). Rules are
//! evaluated in configuration order; the last matching rule wins, mirroring
//! the `exclude <glob>` / `include <glob>` directive pair — an `include`
//! after an `exclude` carves an exception back out. The error dimension
//! matches against a short tag naming the kind of problem found at a
//! position (`missing`, `parity`, `unrecoverable`) rather than a path or
//! disk name, letting `check`/`fix` be pointed at one class of damage
//! without touching the others.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Include,
    Exclude,
}

#[derive(Debug, Clone)]
struct Rule {
    verdict: Verdict,
    pattern: String,
}

#[derive(Debug, Clone, Default)]
pub struct Filter {
    path_rules: Vec<Rule>,
    disk_rules: Vec<Rule>,
    error_rules: Vec<Rule>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude_path(&mut self, pattern: impl Into<String>) {
        self.path_rules.push(Rule { verdict: Verdict::Exclude, pattern: pattern.into() });
    }

    pub fn include_path(&mut self, pattern: impl Into<String>) {
        self.path_rules.push(Rule { verdict: Verdict::Include, pattern: pattern.into() });
    }

    pub fn exclude_disk(&mut self, pattern: impl Into<String>) {
        self.disk_rules.push(Rule { verdict: Verdict::Exclude, pattern: pattern.into() });
    }

    pub fn include_disk(&mut self, pattern: impl Into<String>) {
        self.disk_rules.push(Rule { verdict: Verdict::Include, pattern: pattern.into() });
    }

    pub fn exclude_error(&mut self, pattern: impl Into<String>) {
        self.error_rules.push(Rule { verdict: Verdict::Exclude, pattern: pattern.into() });
    }

    pub fn include_error(&mut self, pattern: impl Into<String>) {
        self.error_rules.push(Rule { verdict: Verdict::Include, pattern: pattern.into() });
    }

    /// `true` if `path` survives the configured rules (default: included).
    pub fn allows_path(&self, path: &str) -> bool {
        allows(&self.path_rules, path)
    }

    pub fn allows_disk(&self, name: &str) -> bool {
        allows(&self.disk_rules, name)
    }

    /// `true` if an error tagged `kind` (e.g. `"missing"`, `"parity"`,
    /// `"unrecoverable"`) survives the configured rules (default: included).
    pub fn allows_error(&self, kind: &str) -> bool {
        allows(&self.error_rules, kind)
    }
}

fn allows(rules: &[Rule], candidate: &str) -> bool {
    let mut verdict = Verdict::Include;
    for rule in rules {
        if glob_match(&rule.pattern, candidate) {
            verdict = rule.verdict;
        }
    }
    verdict == Verdict::Include
}

/// Minimal shell-style glob: `*` (any run, no `/` crossing unless the
/// pattern itself contains `/`), `?` (single char), literal otherwise.
/// Sufficient for typical `exclude`/`include` patterns (`*.tmp`,
/// `/disk1/cache/*`) without pulling in a dedicated glob crate for a
/// feature this narrow.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    glob_match_bytes(pattern.as_bytes(), candidate.as_bytes())
}

fn glob_match_bytes(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'*') => {
            glob_match_bytes(&pattern[1..], text)
                || (!text.is_empty() && glob_match_bytes(pattern, &text[1..]))
        }
        Some(b'?') => !text.is_empty() && glob_match_bytes(&pattern[1..], &text[1..]),
        Some(&c) => !text.is_empty() && text[0] == c && glob_match_bytes(&pattern[1..], &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_any_run() {
        assert!(glob_match("*.tmp", "cache.tmp"));
        assert!(!glob_match("*.tmp", "cache.tmpx"));
        assert!(glob_match("/disk1/cache/*", "/disk1/cache/a/b.txt"));
    }

    #[test]
    fn default_allows_everything() {
        let f = Filter::new();
        assert!(f.allows_path("anything"));
        assert!(f.allows_disk("disk1"));
    }

    #[test]
    fn later_include_overrides_earlier_exclude() {
        let mut f = Filter::new();
        f.exclude_path("*.tmp");
        f.include_path("keep.tmp");
        assert!(!f.allows_path("scratch.tmp"));
        assert!(f.allows_path("keep.tmp"));
    }

    #[test]
    fn error_dimension_is_independent_of_path_and_disk() {
        let mut f = Filter::new();
        f.exclude_error("*");
        f.include_error("parity");
        assert!(f.allows_error("parity"));
        assert!(!f.allows_error("missing"));
        assert!(f.allows_path("anything"));
        assert!(f.allows_disk("disk1"));
    }
}

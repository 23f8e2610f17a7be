use sha2::{Digest, Sha256};

/// Result of matching a name against the folder's ignore patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    Keep,
    Ignore { deletable: bool },
}

impl MatchResult {
    pub fn is_ignored(&self) -> bool {
        matches!(self, MatchResult::Ignore { .. })
    }

    /// Ignored, and safe to remove when it stands in the way of a
    /// directory deletion.
    pub fn is_deletable(&self) -> bool {
        matches!(self, MatchResult::Ignore { deletable: true })
    }
}

#[derive(Debug, Clone)]
struct Pattern {
    glob: String,
    deletable: bool,
}

/// Ignore patterns for one folder. A pattern matches a name if it matches
/// the full name or any parent path, so ignoring a directory ignores its
/// contents. `(?d)` marks a pattern's matches as deletable.
#[derive(Debug, Default)]
pub struct IgnoreMatcher {
    patterns: Vec<Pattern>,
    fingerprint: String,
}

impl IgnoreMatcher {
    pub fn new(lines: &[String]) -> Self {
        let mut patterns = Vec::new();
        let mut hasher = Sha256::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            let (deletable, glob) = match line.strip_prefix("(?d)") {
                Some(rest) => (true, rest.trim()),
                None => (false, line),
            };
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
            patterns.push(Pattern {
                glob: glob.to_string(),
                deletable,
            });
        }
        let digest = hasher.finalize();
        let fingerprint = digest.iter().fold(String::new(), |mut out, b| {
            out.push_str(&format!("{b:02x}"));
            out
        });
        Self {
            patterns,
            fingerprint,
        }
    }

    /// Fingerprint of the pattern set; changes when the policy changes.
    pub fn hash(&self) -> &str {
        &self.fingerprint
    }

    pub fn match_name(&self, name: &str) -> MatchResult {
        for pattern in &self.patterns {
            if matches_with_parents(&pattern.glob, name) {
                return MatchResult::Ignore {
                    deletable: pattern.deletable,
                };
            }
        }
        MatchResult::Keep
    }
}

fn matches_with_parents(glob: &str, name: &str) -> bool {
    if glob_match(glob, name) {
        return true;
    }
    // A pattern matching a parent directory covers everything below it.
    let mut rest = name;
    while let Some((parent, _)) = rest.rsplit_once('/') {
        if glob_match(glob, parent) {
            return true;
        }
        rest = parent;
    }
    false
}

/// Minimal glob: `?` matches one non-separator character, `*` any run of
/// non-separator characters, `**` any run including separators.
fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    glob_match_at(&p, &n)
}

fn glob_match_at(p: &[char], n: &[char]) -> bool {
    match p.first() {
        None => n.is_empty(),
        Some('*') => {
            if p.get(1) == Some(&'*') {
                // `**` may consume anything, separators included.
                (0..=n.len()).any(|i| glob_match_at(&p[2..], &n[i..]))
            } else {
                let limit = n.iter().position(|&c| c == '/').unwrap_or(n.len());
                (0..=limit).any(|i| glob_match_at(&p[1..], &n[i..]))
            }
        }
        Some('?') => !n.is_empty() && n[0] != '/' && glob_match_at(&p[1..], &n[1..]),
        Some(&c) => n.first() == Some(&c) && glob_match_at(&p[1..], &n[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(lines: &[&str]) -> IgnoreMatcher {
        IgnoreMatcher::new(&lines.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn literal_and_star_patterns() {
        let m = matcher(&["*.log", "build"]);
        assert!(m.match_name("a.log").is_ignored());
        assert!(m.match_name("build").is_ignored());
        assert!(!m.match_name("a.txt").is_ignored());
        // `*` does not cross separators.
        assert!(!m.match_name("dir/a.log").is_ignored());
    }

    #[test]
    fn double_star_crosses_directories() {
        let m = matcher(&["**/*.log"]);
        assert!(m.match_name("dir/sub/a.log").is_ignored());
        assert!(!m.match_name("dir/sub/a.txt").is_ignored());
    }

    #[test]
    fn ignored_directory_covers_children() {
        let m = matcher(&["cache"]);
        assert!(m.match_name("cache/inner/file").is_ignored());
    }

    #[test]
    fn deletable_prefix() {
        let m = matcher(&["(?d).DS_Store", "secret"]);
        assert!(m.match_name(".DS_Store").is_deletable());
        assert!(m.match_name("secret").is_ignored());
        assert!(!m.match_name("secret").is_deletable());
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let m = matcher(&["", "// a comment", "real"]);
        assert!(m.match_name("real").is_ignored());
        assert!(!m.match_name("// a comment").is_ignored());
    }

    #[test]
    fn hash_tracks_pattern_changes() {
        let a = matcher(&["*.log"]);
        let b = matcher(&["*.log"]);
        let c = matcher(&["*.tmp"]);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn question_mark_matches_single_character() {
        let m = matcher(&["?.txt"]);
        assert!(m.match_name("a.txt").is_ignored());
        assert!(!m.match_name("ab.txt").is_ignored());
    }
}

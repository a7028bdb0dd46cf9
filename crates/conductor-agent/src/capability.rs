use std::collections::HashMap;

/// How a single required capability was satisfied by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Same tag after normalization, or a declared synonym.
    Exact,
    /// One tag is a substring of the other.
    Partial,
    None,
}

/// Weight of a partial match relative to an exact one.
const PARTIAL_WEIGHT: f64 = 0.7;

/// Matches required capability tags against an agent's declared tags.
///
/// Tags are compared case-insensitively with `-` and spaces folded into `_`.
/// Tags in the same synonym group count as exact matches.
#[derive(Debug, Clone, Default)]
pub struct CapabilityMatcher {
    groups: HashMap<String, usize>,
}

impl CapabilityMatcher {
    pub fn new(synonyms: &[Vec<String>]) -> Self {
        let mut groups = HashMap::new();
        for (idx, group) in synonyms.iter().enumerate() {
            for tag in group {
                groups.insert(normalize(tag), idx);
            }
        }
        Self { groups }
    }

    pub fn match_kind(&self, required: &str, declared: &[String]) -> MatchKind {
        let required = normalize(required);
        if required.is_empty() {
            return MatchKind::None;
        }
        let declared: Vec<String> = declared.iter().map(|d| normalize(d)).collect();

        if declared.iter().any(|d| *d == required || self.synonymous(d, &required)) {
            return MatchKind::Exact;
        }
        if declared
            .iter()
            .any(|d| !d.is_empty() && (d.contains(&required) || required.contains(d.as_str())))
        {
            return MatchKind::Partial;
        }
        MatchKind::None
    }

    /// `(exact + 0.7 * partial) / required`, or 1.0 when nothing is required.
    pub fn score(&self, required: &[String], declared: &[String]) -> f64 {
        if required.is_empty() {
            return 1.0;
        }
        let mut total = 0.0;
        for tag in required {
            total += match self.match_kind(tag, declared) {
                MatchKind::Exact => 1.0,
                MatchKind::Partial => PARTIAL_WEIGHT,
                MatchKind::None => 0.0,
            };
        }
        total / required.len() as f64
    }

    /// Every required tag has at least a partial match.
    pub fn covers_all(&self, required: &[String], declared: &[String]) -> bool {
        required
            .iter()
            .all(|tag| self.match_kind(tag, declared) != MatchKind::None)
    }

    fn synonymous(&self, a: &str, b: &str) -> bool {
        match (self.groups.get(a), self.groups.get(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }
}

pub fn normalize(tag: &str) -> String {
    tag.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '-' || c == ' ' { '_' } else { c })
        .collect()
}

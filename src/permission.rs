use once_cell::sync::Lazy;
use regex::Regex;

/// Keywords seen in provider errors when a grant is missing. Matched case-insensitively.
pub const DEFAULT_PERMISSION_KEYWORDS: &[&str] = &[
    "permission",
    "scope",
    "forbidden",
    "403",
    "401",
    "unauthorized",
    "unauthenticated",
    "insufficient",
    "token",
    "authentication",
    "access denied",
    "consent",
];

static TOKEN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(missing|invalid|expired|revoked)\s+(access\s+|auth\s+|oauth\s+|id\s+)?(token|credentials?|grant)",
        r"(token|credentials?)\s+(has\s+|have\s+|is\s+|are\s+)?(been\s+)?(expired|revoked|invalid|missing)",
        r"\binvalid_(grant|token|scope)\b",
        r"\bnot\s+(authorized|authorised|allowed)\b",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Decides whether a failed secondary save needs more authorization.
///
/// Provider error wording is not a stable contract, so the orchestrator only
/// depends on this predicate and a structured error-code check can replace
/// the keyword heuristic later.
pub trait PermissionClassifier: Send + Sync {
    fn is_permission_error(&self, message: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct KeywordPermissionClassifier {
    keywords: Vec<String>,
}

impl KeywordPermissionClassifier {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }
}

impl Default for KeywordPermissionClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_PERMISSION_KEYWORDS)
    }
}

impl PermissionClassifier for KeywordPermissionClassifier {
    fn is_permission_error(&self, message: &str) -> bool {
        let lowered = message.trim().to_lowercase();
        if lowered.is_empty() {
            return false;
        }
        self.keywords.iter().any(|k| lowered.contains(k.as_str()))
            || TOKEN_PATTERNS.iter().any(|re| re.is_match(&lowered))
    }
}

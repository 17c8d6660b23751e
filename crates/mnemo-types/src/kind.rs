//! Closed noun and verb vocabularies with nearest-match suggestions.
//!
//! Unknown kinds are rejected with `InvalidArgument`; when a known kind sits
//! within Levenshtein distance 3 (case-insensitive) it is offered as a hint.

use std::fmt;

use mnemo_error::{MnemoError, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! closed_vocab {
    ($(#[$doc:meta])* $name:ident, $what:literal, [$($variant:ident),+ $(,)?]) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            /// Every member of the vocabulary, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant,)+];

            /// Canonical wire spelling.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant),)+
                }
            }

            /// Parse a kind case-insensitively, suggesting the nearest
            /// member on failure.
            pub fn parse(raw: &str) -> Result<Self> {
                for kind in Self::ALL {
                    if kind.as_str().eq_ignore_ascii_case(raw) {
                        return Ok(*kind);
                    }
                }
                Err(MnemoError::InvalidArgument {
                    what: $what,
                    value: raw.to_owned(),
                    hint: suggest_nearest(raw, Self::ALL.iter().map(|k| k.as_str())),
                })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Self::parse(&raw).map_err(D::Error::custom)
            }
        }
    };
}

closed_vocab!(
    /// Entity ("noun") kinds.
    NounKind,
    "noun kind",
    [
        Person,
        Organization,
        Location,
        Event,
        Concept,
        Document,
        Product,
        Project,
        Task,
        Message,
        Topic,
        Skill,
        Tool,
        Dataset,
        Model,
        Service,
        Team,
        Role,
        Goal,
        Metric,
        Note,
        Question,
        Answer,
        Decision,
        Requirement,
        Risk,
        Resource,
        Account,
        Tag,
        Media,
    ]
);

closed_vocab!(
    /// Relationship ("verb") kinds.
    VerbKind,
    "verb kind",
    [
        RelatedTo,
        PartOf,
        Contains,
        Created,
        CreatedBy,
        Owns,
        OwnedBy,
        WorksFor,
        WorksWith,
        Manages,
        ManagedBy,
        Knows,
        Mentions,
        References,
        DependsOn,
        Supports,
        Contradicts,
        Precedes,
        Follows,
        Causes,
        CausedBy,
        LocatedIn,
        MemberOf,
        HasMember,
        Uses,
        UsedBy,
        Produces,
        ProducedBy,
        Requires,
        RequiredBy,
        SimilarTo,
        InstanceOf,
        TypeOf,
        DerivedFrom,
        Supersedes,
        SupersededBy,
        AssignedTo,
        Attended,
        Discussed,
        Tagged,
    ]
);

/// Maximum edit distance at which a suggestion is offered.
const SUGGESTION_DISTANCE: usize = 3;

/// Nearest vocabulary member within the suggestion distance, if any.
fn suggest_nearest<'a>(
    input: &str,
    candidates: impl Iterator<Item = &'a str>,
) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;
    for candidate in candidates {
        let dist = levenshtein_ci(input, candidate);
        if dist <= SUGGESTION_DISTANCE && best.is_none_or(|(d, _)| dist < d) {
            best = Some((dist, candidate));
        }
    }
    best.map(|(_, name)| name.to_owned())
}

/// Case-insensitive Levenshtein distance, two-row dynamic programming.
fn levenshtein_ci(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().flat_map(char::to_lowercase).collect();
    let b: Vec<char> = b.chars().flat_map(char::to_lowercase).collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0_usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

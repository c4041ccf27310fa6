//! Tag set <-> segment filter query.
//!
//! Each tag becomes `tags like '%\"<tag>\"%'`, so a tag only matches when it
//! appears quoted inside the stored tag text ("cat" never matches "category").
//! Several tags are OR-ed together. Tag text is not escaped: a tag holding a
//! quote or backslash yields a query the platform may reject, and such a tag
//! will not survive `decode`.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{SaganError, SaganResult};

pub const QUERY_PREFIX: &str = "select contact_id, updated_at from contact_data where ";

static TAG_CONDITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i:tags\s+like)\s+'%\\"([^\\"]*)\\"%'"#).expect("tag condition regex compiles")
});

pub fn tag_condition(tag: &str) -> String {
    format!(r#"tags like '%\"{tag}\"%'"#)
}

/// Builds the platform filter query for a non-empty tag set. Tags that are
/// blank after trimming are ignored; the rest are encoded verbatim, and
/// duplicates collapse to their first occurrence.
pub fn encode<I, S>(tags: I) -> SaganResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    let conditions = tags
        .into_iter()
        .filter_map(|tag| {
            let tag = tag.as_ref();
            (!tag.trim().is_empty() && seen.insert(tag.to_string())).then(|| tag_condition(tag))
        })
        .collect::<Vec<_>>();

    if conditions.is_empty() {
        return Err(SaganError::validation("at least one tag must be selected"));
    }
    Ok(format!("{QUERY_PREFIX}{}", conditions.join(" OR ")))
}

/// Recovers the tags named by a query built with [`encode`]. Queries authored
/// elsewhere usually yield the empty set; that means "not representable as
/// tags", not "matches nothing".
pub fn decode(query: &str) -> BTreeSet<String> {
    TAG_CONDITION
        .captures_iter(query)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn set(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn single_tag_is_a_quoted_like() {
        let query = encode(["meetup"]).unwrap();
        assert_eq!(
            query,
            r#"select contact_id, updated_at from contact_data where tags like '%\"meetup\"%'"#
        );
        assert!(!query.contains(" OR "));
    }

    #[test]
    fn several_tags_are_or_joined() {
        let query = encode(["meetup", "friend", "meetup"]).unwrap();
        assert_eq!(query.matches(" OR ").count(), 1);
        assert!(query.contains(r#"tags like '%\"friend\"%'"#));
    }

    #[test]
    fn empty_set_is_rejected() {
        let err = encode(Vec::<String>::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(encode(["  ", ""]).is_err());
    }

    #[test]
    fn decode_inverts_encode() {
        for tags in [
            set(&["meetup"]),
            set(&["meetup", "friend", "web site", "éclair"]),
            set(&["a,b", "x-y"]),
            set(&[" vip", "meetup "]),
        ] {
            assert_eq!(decode(&encode(&tags).unwrap()), tags);
        }
    }

    #[test]
    fn decode_of_foreign_query_is_empty() {
        assert!(decode("select contact_id from contact_data where city = 'Paris'").is_empty());
        assert!(decode("").is_empty());
    }

    #[test]
    fn decode_tolerates_keyword_case() {
        let query = r#"SELECT contact_id FROM contact_data WHERE TAGS LIKE '%\"vip\"%'"#;
        assert_eq!(decode(query), set(&["vip"]));
    }

    #[test]
    fn quoted_tag_is_not_rejected_but_does_not_round_trip() {
        let query = encode([r#"say "hi""#]).unwrap();
        assert!(query.contains(r#"say "hi""#));
        assert!(decode(&query).is_empty());
    }
}

//! Team name normalization.
//!
//! Upstream feeds are not consistent about team naming ("The Dallas Cowboys"
//! vs "Dallas Cowboys", stray punctuation, double spaces). The normalized
//! form is the de-duplication key within a league, so it must be pure and
//! deterministic: the same input always yields the same key.

/// Normalize a raw team name into the canonical matching key.
///
/// Steps:
/// - lowercase and trim
/// - strip a leading "the "
/// - drop everything that is not alphanumeric or whitespace
/// - collapse whitespace runs into a single `_`
///
/// `"Los Angeles Lakers"` -> `"los_angeles_lakers"`,
/// `"The Dallas Cowboys"` -> `"dallas_cowboys"`,
/// `"FC  Barcelona!"` -> `"fc_barcelona"`.
pub fn normalize(team_name: &str) -> String {
    let lower = team_name.trim().to_lowercase();
    let without_article = lower.strip_prefix("the ").unwrap_or(&lower);
    let filtered: String = without_article
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    filtered.split_whitespace().collect::<Vec<_>>().join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_article() {
        assert_eq!(normalize("The Dallas Cowboys"), "dallas_cowboys");
        assert_eq!(normalize("dallas cowboys"), "dallas_cowboys");
    }

    #[test]
    fn drops_punctuation_and_collapses_whitespace() {
        assert_eq!(normalize("FC  Barcelona!"), "fc_barcelona");
        assert_eq!(normalize("St. Louis Blues"), "st_louis_blues");
    }

    #[test]
    fn is_deterministic_across_variants() {
        let variants = ["Los Angeles Lakers", " los angeles  lakers ", "Los Angeles Lakers!"];
        for v in variants {
            assert_eq!(normalize(v), "los_angeles_lakers");
        }
    }

    #[test]
    fn keeps_interior_the() {
        // Only a leading article is an alias; interior words are meaningful.
        assert_eq!(normalize("Texas The Rangers"), "texas_the_rangers");
    }
}

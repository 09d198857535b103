//! Student grouping keys derived from free-text names.
//!
//! Keys are pure functions of their input. Two spellings of the same name that differ
//! only by diacritics, compatibility forms, letterform variants, or whitespace map to
//! the same key. Distinct students with identical names collide; callers treat the
//! key as a grouping hint, never as identity.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::Referral;

pub const MAX_EXTERNAL_KEY_CHARS: usize = 64;
pub const MAX_NAME_KEY_CHARS: usize = 60;
pub const JOIN_CHAR: char = '-';

const TATWEEL: char = '\u{0640}';

/// Derives the grouping key for a student.
///
/// A non-blank `external_id` wins and is returned trimmed, cut to
/// [`MAX_EXTERNAL_KEY_CHARS`]. Otherwise the display name is folded. An empty result
/// means no grouping is possible.
#[must_use]
pub fn derive_key(display_name: &str, external_id: Option<&str>) -> String {
    if let Some(external) = external_id.map(str::trim).filter(|value| !value.is_empty()) {
        return external.chars().take(MAX_EXTERNAL_KEY_CHARS).collect();
    }

    let folded: String = display_name
        .nfkd()
        .filter(|ch| !is_combining_mark(*ch) && *ch != TATWEEL)
        .map(canonical_letterform)
        .collect();
    let joined = folded.split_whitespace().collect::<Vec<_>>().join("-");
    let kept: String =
        joined.chars().filter(|ch| is_key_char(*ch)).take(MAX_NAME_KEY_CHARS).collect();
    kept.trim_matches(JOIN_CHAR).to_string()
}

/// Sets `student_key` when absent and returns the newly assigned key.
pub fn ensure_student_key(referral: &mut Referral) -> Option<String> {
    if referral.student_key.is_some() {
        return None;
    }
    let key = derive_key(&referral.student_name, referral.civil_id.as_deref());
    referral.student_key = Some(key.clone());
    Some(key)
}

/// Key a referral groups under, computed on the fly when not yet stored.
#[must_use]
pub fn effective_key(referral: &Referral) -> String {
    match &referral.student_key {
        Some(key) => key.clone(),
        None => derive_key(&referral.student_name, referral.civil_id.as_deref()),
    }
}

fn canonical_letterform(ch: char) -> char {
    match ch {
        '\u{0671}' | '\u{0672}' | '\u{0673}' | '\u{0675}' => '\u{0627}',
        '\u{0649}' | '\u{06CC}' | '\u{06D0}' => '\u{064A}',
        '\u{06A9}' | '\u{06AA}' => '\u{0643}',
        '\u{0629}' | '\u{06C1}' | '\u{06D5}' => '\u{0647}',
        '\u{0660}'..='\u{0669}' => shift_digit(ch, '\u{0660}'),
        '\u{06F0}'..='\u{06F9}' => shift_digit(ch, '\u{06F0}'),
        other => other,
    }
}

fn shift_digit(ch: char, zero: char) -> char {
    let offset = u32::from(ch) - u32::from(zero);
    char::from_digit(offset, 10).unwrap_or(ch)
}

fn is_key_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || ch == JOIN_CHAR
        || ('\u{0621}'..='\u{063A}').contains(&ch)
        || ('\u{0641}'..='\u{064A}').contains(&ch)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::OffsetDateTime;

    use super::*;
    use crate::{Grade, ReferralId, ReferralStatus, ReferralType, UserId};

    fn referral(name: &str, civil_id: Option<&str>) -> Referral {
        Referral {
            id: ReferralId::new(),
            reference: "R-2026-00AB12".to_string(),
            student_name: name.to_string(),
            civil_id: civil_id.map(str::to_string),
            student_key: None,
            grade: Grade::new(7).unwrap_or_else(|| panic!("grade 7 is valid")),
            referral_type: ReferralType::Behavior,
            details: "Disrupted class twice this week".to_string(),
            status: ReferralStatus::New,
            created_by: UserId::from("teacher"),
            assignee: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
            version: 1,
        }
    }

    // Test IDs: KEY-001
    #[test]
    fn diacritic_variants_share_a_key() {
        let plain = derive_key("محمد علي", None);
        let voweled = derive_key("مُحَمَّد  عَلِي", None);
        let stretched = derive_key("محـــمد علی", None);
        assert_eq!(plain, "محمد-علي");
        assert_eq!(voweled, plain);
        assert_eq!(stretched, plain);
    }

    // Test IDs: KEY-002
    #[test]
    fn letterform_variants_fold_together() {
        assert_eq!(derive_key("فاطمة", None), derive_key("فاطمه", None));
        assert_eq!(derive_key("ٱحمد", None), derive_key("أحمد", None));
        assert_eq!(derive_key("کمال", None), derive_key("كمال", None));
        assert_eq!(derive_key("مصطفى", None), derive_key("مصطفي", None));
    }

    // Test IDs: KEY-003
    #[test]
    fn latin_names_fold_accents_and_whitespace() {
        assert_eq!(derive_key("  José   Álvarez ", None), "Jose-Alvarez");
        assert_eq!(derive_key("Ana!", None), "Ana");
        assert_eq!(derive_key("-Omar-", None), "Omar");
    }

    // Test IDs: KEY-004
    #[test]
    fn external_id_wins_and_is_truncated() {
        assert_eq!(derive_key("Someone", Some("  290010112345  ")), "290010112345");
        let long = "9".repeat(80);
        assert_eq!(derive_key("Someone", Some(&long)).chars().count(), MAX_EXTERNAL_KEY_CHARS);
        assert_eq!(derive_key("Some One", Some("   ")), "Some-One");
    }

    // Test IDs: KEY-005
    #[test]
    fn blank_names_yield_empty_key() {
        assert_eq!(derive_key("", None), "");
        assert_eq!(derive_key(" \t\n ", None), "");
        assert_eq!(derive_key("!!!", None), "");
    }

    #[test]
    fn name_keys_are_capped() {
        let long = "a".repeat(200);
        assert_eq!(derive_key(&long, None).chars().count(), MAX_NAME_KEY_CHARS);
    }

    #[test]
    fn indic_digits_map_to_ascii() {
        assert_eq!(derive_key("صف ٣", None), "صف-3");
    }

    // Test IDs: KEY-006
    #[test]
    fn ensure_student_key_only_assigns_once() {
        let mut case = referral("Sara Khalid", None);
        assert_eq!(ensure_student_key(&mut case), Some("Sara-Khalid".to_string()));
        case.student_name = "Renamed".to_string();
        assert_eq!(ensure_student_key(&mut case), None);
        assert_eq!(case.student_key.as_deref(), Some("Sara-Khalid"));
        assert_eq!(effective_key(&case), "Sara-Khalid");
    }

    #[test]
    fn effective_key_prefers_civil_id() {
        let case = referral("Sara Khalid", Some("301"));
        assert_eq!(effective_key(&case), "301");
    }

    proptest! {
        #[test]
        fn derive_key_is_deterministic(name in "\\PC{0,40}") {
            prop_assert_eq!(derive_key(&name, None), derive_key(&name, None));
        }

        #[test]
        fn derived_keys_are_fixed_points(name in "[A-Za-z ]{0,30}") {
            let key = derive_key(&name, None);
            prop_assert_eq!(derive_key(&key, None), key.clone());
            prop_assert!(!key.starts_with(JOIN_CHAR) && !key.ends_with(JOIN_CHAR));
        }

        #[test]
        fn combining_marks_never_change_the_key(words in prop::collection::vec("[A-Za-z]{1,8}", 1..4)) {
            let plain = words.join(" ");
            let marked: String = plain
                .chars()
                .flat_map(|ch| if ch == ' ' { vec![ch, ' '] } else { vec![ch, '\u{0301}'] })
                .collect();
            prop_assert_eq!(derive_key(&marked, None), derive_key(&plain, None));
        }
    }
}

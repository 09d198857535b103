use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReferencePrefix {
    Referral,
    Thread,
}

impl ReferencePrefix {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Referral => "R",
            Self::Thread => "M",
        }
    }
}

/// Human-facing code such as `R-2026-4F0A1C`: prefix, year, six uppercase hex digits.
///
/// Not guaranteed unique; the store enforces uniqueness and callers regenerate on
/// collision.
#[must_use]
pub fn generate_reference(prefix: ReferencePrefix, now: OffsetDateTime) -> String {
    let suffix = Ulid::new().random() & 0x00FF_FFFF;
    format!("{}-{}-{suffix:06X}", prefix.as_str(), now.year())
}

#[must_use]
pub fn is_reference(value: &str) -> bool {
    let mut parts = value.split('-');
    let (Some(prefix), Some(year), Some(suffix), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    matches!(prefix, "R" | "M")
        && year.len() == 4
        && year.chars().all(|ch| ch.is_ascii_digit())
        && suffix.len() == 6
        && suffix.chars().all(|ch| ch.is_ascii_digit() || ('A'..='F').contains(&ch))
}

//! Instance id rules and slug generation.
//!
//! Ids are lowercase ASCII letters, digits and hyphens, 3 to 50 characters,
//! and never one of the branch-like reserved names.

use crate::errors::InstanceError;

/// Names that would be confused with canonical branches.
pub const RESERVED_IDS: &[&str] = &["main", "master", "develop", "dev", "test", "staging", "prod"];

pub const MIN_ID_LEN: usize = 3;
pub const MAX_ID_LEN: usize = 50;

fn is_slug_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'
}

/// Check `id` against the slug rules.
pub fn validate_instance_id(id: &str) -> Result<(), InstanceError> {
    let len = id.chars().count();
    if len < MIN_ID_LEN {
        return Err(InstanceError::InvalidId {
            id: id.to_string(),
            reason: format!("must be at least {MIN_ID_LEN} characters"),
        });
    }
    if len > MAX_ID_LEN {
        return Err(InstanceError::InvalidId {
            id: id.to_string(),
            reason: format!("must be at most {MAX_ID_LEN} characters"),
        });
    }
    if !id.chars().all(is_slug_char) {
        return Err(InstanceError::InvalidId {
            id: id.to_string(),
            reason: "only lowercase letters, digits and hyphens are allowed".into(),
        });
    }
    if RESERVED_IDS.contains(&id) {
        return Err(InstanceError::ReservedId(id.to_string()));
    }
    Ok(())
}

/// Turn free text into a candidate id. The result may still be too short or
/// reserved; callers validate it.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_hyphen = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    let mut slug = slug.trim_matches('-').to_string();
    if slug.len() > MAX_ID_LEN {
        slug.truncate(MAX_ID_LEN);
        slug = slug.trim_end_matches('-').to_string();
    }
    slug
}

/// Highest numeric suffix tried before giving up on a base name.
pub const MAX_ID_SUFFIX: u32 = 999;

/// Derive an id from a purpose and themes, falling back to a dated name,
/// and pick the first candidate for which `taken` reports `false`.
///
/// Errors from `taken` are returned as-is. When `base` through
/// `base-999` are all taken the result is [`InstanceError::AlreadyExists`].
pub fn generate_instance_id<F, E>(purpose: &str, themes: &[String], taken: F) -> Result<String, E>
where
    F: Fn(&str) -> Result<bool, E>,
    E: From<InstanceError>,
{
    let mut base = slugify(purpose);
    if base.len() < MIN_ID_LEN {
        base = slugify(&themes.join(" "));
    }
    if base.len() < MIN_ID_LEN || RESERVED_IDS.contains(&base.as_str()) {
        base = format!("instance-{}", chrono::Utc::now().format("%Y%m%d"));
    }
    // Leave room for a numeric suffix.
    if base.len() > MAX_ID_LEN - 4 {
        base.truncate(MAX_ID_LEN - 4);
        base = base.trim_end_matches('-').to_string();
    }

    if !taken(&base)? {
        return Ok(base);
    }
    for n in 2..=MAX_ID_SUFFIX {
        let candidate = format!("{base}-{n}");
        if !taken(&candidate)? {
            return Ok(candidate);
        }
    }
    Err(InstanceError::AlreadyExists(format!("{base}-{MAX_ID_SUFFIX}")).into())
}

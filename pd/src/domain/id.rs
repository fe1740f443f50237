//! Domain ID generation
//!
//! Entity IDs use the format `{8-char-hex}-{type}-{slug}`, e.g. `0193a4f2-material-aluminium-housing`.

/// Generate a domain ID from type and name
pub fn generate_id(domain_type: &str, name: &str) -> String {
    let uuid = uuid::Uuid::now_v7().simple().to_string();
    // v7 leads with the timestamp; take the random tail so siblings created in
    // the same millisecond still differ
    let suffix = &uuid[uuid.len() - 8..];
    let slug = slugify(name);
    if slug.is_empty() {
        format!("{}-{}", suffix, domain_type)
    } else {
        format!("{}-{}-{}", suffix, domain_type, slug)
    }
}

/// Lowercase, alphanumeric words joined by hyphens, at most 40 chars
pub fn slugify(name: &str) -> String {
    let slug = name
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    slug.chars().take(40).collect::<String>().trim_end_matches('-').to_string()
}

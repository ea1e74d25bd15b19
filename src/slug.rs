// src/slug.rs
//
// Clinic URL slugs and brand colors.

pub const SLUG_MIN: usize = 3;
pub const SLUG_MAX: usize = 63;

/// Lowercase `a-z0-9-`, 3..=63 chars, no leading, trailing or doubled hyphen.
pub fn validate_slug(slug: &str) -> Result<(), String> {
    if slug.len() < SLUG_MIN || slug.len() > SLUG_MAX {
        return Err(format!("slug must be {SLUG_MIN}-{SLUG_MAX} characters"));
    }
    if !slug
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err("slug may only contain a-z, 0-9 and '-'".into());
    }
    if slug.starts_with('-') || slug.ends_with('-') || slug.contains("--") {
        return Err("slug cannot start or end with '-' or contain '--'".into());
    }
    Ok(())
}

/// Derives a slug from a display name. Returns `None` when nothing usable is
/// left (e.g. a name made only of symbols).
pub fn slugify(name: &str) -> Option<String> {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        let c = match c {
            'á' | 'à' | 'ä' | 'â' | 'ã' | 'Á' | 'À' | 'Ä' | 'Â' | 'Ã' => 'a',
            'é' | 'è' | 'ë' | 'ê' | 'É' | 'È' | 'Ë' | 'Ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' | 'Í' | 'Ì' | 'Ï' | 'Î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' | 'õ' | 'Ó' | 'Ò' | 'Ö' | 'Ô' | 'Õ' => 'o',
            'ú' | 'ù' | 'ü' | 'û' | 'Ú' | 'Ù' | 'Ü' | 'Û' => 'u',
            'ñ' | 'Ñ' => 'n',
            'ç' | 'Ç' => 'c',
            other => other,
        };
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if out.len() >= SLUG_MAX {
            break;
        }
    }
    out.truncate(SLUG_MAX);
    let out = out.trim_end_matches('-').to_string();
    if out.is_empty() {
        return None;
    }
    // pad short names so they still validate
    let out = if out.len() < SLUG_MIN {
        format!("{out}-clinic")
    } else {
        out
    };
    validate_slug(&out).ok().map(|_| out)
}

/// `#rrggbb`, returned lowercased.
pub fn validate_brand_color(raw: &str) -> Result<String, String> {
    let c = raw.trim();
    let ok = c.len() == 7
        && c.starts_with('#')
        && c[1..].bytes().all(|b| b.is_ascii_hexdigit());
    if ok {
        Ok(c.to_ascii_lowercase())
    } else {
        Err("brand_color must look like #rrggbb".into())
    }
}

//! Sortable encoding of semantic versions.

/// Rewrites a semantic version string so that byte-wise lexicographic order
/// of the outputs agrees with semantic-version order of the inputs.
///
/// Numeric components are zero-padded to a fixed width. Release versions get
/// a trailing `~` so they sort after their own prereleases (`~` compares
/// greater than `-` and every identifier byte). Build metadata does not
/// participate in ordering and is dropped.
pub fn for_sorting(version: &str) -> String {
    let v = version.strip_prefix('v').unwrap_or(version);
    let v = match v.find('+') {
        Some(plus) => &v[..plus],
        None => v,
    };
    let (core, prerelease) = match v.find('-') {
        Some(dash) => (&v[..dash], Some(&v[dash + 1..])),
        None => (v, None),
    };

    let mut out = String::with_capacity(v.len() + 24);
    for (i, part) in core.split('.').enumerate() {
        if i > 0 {
            out.push('.');
        }
        out.push_str(&pad_numeric(part));
    }
    match prerelease {
        Some(pre) => {
            out.push('-');
            for (i, ident) in pre.split('.').enumerate() {
                if i > 0 {
                    out.push('.');
                }
                out.push_str(&pad_numeric(ident));
            }
        }
        // Releases sort after every prerelease of the same core.
        None => out.push('~'),
    }
    out
}

/// Zero-pads purely numeric identifiers; leaves others untouched. Numeric
/// identifiers always compare less than alphanumeric ones in semver, which
/// the `0` padding prefix preserves against ASCII letters.
fn pad_numeric(part: &str) -> String {
    if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) {
        format!("{:0>12}", part)
    } else {
        part.to_string()
    }
}

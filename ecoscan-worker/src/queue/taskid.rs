//! Stable, filesystem-safe task identifiers.

/// Derives the queue task ID for a module version.
///
/// The 4-hex-digit prefix spreads IDs uniformly across queue shards; the
/// rest is a readable escaping of `path` and `version`. The output is pure
/// in its inputs and stable across processes, since task names double as the
/// queue's deduplication key.
pub fn new_task_id(module_path: &str, version: &str) -> String {
    let hash = fnv1_32(format!("{module_path}@{version}").as_bytes()) % 0xFFFF;
    format!("{hash:04x}-{}_v{}", escape(module_path), escape(version))
}

/// Escapes a string to task-name-safe characters. ASCII alphanumerics and
/// `-` pass through; `_` doubles, `.` and `/` get short escapes, everything
/// else becomes `_` plus the four-hex-digit codepoint.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' => out.push(c),
            '_' => out.push_str("__"),
            '.' => out.push_str("_o"),
            '/' => out.push_str("_-"),
            _ => out.push_str(&format!("_{:04x}", c as u32)),
        }
    }
    out
}

/// 32-bit FNV-1. The task-ID format predates this implementation and is
/// pinned to FNV-1 (not FNV-1a); the published `fnv` hasher implements the
/// latter, so the few lines live here.
fn fnv1_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in data {
        hash = hash.wrapping_mul(0x0100_0193);
        hash ^= u32::from(b);
    }
    hash
}

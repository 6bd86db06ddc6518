//! Glob matching for route patterns.
//!
//! Patterns are anchored against the full route string. `*` matches any run
//! of characters (including none), `?` matches exactly one character, and
//! everything else matches literally. No regex engine is involved, so the
//! semantics are fixed and independent of any runtime's regex dialect.

/// Check whether `route` matches the glob `pattern`.
pub fn route_matches(pattern: &str, route: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = route.chars().collect();

    let mut p = 0;
    let mut t = 0;
    // Position to resume from after the most recent `*` on a mismatch.
    let mut star_p: Option<usize> = None;
    let mut star_t = 0;

    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star_p = Some(p);
            star_t = t;
            p += 1;
        } else if let Some(sp) = star_p {
            // Backtrack: let the last `*` swallow one more character.
            p = sp + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }

    // Remaining pattern must be all `*` to match the exhausted route.
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

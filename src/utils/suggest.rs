fn normalize_token(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut curr = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        prev = curr;
    }
    prev[b.len()]
}

fn distance(input: &str, candidate: &str) -> Option<usize> {
    if input.is_empty() || candidate.is_empty() {
        return None;
    }
    if input == candidate {
        return Some(0);
    }
    if input.contains(candidate) || candidate.contains(input) {
        return Some(1);
    }
    let a: Vec<char> = input.chars().collect();
    let b: Vec<char> = candidate.chars().collect();
    Some(levenshtein(&a, &b))
}

/// Returns up to `limit` known names close to `input`, closest first.
pub fn suggest(input: &str, candidates: &[&str], limit: usize) -> Vec<String> {
    let needle = normalize_token(input);
    if needle.is_empty() {
        return Vec::new();
    }
    let allowed = match needle.len() {
        0..=4 => 1,
        5..=8 => 2,
        n => (n * 35 / 100).max(3),
    };
    let mut scored: Vec<(usize, &str)> = candidates
        .iter()
        .filter_map(|candidate| {
            distance(&needle, &normalize_token(candidate))
                .filter(|score| *score <= allowed)
                .map(|score| (score, *candidate))
        })
        .collect();
    scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    scored.dedup_by(|a, b| a.1 == b.1);
    scored
        .into_iter()
        .take(limit.max(1))
        .map(|(_, name)| name.to_string())
        .collect()
}

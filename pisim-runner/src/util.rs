use anyhow::{Context, Result, bail};

pub fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|x| x.trim().to_string())
        .filter(|x| !x.is_empty())
        .collect()
}

/// Parse a comma-separated list of positive target counts.
///
/// # Errors
///
/// Returns an error for non-numeric entries, zero, or an empty list.
pub fn parse_target_counts(s: &str) -> Result<Vec<u32>> {
    let mut counts = Vec::new();
    for token in split_csv(s) {
        let count: u32 = token
            .parse()
            .with_context(|| format!("invalid target count '{token}'"))?;
        if count == 0 {
            bail!("target counts must be positive");
        }
        counts.push(count);
    }
    if counts.is_empty() {
        bail!("no target counts given");
    }
    Ok(counts)
}

//! Noise reduction over repeated simulation runs.

/// Arithmetic mean, `None` for an empty slice.
#[must_use]
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let count = values.len() as f64;
    Some(values.iter().sum::<f64>() / count)
}

/// Index of the value closest to the mean of all values.
///
/// Ties resolve to the earliest index. Returns `None` for an empty slice or
/// when any value is not finite.
#[must_use]
pub fn closest_to_mean(values: &[f64]) -> Option<usize> {
    if values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let avg = mean(values)?;
    let mut best: Option<(usize, f64)> = None;
    for (index, value) in values.iter().enumerate() {
        let distance = (value - avg).abs();
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((index, distance)),
        }
    }
    best.map(|(index, _)| index)
}

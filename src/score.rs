use serde::Serialize;
use std::collections::BTreeMap;

/// Rubric keys look like "[Professionalism] Meets deadlines". The bracketed
/// prefix is the category; the rest is the item label. Keys without a
/// bracketed prefix land in the "" category.
pub fn split_category(key: &str) -> (&str, &str) {
    let trimmed = key.trim_start();
    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            return (&rest[..close], rest[close + 1..].trim_start());
        }
    }
    ("", trimmed)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySubtotal {
    pub raw: i64,
    pub max: i64,
    pub items: i64,
}

/// Partition a rubric map by category prefix. Categories with zero items are
/// simply absent from the output.
pub fn categorize(rubric: &BTreeMap<String, i64>) -> BTreeMap<String, CategorySubtotal> {
    let mut out: BTreeMap<String, CategorySubtotal> = BTreeMap::new();
    for (key, value) in rubric {
        let (category, _) = split_category(key);
        let entry = out.entry(category.to_string()).or_insert(CategorySubtotal {
            raw: 0,
            max: 0,
            items: 0,
        });
        entry.raw += value;
        entry.max += 5;
        entry.items += 1;
    }
    out
}

/// Canonical 0-100 percentage for a 1-5 rubric: round(raw / (items * 5) * 100).
/// An empty rubric has no percentage, not a zero one.
pub fn normalize(rubric: &BTreeMap<String, i64>) -> Option<i64> {
    if rubric.is_empty() {
        return None;
    }
    let raw: i64 = rubric.values().sum();
    let max: i64 = (rubric.len() as i64) * 5;
    Some(((raw as f64) / (max as f64) * 100.0).round() as i64)
}

/// Every rubric item must be an integer 1..=5. Returns the offending key on
/// failure so the caller can name it in the error payload.
pub fn validate_rubric(rubric: &BTreeMap<String, i64>) -> Result<(), (String, i64)> {
    for (key, value) in rubric {
        if !(1..=5).contains(value) {
            return Err((key.clone(), *value));
        }
    }
    Ok(())
}

/// Legacy flat-score math for reporting. The HOD and Asst-Dean ratings are
/// each out of 10 and are not derived from the rubric track.
pub const COMBINED_MAX: i64 = 20;

pub fn combined_score(hod: Option<i64>, asst: Option<i64>) -> Option<i64> {
    match (hod, asst) {
        (Some(h), Some(a)) => Some(h + a),
        _ => None,
    }
}

pub fn performance_percent(combined: i64, max: i64) -> Option<i64> {
    if max <= 0 {
        return None;
    }
    Some(((combined as f64) / (max as f64) * 100.0).round() as i64)
}

/// Parse a JSON object of integer rubric scores as stored in the review
/// `scores` columns. Non-integer values are rejected by the submit path, so a
/// stored row that fails to parse reads as no rubric at all.
pub fn rubric_from_json(value: &serde_json::Value) -> Option<BTreeMap<String, i64>> {
    let obj = value.as_object()?;
    let mut out = BTreeMap::new();
    for (k, v) in obj {
        out.insert(k.clone(), v.as_i64()?);
    }
    Some(out)
}

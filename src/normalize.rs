//! Unit and scale detection for canonical fields.
//!
//! Scale is decided only by the observed maximum, tested in the order
//! `<= 1`, `<= 20`, otherwise normalize by the maximum. Values that cannot
//! be coerced become `None` and are left for the imputer.

use std::collections::BTreeMap;

use crate::models::Field;
use crate::schema::ReconciledTable;

/// Minimum share of rows that must parse before a duration column is used.
pub const MIN_DURATION_COVERAGE: f64 = 0.2;
pub const GRADE_SCALE_MAX: f64 = 20.0;

#[derive(Debug, Clone, Default)]
pub struct NormalizedTable {
    pub learner_ids: Vec<String>,
    pub columns: BTreeMap<Field, Vec<Option<f64>>>,
}

impl NormalizedTable {
    pub fn len(&self) -> usize {
        self.learner_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.learner_ids.is_empty()
    }

    /// Stacks `other` below this table. A field only one side carries is
    /// padded with `None` on the other, so the imputer fills those rows.
    pub fn append(&mut self, mut other: NormalizedTable) {
        if self.is_empty() {
            *self = other;
            return;
        }
        let (top, bottom) = (self.len(), other.len());
        for (field, column) in self.columns.iter_mut() {
            match other.columns.remove(field) {
                Some(values) => column.extend(values),
                None => column.resize(top + bottom, None),
            }
        }
        for (field, values) in other.columns {
            let mut column = vec![None; top];
            column.extend(values);
            self.columns.insert(field, column);
        }
        self.learner_ids.extend(other.learner_ids);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ValueNormalizer {
    levels: i64,
}

impl ValueNormalizer {
    pub fn new(levels: i64) -> Self {
        Self {
            levels: levels.max(1),
        }
    }

    pub fn normalize_table(&self, table: &ReconciledTable) -> NormalizedTable {
        let mut columns = BTreeMap::new();
        for (field, raw) in &table.columns {
            let values = self.normalize(*field, raw);
            if values.iter().all(Option::is_none) && !values.is_empty() {
                tracing::warn!(%field, "column carried no usable values, treating as absent");
                continue;
            }
            columns.insert(*field, values);
        }
        NormalizedTable {
            learner_ids: table.learner_ids.clone(),
            columns,
        }
    }

    pub fn normalize(&self, field: Field, raw: &[Option<String>]) -> Vec<Option<f64>> {
        match field {
            Field::LearnerId => vec![None; raw.len()],
            Field::AvgScore | Field::Accuracy | Field::TopicProgress => {
                normalize_fraction(field, raw)
            }
            Field::DifficultyLevel => self.normalize_difficulty(raw),
            Field::TimeSpent => normalize_duration(raw),
        }
    }

    fn normalize_difficulty(&self, raw: &[Option<String>]) -> Vec<Option<f64>> {
        let max_level = (self.levels - 1) as f64;
        let labelled = raw
            .iter()
            .flatten()
            .any(|value| parse_number(value).is_none() && ordinal_fraction(value).is_some());

        if labelled {
            tracing::debug!("difficulty column carries ordinal labels");
            return raw
                .iter()
                .map(|value| {
                    value
                        .as_deref()
                        .and_then(ordinal_fraction)
                        .map(|frac| (frac * max_level).round())
                })
                .collect();
        }

        let numbers = coerce(raw);
        let observed: Vec<f64> = numbers.iter().flatten().copied().collect();
        let Some(max) = observed.iter().copied().reduce(f64::max) else {
            return numbers;
        };

        // A column of only 0 and 1 is the ambiguous case: it is read as
        // levels 0 and 1 rather than as fractions scaled to 0 and L-1.
        let already_levels = observed
            .iter()
            .all(|v| v.fract() == 0.0 && *v >= 0.0 && *v <= max_level);
        if already_levels {
            return numbers;
        }

        let divisor = if max <= 1.0 {
            1.0
        } else if max <= GRADE_SCALE_MAX {
            GRADE_SCALE_MAX
        } else {
            max
        };
        tracing::debug!(max, divisor, "difficulty scale detected");
        numbers
            .into_iter()
            .map(|value| value.map(|v| ((v / divisor).clamp(0.0, 1.0) * max_level).round()))
            .collect()
    }
}

fn normalize_fraction(field: Field, raw: &[Option<String>]) -> Vec<Option<f64>> {
    let numbers = coerce(raw);
    let max = numbers.iter().flatten().copied().reduce(f64::max);
    let divisor = match max {
        Some(max) if max > 1.0 => {
            tracing::debug!(%field, max, "percentage scale detected");
            100.0
        }
        _ => 1.0,
    };
    numbers
        .into_iter()
        .map(|value| value.map(|v| (v / divisor).clamp(0.0, 1.0)))
        .collect()
}

fn normalize_duration(raw: &[Option<String>]) -> Vec<Option<f64>> {
    let minutes: Vec<Option<f64>> = raw
        .iter()
        .map(|value| {
            value
                .as_deref()
                .and_then(|v| parse_number(v).or_else(|| parse_duration_minutes(v)))
                .map(|v| v.max(0.0))
        })
        .collect();

    if raw.is_empty() {
        return minutes;
    }
    let parsed = minutes.iter().filter(|v| v.is_some()).count();
    let coverage = parsed as f64 / raw.len() as f64;
    if coverage < MIN_DURATION_COVERAGE {
        tracing::warn!(
            coverage,
            "time column parsed below coverage floor, leaving it to synthesis"
        );
        return vec![None; raw.len()];
    }
    minutes
}

fn coerce(raw: &[Option<String>]) -> Vec<Option<f64>> {
    raw.iter()
        .map(|value| value.as_deref().and_then(parse_number))
        .collect()
}

pub fn parse_number(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    let trimmed = trimmed.strip_suffix('%').unwrap_or(trimmed).trim_end();
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn ordinal_fraction(label: &str) -> Option<f64> {
    match label.trim().to_lowercase().as_str() {
        "beginner" | "easy" | "low" | "basic" => Some(0.0),
        "intermediate" | "medium" | "moderate" => Some(0.5),
        "advanced" | "hard" | "high" | "expert" => Some(1.0),
        _ => None,
    }
}

/// Parses clock (`01:30:00`, `45:30`), unit (`1h 30m`, `90s`, `1.5 hours`)
/// and ISO-8601 (`PT1H30M`) durations into minutes.
pub fn parse_duration_minutes(value: &str) -> Option<f64> {
    let lower = value.trim().to_ascii_lowercase();
    let mut rest = lower.strip_prefix("pt").unwrap_or(&lower);
    let mut total = 0.0_f64;
    let mut matched = false;

    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if rest.is_empty() {
            break;
        }
        let token_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let token = &rest[..token_end];
        if token.contains(':') {
            total += parse_clock_seconds(token)?;
            matched = true;
            rest = &rest[token_end..];
            continue;
        }

        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return None;
        }
        let amount: f64 = rest[..number_end].parse().ok()?;
        rest = rest[number_end..].trim_start();
        let unit_end = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        total += amount * unit_seconds(&rest[..unit_end])?;
        matched = true;
        rest = &rest[unit_end..];
    }

    matched.then_some(total / 60.0)
}

fn parse_clock_seconds(token: &str) -> Option<f64> {
    let parts: Vec<f64> = token
        .split(':')
        .map(|part| part.parse::<f64>().ok())
        .collect::<Option<_>>()?;
    match parts.as_slice() {
        [h, m, s] => Some(h * 3600.0 + m * 60.0 + s),
        [m, s] => Some(m * 60.0 + s),
        _ => None,
    }
}

fn unit_seconds(unit: &str) -> Option<f64> {
    match unit {
        "d" | "day" | "days" => Some(86_400.0),
        "h" | "hr" | "hrs" | "hour" | "hours" => Some(3600.0),
        "m" | "min" | "mins" | "minute" | "minutes" => Some(60.0),
        "s" | "sec" | "secs" | "second" | "seconds" => Some(1.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(values: &[&str]) -> Vec<Option<String>> {
        values
            .iter()
            .map(|v| (!v.is_empty()).then(|| v.to_string()))
            .collect()
    }

    #[test]
    fn percentages_are_divided_by_100() {
        let out = ValueNormalizer::new(3).normalize(Field::AvgScore, &cells(&["80", "95%", ""]));
        assert_eq!(out, vec![Some(0.8), Some(0.95), None]);
    }

    #[test]
    fn fractions_pass_through_and_clip() {
        let out = ValueNormalizer::new(3).normalize(Field::Accuracy, &cells(&["0.5", "-0.2", "x"]));
        assert_eq!(out, vec![Some(0.5), Some(0.0), None]);
    }

    #[test]
    fn canonical_values_are_unchanged() {
        let normalizer = ValueNormalizer::new(3);
        assert_eq!(
            normalizer.normalize(Field::TopicProgress, &cells(&["0.25", "1", "0"])),
            vec![Some(0.25), Some(1.0), Some(0.0)]
        );
        assert_eq!(
            normalizer.normalize(Field::DifficultyLevel, &cells(&["0", "1", "2"])),
            vec![Some(0.0), Some(1.0), Some(2.0)]
        );
        assert_eq!(
            normalizer.normalize(Field::DifficultyLevel, &cells(&["0", "1"])),
            vec![Some(0.0), Some(1.0)]
        );
        assert_eq!(
            normalizer.normalize(Field::TimeSpent, &cells(&["12.5", "40"])),
            vec![Some(12.5), Some(40.0)]
        );
    }

    #[test]
    fn difficulty_labels_map_through_ordinal_table() {
        let out = ValueNormalizer::new(3).normalize(
            Field::DifficultyLevel,
            &cells(&["Beginner", "intermediate", "ADVANCED", "unknown", ""]),
        );
        assert_eq!(out, vec![Some(0.0), Some(1.0), Some(2.0), None, None]);
    }

    #[test]
    fn difficulty_scale_follows_maximum_thresholds() {
        let normalizer = ValueNormalizer::new(3);
        // fraction scale
        assert_eq!(
            normalizer.normalize(Field::DifficultyLevel, &cells(&["0.2", "0.9"])),
            vec![Some(0.0), Some(2.0)]
        );
        // grade scale out of 20
        assert_eq!(
            normalizer.normalize(Field::DifficultyLevel, &cells(&["4", "10", "18"])),
            vec![Some(0.0), Some(1.0), Some(2.0)]
        );
        // anything larger normalizes by its own maximum
        assert_eq!(
            normalizer.normalize(Field::DifficultyLevel, &cells(&["25", "100"])),
            vec![Some(1.0), Some(2.0)]
        );
    }

    #[test]
    fn difficulty_scales_to_configured_levels() {
        let out = ValueNormalizer::new(5).normalize(Field::DifficultyLevel, &cells(&["advanced"]));
        assert_eq!(out, vec![Some(4.0)]);
    }

    #[test]
    fn parses_duration_encodings() {
        assert_eq!(parse_duration_minutes("01:30:00"), Some(90.0));
        assert_eq!(parse_duration_minutes("45:30"), Some(45.5));
        assert_eq!(parse_duration_minutes("1h 30m"), Some(90.0));
        assert_eq!(parse_duration_minutes("1h30m"), Some(90.0));
        assert_eq!(parse_duration_minutes("90s"), Some(1.5));
        assert_eq!(parse_duration_minutes("1.5 hours"), Some(90.0));
        assert_eq!(parse_duration_minutes("PT1H15M"), Some(75.0));
        assert_eq!(parse_duration_minutes("0 days 00:45:00"), Some(45.0));
        assert_eq!(parse_duration_minutes("soon"), None);
        assert_eq!(parse_duration_minutes("12 parsecs"), None);
    }

    #[test]
    fn duration_column_mixes_numbers_and_text() {
        let out = ValueNormalizer::new(3).normalize(Field::TimeSpent, &cells(&["30", "1h", "n/a"]));
        assert_eq!(out, vec![Some(30.0), Some(60.0), None]);
    }

    #[test]
    fn poorly_covered_duration_column_is_rejected() {
        let raw = cells(&["10", "junk", "junk", "junk", "junk", "junk"]);
        let out = ValueNormalizer::new(3).normalize(Field::TimeSpent, &raw);
        assert!(out.iter().all(Option::is_none));
    }

    #[test]
    fn table_drops_columns_without_usable_values() {
        let mut reconciled = ReconciledTable {
            learner_ids: vec!["a".to_string(), "b".to_string()],
            ..ReconciledTable::default()
        };
        reconciled
            .columns
            .insert(Field::TimeSpent, cells(&["x", "y"]));
        reconciled
            .columns
            .insert(Field::AvgScore, cells(&["50", "100"]));
        let table = ValueNormalizer::new(3).normalize_table(&reconciled);
        assert!(table.columns.get(&Field::TimeSpent).is_none());
        assert_eq!(
            table.columns.get(&Field::AvgScore).unwrap(),
            &[Some(0.5), Some(1.0)]
        );
    }

    #[test]
    fn binary_difficulty_column_is_read_as_levels() {
        let normalizer = ValueNormalizer::new(3);
        assert_eq!(
            normalizer.normalize(Field::DifficultyLevel, &cells(&["0", "1", "1", ""])),
            vec![Some(0.0), Some(1.0), Some(1.0), None]
        );
    }

    #[test]
    fn appended_tables_pad_fields_the_other_lacks() {
        let mut top = NormalizedTable {
            learner_ids: vec!["a".to_string(), "b".to_string()],
            ..NormalizedTable::default()
        };
        top.columns.insert(Field::AvgScore, vec![Some(0.8), None]);
        let mut bottom = NormalizedTable {
            learner_ids: vec!["c".to_string()],
            ..NormalizedTable::default()
        };
        bottom.columns.insert(Field::Accuracy, vec![Some(0.4)]);

        top.append(bottom);
        assert_eq!(top.learner_ids, vec!["a", "b", "c"]);
        assert_eq!(top.columns[&Field::AvgScore], vec![Some(0.8), None, None]);
        assert_eq!(top.columns[&Field::Accuracy], vec![None, None, Some(0.4)]);

        let mut empty = NormalizedTable::default();
        empty.append(top.clone());
        assert_eq!(empty.len(), 3);
    }
}

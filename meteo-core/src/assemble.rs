//! Turns one city's series into time-indexed rows.

use crate::model::{CityTarget, Row, TimeRange, VariableGap, VariableSeries};

/// Rows for one city plus every variable that came up short.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assembly {
    pub rows: Vec<Row>,
    pub gaps: Vec<VariableGap>,
}

/// Build one row per timestamp of `range`, with values in `variables` order.
///
/// A variable with fewer samples than timestamps, or with `null` samples, leaves those
/// cells absent and is reported as a gap; the rest of the city is kept. An invalid
/// range yields no rows.
pub fn build(
    target: &CityTarget,
    range: &TimeRange,
    series: &VariableSeries,
    variables: &[String],
) -> Assembly {
    if !range.is_valid() {
        tracing::warn!(city = %target.name, "empty or invalid time range, no rows produced");
        return Assembly::default();
    }

    let count = range.count();
    let columns: Vec<&[Option<f64>]> =
        variables.iter().map(|v| series.get(v).unwrap_or(&[])).collect();

    let gaps: Vec<VariableGap> = variables
        .iter()
        .zip(&columns)
        .filter_map(|(variable, values)| {
            let present = values.iter().take(count).filter(|v| v.is_some()).count();
            let missing = count - present;
            (missing > 0).then(|| VariableGap {
                city: target.name.clone(),
                variable: variable.clone(),
                missing,
            })
        })
        .collect();

    for gap in &gaps {
        tracing::warn!(
            city = %gap.city,
            variable = %gap.variable,
            "{} of {count} samples missing",
            gap.missing
        );
    }

    let rows = range
        .timestamps()
        .enumerate()
        .map(|(i, timestamp)| Row {
            timestamp,
            city: target.name.clone(),
            values: columns.iter().map(|values| values.get(i).copied().flatten()).collect(),
        })
        .collect();

    Assembly { rows, gaps }
}

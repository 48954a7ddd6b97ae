use crate::model::Row;

pub const DATE_COLUMN: &str = "date";
pub const CITY_COLUMN: &str = "city";

/// Rows collected during one run, in city order then timestamp order.
///
/// Append-only: nothing is reordered or deduplicated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    variables: Vec<String>,
    rows: Vec<Row>,
}

impl Dataset {
    pub fn new(variables: Vec<String>) -> Self {
        Self {
            variables,
            rows: Vec::new(),
        }
    }

    pub fn append(&mut self, rows: Vec<Row>) {
        self.rows.extend(rows);
    }

    /// Builder-style `append`, for folding city results into one dataset.
    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.append(rows);
        self
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `date`, every variable in request order, `city`.
    pub fn header(&self) -> Vec<&str> {
        std::iter::once(DATE_COLUMN)
            .chain(self.variables.iter().map(String::as_str))
            .chain(std::iter::once(CITY_COLUMN))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn row(city: &str, hour: u32) -> Row {
        Row {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            city: city.to_string(),
            values: vec![Some(hour as f64)],
        }
    }

    #[test]
    fn append_keeps_city_order() {
        let ds = Dataset::new(vec!["t".into()])
            .with_rows(vec![row("A", 0), row("A", 1)])
            .with_rows(vec![row("B", 0)]);

        let cities: Vec<&str> = ds.rows().iter().map(|r| r.city.as_str()).collect();
        assert_eq!(cities, ["A", "A", "B"]);
    }

    #[test]
    fn empty_append_is_noop() {
        let ds = Dataset::new(vec!["t".into()]).with_rows(vec![row("A", 0)]);
        let again = ds.clone().with_rows(Vec::new());
        assert_eq!(ds, again);
    }

    #[test]
    fn overlapping_rows_are_kept() {
        let ds = Dataset::new(vec!["t".into()])
            .with_rows(vec![row("A", 0)])
            .with_rows(vec![row("A", 0)]);
        assert_eq!(ds.len(), 2);
    }

    #[test]
    fn header_wraps_variables_with_date_and_city() {
        let ds = Dataset::new(vec!["temperature_2m".into(), "precipitation".into()]);
        assert_eq!(ds.header(), ["date", "temperature_2m", "precipitation", "city"]);
    }
}

//! Canonical ADO export columns and header matching.

use std::collections::BTreeMap;

/// Rows scanned when looking for a header row below preamble lines.
pub const HEADER_SCAN_ROWS: usize = 20;

/// Labels that mark a row as the header row.
const HEADER_SAMPLES: [&str; 6] = ["Title", "ID", "Team", "Iteration", "State", "Effort"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Column {
    Id,
    Title,
    State,
    Team,
    Application,
    Effort,
    Iteration,
    CreatedDate,
    ChangedDate,
    Year,
}

impl Column {
    pub const ALL: [Column; 10] = [
        Column::Effort,
        Column::Team,
        Column::Application,
        Column::Iteration,
        Column::Title,
        Column::State,
        Column::Id,
        Column::CreatedDate,
        Column::ChangedDate,
        Column::Year,
    ];

    pub fn canonical(&self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::Title => "Title",
            Self::State => "State",
            Self::Team => "Team",
            Self::Application => "Custom_ApplicationName",
            Self::Effort => "Effort",
            Self::Iteration => "Iteration",
            Self::CreatedDate => "CreatedDate",
            Self::ChangedDate => "ChangedDate",
            Self::Year => "Year",
        }
    }

    /// Header spellings seen in ADO exports, most specific first.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::Id => &["ID", "Work Item ID", "System.Id", "WorkItemId", "Work Item Id"],
            Self::Title => &["Title", "System.Title"],
            Self::State => &["State", "System.State"],
            Self::Team => &["Team", "System.Team", "Area Team"],
            Self::Application => &["Custom_ApplicationName", "Application", "App Name"],
            Self::Effort => &["Effort", "Story Points", "Effort Points", "EFFORT_POINTS"],
            Self::Iteration => &[
                "Iteration",
                "Iteration Path",
                "System.IterationPath",
                "Iteration.IterationLevel3.2",
            ],
            Self::CreatedDate => &["Created Date", "System.CreatedDate", "CreatedDate"],
            Self::ChangedDate => &["Changed Date", "System.ChangedDate", "ChangedDate"],
            Self::Year => &["Year", "ADO Year", "ADO_YEAR"],
        }
    }
}

/// Trimmed header text without a stray byte-order mark.
pub fn normalize_header(raw: &str) -> String {
    raw.replace('\u{feff}', "").trim().to_string()
}

/// Resolved position of each canonical column in the source header.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    indices: BTreeMap<Column, usize>,
    sources: BTreeMap<Column, String>,
}

impl ColumnMap {
    /// Match headers to canonical columns.
    ///
    /// Each column first looks for a case-insensitive exact match on any of its
    /// aliases, then for a header containing the canonical name. A header is
    /// claimed by at most one column.
    pub fn from_headers(headers: &[String]) -> Self {
        let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
        let lowered: Vec<String> = normalized.iter().map(|h| h.to_lowercase()).collect();
        let mut map = Self::default();

        for column in Column::ALL {
            let exact = column.aliases().iter().find_map(|alias| {
                let alias = alias.to_lowercase();
                lowered
                    .iter()
                    .enumerate()
                    .find(|(i, h)| **h == alias && !map.is_claimed(*i))
                    .map(|(i, _)| i)
            });
            let token = column.canonical().to_lowercase();
            let found = exact.or_else(|| {
                lowered
                    .iter()
                    .enumerate()
                    .find(|(i, h)| h.contains(&token) && !map.is_claimed(*i))
                    .map(|(i, _)| i)
            });

            if let Some(index) = found {
                map.indices.insert(column, index);
                map.sources.insert(column, normalized[index].clone());
            }
        }

        map
    }

    fn is_claimed(&self, index: usize) -> bool {
        self.indices.values().any(|&i| i == index)
    }

    pub fn index(&self, column: Column) -> Option<usize> {
        self.indices.get(&column).copied()
    }

    /// Canonical name → source header, for diagnostics.
    pub fn describe(&self) -> BTreeMap<String, String> {
        self.sources
            .iter()
            .map(|(column, source)| (column.canonical().to_string(), source.clone()))
            .collect()
    }

    pub fn missing(&self) -> Vec<String> {
        Column::ALL
            .iter()
            .filter(|c| !self.indices.contains_key(c))
            .map(|c| c.canonical().to_string())
            .collect()
    }
}

/// Index of the first row that contains at least two header sample labels.
pub fn detect_header_row(rows: &[Vec<String>]) -> Option<usize> {
    rows.iter().take(HEADER_SCAN_ROWS).position(|row| {
        let cells: Vec<String> = row.iter().map(|c| normalize_header(c).to_lowercase()).collect();
        HEADER_SAMPLES
            .iter()
            .filter(|sample| cells.contains(&sample.to_lowercase()))
            .count()
            >= 2
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_alias_match_is_case_insensitive() {
        let map = ColumnMap::from_headers(&headers(&["system.id", "STORY POINTS", "Area Team"]));
        assert_eq!(map.index(Column::Id), Some(0));
        assert_eq!(map.index(Column::Effort), Some(1));
        assert_eq!(map.index(Column::Team), Some(2));
    }

    #[test]
    fn falls_back_to_canonical_substring() {
        let map =
            ColumnMap::from_headers(&headers(&["Work Item Id", "Custom_ApplicationName (App)"]));
        assert_eq!(map.index(Column::Application), Some(1));
        assert_eq!(
            map.describe().get("Custom_ApplicationName").map(String::as_str),
            Some("Custom_ApplicationName (App)")
        );
    }

    #[test]
    fn header_is_claimed_once() {
        // "Effort Points" matches Effort exactly; it must not also satisfy another column.
        let map = ColumnMap::from_headers(&headers(&["ID", "Effort Points"]));
        assert_eq!(map.index(Column::Effort), Some(1));
        assert_eq!(map.index(Column::Id), Some(0));
        assert!(map.missing().contains(&"Team".to_string()));
    }

    #[test]
    fn strips_bom_and_whitespace() {
        let map = ColumnMap::from_headers(&headers(&["\u{feff}ID ", " Title"]));
        assert_eq!(map.index(Column::Id), Some(0));
        assert_eq!(map.index(Column::Title), Some(1));
    }

    #[test]
    fn detects_header_below_preamble() {
        let rows = vec![
            vec!["Query: Features".to_string(), String::new()],
            vec![String::new(), String::new()],
            headers(&["ID", "Title", "Team"]),
        ];
        assert_eq!(detect_header_row(&rows), Some(2));
    }

    #[test]
    fn single_sample_is_not_a_header() {
        let rows = vec![headers(&["Title", "something"])];
        assert_eq!(detect_header_row(&rows), None);
    }
}

use crate::config::PipelineConfig;
use crate::pipeline::executor::{ColumnKind, TabularResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Line,
    Scatter,
    Pie,
    Table,
}

/// Which bar to emphasize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Highlight {
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub x: Option<String>,
    pub y: Option<String>,
    pub highlight: Option<Highlight>,
    /// Ordering applied to `x` before plotting
    pub sort: Option<SortOrder>,
}

impl ChartSpec {
    pub fn table() -> Self {
        Self {
            kind: ChartKind::Table,
            x: None,
            y: None,
            highlight: None,
            sort: None,
        }
    }

    fn plot(kind: ChartKind, x: &str, y: &str) -> Self {
        Self {
            kind,
            x: Some(x.to_string()),
            y: Some(y.to_string()),
            highlight: None,
            sort: None,
        }
    }
}

/// Reads intent out of the question text. Keyword matching is a heuristic, so it is
/// kept swappable.
pub trait KeywordPolicy: Send + Sync {
    fn wants_max(&self, question: &str) -> bool;
    fn wants_min(&self, question: &str) -> bool;
    fn wants_proportion(&self, question: &str) -> bool;
}

/// Whole-word matching against configured keyword lists.
#[derive(Debug, Clone)]
pub struct KeywordLists {
    superlative: Vec<String>,
    minimum: Vec<String>,
    proportion: Vec<String>,
}

impl KeywordLists {
    pub fn new(superlative: Vec<String>, minimum: Vec<String>, proportion: Vec<String>) -> Self {
        let lower = |list: Vec<String>| -> Vec<String> { list.into_iter().map(|w| w.to_lowercase()).collect() };
        Self {
            superlative: lower(superlative),
            minimum: lower(minimum),
            proportion: lower(proportion),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.superlative_keywords.clone(),
            config.minimum_keywords.clone(),
            config.proportion_keywords.clone(),
        )
    }

    fn mentions(list: &[String], question: &str) -> bool {
        let lower = question.to_lowercase();
        let words: Vec<&str> = lower.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()).collect();
        let normalized = words.join(" ");
        list.iter().any(|keyword| {
            if keyword.contains(' ') {
                format!(" {} ", normalized).contains(&format!(" {} ", keyword))
            } else {
                words.contains(&keyword.as_str())
            }
        })
    }
}

impl Default for KeywordLists {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl KeywordPolicy for KeywordLists {
    fn wants_max(&self, question: &str) -> bool {
        Self::mentions(&self.superlative, question)
    }

    fn wants_min(&self, question: &str) -> bool {
        Self::mentions(&self.minimum, question)
    }

    fn wants_proportion(&self, question: &str) -> bool {
        Self::mentions(&self.proportion, question)
    }
}

pub struct ChartSelector {
    policy: Box<dyn KeywordPolicy>,
    bar_max_rows: usize,
}

impl ChartSelector {
    pub fn new(policy: Box<dyn KeywordPolicy>, bar_max_rows: usize) -> Self {
        Self { policy, bar_max_rows }
    }

    /// Picks a chart from the result shape and the question. Pure.
    pub fn select(&self, table: &TabularResult, question: &str) -> ChartSpec {
        let rows = table.row_count();
        if rows == 0 || table.columns.len() != 2 {
            return ChartSpec::table();
        }

        let first = &table.columns[0];
        let second = &table.columns[1];
        let pick = |kind: ColumnKind| {
            if first.kind == kind {
                Some(&first.name)
            } else if second.kind == kind {
                Some(&second.name)
            } else {
                None
            }
        };
        let kinds = (first.kind, second.kind);
        let numeric_and = |other: ColumnKind| {
            (first.kind == ColumnKind::Numeric && second.kind == other)
                || (second.kind == ColumnKind::Numeric && first.kind == other)
        };

        // bar: one category, one measure, few rows
        if numeric_and(ColumnKind::Categorical) && rows <= self.bar_max_rows {
            if let (Some(x), Some(y)) = (pick(ColumnKind::Categorical), pick(ColumnKind::Numeric)) {
                let mut spec = ChartSpec::plot(ChartKind::Bar, x, y);
                if self.policy.wants_max(question) {
                    spec.highlight = Some(Highlight::Max);
                } else if self.policy.wants_min(question) {
                    spec.highlight = Some(Highlight::Min);
                }
                return spec;
            }
        }

        // line: a measure over time
        if numeric_and(ColumnKind::Temporal) {
            if let (Some(x), Some(y)) = (pick(ColumnKind::Temporal), pick(ColumnKind::Numeric)) {
                let mut spec = ChartSpec::plot(ChartKind::Line, x, y);
                spec.sort = Some(SortOrder::Ascending);
                return spec;
            }
        }

        if kinds == (ColumnKind::Numeric, ColumnKind::Numeric) {
            return ChartSpec::plot(ChartKind::Scatter, &first.name, &second.name);
        }

        // pie: parts of a non-negative whole, when asked for
        if numeric_and(ColumnKind::Categorical) && self.policy.wants_proportion(question) {
            if let (Some(x), Some(y)) = (pick(ColumnKind::Categorical), pick(ColumnKind::Numeric)) {
                if forms_a_whole(table, y) {
                    return ChartSpec::plot(ChartKind::Pie, x, y);
                }
            }
        }

        ChartSpec::table()
    }
}

fn forms_a_whole(table: &TabularResult, column: &str) -> bool {
    let Some(index) = table.column_index(column) else {
        return false;
    };
    let mut total = 0.0;
    for row in &table.rows {
        match row.get(index).and_then(|v| v.as_f64()) {
            Some(value) if value >= 0.0 => total += value,
            _ => return false,
        }
    }
    total > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::executor::{ResultColumn, Value};
    use crate::pipeline::testing::revenue_by_product;

    fn selector(bar_max_rows: usize) -> ChartSelector {
        ChartSelector::new(Box::new(KeywordLists::default()), bar_max_rows)
    }

    fn table(columns: &[(&str, ColumnKind)], rows: Vec<Vec<Value>>) -> TabularResult {
        TabularResult {
            columns: columns.iter().map(|(n, k)| ResultColumn::new(n, *k)).collect(),
            rows,
            truncated: false,
            row_cap: 1000,
        }
    }

    fn status_shares(rows: usize) -> TabularResult {
        table(
            &[("status", ColumnKind::Categorical), ("orders", ColumnKind::Numeric)],
            (0..rows).map(|i| vec![Value::Text(format!("s{}", i)), Value::Int(i as i64 + 1)]).collect(),
        )
    }

    #[test]
    fn monthly_revenue_is_a_line_chart() {
        let result = table(
            &[("month", ColumnKind::Temporal), ("revenue", ColumnKind::Numeric)],
            vec![
                vec![Value::Text("2024-01-01".into()), Value::Float(10.0)],
                vec![Value::Text("2024-02-01".into()), Value::Float(12.5)],
            ],
        );
        let spec = selector(25).select(&result, "Plot a line chart of total monthly revenue");
        assert_eq!(spec.kind, ChartKind::Line);
        assert_eq!(spec.x.as_deref(), Some("month"));
        assert_eq!(spec.y.as_deref(), Some("revenue"));
        assert_eq!(spec.sort, Some(SortOrder::Ascending));
    }

    #[test]
    fn superlatives_highlight_the_maximum() {
        let spec = selector(25).select(&revenue_by_product(), "What are the top 10 products by total revenue?");
        assert_eq!(spec.kind, ChartKind::Bar);
        assert_eq!(spec.x.as_deref(), Some("ProductName"));
        assert_eq!(spec.y.as_deref(), Some("revenue"));
        assert_eq!(spec.highlight, Some(Highlight::Max));
    }

    #[test]
    fn minimum_keywords_highlight_the_minimum() {
        let spec = selector(25).select(&revenue_by_product(), "Which products sold the least?");
        assert_eq!(spec.highlight, Some(Highlight::Min));

        let spec = selector(25).select(&revenue_by_product(), "Revenue per product");
        assert_eq!(spec.kind, ChartKind::Bar);
        assert_eq!(spec.highlight, None);
    }

    #[test]
    fn keywords_match_whole_words_only() {
        let policy = KeywordLists::default();
        assert!(policy.wants_max("Top sellers"));
        assert!(!policy.wants_max("laptop sales"));
    }

    #[test]
    fn column_order_does_not_matter_for_bars() {
        let result = table(
            &[("revenue", ColumnKind::Numeric), ("ProductName", ColumnKind::Categorical)],
            vec![vec![Value::Float(1.0), Value::Text("a".into())]],
        );
        let spec = selector(25).select(&result, "revenue by product");
        assert_eq!(spec.kind, ChartKind::Bar);
        assert_eq!(spec.x.as_deref(), Some("ProductName"));
    }

    #[test]
    fn two_measures_make_a_scatter() {
        let result = table(
            &[("price", ColumnKind::Numeric), ("rating", ColumnKind::Numeric)],
            vec![vec![Value::Float(10.0), Value::Int(4)]],
        );
        let spec = selector(25).select(&result, "price vs rating");
        assert_eq!(spec.kind, ChartKind::Scatter);
        assert_eq!(spec.x.as_deref(), Some("price"));
        assert_eq!(spec.y.as_deref(), Some("rating"));
    }

    #[test]
    fn proportions_beyond_the_bar_limit_are_pies() {
        let spec = selector(3).select(&status_shares(5), "What is the distribution of order status?");
        assert_eq!(spec.kind, ChartKind::Pie);
        assert_eq!(spec.x.as_deref(), Some("status"));

        // without the keyword it stays a table
        let spec = selector(3).select(&status_shares(5), "orders per status");
        assert_eq!(spec.kind, ChartKind::Table);
    }

    #[test]
    fn negative_values_never_form_a_pie() {
        let mut result = status_shares(5);
        result.rows[0][1] = Value::Int(-4);
        let spec = selector(3).select(&result, "percentage of orders per status");
        assert_eq!(spec.kind, ChartKind::Table);
    }

    #[test]
    fn empty_and_wide_results_are_tables() {
        let empty = table(&[("month", ColumnKind::Temporal), ("revenue", ColumnKind::Numeric)], Vec::new());
        assert_eq!(selector(25).select(&empty, "monthly revenue"), ChartSpec::table());

        let wide = table(
            &[
                ("a", ColumnKind::Categorical),
                ("b", ColumnKind::Numeric),
                ("c", ColumnKind::Numeric),
            ],
            vec![vec![Value::Text("x".into()), Value::Int(1), Value::Int(2)]],
        );
        assert_eq!(selector(25).select(&wide, "everything").kind, ChartKind::Table);
    }

    #[test]
    fn selection_is_deterministic() {
        let selector = selector(25);
        let result = revenue_by_product();
        let first = selector.select(&result, "best products");
        for _ in 0..10 {
            assert_eq!(selector.select(&result, "best products"), first);
        }
    }

    #[test]
    fn custom_policies_plug_in() {
        struct Never;
        impl KeywordPolicy for Never {
            fn wants_max(&self, _: &str) -> bool {
                false
            }
            fn wants_min(&self, _: &str) -> bool {
                false
            }
            fn wants_proportion(&self, _: &str) -> bool {
                false
            }
        }
        let selector = ChartSelector::new(Box::new(Never), 25);
        let spec = selector.select(&revenue_by_product(), "top products");
        assert_eq!(spec.highlight, None);
    }
}

//! Incremental cursor (watermark) for delta polling
//!
//! The watermark only moves forward. It is advanced by the runtime after a
//! poll cycle fully succeeded; a poll with failed items leaves it alone so
//! the same rows are fetched again.

use crate::{result::Metadata, types::RawItem};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use tracing::debug;

/// Watermark value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Watermark {
    /// Integer sequence value
    Integer(i64),
    /// Floating point value
    Float(f64),
    /// Timestamp string or opaque continuation token
    Text(String),
}

impl Watermark {
    /// Convert a field value; `null`, booleans and containers yield `None`
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Watermark::Integer(i)),
                None => n.as_f64().map(Watermark::Float),
            },
            Value::String(s) => Some(Watermark::Text(s.clone())),
            _ => None,
        }
    }

    /// Compare two watermarks; values of unrelated types are incomparable
    pub fn compare(&self, other: &Watermark) -> Option<Ordering> {
        match (self, other) {
            (Watermark::Integer(a), Watermark::Integer(b)) => Some(a.cmp(b)),
            (Watermark::Integer(a), Watermark::Float(b)) => (*a as f64).partial_cmp(b),
            (Watermark::Float(a), Watermark::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Watermark::Float(a), Watermark::Float(b)) => a.partial_cmp(b),
            (Watermark::Text(a), Watermark::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// SQL literal for query scoping
    pub fn to_sql_literal(&self) -> String {
        match self {
            Watermark::Integer(i) => i.to_string(),
            Watermark::Float(f) => f.to_string(),
            Watermark::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }

    /// JSON form, used in result metadata
    pub fn to_json(&self) -> Value {
        match self {
            Watermark::Integer(i) => Value::from(*i),
            Watermark::Float(f) => Value::from(*f),
            Watermark::Text(s) => Value::from(s.clone()),
        }
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Watermark::Integer(i) => write!(f, "{}", i),
            Watermark::Float(v) => write!(f, "{}", v),
            Watermark::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Incremental cursor over one tracked column/field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncrementalCursor {
    column: Option<String>,
    watermark: Option<Watermark>,
}

impl IncrementalCursor {
    /// Cursor tracking `column`; `None` disables delta scoping
    pub fn new(column: Option<String>) -> Self {
        Self {
            column,
            watermark: None,
        }
    }

    /// Tracked column
    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    /// Current watermark
    pub fn watermark(&self) -> Option<&Watermark> {
        self.watermark.as_ref()
    }

    /// Whether a column is tracked
    pub fn is_enabled(&self) -> bool {
        self.column.is_some()
    }

    /// Scope a base query to rows newer than the watermark
    ///
    /// Appends `column > watermark` (never `>=`) when a watermark exists and
    /// always orders ascending on the column.
    pub fn scope_query(&self, base: &str) -> String {
        let column = match &self.column {
            Some(column) => column,
            None => return base.to_string(),
        };

        let query = base.trim().trim_end_matches(';').trim_end();
        let words = top_level_words(query);
        let (head, existing_order) = match keyword_ranges(query, &words, &["ORDER", "BY"], query.len()).last() {
            Some(&(start, end)) => (query[..start].trim_end(), Some(query[end..].trim())),
            None => (query, None),
        };

        let mut scoped = match &self.watermark {
            Some(watermark) => {
                let filter = format!("{} > {}", column, watermark.to_sql_literal());
                // GROUP BY and HAVING come after the WHERE clause
                let tail_at = [&["GROUP", "BY"][..], &["HAVING"][..]]
                    .iter()
                    .filter_map(|keyword| {
                        keyword_ranges(query, &words, keyword, head.len())
                            .first()
                            .map(|&(start, _)| start)
                    })
                    .min()
                    .unwrap_or(head.len());
                let body = head[..tail_at].trim_end();
                let tail = head[tail_at..].trim();

                let mut scoped = match keyword_ranges(query, &words, &["WHERE"], body.len()).last() {
                    Some(&(start, end)) => format!(
                        "{} WHERE ({}) AND {}",
                        body[..start].trim_end(),
                        body[end..].trim(),
                        filter
                    ),
                    None => format!("{} WHERE {}", body, filter),
                };
                if !tail.is_empty() {
                    scoped.push(' ');
                    scoped.push_str(tail);
                }
                scoped
            }
            None => head.to_string(),
        };

        scoped.push_str(&format!(" ORDER BY {} ASC", column));
        if let Some(order) = existing_order {
            scoped.push_str(", ");
            scoped.push_str(order);
        }
        scoped
    }

    /// Whether a row lies beyond the watermark
    ///
    /// Rows without the column, or with an incomparable value, are admitted.
    pub fn admits(&self, fields: &Metadata) -> bool {
        let current = match &self.watermark {
            Some(current) => current,
            None => return true,
        };
        match self.value_of(fields) {
            Some(value) => !matches!(
                value.compare(current),
                Some(Ordering::Less) | Some(Ordering::Equal)
            ),
            None => true,
        }
    }

    /// Advance to the maximum column value across `items`
    ///
    /// Never regresses. Returns true when the watermark moved.
    pub fn advance(&mut self, items: &[RawItem]) -> bool {
        if self.column.is_none() {
            return false;
        }

        let mut candidate: Option<Watermark> = None;
        for item in items {
            let value = match self.value_of(&item.fields) {
                Some(value) => value,
                None => continue,
            };
            candidate = match candidate {
                None => Some(value),
                Some(best) => match value.compare(&best) {
                    Some(Ordering::Greater) => Some(value),
                    _ => Some(best),
                },
            };
        }

        match candidate {
            Some(value) => self.advance_to(value),
            None => false,
        }
    }

    /// Advance to an explicit value (continuation tokens); never regresses
    pub fn advance_to(&mut self, value: Watermark) -> bool {
        let moves = match &self.watermark {
            None => true,
            Some(current) => value.compare(current) == Some(Ordering::Greater),
        };
        if moves {
            debug!(
                "Cursor {} advanced to {}",
                self.column.as_deref().unwrap_or("-"),
                value
            );
            self.watermark = Some(value);
        }
        moves
    }

    /// Forget the watermark
    pub fn clear(&mut self) {
        self.watermark = None;
    }

    fn value_of(&self, fields: &Metadata) -> Option<Watermark> {
        let column = self.column.as_deref()?;
        let value = fields.get(column).or_else(|| {
            fields
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(column))
                .map(|(_, value)| value)
        })?;
        Watermark::from_json(value)
    }
}

/// Byte offset of the last case-insensitive occurrence of `keyword`
/// Bare word of a query, as a byte range
struct Word {
    start: usize,
    end: usize,
}

/// Words outside parentheses and quotes
///
/// Keywords of subqueries, window clauses and literals never appear here.
fn top_level_words(query: &str) -> Vec<Word> {
    let mut words = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut word_start: Option<usize> = None;

    for (idx, ch) in query.char_indices() {
        if let Some(open) = quote {
            if ch == open {
                quote = None;
            }
            continue;
        }

        let in_word = ch.is_alphanumeric() || ch == '_';
        match word_start {
            None if in_word && depth == 0 => word_start = Some(idx),
            Some(start) if !in_word => {
                words.push(Word { start, end: idx });
                word_start = None;
            }
            _ => {}
        }

        match ch {
            '\'' | '"' | '`' => quote = Some(ch),
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if let Some(start) = word_start {
        words.push(Word {
            start,
            end: query.len(),
        });
    }
    words
}

/// Top-level occurrences of a keyword ending within `query[..limit]`
///
/// Case-insensitive; the words of `keyword` may be separated by any whitespace.
fn keyword_ranges(query: &str, words: &[Word], keyword: &[&str], limit: usize) -> Vec<(usize, usize)> {
    words
        .windows(keyword.len())
        .filter(|window| {
            window
                .iter()
                .zip(keyword)
                .all(|(word, expected)| query[word.start..word.end].eq_ignore_ascii_case(expected))
                && window
                    .windows(2)
                    .all(|pair| query[pair[0].end..pair[1].start].trim().is_empty())
        })
        .map(|window| (window[0].start, window[window.len() - 1].end))
        .filter(|&(_, end)| end <= limit)
        .collect()
}

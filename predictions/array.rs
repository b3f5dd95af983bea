//! Parser for the array literals stored in prediction tables.
//!
//! Cells look like `[0.12, -1.5, 3.0, 0.4]` or, when written by numpy, like
//! `[ 0.12 -1.5   3.   0.4 ]`, possibly wrapped across lines and nested one level
//! (`[[...]]`). Nesting is flattened in row-major order.

use ndarray::Array2;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArrayParseError {
    #[error("array literal must be enclosed in brackets, got '{0}'")]
    MissingBrackets(String),

    #[error("unbalanced brackets in '{0}'")]
    UnbalancedBrackets(String),

    #[error("unexpected text after the closing bracket in '{0}'")]
    TrailingInput(String),

    #[error("'{token}' is not a number")]
    InvalidNumber { token: String },

    #[error("row {row}: {source}")]
    Row {
        row: usize,
        #[source]
        source: Box<ArrayParseError>,
    },

    #[error("row {row} has {found} values, expected {expected}")]
    Ragged {
        row: usize,
        expected: usize,
        found: usize,
    },
}

/// Parses one array literal into a flat vector.
pub fn parse_array(text: &str) -> Result<Vec<f64>, ArrayParseError> {
    let trimmed = text.trim();
    if !trimmed.starts_with('[') {
        return Err(ArrayParseError::MissingBrackets(trimmed.to_string()));
    }

    let mut values = Vec::new();
    let mut depth = 0usize;
    let mut closed = false;
    let mut token = String::new();

    for ch in trimmed.chars() {
        if closed {
            if ch.is_whitespace() {
                continue;
            }
            return Err(ArrayParseError::TrailingInput(trimmed.to_string()));
        }
        match ch {
            '[' => {
                flush(&mut token, &mut values)?;
                depth += 1;
            }
            ']' => {
                flush(&mut token, &mut values)?;
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| ArrayParseError::UnbalancedBrackets(trimmed.to_string()))?;
                closed = depth == 0;
            }
            ',' => flush(&mut token, &mut values)?,
            c if c.is_whitespace() => flush(&mut token, &mut values)?,
            c => token.push(c),
        }
    }

    if !closed {
        return Err(ArrayParseError::UnbalancedBrackets(trimmed.to_string()));
    }
    Ok(values)
}

fn flush(token: &mut String, values: &mut Vec<f64>) -> Result<(), ArrayParseError> {
    if token.is_empty() {
        return Ok(());
    }
    let value = token
        .parse::<f64>()
        .map_err(|_| ArrayParseError::InvalidNumber {
            token: token.clone(),
        })?;
    values.push(value);
    token.clear();
    Ok(())
}

/// Parses a column of array literals into an `(rows, width)` matrix.
///
/// With `expected_width = None` the first row fixes the width. Every other row must match.
pub fn parse_array_column<'a, I>(
    cells: I,
    expected_width: Option<usize>,
) -> Result<Array2<f64>, ArrayParseError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut width = expected_width;
    let mut buffer = Vec::new();
    let mut rows = 0usize;

    for (row, cell) in cells.into_iter().enumerate() {
        let values = parse_array(cell).map_err(|source| ArrayParseError::Row {
            row,
            source: Box::new(source),
        })?;
        let expected = *width.get_or_insert(values.len());
        if values.len() != expected {
            return Err(ArrayParseError::Ragged {
                row,
                expected,
                found: values.len(),
            });
        }
        buffer.extend(values);
        rows += 1;
    }

    let width = width.unwrap_or(0);
    Array2::from_shape_vec((rows, width), buffer).map_err(|_| ArrayParseError::Ragged {
        row: rows,
        expected: width,
        found: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_and_whitespace_separated_literals() {
        assert_eq!(parse_array("[1.0, -2.5, 3e-2]").unwrap(), vec![1.0, -2.5, 0.03]);
        assert_eq!(
            parse_array("[ 0.12 -1.5   3.   0.4 ]").unwrap(),
            vec![0.12, -1.5, 3.0, 0.4]
        );
        assert_eq!(
            parse_array("[0.1 0.2\n 0.3 0.4]").unwrap(),
            vec![0.1, 0.2, 0.3, 0.4]
        );
        assert!(parse_array("[]").unwrap().is_empty());
    }

    #[test]
    fn flattens_nested_literals() {
        assert_eq!(
            parse_array("[[1, 2], [3, 4]]").unwrap(),
            vec![1.0, 2.0, 3.0, 4.0]
        );
    }

    #[test]
    fn rejects_malformed_literals() {
        assert!(matches!(
            parse_array("1.0, 2.0"),
            Err(ArrayParseError::MissingBrackets(_))
        ));
        assert!(matches!(
            parse_array("[1.0, 2.0"),
            Err(ArrayParseError::UnbalancedBrackets(_))
        ));
        assert!(matches!(
            parse_array("[1.0]]"),
            Err(ArrayParseError::TrailingInput(_))
        ));
        assert!(matches!(
            parse_array("[1.0] [2.0]"),
            Err(ArrayParseError::TrailingInput(_))
        ));
        assert_eq!(
            parse_array("[1.0, abc]"),
            Err(ArrayParseError::InvalidNumber {
                token: "abc".to_string()
            })
        );
    }

    #[test]
    fn column_has_fixed_width() {
        let matrix = parse_array_column(["[1, 2]", "[3, 4]", "[5, 6]"], None).unwrap();
        assert_eq!(matrix.dim(), (3, 2));
        assert_eq!(matrix[[2, 1]], 6.0);
    }

    #[test]
    fn ragged_column_is_rejected() {
        let err = parse_array_column(["[1, 2]", "[3]"], None).unwrap_err();
        assert_eq!(
            err,
            ArrayParseError::Ragged {
                row: 1,
                expected: 2,
                found: 1
            }
        );

        let err = parse_array_column(["[1, 2]"], Some(4)).unwrap_err();
        assert!(matches!(err, ArrayParseError::Ragged { expected: 4, .. }));
    }

    #[test]
    fn row_errors_carry_their_index() {
        let err = parse_array_column(["[1]", "[x]"], None).unwrap_err();
        assert!(matches!(err, ArrayParseError::Row { row: 1, .. }));
    }
}

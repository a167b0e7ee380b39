//! Block height selections.

use crate::Error;
use std::fmt;

/// The heights a migration or patch applies to.
///
/// Either a closed range `[start, end]` (`0` leaves that side unbounded) or a sorted, deduplicated
/// list of specific heights. When specific heights are present, `start` and `end` are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeightRange {
    pub start: u64,
    pub end: u64,
    pub specific_heights: Vec<u64>,
}

impl HeightRange {
    /// A closed range of heights.
    pub fn range(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            specific_heights: Vec::new(),
        }
    }

    /// A list of specific heights.
    pub fn heights(mut heights: Vec<u64>) -> Self {
        heights.sort_unstable();
        heights.dedup();
        Self {
            start: 0,
            end: 0,
            specific_heights: heights,
        }
    }

    /// Returns true if no heights were selected (interpreted as "every key").
    pub fn is_empty(&self) -> bool {
        self.start == 0 && self.end == 0 && self.specific_heights.is_empty()
    }

    /// Returns true if the selection is a list of specific heights.
    pub fn has_specific_heights(&self) -> bool {
        !self.specific_heights.is_empty()
    }

    /// Returns true if `height` is selected.
    pub fn is_within_range(&self, height: u64) -> bool {
        if self.has_specific_heights() {
            return self.specific_heights.binary_search(&height).is_ok();
        }
        (self.start == 0 || height >= self.start) && (self.end == 0 || height <= self.end)
    }

    /// The smallest and largest selected height (`0` means unbounded).
    pub fn bounds(&self) -> (u64, u64) {
        match (
            self.specific_heights.first(),
            self.specific_heights.last(),
        ) {
            (Some(min), Some(max)) => (*min, *max),
            _ => (self.start, self.end),
        }
    }

    /// Reject a range whose start lies beyond its (bounded) end.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.has_specific_heights() && self.end > 0 && self.start > self.end {
            return Err(Error::InvalidHeight(format!(
                "start height ({}) cannot be greater than end height ({})",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

impl fmt::Display for HeightRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.specific_heights.as_slice() {
            [] => {}
            [height] => return write!(f, "height {height}"),
            heights if heights.len() <= 5 => {
                let list: Vec<String> = heights.iter().map(u64::to_string).collect();
                return write!(f, "heights {}", list.join(", "));
            }
            heights => return write!(f, "{} specific heights", heights.len()),
        }
        match (self.start, self.end) {
            (0, 0) => f.write_str("all heights"),
            (start, 0) => write!(f, "heights from {start}"),
            (0, end) => write!(f, "heights up to {end}"),
            (start, end) => write!(f, "heights {start} to {end}"),
        }
    }
}

fn parse_one(s: &str) -> Result<u64, Error> {
    let s = s.trim();
    let value: i64 = s
        .parse()
        .map_err(|_| Error::InvalidHeight(format!("invalid height value '{s}'")))?;
    u64::try_from(value)
        .map_err(|_| Error::InvalidHeight(format!("height cannot be negative: {value}")))
}

/// Parse a `--height` flag.
///
/// Accepts `""` (every height), `"N"`, `"a-b"`, and `"h1,h2,..."`. A `-` takes precedence over
/// `,`. Whitespace around each number is ignored.
pub fn parse_height_flag(s: &str) -> Result<HeightRange, Error> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(HeightRange::default());
    }

    if s.contains('-') {
        let parts: Vec<&str> = s.split('-').collect();
        let [start, end] = parts.as_slice() else {
            return Err(Error::InvalidHeight(format!(
                "invalid range format, expected 'start-end', got: {s}"
            )));
        };
        let (start, end) = (parse_one(start)?, parse_one(end)?);
        if start > end {
            return Err(Error::InvalidHeight(format!(
                "start height ({start}) cannot be greater than end height ({end})"
            )));
        }
        return Ok(HeightRange::range(start, end));
    }

    if s.contains(',') {
        let heights = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(parse_one)
            .collect::<Result<Vec<_>, _>>()?;
        if heights.is_empty() {
            return Err(Error::InvalidHeight("no valid heights specified".into()));
        }
        return Ok(HeightRange::heights(heights));
    }

    Ok(HeightRange::heights(vec![parse_one(s)?]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("", HeightRange::default(); "empty")]
    #[test_case("123456", HeightRange::heights(vec![123456]); "single")]
    #[test_case(" 10000 - 20000 ", HeightRange::range(10000, 20000); "range with whitespace")]
    #[test_case("0-0", HeightRange::range(0, 0); "zero range")]
    #[test_case("300,100, 200", HeightRange::heights(vec![100, 200, 300]); "list sorted")]
    #[test_case("5,,5,", HeightRange::heights(vec![5]); "list skips empty and duplicates")]
    fn test_parse_height_flag(input: &str, expected: HeightRange) {
        assert_eq!(parse_height_flag(input).unwrap(), expected);
    }

    #[test_case("20000-10000"; "inverted range")]
    #[test_case("1-2-3"; "too many dashes")]
    #[test_case("-5"; "missing start")]
    #[test_case("abc"; "not a number")]
    #[test_case(",,"; "no heights")]
    #[test_case("1,x"; "bad list item")]
    #[test_case("1-2,3"; "dash wins over comma")]
    fn test_parse_height_flag_rejects(input: &str) {
        assert!(matches!(
            parse_height_flag(input),
            Err(Error::InvalidHeight(_))
        ));
    }

    #[test]
    fn test_parse_inverted_message() {
        match parse_height_flag("20000-10000") {
            Err(Error::InvalidHeight(msg)) => assert_eq!(
                msg,
                "start height (20000) cannot be greater than end height (10000)"
            ),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_is_within_range() {
        let range = HeightRange::range(10, 20);
        assert!(!range.is_within_range(9));
        assert!(range.is_within_range(10));
        assert!(range.is_within_range(20));
        assert!(!range.is_within_range(21));

        let from = HeightRange::range(10, 0);
        assert!(from.is_within_range(u64::MAX));
        assert!(!from.is_within_range(9));

        let up_to = HeightRange::range(0, 10);
        assert!(up_to.is_within_range(0));
        assert!(!up_to.is_within_range(11));

        let specific = HeightRange::heights(vec![7, 3]);
        assert!(specific.is_within_range(3));
        assert!(!specific.is_within_range(5));
        assert_eq!(specific.bounds(), (3, 7));
    }

    #[test]
    fn test_is_empty() {
        assert!(HeightRange::default().is_empty());
        assert!(!HeightRange::range(1, 0).is_empty());
        assert!(!HeightRange::heights(vec![0]).is_empty());
    }

    #[test_case(HeightRange::default(), "all heights")]
    #[test_case(HeightRange::heights(vec![42]), "height 42")]
    #[test_case(HeightRange::heights(vec![1, 2, 3]), "heights 1, 2, 3")]
    #[test_case(HeightRange::heights(vec![1, 2, 3, 4, 5, 6]), "6 specific heights")]
    #[test_case(HeightRange::range(10, 20), "heights 10 to 20")]
    #[test_case(HeightRange::range(10, 0), "heights from 10")]
    #[test_case(HeightRange::range(0, 20), "heights up to 20")]
    fn test_display(range: HeightRange, expected: &str) {
        assert_eq!(range.to_string(), expected);
    }

    #[test]
    fn test_validate() {
        assert!(HeightRange::range(20, 10).validate().is_err());
        assert!(HeightRange::range(20, 0).validate().is_ok());
        assert!(HeightRange::heights(vec![9, 1]).validate().is_ok());
    }
}

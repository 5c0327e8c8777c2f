//! Deterministic archive key layout.
//!
//! Keys have the shape
//! `[prefix_]date[_suffix]/[hour-HH-HH/][status/][custom.../]filename`
//! where the date part may span several segments when the pattern contains
//! `/`. Keys are always `/`-separated so that [`PathScheme::parse_path`]
//! recovers exactly the fields [`PathScheme::generate_cloud_path`] encoded.

use crate::config::{ArchiveConfig, StructureType};
use crate::error::{ArchiveError, Result};
use chrono::{Datelike, NaiveDate};
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const HOUR_SEGMENT_PREFIX: &str = "hour-";

/// One-hour (or wider) bucket covered by an archive batch, labelled `HH-HH`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HourRange {
    start: u8,
    end: u8,
}

impl HourRange {
    pub fn new(start: u8, end: u8) -> Result<Self> {
        if start >= end || end > 24 {
            return Err(ArchiveError::InvalidComponent {
                value: format!("{}-{}", start, end),
                reason: "hour range must satisfy start < end <= 24".to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// The bucket `[hour, hour + 1)`
    pub fn for_hour(hour: u32) -> Result<Self> {
        let start = u8::try_from(hour).map_err(|_| ArchiveError::InvalidComponent {
            value: hour.to_string(),
            reason: "hour out of range".to_string(),
        })?;
        Self::new(start, start.saturating_add(1))
    }

    pub fn start(&self) -> u8 {
        self.start
    }

    pub fn end(&self) -> u8 {
        self.end
    }

    /// Folder segment, e.g. `hour-14-15`
    pub fn segment(&self) -> String {
        format!("{}{}", HOUR_SEGMENT_PREFIX, self)
    }

    fn from_segment(segment: &str) -> Option<Self> {
        segment
            .strip_prefix(HOUR_SEGMENT_PREFIX)
            .and_then(|label| label.parse().ok())
    }
}

impl fmt::Display for HourRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:02}", self.start, self.end)
    }
}

impl FromStr for HourRange {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ArchiveError::InvalidComponent {
            value: s.to_string(),
            reason: "expected an hour range like 14-15".to_string(),
        };
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        if start.len() != 2 || end.len() != 2 {
            return Err(invalid());
        }
        let start: u8 = start.parse().map_err(|_| invalid())?;
        let end: u8 = end.parse().map_err(|_| invalid())?;
        Self::new(start, end)
    }
}

impl Serialize for HourRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Date recovered from a key, as precise as the layout encodes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchiveDate {
    year: i32,
    month: Option<u32>,
    day: Option<u32>,
}

impl ArchiveDate {
    pub fn new(year: i32, month: Option<u32>, day: Option<u32>) -> Option<Self> {
        let date = Self {
            year,
            month,
            day: month.and(day),
        };
        // Validates month/day and rejects impossible days like Feb 30
        NaiveDate::from_ymd_opt(year, month.unwrap_or(1), date.day.unwrap_or(1))?;
        Some(date)
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> Option<u32> {
        self.month
    }

    pub fn day(&self) -> Option<u32> {
        self.day
    }

    /// The exact calendar day, if the layout encodes days
    pub fn exact(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month?, self.day?)
    }

    /// First calendar day the key can stand for
    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month.unwrap_or(1), self.day.unwrap_or(1))
            .unwrap_or(NaiveDate::MIN)
    }

    /// Last calendar day the key can stand for
    pub fn last_day(&self) -> NaiveDate {
        match (self.month, self.day) {
            (Some(_), Some(_)) => self.first_day(),
            (Some(month), None) => {
                let (y, m) = if month == 12 {
                    (self.year + 1, 1)
                } else {
                    (self.year, month + 1)
                };
                NaiveDate::from_ymd_opt(y, m, 1)
                    .and_then(|d| d.pred_opt())
                    .unwrap_or(NaiveDate::MAX)
            }
            _ => NaiveDate::from_ymd_opt(self.year, 12, 31).unwrap_or(NaiveDate::MAX),
        }
    }

    /// Whether any day covered by this date lies in `[from, to]`
    pub fn overlaps(&self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
        let after_from = from.map_or(true, |from| self.last_day() >= from);
        let before_to = to.map_or(true, |to| self.first_day() <= to);
        after_from && before_to
    }

    /// Whether every day covered by this date is older than `cutoff`
    pub fn entirely_before(&self, cutoff: NaiveDate) -> bool {
        self.last_day() < cutoff
    }
}

impl From<NaiveDate> for ArchiveDate {
    fn from(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: Some(date.month()),
            day: Some(date.day()),
        }
    }
}

impl fmt::Display for ArchiveDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.year)?;
        if let Some(month) = self.month {
            write!(f, "-{:02}", month)?;
            if let Some(day) = self.day {
                write!(f, "-{:02}", day)?;
            }
        }
        Ok(())
    }
}

impl Serialize for ArchiveDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Fields decoded from an archive key. Fields the layout does not encode stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPath {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub hour_range: Option<HourRange>,
    pub status: Option<String>,
}

impl ParsedPath {
    pub fn date(&self) -> Option<ArchiveDate> {
        ArchiveDate::new(self.year?, self.month, self.day)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DatePiece {
    Literal(String),
    Year,
    Month,
    Day,
}

impl DatePiece {
    fn width(&self) -> usize {
        match self {
            DatePiece::Literal(s) => s.len(),
            DatePiece::Year => 4,
            DatePiece::Month | DatePiece::Day => 2,
        }
    }
}

/// Tokenized date layout; each inner vector is one key segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatePattern {
    segments: Vec<Vec<DatePiece>>,
}

impl DatePattern {
    /// Effective pattern for a config: `pattern` wins over `structure_type`
    pub fn for_config(config: &ArchiveConfig) -> Result<Self> {
        if let Some(ref pattern) = config.pattern {
            return Self::parse(pattern);
        }

        let base = Self::parse(&config.naming.date_format)?;
        match config.structure_type {
            StructureType::Daily => Ok(base),
            StructureType::Monthly => base.without(&DatePiece::Day),
            StructureType::Yearly => base.without(&DatePiece::Day)?.without(&DatePiece::Month),
            StructureType::Custom => Err(ArchiveError::Config(
                "archive.structure_type = custom requires archive.pattern".to_string(),
            )),
        }
    }

    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            ArchiveError::Config(format!("invalid date pattern '{}': {}", pattern, reason))
        };

        let mut segments = Vec::new();
        let (mut years, mut months, mut days) = (0, 0, 0);

        for raw in pattern.split('/') {
            if raw.is_empty() {
                return Err(invalid("empty segment"));
            }
            let mut pieces = Vec::new();
            let mut literal = String::new();
            let mut rest = raw;

            while !rest.is_empty() {
                let token = if rest.starts_with("YYYY") {
                    years += 1;
                    Some(DatePiece::Year)
                } else if rest.starts_with("MM") {
                    months += 1;
                    Some(DatePiece::Month)
                } else if rest.starts_with("DD") {
                    days += 1;
                    Some(DatePiece::Day)
                } else {
                    None
                };

                match token {
                    Some(token) => {
                        if !literal.is_empty() {
                            pieces.push(DatePiece::Literal(std::mem::take(&mut literal)));
                        }
                        rest = &rest[token.width()..];
                        pieces.push(token);
                    }
                    None => {
                        let c = rest.chars().next().unwrap_or_default();
                        if c == '\\' {
                            return Err(invalid("backslash is not allowed"));
                        }
                        literal.push(c);
                        rest = &rest[c.len_utf8()..];
                    }
                }
            }
            if !literal.is_empty() {
                pieces.push(DatePiece::Literal(literal));
            }
            segments.push(pieces);
        }

        if years > 1 || months > 1 || days > 1 {
            return Err(invalid("YYYY, MM and DD may each appear at most once"));
        }
        if years + months + days == 0 {
            return Err(invalid("no date token"));
        }

        Ok(Self { segments })
    }

    /// Drop a token together with its adjoining separator
    fn without(mut self, token: &DatePiece) -> Result<Self> {
        for pieces in &mut self.segments {
            if let Some(pos) = pieces.iter().position(|p| p == token) {
                pieces.remove(pos);
                if pos > 0 && matches!(pieces[pos - 1], DatePiece::Literal(_)) {
                    pieces.remove(pos - 1);
                } else if pos < pieces.len() && matches!(pieces[pos], DatePiece::Literal(_)) {
                    pieces.remove(pos);
                }
            }
        }
        self.segments
            .retain(|pieces| pieces.iter().any(|p| !matches!(p, DatePiece::Literal(_))));

        if self.segments.is_empty() {
            return Err(ArchiveError::Config(
                "date format leaves no date segment".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn format(&self, date: NaiveDate) -> Vec<String> {
        self.segments
            .iter()
            .map(|pieces| {
                pieces
                    .iter()
                    .map(|piece| match piece {
                        DatePiece::Literal(s) => s.clone(),
                        DatePiece::Year => format!("{:04}", date.year()),
                        DatePiece::Month => format!("{:02}", date.month()),
                        DatePiece::Day => format!("{:02}", date.day()),
                    })
                    .collect()
            })
            .collect()
    }

    /// Decode date segments; `None` when they do not follow the pattern
    fn decode(&self, segments: &[&str]) -> Option<(Option<i32>, Option<u32>, Option<u32>)> {
        if segments.len() != self.segments.len() {
            return None;
        }

        let (mut year, mut month, mut day) = (None, None, None);
        for (pieces, segment) in self.segments.iter().zip(segments) {
            let mut rest = *segment;
            for piece in pieces {
                let width = piece.width();
                if rest.len() < width || !rest.is_char_boundary(width) {
                    return None;
                }
                let (head, tail) = rest.split_at(width);
                match piece {
                    DatePiece::Literal(s) => {
                        if head != s.as_str() {
                            return None;
                        }
                    }
                    _ if !head.bytes().all(|b| b.is_ascii_digit()) => return None,
                    DatePiece::Year => year = head.parse().ok(),
                    DatePiece::Month => month = head.parse().ok(),
                    DatePiece::Day => day = head.parse().ok(),
                }
                rest = tail;
            }
            if !rest.is_empty() {
                return None;
            }
        }

        if matches!(month, Some(m) if !(1..=12).contains(&m)) {
            return None;
        }
        if matches!(day, Some(d) if !(1..=31).contains(&d)) {
            return None;
        }
        if let (Some(y), Some(m), Some(d)) = (year, month, day) {
            NaiveDate::from_ymd_opt(y, m, d)?;
        }
        Some((year, month, day))
    }
}

/// Reject values that would break key parsing
pub fn validate_component(value: &str) -> Result<()> {
    let reason = if value.is_empty() {
        Some("must not be empty")
    } else if value.contains('/') || value.contains('\\') {
        Some("must not contain path separators")
    } else if value == "." || value == ".." {
        Some("must not be a relative path reference")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ArchiveError::InvalidComponent {
            value: value.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

fn validate_status(status: &str) -> Result<()> {
    validate_component(status)?;
    if status.starts_with(HOUR_SEGMENT_PREFIX) {
        return Err(ArchiveError::InvalidComponent {
            value: status.to_string(),
            reason: format!("status must not start with '{}'", HOUR_SEGMENT_PREFIX),
        });
    }
    Ok(())
}

/// Maps archive coordinates to keys and back for one [`ArchiveConfig`]
#[derive(Debug, Clone)]
pub struct PathScheme {
    config: ArchiveConfig,
    pattern: DatePattern,
}

impl PathScheme {
    pub fn new(config: ArchiveConfig) -> Result<Self> {
        config.validate()?;
        let pattern = DatePattern::for_config(&config)?;
        Ok(Self { config, pattern })
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    fn date_segments(&self, date: NaiveDate) -> Vec<String> {
        let mut segments = self.pattern.format(date);
        if let Some(ref prefix) = self.config.naming.prefix {
            if let Some(first) = segments.first_mut() {
                *first = format!("{}_{}", prefix, first);
            }
        }
        if let Some(ref suffix) = self.config.naming.suffix {
            if let Some(last) = segments.last_mut() {
                last.push('_');
                last.push_str(suffix);
            }
        }
        segments
    }

    fn segments(
        &self,
        date: NaiveDate,
        hour_range: Option<HourRange>,
        status: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut segments = self.date_segments(date);
        let sub_folders = &self.config.sub_folders;

        if sub_folders.enabled {
            if let (true, Some(hour_range)) = (sub_folders.by_hour, hour_range) {
                segments.push(hour_range.segment());
            }
            if let (true, Some(status)) = (sub_folders.by_status, status) {
                validate_status(status)?;
                segments.push(status.to_string());
            }
            segments.extend(sub_folders.custom.iter().cloned());
        }
        Ok(segments)
    }

    /// Folder path for a batch, without the file name
    pub fn generate_path(
        &self,
        date: NaiveDate,
        hour_range: Option<HourRange>,
        status: Option<&str>,
    ) -> Result<String> {
        Ok(self.segments(date, hour_range, status)?.join("/"))
    }

    /// Object key for a file; always `/`-separated
    pub fn generate_cloud_path(
        &self,
        date: NaiveDate,
        file_name: &str,
        hour_range: Option<HourRange>,
        status: Option<&str>,
    ) -> Result<String> {
        validate_component(file_name)?;
        let mut segments = self.segments(date, hour_range, status)?;
        segments.push(file_name.to_string());
        Ok(segments.join("/"))
    }

    /// Same layout under `root`, using the platform separator
    pub fn generate_local_path(
        &self,
        root: &Path,
        date: NaiveDate,
        file_name: &str,
        hour_range: Option<HourRange>,
        status: Option<&str>,
    ) -> Result<PathBuf> {
        validate_component(file_name)?;
        let mut path = root.to_path_buf();
        for segment in self.segments(date, hour_range, status)? {
            path.push(segment);
        }
        path.push(file_name);
        Ok(path)
    }

    /// Decode a key produced by [`Self::generate_cloud_path`] with the same config
    pub fn parse_path(&self, key: &str) -> Result<ParsedPath> {
        let segments: Vec<&str> = key.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ArchiveError::malformed(key, "empty path component"));
        }

        let date_count = self.pattern.segment_count();
        if segments.len() < date_count + 1 {
            return Err(ArchiveError::malformed(
                key,
                format!("expected at least {} segments", date_count + 1),
            ));
        }

        let mut date_parts: Vec<&str> = segments[..date_count].to_vec();
        if let Some(ref prefix) = self.config.naming.prefix {
            let first = date_parts[0]
                .strip_prefix(prefix.as_str())
                .and_then(|s| s.strip_prefix('_'))
                .ok_or_else(|| ArchiveError::malformed(key, "missing prefix"))?;
            date_parts[0] = first;
        }
        if let Some(ref suffix) = self.config.naming.suffix {
            let last_index = date_parts.len() - 1;
            let last = date_parts[last_index]
                .strip_suffix(suffix.as_str())
                .and_then(|s| s.strip_suffix('_'))
                .ok_or_else(|| ArchiveError::malformed(key, "missing suffix"))?;
            date_parts[last_index] = last;
        }

        let (year, month, day) = self
            .pattern
            .decode(&date_parts)
            .ok_or_else(|| ArchiveError::malformed(key, "date does not match the layout"))?;

        let mut rest = &segments[date_count..segments.len() - 1];
        let mut parsed = ParsedPath {
            year,
            month,
            day,
            ..Default::default()
        };

        let sub_folders = &self.config.sub_folders;
        if sub_folders.enabled {
            let custom = &sub_folders.custom;
            if rest.len() < custom.len()
                || rest[rest.len() - custom.len()..]
                    .iter()
                    .zip(custom)
                    .any(|(a, b)| *a != b.as_str())
            {
                return Err(ArchiveError::malformed(key, "custom folders do not match"));
            }
            rest = &rest[..rest.len() - custom.len()];

            if sub_folders.by_hour {
                if let Some(hour_range) = rest.first().and_then(|s| HourRange::from_segment(s)) {
                    parsed.hour_range = Some(hour_range);
                    rest = &rest[1..];
                }
            }
            if sub_folders.by_status {
                if let Some(status) = rest.first() {
                    validate_status(status).map_err(|_| {
                        ArchiveError::malformed(key, "status folder is not a valid status")
                    })?;
                    parsed.status = Some(status.to_string());
                    rest = &rest[1..];
                }
            }
        }

        if !rest.is_empty() {
            return Err(ArchiveError::malformed(key, "unexpected folder segments"));
        }
        Ok(parsed)
    }

    /// Listing prefix shared by every key dated within `[from, to]`, when there is one
    pub fn scope_prefix(&self, from: NaiveDate, to: NaiveDate) -> Option<String> {
        let from_segments = self.date_segments(from);
        if from_segments != self.date_segments(to) {
            return None;
        }
        Some(format!("{}/", from_segments.join("/")))
    }
}

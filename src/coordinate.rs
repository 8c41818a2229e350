//! Degree/minute/second coordinate parsing and the grid-cell predicate.
//!
//! A grid cell is one whole degree by six minutes on each axis. Seconds are
//! accepted by the parser and dropped.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::CoordinateError;

/// Width of a minute bucket.
pub const GRID_MINUTES: i64 = 6;

/// Canonical bucket anchors `{0, 6, ..., 54}`.
pub const MINUTE_ANCHORS: [i64; 10] = [0, 6, 12, 18, 24, 30, 36, 42, 48, 54];

pub const MAX_LAT_DEGREES: i64 = 90;
pub const MAX_LON_DEGREES: i64 = 180;

/// Signed whole degrees plus unsigned minutes for latitude and longitude.
///
/// Degrees are negative for the southern and western hemispheres. Values are
/// not range-checked on construction so that arbitrary query coordinates can
/// be fed to a circuit; [`GridCoordinate::parse`] only produces valid ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridCoordinate {
    pub lat_deg: i64,
    pub lat_min: i64,
    pub lon_deg: i64,
    pub lon_min: i64,
}

impl GridCoordinate {
    pub const fn new(lat_deg: i64, lat_min: i64, lon_deg: i64, lon_min: i64) -> Self {
        Self {
            lat_deg,
            lat_min,
            lon_deg,
            lon_min,
        }
    }

    /// Parse `D° M' S.F" H, D° M' S.F" H`.
    pub fn parse(input: &str) -> Result<Self, CoordinateError> {
        let mut halves = input.split(',');
        let (lat, lon) = match (halves.next(), halves.next(), halves.next()) {
            (Some(lat), Some(lon), None) => (lat, lon),
            _ => return Err(format_error(input, "expected `latitude, longitude`")),
        };

        let (lat_deg, lat_min) = parse_axis(lat, Axis::Latitude, input)?;
        let (lon_deg, lon_min) = parse_axis(lon, Axis::Longitude, input)?;

        Ok(Self::new(lat_deg, lat_min, lon_deg, lon_min))
    }

    /// Same degrees with both minute values floored onto the 6-minute grid.
    #[must_use]
    pub fn anchored(&self) -> Self {
        Self::new(
            self.lat_deg,
            minute_anchor(self.lat_min),
            self.lon_deg,
            minute_anchor(self.lon_min),
        )
    }

    /// Whether both minute values are canonical bucket anchors.
    pub fn is_grid_aligned(&self) -> bool {
        MINUTE_ANCHORS.contains(&self.lat_min) && MINUTE_ANCHORS.contains(&self.lon_min)
    }

    /// Whether `self` lies in the grid cell of `reference`: equal degrees and
    /// minutes inside `[anchor, anchor + 6)` of the reference's floored minutes.
    pub fn in_cell_of(&self, reference: &GridCoordinate) -> bool {
        let lat_anchor = minute_anchor(reference.lat_min);
        let lon_anchor = minute_anchor(reference.lon_min);
        self.lat_deg == reference.lat_deg
            && self.lon_deg == reference.lon_deg
            && (lat_anchor..lat_anchor + GRID_MINUTES).contains(&self.lat_min)
            && (lon_anchor..lon_anchor + GRID_MINUTES).contains(&self.lon_min)
    }
}

impl FromStr for GridCoordinate {
    type Err = CoordinateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for GridCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lat_hemisphere = if self.lat_deg < 0 { 'S' } else { 'N' };
        let lon_hemisphere = if self.lon_deg < 0 { 'W' } else { 'E' };
        write!(
            f,
            "{}° {}' 0\" {}, {}° {}' 0\" {}",
            self.lat_deg.abs(),
            self.lat_min,
            lat_hemisphere,
            self.lon_deg.abs(),
            self.lon_min,
            lon_hemisphere
        )
    }
}

/// Floor a minute value onto its bucket anchor.
pub fn minute_anchor(minute: i64) -> i64 {
    minute - minute.rem_euclid(GRID_MINUTES)
}

#[derive(Clone, Copy)]
enum Axis {
    Latitude,
    Longitude,
}

impl Axis {
    fn name(self) -> &'static str {
        match self {
            Axis::Latitude => "latitude",
            Axis::Longitude => "longitude",
        }
    }

    fn max_degrees(self) -> i64 {
        match self {
            Axis::Latitude => MAX_LAT_DEGREES,
            Axis::Longitude => MAX_LON_DEGREES,
        }
    }

    /// Sign for a hemisphere letter, or `None` if the letter belongs to the other axis.
    fn sign(self, hemisphere: &str) -> Option<i64> {
        match (self, hemisphere) {
            (Axis::Latitude, "N") | (Axis::Longitude, "E") => Some(1),
            (Axis::Latitude, "S") | (Axis::Longitude, "W") => Some(-1),
            _ => None,
        }
    }
}

fn format_error(input: &str, reason: impl Into<String>) -> CoordinateError {
    CoordinateError::Format {
        input: input.to_string(),
        reason: reason.into(),
    }
}

fn parse_axis(part: &str, axis: Axis, input: &str) -> Result<(i64, i64), CoordinateError> {
    let mut rest = part.trim();

    let degrees = take_integer(&mut rest, '°', input)?;
    let minutes = take_integer(&mut rest, '\'', input)?;
    let seconds = take_decimal(&mut rest, '"', input)?;

    let sign = axis.sign(rest.trim()).ok_or_else(|| {
        format_error(
            input,
            format!("bad {} hemisphere {:?}", axis.name(), rest.trim()),
        )
    })?;

    if degrees > axis.max_degrees() {
        return Err(CoordinateError::OutOfRange {
            axis: axis.name(),
            value: degrees,
            min: 0,
            max: axis.max_degrees(),
        });
    }
    if minutes > 59 {
        return Err(CoordinateError::OutOfRange {
            axis: "minutes",
            value: minutes,
            min: 0,
            max: 59,
        });
    }
    if seconds >= 60.0 {
        return Err(format_error(input, format!("seconds {seconds} >= 60")));
    }

    Ok((sign * degrees, minutes))
}

/// Consume leading digits followed by `marker`.
fn take_integer(rest: &mut &str, marker: char, input: &str) -> Result<i64, CoordinateError> {
    let s = rest.trim_start();
    let digits = s.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 || digits > 3 {
        return Err(format_error(input, format!("expected digits before `{marker}`")));
    }

    let (number, tail) = s.split_at(digits);
    let tail = tail
        .strip_prefix(marker)
        .ok_or_else(|| format_error(input, format!("missing `{marker}` after {number}")))?;

    *rest = tail;
    number
        .parse()
        .map_err(|_| format_error(input, format!("invalid number {number}")))
}

/// Consume `digits[.digits]` followed by `marker`.
fn take_decimal(rest: &mut &str, marker: char, input: &str) -> Result<f64, CoordinateError> {
    let s = rest.trim_start();
    let len = s
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .count();
    let (number, tail) = s.split_at(len);

    if number.is_empty() || number.starts_with('.') || number.matches('.').count() > 1 {
        return Err(format_error(input, format!("expected seconds before `{marker}`")));
    }
    let tail = tail
        .strip_prefix(marker)
        .ok_or_else(|| format_error(input, format!("missing `{marker}` after {number}")))?;

    *rest = tail;
    number
        .parse()
        .map_err(|_| format_error(input, format!("invalid seconds {number}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_southern_eastern() {
        let c = GridCoordinate::parse("23° 11' 6.5\" S, 18° 22' 36\" E").unwrap();
        assert_eq!(c, GridCoordinate::new(-23, 11, 18, 22));
    }

    #[test]
    fn test_parse_northern_western_without_spaces() {
        let c = GridCoordinate::parse("51°30'26.4\"N, 0°7'39.9\"W").unwrap();
        assert_eq!(c, GridCoordinate::new(51, 30, 0, 7));
    }

    #[test]
    fn test_parse_missing_marks_is_format_error() {
        let err = GridCoordinate::parse("23 11 6 S 18 22 36 E").unwrap_err();
        assert!(matches!(err, CoordinateError::Format { .. }));
    }

    #[test]
    fn test_parse_swapped_hemispheres() {
        let err = GridCoordinate::parse("23° 11' 6\" E, 18° 22' 36\" S").unwrap_err();
        assert!(matches!(err, CoordinateError::Format { .. }));
    }

    #[test]
    fn test_parse_out_of_range() {
        assert!(matches!(
            GridCoordinate::parse("91° 0' 0\" N, 18° 22' 36\" E"),
            Err(CoordinateError::OutOfRange { .. })
        ));
        assert!(matches!(
            GridCoordinate::parse("10° 60' 0\" N, 18° 22' 36\" E"),
            Err(CoordinateError::OutOfRange { .. })
        ));
        assert!(GridCoordinate::parse("10° 5' 60\" N, 18° 22' 36\" E").is_err());
    }

    #[test]
    fn test_anchor_floors_to_six() {
        assert_eq!(minute_anchor(11), 6);
        assert_eq!(minute_anchor(22), 18);
        assert_eq!(minute_anchor(54), 54);
        assert_eq!(minute_anchor(0), 0);
        assert_eq!(
            GridCoordinate::new(-23, 11, 18, 22).anchored(),
            GridCoordinate::new(-23, 6, 18, 18)
        );
    }

    #[test]
    fn test_cell_boundaries_are_half_open() {
        let reference = GridCoordinate::new(-23, 11, 18, 22);
        assert!(GridCoordinate::new(-23, 6, 18, 18).in_cell_of(&reference));
        assert!(GridCoordinate::new(-23, 11, 18, 23).in_cell_of(&reference));
        assert!(!GridCoordinate::new(-23, 12, 18, 18).in_cell_of(&reference));
        assert!(!GridCoordinate::new(-23, 5, 18, 18).in_cell_of(&reference));
        assert!(!GridCoordinate::new(-22, 6, 18, 18).in_cell_of(&reference));
    }

    proptest! {
        #[test]
        fn prop_display_parse_roundtrip(
            lat in -90i64..=90,
            lat_min in 0i64..60,
            lon in -180i64..=180,
            lon_min in 0i64..60,
        ) {
            let c = GridCoordinate::new(lat, lat_min, lon, lon_min);
            let parsed = GridCoordinate::parse(&c.to_string()).unwrap();
            prop_assert_eq!(parsed, c);
        }
    }
}

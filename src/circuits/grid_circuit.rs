use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::coordinate::{GridCoordinate, GRID_MINUTES, MAX_LAT_DEGREES, MAX_LON_DEGREES, MINUTE_ANCHORS};

/// Added to every input signal so comparisons never see a negative field element.
pub const SIGNAL_OFFSET: i64 = 1 << 15;

/// Bit width every shifted signal must fit in.
pub const DECLARED_BITS: u32 = 16;

/// Default location of the circomlib circuits directory.
pub const DEFAULT_CIRCOMLIB: &str = "node_modules/circomlib/circuits";

/// A verification input outside `[-SIGNAL_OFFSET, SIGNAL_OFFSET)`. The witness
/// generator cannot satisfy the bit decomposition, so no proof exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("signal {signal} = {value} is outside the declared range [{min}, {max}]")]
pub struct DeclaredRangeError {
    pub signal: &'static str,
    pub value: i64,
    pub min: i64,
    pub max: i64,
}

// Library templates; parameters are baked into `main` per contribution.
const TEMPLATES: &str = r#"
template Shift(offset) {
    signal input in;
    signal output out;

    out <== in + offset;

    component bits = Num2Bits(16);
    bits.in <== out;
}

template InRange(lo, hi) {
    signal input in;
    signal output out;

    component ge = GreaterEqThan(16);
    ge.in[0] <== in;
    ge.in[1] <== lo;

    component le = LessEqThan(16);
    le.in[0] <== in;
    le.in[1] <== hi;

    out <== ge.out * le.out;
}

template OnMinuteGrid(offset) {
    signal input in;
    signal output out;

    component eq[10];
    var hits = 0;
    for (var i = 0; i < 10; i++) {
        eq[i] = IsEqual();
        eq[i].in[0] <== in;
        eq[i].in[1] <== offset + i * 6;
        hits += eq[i].out;
    }
    out <== hits;
}

template AxisInCell(offset, maxDegree, degreeTrue, minuteAnchor) {
    signal input degree;
    signal input minute;
    signal output out;

    component degreeShift = Shift(offset);
    degreeShift.in <== degree;
    component minuteShift = Shift(offset);
    minuteShift.in <== minute;

    component degreeRange = InRange(offset - maxDegree, offset + maxDegree);
    degreeRange.in <== degreeShift.out;

    component onGrid = OnMinuteGrid(offset);
    onGrid.in <== minuteShift.out;

    component degreeMatch = IsEqual();
    degreeMatch.in[0] <== degreeShift.out;
    degreeMatch.in[1] <== degreeTrue;

    component bucket = InRange(minuteAnchor, minuteAnchor + 5);
    bucket.in <== minuteShift.out;

    signal valid;
    valid <== degreeRange.out * onGrid.out;
    signal matched;
    matched <== degreeMatch.out * bucket.out;
    out <== valid * matched;
}

template CoordinateInGrid(latTrue, latAnchor, lonTrue, lonAnchor) {
    signal input latDegVerify;
    signal input latMinVerify;
    signal input lonDegVerify;
    signal input lonMinVerify;
    signal output isInGrid;
"#;

/// Grid-cell membership circuit for one contribution's true coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridCircuit {
    anchor: GridCoordinate,
}

impl GridCircuit {
    /// Minutes are floored onto the 6-minute grid before they are baked in.
    pub fn new(true_coordinate: &GridCoordinate) -> Self {
        Self {
            anchor: true_coordinate.anchored(),
        }
    }

    pub fn anchor(&self) -> &GridCoordinate {
        &self.anchor
    }

    /// Emit circom source. Byte-identical for equal anchors and include paths.
    pub fn synthesize(&self, circomlib: &str) -> String {
        let circomlib = circomlib.trim_end_matches('/');
        let a = &self.anchor;

        let mut source = String::with_capacity(TEMPLATES.len() + 1024);
        source.push_str("pragma circom 2.0.0;\n\n");
        source.push_str(&format!("include \"{circomlib}/comparators.circom\";\n"));
        source.push_str(TEMPLATES);
        source.push_str(&format!(
            "
    component lat = AxisInCell({SIGNAL_OFFSET}, {MAX_LAT_DEGREES}, latTrue, latAnchor);
    lat.degree <== latDegVerify;
    lat.minute <== latMinVerify;

    component lon = AxisInCell({SIGNAL_OFFSET}, {MAX_LON_DEGREES}, lonTrue, lonAnchor);
    lon.degree <== lonDegVerify;
    lon.minute <== lonMinVerify;

    isInGrid <== lat.out * lon.out;
}}

component main = CoordinateInGrid({}, {}, {}, {});
",
            a.lat_deg + SIGNAL_OFFSET,
            a.lat_min + SIGNAL_OFFSET,
            a.lon_deg + SIGNAL_OFFSET,
            a.lon_min + SIGNAL_OFFSET,
        ));
        source
    }

    /// Digest of the synthesized source, used to detect stale artifacts.
    pub fn source_digest(source: &str) -> [u8; 32] {
        Sha256::digest(source.as_bytes()).into()
    }

    /// Native evaluation of the circuit's output signal.
    ///
    /// Mirrors the constraint system: declared-range violations are errors
    /// (no witness exists), anything else yields 0 or 1.
    pub fn evaluate(&self, query: &GridCoordinate) -> Result<u8, DeclaredRangeError> {
        let lat_deg = shift("latDegVerify", query.lat_deg)?;
        let lat_min = shift("latMinVerify", query.lat_min)?;
        let lon_deg = shift("lonDegVerify", query.lon_deg)?;
        let lon_min = shift("lonMinVerify", query.lon_min)?;

        let lat = axis_in_cell(
            lat_deg,
            lat_min,
            MAX_LAT_DEGREES,
            self.anchor.lat_deg,
            self.anchor.lat_min,
        );
        let lon = axis_in_cell(
            lon_deg,
            lon_min,
            MAX_LON_DEGREES,
            self.anchor.lon_deg,
            self.anchor.lon_min,
        );

        Ok(u8::from(lat && lon))
    }
}

fn shift(signal: &'static str, value: i64) -> Result<i64, DeclaredRangeError> {
    let shifted = value + SIGNAL_OFFSET;
    if (0..1i64 << DECLARED_BITS).contains(&shifted) {
        Ok(shifted)
    } else {
        Err(DeclaredRangeError {
            signal,
            value,
            min: -SIGNAL_OFFSET,
            max: SIGNAL_OFFSET - 1,
        })
    }
}

fn axis_in_cell(
    degree: i64,
    minute: i64,
    max_degree: i64,
    degree_true: i64,
    minute_anchor: i64,
) -> bool {
    let degree_range = (SIGNAL_OFFSET - max_degree..=SIGNAL_OFFSET + max_degree).contains(&degree);
    let on_grid = MINUTE_ANCHORS
        .iter()
        .any(|anchor| minute == SIGNAL_OFFSET + anchor);
    let degree_match = degree == SIGNAL_OFFSET + degree_true;
    let anchor = SIGNAL_OFFSET + minute_anchor;
    let bucket = (anchor..anchor + GRID_MINUTES).contains(&minute);

    degree_range && on_grid && degree_match && bucket
}

//! Conversion of exported Solidity calldata into verifier call arguments.
//!
//! The export is a flat list of nine integers: `a` (2), `b` (2x2, row-major),
//! `c` (2) and the single public signal. The verifier ABI depends on this shape.

use std::fmt;

use ethers::types::U256;

use crate::error::CalldataError;

pub const CALLDATA_TOKENS: usize = 9;

/// Arguments of `verifyProof(uint[2], uint[2][2], uint[2], uint[1])`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Calldata {
    pub a: [U256; 2],
    pub b: [[U256; 2]; 2],
    pub c: [U256; 2],
    pub input: [U256; 1],
}

impl Calldata {
    /// Parse the textual export, e.g. `["0x1","0x2"],[["0x3","0x4"],["0x5","0x6"]],["0x7","0x8"],["0x1"]`.
    pub fn parse(export: &str) -> Result<Self, CalldataError> {
        let cleaned: String = export
            .chars()
            .filter(|c| !matches!(c, '"' | '[' | ']') && !c.is_whitespace())
            .collect();
        let tokens: Vec<&str> = cleaned.split(',').filter(|t| !t.is_empty()).collect();

        if tokens.len() != CALLDATA_TOKENS {
            return Err(CalldataError::TokenCount {
                expected: CALLDATA_TOKENS,
                actual: tokens.len(),
            });
        }

        let v = tokens
            .iter()
            .map(|t| parse_integer(t))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            a: [v[0], v[1]],
            b: [[v[2], v[3]], [v[4], v[5]]],
            c: [v[6], v[7]],
            input: [v[8]],
        })
    }

    pub fn public_signal(&self) -> U256 {
        self.input[0]
    }

    /// Same proof, submitted as a claim that the query is inside the grid cell.
    ///
    /// A proof whose real output is 0 does not verify against this claim.
    #[must_use]
    pub fn claiming_in_grid(&self) -> Self {
        Self {
            input: [U256::one()],
            ..self.clone()
        }
    }

    /// Flat token list in export order.
    pub fn tokens(&self) -> [U256; CALLDATA_TOKENS] {
        [
            self.a[0],
            self.a[1],
            self.b[0][0],
            self.b[0][1],
            self.b[1][0],
            self.b[1][1],
            self.c[0],
            self.c[1],
            self.input[0],
        ]
    }
}

impl fmt::Display for Calldata {
    /// Renders in the exporter's format so [`Calldata::parse`] accepts it.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = |v: &U256| format!("\"{v:#x}\"");
        write!(
            f,
            "[{},{}],[[{},{}],[{},{}]],[{},{}],[{}]",
            h(&self.a[0]),
            h(&self.a[1]),
            h(&self.b[0][0]),
            h(&self.b[0][1]),
            h(&self.b[1][0]),
            h(&self.b[1][1]),
            h(&self.c[0]),
            h(&self.c[1]),
            h(&self.input[0]),
        )
    }
}

/// Decimal or `0x` hex, as the exporter may emit either.
fn parse_integer(token: &str) -> Result<U256, CalldataError> {
    let parsed = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => U256::from_str_radix(hex, 16).ok(),
        None => U256::from_dec_str(token).ok(),
    };
    parsed.ok_or_else(|| CalldataError::InvalidInteger(token.to_string()))
}

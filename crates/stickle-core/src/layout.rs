//! Accelerator layout tags carried by stick/unstick operations.

use std::fmt;
use std::str::FromStr;

use crate::affine::{AffineExpr, AffineMap};
use crate::{Error, Result};

/// Axis order that moves the channel axis of an NCHW index to the last place.
pub const NCHW_TO_NHWC: [usize; 4] = [0, 2, 3, 1];

/// Elements per stick along the innermost axis.
const STICK_ELEMENTS: i64 = 64;

/// Sticks per page along the second innermost axis.
const PAGE_STICKS: i64 = 32;

/// Layout tag identifying the index remapping of a stickified buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StickLayout {
    D1,
    D2,
    D3,
    D4,
    D2S,
    D3S,
    D4S,
    Nhwc,
    /// Logical NCHW data stored as NHWC sticks.
    Nchw,
}

impl StickLayout {
    /// Check if the tag permutes dimensions between the two sides.
    pub fn is_permuting(&self) -> bool {
        matches!(self, StickLayout::Nchw)
    }

    /// Tags whose addressing formula the layout-chain rewrite cannot handle.
    pub fn is_unsupported_for_chains(&self) -> bool {
        matches!(self, StickLayout::D1 | StickLayout::D2S)
    }

    /// Rank of the logical (accelerator-side) index space.
    pub fn rank(&self) -> usize {
        match self {
            StickLayout::D1 => 1,
            StickLayout::D2 | StickLayout::D2S => 2,
            StickLayout::D3 | StickLayout::D3S => 3,
            StickLayout::D4 | StickLayout::D4S | StickLayout::Nhwc | StickLayout::Nchw => 4,
        }
    }

    /// The layout map of a stickified buffer with this tag.
    ///
    /// Results are `(outer, stick, inner, page, row, element)`; the buffer is
    /// indexed with accelerator-side logical indices, which are NHWC for the
    /// `Nchw` tag.
    pub fn stick_map(&self) -> AffineMap {
        let d = AffineExpr::dim;
        let c = AffineExpr::constant;
        let results = match self {
            StickLayout::D1 => vec![
                c(0),
                d(0).floor_div(STICK_ELEMENTS),
                c(0),
                c(0),
                c(PAGE_STICKS - 1),
                d(0).modulo(STICK_ELEMENTS),
            ],
            StickLayout::D2 => vec![
                c(0),
                d(1).floor_div(STICK_ELEMENTS),
                c(0),
                d(0).floor_div(PAGE_STICKS),
                d(0).modulo(PAGE_STICKS),
                d(1).modulo(STICK_ELEMENTS),
            ],
            StickLayout::D2S => vec![
                d(0),
                d(1).floor_div(STICK_ELEMENTS),
                c(0),
                c(0),
                c(PAGE_STICKS - 1),
                d(1).modulo(STICK_ELEMENTS),
            ],
            StickLayout::D3 | StickLayout::D3S => vec![
                d(0),
                d(2).floor_div(STICK_ELEMENTS),
                c(0),
                d(1).floor_div(PAGE_STICKS),
                d(1).modulo(PAGE_STICKS),
                d(2).modulo(STICK_ELEMENTS),
            ],
            StickLayout::D4 | StickLayout::D4S | StickLayout::Nhwc | StickLayout::Nchw => vec![
                d(0),
                d(3).floor_div(STICK_ELEMENTS),
                d(1),
                d(2).floor_div(PAGE_STICKS),
                d(2).modulo(PAGE_STICKS),
                d(3).modulo(STICK_ELEMENTS),
            ],
        };
        AffineMap::new(self.rank(), 0, results)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StickLayout::D1 => "1D",
            StickLayout::D2 => "2D",
            StickLayout::D3 => "3D",
            StickLayout::D4 => "4D",
            StickLayout::D2S => "2DS",
            StickLayout::D3S => "3DS",
            StickLayout::D4S => "4DS",
            StickLayout::Nhwc => "NHWC",
            StickLayout::Nchw => "NCHW",
        }
    }
}

impl fmt::Display for StickLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StickLayout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "1D" => StickLayout::D1,
            "2D" => StickLayout::D2,
            "3D" => StickLayout::D3,
            "4D" => StickLayout::D4,
            "2DS" => StickLayout::D2S,
            "3DS" => StickLayout::D3S,
            "4DS" => StickLayout::D4S,
            "NHWC" => StickLayout::Nhwc,
            "NCHW" => StickLayout::Nchw,
            other => return Err(Error::Attribute(format!("Unknown layout tag '{}'", other))),
        })
    }
}

//! Colour faces used to resolve difftastic's SGR output
//!
//! difftastic only ever emits foreground colours from the 8-colour palette.
//! Each palette slot maps to a face carrying the background that emphasized
//! text of that colour should be drawn on.

use crate::error::ViewError;
use ratatui::style::Color;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Number of entries in each brightness table.
pub const PALETTE_SIZE: usize = 8;

/// Background hint passed to difftastic and used to pick the default palette
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Background {
    #[default]
    Dark,
    Light,
}

impl Background {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dark => "dark",
            Self::Light => "light",
        }
    }
}

impl FromStr for Background {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dark" => Ok(Self::Dark),
            "light" => Ok(Self::Light),
            _ => Err(format!("invalid background '{}': use dark or light", s)),
        }
    }
}

/// A named style with its own foreground and background
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Face {
    pub name: String,
    pub fg: Color,
    pub bg: Color,
}

impl Face {
    pub fn new(name: &str, fg: Color, bg: Color) -> Self {
        Self {
            name: name.to_string(),
            fg,
            bg,
        }
    }

    /// Faces painted in a single colour (the grayscale endpoints of the
    /// palette) are foreground-only and never lend their background.
    pub fn is_synthesis_candidate(&self) -> bool {
        self.fg != self.bg
    }
}

/// Maps a palette face (by name) to its highlighted counterpart
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HighlightPair {
    pub face: String,
    pub highlight: Face,
}

/// Normal and bright palette faces plus the highlight mapping
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ColorFaceTable {
    pub normal: Vec<Face>,
    pub bright: Vec<Face>,
    #[serde(default)]
    pub highlights: Vec<HighlightPair>,
}

impl ColorFaceTable {
    pub fn for_background(background: Background) -> Self {
        match background {
            Background::Dark => Self::dark(),
            Background::Light => Self::light(),
        }
    }

    fn dark() -> Self {
        Self {
            normal: vec![
                Face::new("black", Color::Black, Color::Black),
                Face::new("removed", Color::Red, Color::Rgb(0x55, 0x22, 0x22)),
                Face::new("added", Color::Green, Color::Rgb(0x22, 0x44, 0x22)),
                Face::new("heading", Color::Yellow, Color::Reset),
                Face::new("comment", Color::Blue, Color::Reset),
                Face::new("string", Color::Magenta, Color::Reset),
                Face::new("warning", Color::Cyan, Color::Reset),
                Face::new("white", Color::Gray, Color::Gray),
            ],
            bright: vec![
                Face::new("bright-black", Color::DarkGray, Color::DarkGray),
                Face::new("bright-removed", Color::LightRed, Color::Rgb(0x66, 0x22, 0x22)),
                Face::new("bright-added", Color::LightGreen, Color::Rgb(0x22, 0x55, 0x22)),
                Face::new("bright-heading", Color::LightYellow, Color::Reset),
                Face::new("bright-comment", Color::LightBlue, Color::Reset),
                Face::new("bright-string", Color::LightMagenta, Color::Reset),
                Face::new("bright-warning", Color::LightCyan, Color::Reset),
                Face::new("bright-white", Color::White, Color::White),
            ],
            highlights: vec![
                HighlightPair {
                    face: "removed".to_string(),
                    highlight: Face::new(
                        "removed-highlight",
                        Color::White,
                        Color::Rgb(0x99, 0x22, 0x22),
                    ),
                },
                HighlightPair {
                    face: "added".to_string(),
                    highlight: Face::new(
                        "added-highlight",
                        Color::White,
                        Color::Rgb(0x22, 0x77, 0x22),
                    ),
                },
            ],
        }
    }

    fn light() -> Self {
        Self {
            normal: vec![
                Face::new("black", Color::Black, Color::Black),
                Face::new("removed", Color::Red, Color::Rgb(0xff, 0xdd, 0xdd)),
                Face::new("added", Color::Green, Color::Rgb(0xdd, 0xff, 0xdd)),
                Face::new("heading", Color::Yellow, Color::Reset),
                Face::new("comment", Color::Blue, Color::Reset),
                Face::new("string", Color::Magenta, Color::Reset),
                Face::new("warning", Color::Cyan, Color::Reset),
                Face::new("white", Color::Gray, Color::Gray),
            ],
            bright: vec![
                Face::new("bright-black", Color::DarkGray, Color::DarkGray),
                Face::new("bright-removed", Color::LightRed, Color::Rgb(0xff, 0xcc, 0xcc)),
                Face::new("bright-added", Color::LightGreen, Color::Rgb(0xcc, 0xff, 0xcc)),
                Face::new("bright-heading", Color::LightYellow, Color::Reset),
                Face::new("bright-comment", Color::LightBlue, Color::Reset),
                Face::new("bright-string", Color::LightMagenta, Color::Reset),
                Face::new("bright-warning", Color::LightCyan, Color::Reset),
                Face::new("bright-white", Color::White, Color::White),
            ],
            highlights: vec![
                HighlightPair {
                    face: "removed".to_string(),
                    highlight: Face::new(
                        "removed-highlight",
                        Color::Black,
                        Color::Rgb(0xff, 0xaa, 0xaa),
                    ),
                },
                HighlightPair {
                    face: "added".to_string(),
                    highlight: Face::new(
                        "added-highlight",
                        Color::Black,
                        Color::Rgb(0xaa, 0xee, 0xaa),
                    ),
                },
            ],
        }
    }

    /// Check the table shape and that every highlight key can actually be
    /// reached as a synthesized background.
    pub fn validate(&self) -> Result<(), ViewError> {
        for (label, table) in [("normal", &self.normal), ("bright", &self.bright)] {
            if table.len() != PALETTE_SIZE {
                return Err(ViewError::InvalidPalette(format!(
                    "{} table has {} entries, expected {}",
                    label,
                    table.len(),
                    PALETTE_SIZE
                )));
            }
        }

        for pair in &self.highlights {
            let reachable = self
                .candidates()
                .any(|face| face.name == pair.face);
            if !reachable {
                return Err(ViewError::InvalidPalette(format!(
                    "highlight key {:?} is not a palette face with its own background",
                    pair.face
                )));
            }
        }

        Ok(())
    }

    /// Face for an SGR palette index (0-7)
    pub fn palette_face(&self, index: u8, bright: bool) -> Option<&Face> {
        let table = if bright { &self.bright } else { &self.normal };
        table.get(index as usize)
    }

    /// First candidate face, normal table before bright, whose foreground is `fg`
    pub fn match_foreground(&self, fg: Color) -> Option<&Face> {
        self.candidates().find(|face| face.fg == fg)
    }

    pub fn highlight_for(&self, face_name: &str) -> Option<&Face> {
        self.highlights
            .iter()
            .find(|pair| pair.face == face_name)
            .map(|pair| &pair.highlight)
    }

    fn candidates(&self) -> impl Iterator<Item = &Face> {
        self.normal
            .iter()
            .chain(self.bright.iter())
            .filter(|face| face.is_synthesis_candidate())
    }
}

impl Default for ColorFaceTable {
    fn default() -> Self {
        Self::for_background(Background::default())
    }
}

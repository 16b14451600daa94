//! Color palettes for indexed-color ILDA records.

use crate::types::Color;

/// Number of entries in the default palette.
pub const DEFAULT_PALETTE_LEN: usize = 256;

/// The standard 64-color ILDA palette, repeated to fill the default palette.
const STANDARD_COLORS: [(u8, u8, u8); 64] = [
    (255, 0, 0),
    (255, 16, 0),
    (255, 32, 0),
    (255, 48, 0),
    (255, 64, 0),
    (255, 80, 0),
    (255, 96, 0),
    (255, 112, 0),
    (255, 128, 0),
    (255, 144, 0),
    (255, 160, 0),
    (255, 176, 0),
    (255, 192, 0),
    (255, 208, 0),
    (255, 224, 0),
    (255, 240, 0),
    (255, 255, 0),
    (224, 255, 0),
    (192, 255, 0),
    (160, 255, 0),
    (128, 255, 0),
    (96, 255, 0),
    (64, 255, 0),
    (32, 255, 0),
    (0, 255, 0),
    (0, 255, 36),
    (0, 255, 73),
    (0, 255, 109),
    (0, 255, 146),
    (0, 255, 182),
    (0, 255, 219),
    (0, 255, 255),
    (0, 227, 255),
    (0, 198, 255),
    (0, 170, 255),
    (0, 142, 255),
    (0, 113, 255),
    (0, 85, 255),
    (0, 56, 255),
    (0, 28, 255),
    (0, 0, 255),
    (32, 0, 255),
    (64, 0, 255),
    (96, 0, 255),
    (128, 0, 255),
    (160, 0, 255),
    (192, 0, 255),
    (224, 0, 255),
    (255, 0, 255),
    (255, 32, 255),
    (255, 64, 255),
    (255, 96, 255),
    (255, 128, 255),
    (255, 160, 255),
    (255, 192, 255),
    (255, 224, 255),
    (255, 255, 255),
    (255, 224, 224),
    (255, 192, 192),
    (255, 160, 160),
    (255, 128, 128),
    (255, 96, 96),
    (255, 64, 64),
    (255, 32, 32),
];

/// Color lookup table for indexed-color records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<Color>,
}

impl Palette {
    pub fn new(colors: Vec<Color>) -> Self {
        Palette { colors }
    }

    pub fn colors(&self) -> &[Color] {
        &self.colors
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    /// Look up `index`, falling back to the default palette when this one is
    /// too short.
    pub fn color(&self, index: u8) -> Color {
        self.colors
            .get(index as usize)
            .copied()
            .unwrap_or_else(|| default_color(index))
    }
}

impl Default for Palette {
    fn default() -> Self {
        let colors = (0..DEFAULT_PALETTE_LEN)
            .map(|i| default_color(i as u8))
            .collect();
        Palette { colors }
    }
}

fn default_color(index: u8) -> Color {
    let (r, g, b) = STANDARD_COLORS[index as usize % STANDARD_COLORS.len()];
    Color::new(r, g, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_palette() {
        let palette = Palette::default();
        assert_eq!(palette.len(), DEFAULT_PALETTE_LEN);
        assert_eq!(palette.color(0), Color::RED);
        assert_eq!(palette.color(56), Color::WHITE);
        assert_eq!(palette.color(64), palette.color(0));
        assert_eq!(palette.color(255), palette.color(63));
    }

    #[test]
    fn test_short_palette_falls_back() {
        let palette = Palette::new(vec![Color::new(1, 2, 3)]);
        assert_eq!(palette.color(0), Color::new(1, 2, 3));
        assert_eq!(palette.color(24), Color::new(0, 255, 0));
    }
}

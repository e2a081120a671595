//! RGB color type shared by the LED engines, the HAL and the config.

use serde::{Deserialize, Serialize};

/// 8-bit RGB triple. The zero value is "off".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    #[serde(default)]
    pub red: u8,
    #[serde(default)]
    pub green: u8,
    #[serde(default)]
    pub blue: u8,
}

impl Color {
    pub const OFF: Color = Color {
        red: 0,
        green: 0,
        blue: 0,
    };

    pub fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    pub fn is_off(self) -> bool {
        self == Self::OFF
    }
}

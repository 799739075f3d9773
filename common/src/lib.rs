use serde::{Deserialize, Serialize};

/// One macroblock's motion vector as written by the encoder
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotionVector {
    pub dx: i8,
    pub dy: i8,
    /// Sum of absolute differences. Not used for scoring.
    pub sad: i16,
}

impl MotionVector {
    pub const SIZE: usize = 4;

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            dx: bytes[0] as i8,
            dy: bytes[1] as i8,
            sad: i16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let sad = self.sad.to_le_bytes();
        [self.dx as u8, self.dy as u8, sad[0], sad[1]]
    }

    pub fn magnitude_squared(&self) -> u32 {
        let dx = i32::from(self.dx);
        let dy = i32::from(self.dy);
        (dx * dx + dy * dy) as u32
    }
}

/// Sent over UDP every time motion is detected
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionDetectPacket {
    /// How many vectors were above the magnitude threshold
    pub count: u32,
}

impl MotionDetectPacket {
    pub const SIZE: usize = 4;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        self.count.to_le_bytes()
    }

    /// Returns `None` unless `bytes` is exactly one packet
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; Self::SIZE] = bytes.try_into().ok()?;
        Some(Self {
            count: u32::from_le_bytes(bytes),
        })
    }
}

/// Hardware abstraction for supported boards.
///
/// Each board module defines pin assignments and capabilities
/// selected at compile time via feature flags.

#[cfg(feature = "board-watch")]
mod hw {
    // Waveshare ESP32-S3-Touch-AMOLED-2.06. QMI8658 shares the
    // touch/PMU bus.
    pub const IMU_SDA_PIN: u8 = 18;
    pub const IMU_SCL_PIN: u8 = 8;
    pub const I2C_FREQ_HZ: u32 = 400_000;
    pub const BOOT_BUTTON_PIN: u8 = 0;
    pub const HAS_PSRAM: bool = true;
    pub const BOARD_NAME: &str = "s3_amoled_watch";
}

#[cfg(not(feature = "board-watch"))]
mod hw {
    pub const I2C_FREQ_HZ: u32 = 400_000;
    pub const BOARD_NAME: &str = "unknown";
}

pub use hw::*;

/// QMI8658 accelerometer over I2C.
///
/// Generic over `embedded_hal::i2c::I2c` so the same driver runs under
/// esp-hal (Embassy firmware), esp-idf-hal (std firmware), and a fake bus
/// in tests. Only the accelerometer is enabled; the gyro stays off.
use core::fmt;

use embedded_hal::i2c::I2c;

use crate::detector::MagnitudeSource;

/// 7-bit I2C address (SA0 high).
pub const QMI8658_ADDR: u8 = 0x6B;

/// Register map subset used by this driver.
pub mod reg {
    pub const WHO_AM_I: u8 = 0x00;
    pub const CTRL1: u8 = 0x02;
    pub const CTRL2: u8 = 0x03;
    pub const CTRL7: u8 = 0x08;
    pub const AX_L: u8 = 0x35;
}

/// Expected WHO_AM_I value.
pub const CHIP_ID: u8 = 0x05;

/// CTRL2: ±4 g full scale, 125 Hz output data rate.
const CTRL2_ACCEL_4G_125HZ: u8 = 0x95;
/// CTRL7: accelerometer enable.
const CTRL7_ACCEL_ENABLE: u8 = 0x03;

/// ±4 g full scale over a signed 16-bit range.
const MG_PER_LSB: f64 = 4000.0 / 32768.0;

/// Why a magnitude reading was not produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    /// The I2C transaction failed.
    Bus,
    /// WHO_AM_I returned something other than a QMI8658.
    UnexpectedChipId(u8),
    /// The sensor has not been initialized.
    NotReady,
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::Bus => write!(f, "i2c transaction failed"),
            SensorError::UnexpectedChipId(id) => write!(f, "unexpected chip id 0x{id:02X}"),
            SensorError::NotReady => write!(f, "sensor not initialized"),
        }
    }
}

/// Acceleration on three axes, in milli-g.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelSample {
    pub x_mg: f64,
    pub y_mg: f64,
    pub z_mg: f64,
}

impl AccelSample {
    /// Convert six little-endian data bytes (x, y, z) to milli-g.
    pub fn from_raw(data: &[u8; 6]) -> Self {
        let axis = |lo: u8, hi: u8| i16::from_le_bytes([lo, hi]) as f64 * MG_PER_LSB;
        Self {
            x_mg: axis(data[0], data[1]),
            y_mg: axis(data[2], data[3]),
            z_mg: axis(data[4], data[5]),
        }
    }

    /// Euclidean norm of the three axes.
    pub fn magnitude(&self) -> f64 {
        sqrt_f64(self.x_mg * self.x_mg + self.y_mg * self.y_mg + self.z_mg * self.z_mg)
    }
}

/// Newton square root; `core` has no float `sqrt` without `std`.
fn sqrt_f64(value: f64) -> f64 {
    if !(value > 0.0) {
        return 0.0;
    }
    // Start at or above the root so iterates decrease monotonically.
    let mut x = if value > 1.0 { value } else { 1.0 };
    for _ in 0..64 {
        let next = 0.5 * (x + value / x);
        if next >= x {
            break;
        }
        x = next;
    }
    x
}

/// QMI8658 driver holding its bus.
pub struct Qmi8658<I> {
    i2c: I,
    ready: bool,
}

impl<I: I2c> Qmi8658<I> {
    pub fn new(i2c: I) -> Self {
        Self { i2c, ready: false }
    }

    /// Check the chip id and enable the accelerometer at ±4 g / 125 Hz.
    pub fn init(&mut self) -> Result<u8, SensorError> {
        let mut id = [0u8; 1];
        self.i2c
            .write_read(QMI8658_ADDR, &[reg::WHO_AM_I], &mut id)
            .map_err(|_| SensorError::Bus)?;
        if id[0] != CHIP_ID {
            return Err(SensorError::UnexpectedChipId(id[0]));
        }
        log::info!("QMI8658 WHO_AM_I: 0x{:02X}", id[0]);

        self.write_reg(reg::CTRL1, 0x00)?;
        self.write_reg(reg::CTRL2, CTRL2_ACCEL_4G_125HZ)?;
        self.write_reg(reg::CTRL7, CTRL7_ACCEL_ENABLE)?;
        self.ready = true;

        log::info!("QMI8658 configured: accel ±4g, 125Hz");
        Ok(id[0])
    }

    /// Read one three-axis sample.
    pub fn read_accel(&mut self) -> Result<AccelSample, SensorError> {
        if !self.ready {
            return Err(SensorError::NotReady);
        }
        let mut data = [0u8; 6];
        self.i2c
            .write_read(QMI8658_ADDR, &[reg::AX_L], &mut data)
            .map_err(|_| SensorError::Bus)?;
        Ok(AccelSample::from_raw(&data))
    }

    /// Release the bus.
    pub fn release(self) -> I {
        self.i2c
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), SensorError> {
        self.i2c
            .write(QMI8658_ADDR, &[reg, value])
            .map_err(|_| SensorError::Bus)
    }
}

impl<I: I2c> MagnitudeSource for Qmi8658<I> {
    fn read_magnitude(&mut self) -> Result<f64, SensorError> {
        self.read_accel().map(|s| s.magnitude())
    }
}

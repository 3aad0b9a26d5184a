//! Digital output pins

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::PoisonError;

use crate::{Error, Result};

/// Default sysfs GPIO root
pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// Logic level of a digital line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Line driven low (relay engaged)
    Low,
    /// Line driven high (idle)
    High,
}

impl Level {
    const fn as_sysfs(self) -> &'static str {
        match self {
            Self::Low => "0",
            Self::High => "1",
        }
    }
}

/// A digital output line
pub trait DigitalPin: Send + Sync + std::fmt::Debug {
    /// Drive the line
    ///
    /// # Errors
    ///
    /// Returns [`Error::Gpio`] if the write fails
    fn set(&self, level: Level) -> Result<()>;

    /// Current line level
    ///
    /// # Errors
    ///
    /// Returns [`Error::Gpio`] if the read fails
    fn level(&self) -> Result<Level>;
}

/// GPIO line exported through the Linux sysfs interface
#[derive(Debug)]
pub struct SysfsPin {
    number: u32,
    value_path: PathBuf,
}

impl SysfsPin {
    /// Export and configure a pin under `/sys/class/gpio` as an output
    ///
    /// # Errors
    ///
    /// Returns [`Error::Gpio`] if the pin cannot be exported or configured
    pub fn open(number: u32) -> Result<Self> {
        Self::open_in(Path::new(SYSFS_GPIO_ROOT), number)
    }

    /// Export and configure a pin under a specific sysfs root
    ///
    /// # Errors
    ///
    /// Returns [`Error::Gpio`] if the pin cannot be exported or configured
    pub fn open_in(root: &Path, number: u32) -> Result<Self> {
        let pin_dir = root.join(format!("gpio{number}"));

        if !pin_dir.exists() {
            fs::write(root.join("export"), number.to_string())
                .map_err(|e| Error::Gpio(format!("failed to export pin {number}: {e}")))?;
        }

        fs::write(pin_dir.join("direction"), "out")
            .map_err(|e| Error::Gpio(format!("failed to set pin {number} direction: {e}")))?;

        tracing::debug!(pin = number, "opened sysfs gpio pin");

        Ok(Self {
            number,
            value_path: pin_dir.join("value"),
        })
    }

    /// Pin number
    #[must_use]
    pub const fn number(&self) -> u32 {
        self.number
    }
}

impl DigitalPin for SysfsPin {
    fn set(&self, level: Level) -> Result<()> {
        fs::write(&self.value_path, level.as_sysfs())
            .map_err(|e| Error::Gpio(format!("failed to write pin {}: {e}", self.number)))
    }

    fn level(&self) -> Result<Level> {
        let raw = fs::read_to_string(&self.value_path)
            .map_err(|e| Error::Gpio(format!("failed to read pin {}: {e}", self.number)))?;
        match raw.trim() {
            "0" => Ok(Level::Low),
            "1" => Ok(Level::High),
            other => Err(Error::Gpio(format!(
                "pin {} reported unexpected value '{other}'",
                self.number
            ))),
        }
    }
}

/// Simulated pin that records every write
#[derive(Debug)]
pub struct MemoryPin {
    writes: Mutex<Vec<Level>>,
}

impl Default for MemoryPin {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPin {
    /// Create a simulated pin resting at `High`
    #[must_use]
    pub const fn new() -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Every level written so far, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<Level> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DigitalPin for MemoryPin {
    fn set(&self, level: Level) -> Result<()> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(level);
        Ok(())
    }

    fn level(&self) -> Result<Level> {
        Ok(self
            .writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .copied()
            .unwrap_or(Level::High))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_pin_records_writes() {
        let pin = MemoryPin::new();
        assert_eq!(pin.level().unwrap(), Level::High);

        pin.set(Level::Low).unwrap();
        pin.set(Level::High).unwrap();
        assert_eq!(pin.history(), vec![Level::Low, Level::High]);
        assert_eq!(pin.level().unwrap(), Level::High);
    }

    #[test]
    fn sysfs_pin_writes_value_file() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("gpio17")).unwrap();

        let pin = SysfsPin::open_in(root.path(), 17).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("gpio17/direction")).unwrap(),
            "out"
        );

        pin.set(Level::Low).unwrap();
        assert_eq!(pin.level().unwrap(), Level::Low);
        pin.set(Level::High).unwrap();
        assert_eq!(pin.level().unwrap(), Level::High);
    }

    #[test]
    fn sysfs_pin_exports_missing_pin() {
        let root = tempfile::tempdir().unwrap();

        // No gpio4 directory appears, so configuring direction fails after export
        let err = SysfsPin::open_in(root.path(), 4).unwrap_err();
        assert!(matches!(err, Error::Gpio(_)));
        assert_eq!(fs::read_to_string(root.path().join("export")).unwrap(), "4");
    }
}

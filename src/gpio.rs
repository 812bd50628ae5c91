//! GPIO seam (§6.1). `GpioLines` is the interface boundary the original
//! spec treats as an external collaborator; this crate ships a software
//! simulator used by the worker in test/dev setups and by the whole test
//! suite, plus an optional `rppal`-backed implementation for real boards.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Enable line semantics are active-low (§6.1): `false` enables downstream
/// peripherals, `true` disables them. All fault/emergency paths drive it
/// to `true` (disabled).
pub trait GpioLines: Send + Sync {
    fn read_input(&self, index: usize) -> bool;
    fn write_output(&self, index: usize, value: bool);
    fn set_enable(&self, enabled: bool);
    fn set_indicator(&self, value: bool);

    /// Drives all outputs low, the enable line to its disabled state, and
    /// the indicator to its idle/safe state, in that order (§6.1).
    fn emergency_shutdown(&self) {
        for i in 0..crate::image::NUM_OUTPUTS {
            self.write_output(i, false);
        }
        self.set_enable(false);
        self.set_indicator(true);
    }
}

/// In-memory simulator: every line is an atomic cell. Used by tests and by
/// deployments with no real chip attached.
pub struct SimGpio {
    inputs: [AtomicBool; crate::image::NUM_INPUTS],
    outputs: [AtomicBool; crate::image::NUM_OUTPUTS],
    enable: AtomicBool,
    indicator: AtomicBool,
    lock: Mutex<()>,
}

impl Default for SimGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimGpio {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inputs: std::array::from_fn(|_| AtomicBool::new(false)),
            outputs: std::array::from_fn(|_| AtomicBool::new(false)),
            enable: AtomicBool::new(true),
            indicator: AtomicBool::new(true),
            lock: Mutex::new(()),
        }
    }

    /// Test/dev hook: drive a simulated input line from outside the
    /// evaluator, standing in for a real sensor.
    pub fn set_input(&self, index: usize, value: bool) {
        if index < crate::image::NUM_INPUTS {
            self.inputs[index].store(value, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn output(&self, index: usize) -> bool {
        self.outputs[index].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.enable.load(Ordering::Relaxed)
    }
}

impl GpioLines for SimGpio {
    fn read_input(&self, index: usize) -> bool {
        self.inputs
            .get(index)
            .map_or(false, |b| b.load(Ordering::Relaxed))
    }

    fn write_output(&self, index: usize, value: bool) {
        let _guard = self.lock.lock();
        if let Some(o) = self.outputs.get(index) {
            o.store(value, Ordering::Relaxed);
        }
    }

    fn set_enable(&self, enabled: bool) {
        let _guard = self.lock.lock();
        // stored value is the raw (active-low) line state
        self.enable.store(!enabled, Ordering::Relaxed);
    }

    fn set_indicator(&self, value: bool) {
        let _guard = self.lock.lock();
        self.indicator.store(value, Ordering::Relaxed);
    }
}

#[cfg(feature = "rppal-gpio")]
pub mod rpi {
    //! Real-hardware backend, modeled on the teacher crate's own
    //! `rppal`-based Raspberry Pi sample (`demos/custom_io_rpi_gpio`).

    use super::GpioLines;
    use parking_lot::Mutex;
    use rppal::gpio::{Gpio, InputPin, OutputPin};

    pub struct RpiGpio {
        inputs: Vec<InputPin>,
        outputs: Mutex<Vec<OutputPin>>,
        enable: Mutex<OutputPin>,
        indicator: Mutex<Option<OutputPin>>,
    }

    impl RpiGpio {
        /// # Errors
        ///
        /// Returns `rppal::gpio::Error` if the chip cannot be opened or a
        /// requested line is unavailable.
        pub fn init(
            input_pins: &[u8],
            output_pins: &[u8],
            enable_pin: u8,
            indicator_pin: Option<u8>,
        ) -> Result<Self, rppal::gpio::Error> {
            let gpio = Gpio::new()?;
            let inputs = input_pins
                .iter()
                .map(|&p| gpio.get(p).map(rppal::gpio::Pin::into_input))
                .collect::<Result<Vec<_>, _>>()?;
            let outputs = output_pins
                .iter()
                .map(|&p| gpio.get(p).map(rppal::gpio::Pin::into_output))
                .collect::<Result<Vec<_>, _>>()?;
            let enable = gpio.get(enable_pin)?.into_output();
            let indicator = indicator_pin
                .map(|p| gpio.get(p).map(rppal::gpio::Pin::into_output))
                .transpose()?;
            Ok(Self {
                inputs,
                outputs: Mutex::new(outputs),
                enable: Mutex::new(enable),
                indicator: Mutex::new(indicator),
            })
        }
    }

    impl GpioLines for RpiGpio {
        fn read_input(&self, index: usize) -> bool {
            self.inputs.get(index).map_or(false, InputPin::is_high)
        }

        fn write_output(&self, index: usize, value: bool) {
            if let Some(pin) = self.outputs.lock().get_mut(index) {
                pin.write(value.into());
            }
        }

        fn set_enable(&self, enabled: bool) {
            // active-low: enabled=true means drive the line low (0).
            self.enable.lock().write((!enabled).into());
        }

        fn set_indicator(&self, value: bool) {
            if let Some(pin) = self.indicator.lock().as_mut() {
                pin.write(value.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emergency_shutdown_forces_safe_state() {
        let gpio = SimGpio::new();
        gpio.write_output(0, true);
        gpio.set_enable(true);
        gpio.set_indicator(false);
        gpio.emergency_shutdown();
        for i in 0..crate::image::NUM_OUTPUTS {
            assert!(!gpio.output(i));
        }
        assert!(!gpio.is_enabled());
        assert!(gpio.indicator.load(Ordering::Relaxed));
    }
}

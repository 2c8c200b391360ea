//! Abstract programming bus interface.
use std::{fmt::Display, thread::sleep, time::Duration};

use anyhow::Result;
use clap::{ValueEnum, builder::PossibleValue};
use serde::{Deserialize, Serialize};

use crate::protocol::{Command, Response};

pub use self::serial::SerialBridge;

mod serial;

/// Programming clock divisor, the lower the faster.
///
/// The target only accepts a programming clock below a quarter of its own
/// oscillator, so slow settings are the safe choice for unknown boards.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prescaler {
    Div2,
    Div4,
    Div8,
    Div16,
    Div32,
    Div64,
    #[default]
    Div128,
}

impl Prescaler {
    pub const ALL: [Prescaler; 7] = [
        Prescaler::Div2,
        Prescaler::Div4,
        Prescaler::Div8,
        Prescaler::Div16,
        Prescaler::Div32,
        Prescaler::Div64,
        Prescaler::Div128,
    ];

    /// SPI2X:SPR1:SPR0 encoding of the host SPI peripheral.
    pub const fn bits(self) -> u8 {
        match self {
            Prescaler::Div128 => 0b011,
            Prescaler::Div64 => 0b111,
            Prescaler::Div32 => 0b110,
            Prescaler::Div16 => 0b001,
            Prescaler::Div8 => 0b101,
            Prescaler::Div4 => 0b000,
            Prescaler::Div2 => 0b100,
        }
    }

    pub const fn divisor(self) -> u32 {
        match self {
            Prescaler::Div2 => 2,
            Prescaler::Div4 => 4,
            Prescaler::Div8 => 8,
            Prescaler::Div16 => 16,
            Prescaler::Div32 => 32,
            Prescaler::Div64 => 64,
            Prescaler::Div128 => 128,
        }
    }
}

impl Display for Prescaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "f/{}", self.divisor())
    }
}

impl ValueEnum for Prescaler {
    fn value_variants<'a>() -> &'a [Self] {
        &Self::ALL
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        let value = match self {
            Prescaler::Div2 => PossibleValue::new("div2").aliases(["2"]),
            Prescaler::Div4 => PossibleValue::new("div4").aliases(["4"]),
            Prescaler::Div8 => PossibleValue::new("div8").aliases(["8"]),
            Prescaler::Div16 => PossibleValue::new("div16").aliases(["16"]),
            Prescaler::Div32 => PossibleValue::new("div32").aliases(["32"]),
            Prescaler::Div64 => PossibleValue::new("div64").aliases(["64"]),
            Prescaler::Div128 => PossibleValue::new("div128").aliases(["128"]),
        };
        Some(value)
    }
}

/// Abstraction of the ISP bus: reset line, clock and the four byte exchange.
///
/// Implementations only frame and time the exchange. A target that does not
/// answer as expected still produces a response; interpreting it is up to the
/// caller. `Err` means the bus itself could not be driven.
pub trait IspBus {
    fn transact(&mut self, frame: [u8; 4]) -> Result<[u8; 4]>;

    /// Drives the target's RESET line, `true` holds it in reset.
    fn set_reset(&mut self, asserted: bool) -> Result<()>;

    fn set_prescaler(&mut self, prescaler: Prescaler) -> Result<()>;

    fn delay_ms(&mut self, ms: u32) {
        sleep(Duration::from_millis(ms as u64));
    }

    fn transfer(&mut self, cmd: Command) -> Result<Response> {
        let req = cmd.into_raw();
        log::trace!("=> {}", hex::encode(req));
        let resp = self.transact(req)?;
        log::trace!("<= {}", hex::encode(resp));
        Ok(Response::new(cmd, resp))
    }
}

impl<T: IspBus + ?Sized> IspBus for &mut T {
    fn transact(&mut self, frame: [u8; 4]) -> Result<[u8; 4]> {
        (**self).transact(frame)
    }

    fn set_reset(&mut self, asserted: bool) -> Result<()> {
        (**self).set_reset(asserted)
    }

    fn set_prescaler(&mut self, prescaler: Prescaler) -> Result<()> {
        (**self).set_prescaler(prescaler)
    }

    fn delay_ms(&mut self, ms: u32) {
        (**self).delay_ms(ms)
    }
}

//! Serial bridge to the programming bus.
//!
//! A small bridge MCU owns the SPI pins and the target's RESET line and
//! forwards frames from the serial port:
//!
//! - `'T' c0 c1 c2 c3` clocks four bytes out and answers with the four
//!   bytes clocked in
//! - `'R' level` drives RESET (1 = held in reset), answered by `ACK`
//! - `'P' bits` loads the SPI2X:SPR1:SPR0 clock divisor, answered by `ACK`
use std::{
    io::{Read, Write},
    time::Duration,
};

use anyhow::{Error, Result};
use serialport::SerialPort;

use super::{IspBus, Prescaler};
use crate::constants::{ISP_FRAME_SIZE, bridge};

const SERIAL_TIMEOUT_MS: u64 = 1000;
const BRIDGE_BAUDRATE: u32 = 115200;

pub struct SerialBridge {
    serial_port: Box<dyn SerialPort>,
}

impl SerialBridge {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str) -> Result<Self> {
        log::info!(
            "Opening serial port: \"{}\" @ {} baud",
            port,
            BRIDGE_BAUDRATE
        );
        let port = serialport::new(port, BRIDGE_BAUDRATE)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()?;
        Ok(SerialBridge { serial_port: port })
    }

    pub fn open_nth(nth: usize) -> Result<Self> {
        let ports = serialport::available_ports()?;

        match ports.get(nth) {
            Some(port) => Self::open(&port.port_name),
            None => Err(Error::msg("No serial ports found!")),
        }
    }

    pub fn open_any() -> Result<Self> {
        Self::open_nth(0)
    }

    fn control(&mut self, op: u8, arg: u8) -> Result<()> {
        self.serial_port.write_all(&[op, arg])?;
        self.serial_port.flush()?;
        let mut ack = [0u8; 1];
        self.serial_port.read_exact(&mut ack)?;
        anyhow::ensure!(
            ack[0] == bridge::ACK,
            "bridge rejected {:?} (got 0x{:02x})",
            op as char,
            ack[0]
        );
        Ok(())
    }
}

impl IspBus for SerialBridge {
    fn transact(&mut self, frame: [u8; 4]) -> Result<[u8; 4]> {
        let mut req = [0u8; 1 + ISP_FRAME_SIZE];
        req[0] = bridge::TRANSACT;
        req[1..].copy_from_slice(&frame);
        self.serial_port.write_all(&req)?;
        self.serial_port.flush()?;

        let mut resp = [0u8; ISP_FRAME_SIZE];
        self.serial_port.read_exact(&mut resp)?;
        Ok(resp)
    }

    fn set_reset(&mut self, asserted: bool) -> Result<()> {
        self.control(bridge::RESET, asserted as u8)
    }

    fn set_prescaler(&mut self, prescaler: Prescaler) -> Result<()> {
        log::debug!("SPI clock set to {}", prescaler);
        self.control(bridge::PRESCALER, prescaler.bits())
    }
}

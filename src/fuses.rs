//! Fuse and lock byte programming.
use crate::{
    config::ProgrammingConfig,
    device::{FuseCategory, FuseSet},
    error::{Error, Result},
    flashing::AbortSignal,
    protocol::Command,
    transport::IspBus,
};

/// Only the low six lock bits are implemented, the rest read back as ones.
const LOCK_BITS_MASK: u8 = 0x3f;

pub struct FuseProgrammer {
    verify: bool,
    write_delay_ms: u32,
}

impl FuseProgrammer {
    pub fn new(verify: bool, write_delay_ms: u32) -> Self {
        FuseProgrammer {
            verify,
            write_delay_ms,
        }
    }

    pub fn from_config(config: &ProgrammingConfig) -> Self {
        Self::new(config.verify_fuses, config.fuse_write_delay_ms)
    }

    /// Writes one fuse byte. Never retried: some fuse semantics do not
    /// tolerate being applied twice.
    pub fn write_fuse<B: IspBus>(
        &self,
        bus: &mut B,
        category: FuseCategory,
        value: u8,
    ) -> Result<()> {
        let resp = bus
            .transfer(Command::write_fuse(category, value))
            .map_err(Error::transport)?;
        if !resp.is_ok() {
            return Err(Error::FuseWriteFault {
                category,
                expected: value,
                found: resp.value(),
            });
        }
        bus.delay_ms(self.write_delay_ms);

        if self.verify {
            let found = self.read_fuse(bus, category)?;
            let mask = match category {
                FuseCategory::Lock => LOCK_BITS_MASK,
                _ => 0xff,
            };
            if found & mask != value & mask {
                return Err(Error::FuseWriteFault {
                    category,
                    expected: value,
                    found,
                });
            }
        }
        log::debug!("{} fuse set to 0x{:02x}", category, value);
        Ok(())
    }

    pub fn read_fuse<B: IspBus>(&self, bus: &mut B, category: FuseCategory) -> Result<u8> {
        let resp = bus
            .transfer(Command::read_fuse(category))
            .map_err(Error::transport)?;
        Ok(resp.value())
    }

    pub fn read_fuses<B: IspBus>(&self, bus: &mut B) -> Result<FuseSet> {
        let mut set = FuseSet::new(0, 0, 0, 0);
        for category in FuseCategory::ALL {
            set.set(category, self.read_fuse(bus, category)?);
        }
        Ok(set)
    }

    /// Writes a whole set in `order`, checking `abort` before every category.
    pub fn write_set<B: IspBus>(
        &self,
        bus: &mut B,
        set: &FuseSet,
        order: &[FuseCategory; 4],
        abort: &AbortSignal,
    ) -> Result<()> {
        for &category in order {
            abort.check()?;
            self.write_fuse(bus, category, set.get(category))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Prescaler;

    /// Answers every frame in sync, stores written fuses.
    struct FuseBus {
        fuses: FuseSet,
        frames: Vec<[u8; 4]>,
        nack_writes: bool,
    }

    impl Default for FuseBus {
        fn default() -> Self {
            FuseBus {
                fuses: FuseSet::new(0xff, 0xff, 0xff, 0xff),
                frames: vec![],
                nack_writes: false,
            }
        }
    }

    impl IspBus for FuseBus {
        fn transact(&mut self, frame: [u8; 4]) -> anyhow::Result<[u8; 4]> {
            self.frames.push(frame);
            let category = match [frame[0], frame[1]] {
                [0xac, 0xe0] | [0x58, 0x00] => FuseCategory::Lock,
                [0xac, 0xa0] | [0x50, 0x00] => FuseCategory::Low,
                [0xac, 0xa8] | [0x58, 0x08] => FuseCategory::High,
                [0xac, 0xa4] | [0x50, 0x08] => FuseCategory::Extended,
                _ => anyhow::bail!("unexpected frame {:02x?}", frame),
            };
            if frame[0] == 0xac {
                if self.nack_writes {
                    return Ok([0xff; 4]);
                }
                let stored = if category == FuseCategory::Lock {
                    frame[3] | 0xc0
                } else {
                    frame[3]
                };
                self.fuses.set(category, stored);
                Ok([0, frame[0], frame[1], frame[2]])
            } else {
                Ok([0, frame[0], frame[1], self.fuses.get(category)])
            }
        }

        fn set_reset(&mut self, _asserted: bool) -> anyhow::Result<()> {
            Ok(())
        }

        fn set_prescaler(&mut self, _prescaler: Prescaler) -> anyhow::Result<()> {
            Ok(())
        }

        fn delay_ms(&mut self, _ms: u32) {}
    }

    #[test]
    fn test_write_set_in_order() {
        let mut bus = FuseBus::default();
        let set = FuseSet::new(0x2f, 0xe2, 0xd9, 0xfd);
        let order = crate::config::DEFAULT_FUSE_ORDER;
        FuseProgrammer::new(true, 0)
            .write_set(&mut bus, &set, &order, &AbortSignal::new())
            .unwrap();

        let writes: Vec<u8> = bus
            .frames
            .iter()
            .filter(|f| f[0] == 0xac)
            .map(|f| f[1])
            .collect();
        assert_eq!(writes, vec![0xa4, 0xa8, 0xa0, 0xe0]);
        // lock reads back with the unused bits set, which still verifies
        assert_eq!(bus.fuses.lock, 0xef);
        assert_eq!(bus.fuses.low, 0xe2);
    }

    #[test]
    fn test_nack_is_fatal() {
        let mut bus = FuseBus {
            nack_writes: true,
            ..Default::default()
        };
        let err = FuseProgrammer::new(true, 0)
            .write_fuse(&mut bus, FuseCategory::High, 0xd8)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::FuseWriteFault {
                category: FuseCategory::High,
                ..
            }
        ));
        assert_eq!(bus.frames.len(), 1);
    }

    #[test]
    fn test_abort_before_category() {
        let mut bus = FuseBus::default();
        let abort = AbortSignal::new();
        abort.abort();
        let err = FuseProgrammer::new(false, 0)
            .write_set(
                &mut bus,
                &FuseSet::new(0xff, 0xff, 0xff, 0xff),
                &crate::config::DEFAULT_FUSE_ORDER,
                &abort,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(bus.frames.is_empty());
    }

    #[test]
    fn test_read_fuses() {
        let mut bus = FuseBus::default();
        bus.fuses = FuseSet::new(0x3f, 0x62, 0xd9, 0xff);
        let set = FuseProgrammer::new(false, 0).read_fuses(&mut bus).unwrap();
        assert_eq!(set, FuseSet::new(0x3f, 0x62, 0xd9, 0xff));
    }
}

//! Linux GPIO character device backend (`/dev/gpiochipN`).

use {
    super::{CONSUMER, Direction, GpioBackend, GpioChip, LineLease},
    crate::error::{Error, Result},
    gpiocdev::{
        chip::Chip,
        line::{Offset, Value},
        request::{Config, Request},
    },
    log::debug,
    std::path::PathBuf,
};

/// Resolve `gpiochip1` to `/dev/gpiochip1`; paths are used as given.
pub fn chip_path(chip: &str) -> PathBuf {
    if chip.contains('/') {
        PathBuf::from(chip)
    } else {
        PathBuf::from("/dev").join(chip)
    }
}

fn to_value(level: bool) -> Value {
    if level {
        Value::Active
    } else {
        Value::Inactive
    }
}

/// Backend over the kernel GPIO character device.
#[derive(Debug, Clone, Copy, Default)]
pub struct CdevBackend;

impl GpioBackend for CdevBackend {
    fn open_chip(&self, chip: &str) -> Result<Box<dyn GpioChip>> {
        let path = chip_path(chip);
        let handle = Chip::from_path(&path).map_err(|e| Error::resource(chip, None, e))?;
        debug!("Opened {}", path.display());
        Ok(Box::new(CdevChip {
            name: chip.to_string(),
            path,
            _handle: handle,
        }))
    }
}

struct CdevChip {
    name: String,
    path: PathBuf,
    // Held open for the lifetime of the registry entry
    _handle: Chip,
}

impl GpioChip for CdevChip {
    fn request_line(
        &mut self,
        line: u32,
        direction: Direction,
        initial: bool,
    ) -> Result<Box<dyn LineLease>> {
        let offset: Offset = line;
        let mut cfg = Config::default();
        match direction {
            Direction::Input => {
                cfg.with_line(offset).as_input();
            },
            Direction::Output => {
                cfg.with_line(offset).as_output(to_value(initial));
            },
        }

        let request = Request::from_config(cfg)
            .on_chip(&self.path)
            .with_consumer(CONSUMER)
            .request()
            .map_err(|e| Error::resource(&self.name, Some(line), e))?;

        Ok(Box::new(CdevLease {
            chip: self.name.clone(),
            offset,
            request,
        }))
    }

    fn close(self: Box<Self>) -> Result<()> {
        // Chip fd closes on drop
        Ok(())
    }
}

struct CdevLease {
    chip: String,
    offset: Offset,
    request: Request,
}

impl LineLease for CdevLease {
    fn set(&mut self, value: bool) -> Result<()> {
        self.request
            .set_value(self.offset, to_value(value))
            .map_err(|e| Error::resource(&self.chip, Some(self.offset), e))?;
        Ok(())
    }

    fn get(&mut self) -> Result<bool> {
        let value = self
            .request
            .value(self.offset)
            .map_err(|e| Error::resource(&self.chip, Some(self.offset), e))?;
        Ok(value == Value::Active)
    }

    fn release(self: Box<Self>) -> Result<()> {
        // Dropping the request hands the line back to the kernel
        drop(self.request);
        Ok(())
    }
}

use core::cell::Cell;

use critical_section::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex as AsyncMutex;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration};

use super::{fill_mask, Config, Error, MscRegs, READ_SIZE, WRITE_SIZE};
use crate::internal::drop::OnDrop;
use crate::sleep::{add_pre_sleep, remove_pre_sleep, PreSleep};

/// Limit for both getting hold of the idle eraser and for the erase itself.
const ERASE_LIMIT: Duration = Duration::from_secs(1);
/// Shortest idle window worth starting an erase in.
const MIN_IDLE: Duration = Duration::from_millis(1);
/// Erase commands issued per page before giving up.
const ERASE_TRIES: u32 = 3;

/// Internal flash memory driver.
pub struct Msc<R: MscRegs> {
    regs: R,
    config: Config,
    active: AsyncMutex<CriticalSectionRawMutex, ()>,
    pending: Mutex<Cell<Option<u32>>>,
    erased: Signal<CriticalSectionRawMutex, ()>,
}

impl<R: MscRegs> Msc<R> {
    pub const fn new(regs: R, config: Config) -> Self {
        Self {
            regs,
            config,
            active: AsyncMutex::new(()),
            pending: Mutex::new(Cell::new(None)),
            erased: Signal::new(),
        }
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn page_of(address: u32) -> u32 {
        address & !(R::PAGE_SIZE - 1)
    }

    fn sync(&self) {
        while self.regs.is_busy() {}
    }

    fn unlocked(&self) -> OnDrop<impl FnOnce() + '_> {
        self.regs.unlock();
        OnDrop::new(|| self.regs.lock())
    }

    /// Program one word and verify it, retrying once.
    ///
    /// The first write after a reset may be lost (erratum FLASH_E201).
    fn program(&self, address: u32, word: u32, mask: u32) -> bool {
        for attempt in 0..2 {
            self.regs.load_address(address);
            self.regs.write_once(word);
            self.sync();
            if self.regs.read_word(address) | mask == word {
                return true;
            }
            if attempt == 0 {
                debug!("write at {:#x} did not stick, retrying", address);
            }
        }
        false
    }

    /// Program a single aligned word.
    pub fn write_word(&self, address: u32, value: u32) -> bool {
        if address < self.config.boot_end || address % 4 != 0 {
            return false;
        }
        let _lock = self.unlocked();
        self.program(address, value, 0)
    }

    /// Program `data` at `address`.
    ///
    /// Unaligned leading and trailing bytes are merged into full words padded with `0xFF`, which
    /// leaves the neighbouring flash contents unchanged.
    pub fn write(&self, address: u32, data: &[u8]) -> bool {
        if address < self.config.boot_end {
            return false;
        }
        trace!("writing {} bytes at {:#x}", data.len(), address);

        let _lock = self.unlocked();
        let mut word_addr = address & !3;
        let mut offset = (address & 3) as usize;
        let mut rest = data;

        while !rest.is_empty() {
            let take = (4 - offset).min(rest.len());
            let mut bytes = [0xFF; 4];
            bytes[offset..offset + take].copy_from_slice(&rest[..take]);

            if !self.program(word_addr, u32::from_le_bytes(bytes), fill_mask(offset, take)) {
                error!("failed to write flash at {:#x}", word_addr);
                return false;
            }

            rest = &rest[take..];
            word_addr = word_addr.wrapping_add(4);
            offset = 0;
        }
        true
    }

    /// Erase every page overlapping `address..address + len`.
    ///
    /// Pages that already read back erased are skipped, the rest get up to three erase commands.
    /// Pages below the bootloader end are left alone.
    pub fn erase(&self, address: u32, len: u32) -> bool {
        if len == 0 {
            return true;
        }
        let boot_page = Self::page_of(self.config.boot_end.wrapping_add(R::PAGE_SIZE - 1));
        let mut page = Self::page_of(address).max(boot_page);
        let last = Self::page_of(address.wrapping_add(len - 1));
        let mut tries = 0;

        while page <= last {
            if self.is_erased(page) {
                trace!("page at {:#x} is empty", page);
                tries = 0;
                match page.checked_add(R::PAGE_SIZE) {
                    Some(next) => page = next,
                    None => break,
                }
                continue;
            }

            if tries == ERASE_TRIES {
                error!("failed to erase page at {:#x}", page);
                return false;
            }
            tries += 1;

            debug!("erasing page at {:#x}", page);
            let _lock = self.unlocked();
            self.regs.load_address(page);
            self.regs.erase_page();
            self.sync();
        }
        true
    }

    pub fn is_erased(&self, page: u32) -> bool {
        (0..R::PAGE_SIZE)
            .step_by(4)
            .all(|offset| self.regs.read_word(page.wrapping_add(offset)) == !0)
    }

    /// Erase a page, giving up as soon as any other interrupt wakes the core.
    ///
    /// Meant to be called with interrupts masked right before sleeping: the erase proceeds while
    /// the core would sleep anyway and is aborted when there is other work to do.
    pub fn try_erase_page(&self, page: u32) -> bool {
        if page < self.config.boot_end {
            return false;
        }
        trace!("trying to erase page at {:#x}", page);

        {
            let _lock = self.unlocked();
            self.regs.set_erase_wake(true);
            let _wake = OnDrop::new(|| self.regs.set_erase_wake(false));

            self.regs.load_address(page);
            self.regs.erase_page();
            self.regs.wait_for_interrupt();
            if self.regs.is_busy() {
                self.regs.erase_abort();
                self.sync();
            }
        }

        if !self.is_erased(page) {
            trace!("page at {:#x} not erased", page);
            return false;
        }
        true
    }

    /// Read `buf.len()` bytes at absolute `address`.
    pub fn read(&self, address: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            let at = address.wrapping_add(i as u32);
            *b = self.regs.read_word(at & !3).to_le_bytes()[(at & 3) as usize];
        }
    }

    fn set_pending(&self, page: Option<u32>) {
        critical_section::with(|cs| self.pending.borrow(cs).set(page))
    }

    /// Blocking read.
    ///
    /// NOTE: `offset` is an offset from the flash start, NOT an absolute address.
    pub fn blocking_read(&self, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
        if offset as usize + bytes.len() > self.config.flash_size as usize {
            return Err(Error::Size);
        }
        self.read(self.config.base + offset, bytes);
        Ok(())
    }

    /// Blocking write of whole words.
    ///
    /// NOTE: `offset` is an offset from the flash start, NOT an absolute address.
    pub fn blocking_write(&self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        if offset as usize + bytes.len() > self.config.flash_size as usize {
            return Err(Error::Size);
        }
        if offset as usize % WRITE_SIZE != 0 || bytes.len() % WRITE_SIZE != 0 {
            return Err(Error::Unaligned);
        }
        let address = self.config.base + offset;
        if address < self.config.boot_end {
            return Err(Error::Protected);
        }
        if !self.write(address, bytes) {
            return Err(Error::Prog);
        }
        Ok(())
    }

    /// Blocking erase of whole pages.
    ///
    /// NOTE: `from` and `to` are offsets from the flash start, NOT absolute addresses.
    pub fn blocking_erase(&self, from: u32, to: u32) -> Result<(), Error> {
        if from > to || to > self.config.flash_size {
            return Err(Error::Size);
        }
        if from % R::PAGE_SIZE != 0 || to % R::PAGE_SIZE != 0 {
            return Err(Error::Unaligned);
        }
        let address = self.config.base + from;
        if address < self.config.boot_end {
            return Err(Error::Protected);
        }
        if !self.erase(address, to - from) {
            return Err(Error::Erase);
        }
        Ok(())
    }
}

impl<R: MscRegs + Sync + 'static> Msc<R> {
    /// Erase the page containing `address` during idle time.
    ///
    /// The erase is handed to the pre-sleep hooks and performed once the scheduler has at least
    /// 1 ms to spare. Gives up if another erase holds the driver or the page is not erased within
    /// one second.
    pub async fn erase_page(&'static self, address: u32) -> bool {
        let page = Self::page_of(address);
        if page < self.config.boot_end {
            return false;
        }
        if self.is_erased(page) {
            return true;
        }

        let Ok(_active) = with_timeout(ERASE_LIMIT, self.active.lock()).await else {
            error!("flash eraser busy");
            return false;
        };

        self.erased.reset();
        self.set_pending(Some(page));
        if !add_pre_sleep(self) {
            self.set_pending(None);
            return false;
        }
        let _hook = OnDrop::new(|| {
            remove_pre_sleep(self);
            self.set_pending(None);
        });

        if with_timeout(ERASE_LIMIT, self.erased.wait()).await.is_err() {
            error!("timed out erasing page at {:#x}", page);
            return false;
        }
        true
    }
}

impl<R: MscRegs + Sync> PreSleep for Msc<R> {
    fn pre_sleep(&self, budget: Duration) -> bool {
        if budget < MIN_IDLE {
            return false;
        }
        let Some(page) = critical_section::with(|cs| self.pending.borrow(cs).get()) else {
            return true;
        };
        if !self.try_erase_page(page) {
            return false;
        }
        debug!("erased page at {:#x} while idle", page);
        self.set_pending(None);
        self.erased.signal(());
        true
    }
}

impl<R: MscRegs> embedded_storage::nor_flash::ErrorType for Msc<R> {
    type Error = Error;
}

impl<R: MscRegs> embedded_storage::nor_flash::ReadNorFlash for Msc<R> {
    const READ_SIZE: usize = READ_SIZE;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
        self.blocking_read(offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.config.flash_size as usize
    }
}

impl<R: MscRegs> embedded_storage::nor_flash::NorFlash for Msc<R> {
    const WRITE_SIZE: usize = WRITE_SIZE;
    const ERASE_SIZE: usize = R::PAGE_SIZE as usize;

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        self.blocking_write(offset, bytes)
    }

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Error> {
        self.blocking_erase(from, to)
    }
}

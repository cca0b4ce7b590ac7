use std::sync::Mutex;

use efm32_hal::flash::{Config, Error, Msc, MscRegs};
use efm32_hal::sleep::run_pre_sleep;
use embassy_futures::join::join;
use embassy_futures::{block_on, yield_now};
use embassy_time::Duration;
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

const PAGE: u32 = 1024;
const PAGES: u32 = 8;

/// Tests driving the pre-sleep hooks share one registry.
static IDLE: Mutex<()> = Mutex::new(());

#[derive(Default)]
struct Inner {
    mem: Vec<u32>,
    unlocked: bool,
    addr: u32,
    busy: bool,
    erase_wake: bool,
    /// The next programmed word is lost.
    drop_write: bool,
    /// Erase commands have no effect.
    stuck: bool,
    /// Erases only finish when left alone.
    slow: bool,
    writes: usize,
    erases: usize,
    aborts: usize,
}

struct Sim(Mutex<Inner>);

impl Sim {
    fn new() -> Self {
        Self(Mutex::new(Inner {
            mem: vec![!0; (PAGE * PAGES / 4) as usize],
            ..Default::default()
        }))
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        f(&mut self.0.lock().unwrap())
    }

    /// Put data in flash behind the controller's back.
    fn preload(&self, address: u32, word: u32) {
        self.with(|s| s.mem[(address / 4) as usize] = word);
    }
}

impl MscRegs for Sim {
    const PAGE_SIZE: u32 = PAGE;

    fn unlock(&self) {
        self.with(|s| s.unlocked = true);
    }

    fn lock(&self) {
        self.with(|s| s.unlocked = false);
    }

    fn load_address(&self, address: u32) {
        self.with(|s| s.addr = address);
    }

    fn write_once(&self, word: u32) {
        self.with(|s| {
            assert!(s.unlocked, "write while locked");
            if std::mem::take(&mut s.drop_write) {
                return;
            }
            s.writes += 1;
            s.mem[(s.addr / 4) as usize] &= word;
        })
    }

    fn erase_page(&self) {
        self.with(|s| {
            assert!(s.unlocked, "erase while locked");
            assert_eq!(s.addr % PAGE, 0);
            s.erases += 1;
            if s.slow {
                s.busy = true;
            } else if !s.stuck {
                let start = (s.addr / 4) as usize;
                s.mem[start..start + (PAGE / 4) as usize].fill(!0);
            }
        })
    }

    fn erase_abort(&self) {
        self.with(|s| {
            s.aborts += 1;
            s.busy = false;
        })
    }

    fn is_busy(&self) -> bool {
        self.with(|s| s.busy)
    }

    fn set_erase_wake(&self, enabled: bool) {
        self.with(|s| s.erase_wake = enabled);
    }

    fn wait_for_interrupt(&self) {
        self.with(|s| assert!(s.erase_wake, "sleeping without the erase wake source"));
    }

    fn read_word(&self, address: u32) -> u32 {
        self.with(|s| s.mem[(address / 4) as usize])
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.boot_end = PAGE;
    config.flash_size = PAGE * PAGES;
    config
}

fn flash() -> Msc<Sim> {
    Msc::new(Sim::new(), config())
}

fn leaked() -> &'static Msc<Sim> {
    Box::leak(Box::new(flash()))
}

#[test]
fn unaligned_writes_keep_neighbours() {
    let msc = flash();
    assert!(msc.write(0x401, &[1, 2, 3, 4, 5, 6]));

    let mut buf = [0; 8];
    msc.read(0x400, &mut buf);
    assert_eq!(buf, [0xFF, 1, 2, 3, 4, 5, 6, 0xFF]);
    assert_eq!(msc.regs().with(|s| s.writes), 2);
    assert!(!msc.regs().with(|s| s.unlocked));
}

#[test]
fn lost_write_is_retried() {
    let msc = flash();
    msc.regs().with(|s| s.drop_write = true);
    assert!(msc.write_word(0x800, 0x1234_5678));
    assert_eq!(msc.regs().read_word(0x800), 0x1234_5678);
}

#[test]
fn write_fails_when_bits_cannot_be_set() {
    let msc = flash();
    msc.regs().preload(0x800, 0);
    assert!(!msc.write_word(0x800, 0xFFFF_0000));
    assert!(!msc.write_word(0x802, 0));
}

#[test]
fn bootloader_is_protected() {
    let msc = flash();
    msc.regs().preload(0x10, 0);
    msc.regs().preload(0x400, 0);

    assert!(!msc.write_word(0x10, 0));
    assert!(!msc.write(0x3FF, &[0]));
    assert!(msc.erase(0, 2 * PAGE));

    assert_eq!(msc.regs().read_word(0x10), 0);
    assert_eq!(msc.regs().read_word(0x400), !0);
    assert_eq!(msc.regs().with(|s| s.erases), 1);
}

#[test]
fn erase_skips_blank_pages() {
    let msc = flash();
    msc.regs().preload(0x800, 0);
    msc.regs().preload(0xC00, 0);

    assert!(msc.erase(0x400, 2 * PAGE));
    assert_eq!(msc.regs().with(|s| s.erases), 1);
    assert!(msc.is_erased(0x800));

    // the page holding the last byte is included
    assert!(msc.erase(0xBFF, 2));
    assert!(msc.is_erased(0xC00));
    assert_eq!(msc.regs().with(|s| s.erases), 2);
}

#[test]
fn stubborn_page_fails() {
    let msc = flash();
    msc.regs().preload(0x800, 0);
    msc.regs().with(|s| s.stuck = true);

    assert!(!msc.erase(0x800, PAGE));
    assert_eq!(msc.regs().with(|s| s.erases), 3);
}

#[test]
fn nor_flash_checks_ranges() {
    let mut msc = flash();
    let size = PAGE * PAGES;

    assert_eq!(NorFlash::write(&mut msc, 2, &[0; 4]), Err(Error::Unaligned));
    assert_eq!(NorFlash::write(&mut msc, 0x400, &[0; 3]), Err(Error::Unaligned));
    assert_eq!(NorFlash::write(&mut msc, size - 4, &[0; 8]), Err(Error::Size));
    assert_eq!(NorFlash::write(&mut msc, 0, &[0; 4]), Err(Error::Protected));
    assert_eq!(NorFlash::erase(&mut msc, 0, PAGE), Err(Error::Protected));
    assert_eq!(NorFlash::erase(&mut msc, PAGE, PAGE + 10), Err(Error::Unaligned));
    assert_eq!(NorFlash::erase(&mut msc, 2 * PAGE, PAGE), Err(Error::Size));
    assert_eq!(NorFlash::erase(&mut msc, PAGE, size + PAGE), Err(Error::Size));

    assert_eq!(NorFlash::write(&mut msc, 0x800, &[9, 8, 7, 6]), Ok(()));
    let mut buf = [0; 4];
    assert_eq!(ReadNorFlash::read(&mut msc, 0x800, &mut buf), Ok(()));
    assert_eq!(buf, [9, 8, 7, 6]);
    assert_eq!(ReadNorFlash::read(&mut msc, size - 2, &mut buf), Err(Error::Size));

    assert_eq!(NorFlash::erase(&mut msc, 2 * PAGE, 3 * PAGE), Ok(()));
    assert!(msc.is_erased(0x800));
    assert_eq!(msc.capacity(), size as usize);

    msc.regs().preload(0x800, 0);
    msc.regs().with(|s| s.stuck = true);
    assert_eq!(NorFlash::erase(&mut msc, 2 * PAGE, 3 * PAGE), Err(Error::Erase));
}

#[test]
fn idle_erase_waits_for_a_window() {
    let _serial = IDLE.lock().unwrap_or_else(|e| e.into_inner());
    let msc = leaked();
    msc.regs().preload(0x810, 0);

    let (erased, ()) = block_on(join(msc.erase_page(0x810), async {
        yield_now().await;
        assert!(!run_pre_sleep(Duration::from_micros(500)));
        assert!(!msc.is_erased(0x800));
        assert!(run_pre_sleep(Duration::from_millis(5)));
    }));

    assert!(erased);
    assert!(msc.is_erased(0x800));
    assert!(!msc.regs().with(|s| s.erase_wake));
}

#[test]
fn interrupted_idle_erase_is_retried() {
    let _serial = IDLE.lock().unwrap_or_else(|e| e.into_inner());
    let msc = leaked();
    msc.regs().preload(0xC00, 0);
    msc.regs().with(|s| s.slow = true);

    let (erased, ()) = block_on(join(msc.erase_page(0xC00), async {
        yield_now().await;
        assert!(!run_pre_sleep(Duration::from_millis(5)));
        assert_eq!(msc.regs().with(|s| s.aborts), 1);

        msc.regs().with(|s| s.slow = false);
        assert!(run_pre_sleep(Duration::from_millis(5)));
    }));

    assert!(erased);
    assert_eq!(msc.regs().with(|s| s.erases), 2);
}

#[test]
fn idle_erase_shortcuts() {
    let _serial = IDLE.lock().unwrap_or_else(|e| e.into_inner());
    let msc = leaked();
    msc.regs().preload(0x100, 0);

    assert!(block_on(msc.erase_page(0x800)));
    assert!(!block_on(msc.erase_page(0x100)));
    assert_eq!(msc.regs().with(|s| s.erases), 0);
}

#[test]
fn idle_erase_gives_up() {
    let _serial = IDLE.lock().unwrap_or_else(|e| e.into_inner());
    let msc = leaked();
    msc.regs().preload(0x1000, 0);
    msc.regs().with(|s| s.stuck = true);

    let (erased, ()) = block_on(join(msc.erase_page(0x1000), async {
        yield_now().await;
        assert!(!run_pre_sleep(Duration::from_millis(5)));
    }));
    assert!(!erased);

    // the hook is gone with the request
    let erases = msc.regs().with(|s| s.erases);
    run_pre_sleep(Duration::from_millis(5));
    assert_eq!(msc.regs().with(|s| s.erases), erases);
}

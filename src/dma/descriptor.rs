use core::ops::BitOr;
use core::ptr;

/// Largest number of units one descriptor can move.
pub const MAX_TRANSFER: usize = 2048;

/// `CTRL` word fields.
mod ctrl {
    pub const STRUCTTYPE_MASK: u32 = 0x3;
    pub const STRUCTTYPE_TRANSFER: u32 = 0;
    pub const STRUCTTYPE_SYNCHRONIZE: u32 = 1;
    pub const STRUCTTYPE_WRITE: u32 = 2;
    pub const STRUCTREQ: u32 = 1 << 3;
    pub const XFERCNT_SHIFT: u32 = 4;
    pub const XFERCNT_MASK: u32 = 0x7FF << XFERCNT_SHIFT;
    pub const DONEIFSEN: u32 = 1 << 20;
    pub const REQMODE_ALL: u32 = 1 << 21;
    pub const SRCINC_SHIFT: u32 = 24;
    pub const SIZE_SHIFT: u32 = 26;
    pub const DSTINC_SHIFT: u32 = 28;
    pub const INC_ONE: u32 = 0;
    pub const INC_NONE: u32 = 3;
}

/// Transfer flags of a descriptor `CTRL` word.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Flags(pub u32);

impl Flags {
    /// Start the transfer as soon as the descriptor is loaded.
    pub const START: Self = Self(ctrl::STRUCTREQ);
    /// Raise the channel done flag when the descriptor completes.
    pub const SET_DONE: Self = Self(ctrl::DONEIFSEN);
    /// One request moves the whole descriptor.
    pub const REQUEST_ALL: Self = Self(ctrl::REQMODE_ALL);

    pub const UNIT_BYTE: Self = Self(0 << ctrl::SIZE_SHIFT);
    pub const UNIT_HALF_WORD: Self = Self(1 << ctrl::SIZE_SHIFT);
    pub const UNIT_WORD: Self = Self(2 << ctrl::SIZE_SHIFT);

    pub const M2M: Self = Self(ctrl::INC_ONE << ctrl::SRCINC_SHIFT | ctrl::INC_ONE << ctrl::DSTINC_SHIFT);
    pub const M2P: Self = Self(ctrl::INC_ONE << ctrl::SRCINC_SHIFT | ctrl::INC_NONE << ctrl::DSTINC_SHIFT);
    pub const P2M: Self = Self(ctrl::INC_NONE << ctrl::SRCINC_SHIFT | ctrl::INC_ONE << ctrl::DSTINC_SHIFT);
    pub const P2P: Self = Self(ctrl::INC_NONE << ctrl::SRCINC_SHIFT | ctrl::INC_NONE << ctrl::DSTINC_SHIFT);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Value of a descriptor `LINK` word.
///
/// Bit 1 requests loading the next descriptor, bit 0 selects an address relative to the descriptor
/// holding the link.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Link(pub usize);

impl Link {
    pub const NONE: Self = Self(0);
    /// Repeat the same descriptor.
    pub const SELF: Self = Self(3);
    /// The descriptor following this one in memory.
    pub const NEXT: Self = Self(0x13);
    /// The descriptor preceding this one in memory.
    pub const PREVIOUS: Self = Self((-16isize as usize) | 3);

    const LOAD: usize = 1 << 1;
    const RELATIVE: usize = 1 << 0;

    /// Absolute link to `desc`. A null pointer ends the chain.
    pub fn to(desc: *const Descriptor) -> Self {
        if desc.is_null() {
            Self::NONE
        } else {
            Self(desc as usize | Self::LOAD)
        }
    }

    /// Resolve the link of a descriptor located at `relative_to`.
    pub fn decode(self, relative_to: usize) -> *mut Descriptor {
        if self.0 & Self::LOAD == 0 {
            return ptr::null_mut();
        }
        let base = if self.0 & Self::RELATIVE != 0 { relative_to } else { 0 };
        base.wrapping_add(self.0 & !3) as *mut Descriptor
    }

    pub const fn is_none(self) -> bool {
        self.0 & Self::LOAD == 0
    }
}

/// LDMA transfer descriptor, laid out like the four channel registers starting at `CTRL`.
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct Descriptor {
    pub ctrl: u32,
    pub src: usize,
    pub dst: usize,
    pub link: usize,
}

#[cfg(target_pointer_width = "32")]
const _: () = core::assert!(core::mem::size_of::<Descriptor>() == 16);

impl Descriptor {
    pub const EMPTY: Self = Self {
        ctrl: 0,
        src: 0,
        dst: 0,
        link: 0,
    };

    /// Move `count` units from `src` to `dst`.
    pub fn transfer(src: usize, dst: usize, count: usize, flags: Flags, link: Link) -> Self {
        debug_assert!(count > 0 && count <= MAX_TRANSFER);
        let count = (count.clamp(1, MAX_TRANSFER) - 1) as u32;
        Self {
            ctrl: ctrl::STRUCTTYPE_TRANSFER | flags.bits() | (count << ctrl::XFERCNT_SHIFT),
            src,
            dst,
            link: link.0,
        }
    }

    /// Write `data` to `dst`.
    pub fn immediate_write(data: u32, dst: usize, link: Link) -> Self {
        Self {
            ctrl: ctrl::STRUCTTYPE_WRITE,
            src: data as usize,
            dst,
            link: link.0,
        }
    }

    pub const fn is_transfer(&self) -> bool {
        self.ctrl & ctrl::STRUCTTYPE_MASK == ctrl::STRUCTTYPE_TRANSFER
    }

    pub const fn is_immediate(&self) -> bool {
        self.ctrl & ctrl::STRUCTTYPE_MASK == ctrl::STRUCTTYPE_WRITE
    }

    pub const fn is_sync(&self) -> bool {
        self.ctrl & ctrl::STRUCTTYPE_MASK == ctrl::STRUCTTYPE_SYNCHRONIZE
    }

    /// Units left to transfer.
    pub const fn count(&self) -> usize {
        (((self.ctrl & ctrl::XFERCNT_MASK) >> ctrl::XFERCNT_SHIFT) + 1) as usize
    }

    pub fn set_count(&mut self, count: usize) {
        debug_assert!(count > 0 && count <= MAX_TRANSFER);
        let count = (count.clamp(1, MAX_TRANSFER) - 1) as u32;
        self.ctrl = (self.ctrl & !ctrl::XFERCNT_MASK) | (count << ctrl::XFERCNT_SHIFT);
    }

    pub const fn flags(&self) -> Flags {
        Flags(self.ctrl & !(ctrl::STRUCTTYPE_MASK | ctrl::XFERCNT_MASK))
    }

    pub fn set_link(&mut self, link: Link) {
        self.link = link.0;
    }

    /// Descriptor this one continues with, if any.
    ///
    /// `at` is the address this descriptor is stored at, used for relative links.
    pub fn linked(&self, at: usize) -> *mut Descriptor {
        Link(self.link).decode(at)
    }

    /// Volatile read of a descriptor the controller may be referencing.
    ///
    /// # Safety
    ///
    /// `desc` must point at a valid descriptor.
    pub unsafe fn read(desc: *const Descriptor) -> Self {
        ptr::read_volatile(desc)
    }

    /// Volatile write of a descriptor.
    ///
    /// # Safety
    ///
    /// `desc` must point at a valid descriptor that no enabled channel is fetching.
    pub unsafe fn write(desc: *mut Descriptor, value: Self) {
        ptr::write_volatile(desc, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_encodes_count_minus_one() {
        let d = Descriptor::transfer(0x4000_0000, 0x2000_0000, 256, Flags::P2M | Flags::UNIT_BYTE, Link::NONE);
        assert_eq!(d.count(), 256);
        assert_eq!((d.ctrl >> 4) & 0x7FF, 255);
        assert!(d.is_transfer());
        assert!(d.flags().contains(Flags::P2M));
        assert!(!d.flags().contains(Flags::SET_DONE));

        let d = Descriptor::transfer(0, 0, MAX_TRANSFER, Flags::M2P, Link::NONE);
        assert_eq!(d.count(), MAX_TRANSFER);
    }

    #[test]
    fn set_count_keeps_flags() {
        let mut d = Descriptor::transfer(1, 2, 10, Flags::M2P | Flags::SET_DONE, Link::NONE);
        d.set_count(3);
        assert_eq!(d.count(), 3);
        assert!(d.flags().contains(Flags::M2P | Flags::SET_DONE));
    }

    #[test]
    fn link_encoding() {
        assert!(Link::NONE.decode(0x1000).is_null());
        assert!(Link::to(ptr::null()).is_none());

        let abs = Link::to(0x2000_0100 as *const Descriptor);
        assert_eq!(abs.0, 0x2000_0102);
        assert_eq!(abs.decode(0x1234_0000) as usize, 0x2000_0100);

        assert_eq!(Link::SELF.decode(0x2000_0040) as usize, 0x2000_0040);
        assert_eq!(Link::NEXT.decode(0x2000_0040) as usize, 0x2000_0050);
        assert_eq!(Link::PREVIOUS.decode(0x2000_0040) as usize, 0x2000_0030);
    }

    #[test]
    fn immediate_write_is_not_a_transfer() {
        let d = Descriptor::immediate_write(0xAA, 0x4000_0010, Link::NEXT);
        assert!(d.is_immediate());
        assert!(!d.is_transfer() && !d.is_sync());
        assert_eq!(d.linked(0x100) as usize, 0x110);
    }
}

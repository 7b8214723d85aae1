use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign};

/// Sideband information travelling with a transaction.
///
/// The whole state packs into one 64-bit word so that two sidebands combine
/// with plain bitwise operators: flags occupy the low six bits, the issuing
/// CPU identifier and the privilege level take 20 bits each above them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Sbi(u64);

pub const SBI_NONE: Sbi = Sbi(0);
pub const SBI_DEBUG: Sbi = Sbi(1 << 0);
pub const SBI_NODMI: Sbi = Sbi(1 << 1);
pub const SBI_SYNC: Sbi = Sbi(1 << 2);
pub const SBI_INSN: Sbi = Sbi(1 << 3);
pub const SBI_EXCL: Sbi = Sbi(1 << 4);
pub const SBI_LOCK: Sbi = Sbi(1 << 5);

const CPUID_SHIFT: u32 = 6;
const LEVEL_SHIFT: u32 = 26;
const FIELD_MASK: u64 = 0xfffff;

const _: () = assert!(size_of::<Sbi>() == size_of::<u64>());

impl Sbi {
    /// Sideband carrying only an issuing CPU identifier.
    ///
    /// # Panics
    /// If `cpu` does not fit the 20-bit field.
    pub fn cpuid(cpu: u32) -> Self {
        assert!(u64::from(cpu) <= FIELD_MASK, "cpuid {cpu} out of range");

        Self(u64::from(cpu) << CPUID_SHIFT)
    }

    /// Sideband carrying only a privilege level.
    ///
    /// # Panics
    /// If `lvl` does not fit the 20-bit field.
    pub fn level(lvl: u32) -> Self {
        assert!(u64::from(lvl) <= FIELD_MASK, "level {lvl} out of range");

        Self(u64::from(lvl) << LEVEL_SHIFT)
    }

    pub fn is_debug(self) -> bool {
        self.0 & SBI_DEBUG.0 != 0
    }

    pub fn is_nodmi(self) -> bool {
        self.0 & SBI_NODMI.0 != 0
    }

    pub fn is_sync(self) -> bool {
        self.0 & SBI_SYNC.0 != 0
    }

    pub fn is_insn(self) -> bool {
        self.0 & SBI_INSN.0 != 0
    }

    pub fn is_excl(self) -> bool {
        self.0 & SBI_EXCL.0 != 0
    }

    pub fn is_lock(self) -> bool {
        self.0 & SBI_LOCK.0 != 0
    }

    pub fn get_cpuid(self) -> u32 {
        ((self.0 >> CPUID_SHIFT) & FIELD_MASK) as u32
    }

    pub fn get_level(self) -> u32 {
        ((self.0 >> LEVEL_SHIFT) & FIELD_MASK) as u32
    }

    pub fn code(self) -> u64 {
        self.0
    }

    /// Copy of `self` with the exclusive flag cleared. Targets use this to
    /// deny exclusivity in their reply.
    pub fn without_excl(self) -> Self {
        Self(self.0 & !SBI_EXCL.0)
    }
}

impl BitOr for Sbi {
    type Output = Sbi;

    fn bitor(self, rhs: Sbi) -> Sbi {
        Sbi(self.0 | rhs.0)
    }
}

impl BitOrAssign for Sbi {
    fn bitor_assign(&mut self, rhs: Sbi) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Sbi {
    type Output = Sbi;

    fn bitand(self, rhs: Sbi) -> Sbi {
        Sbi(self.0 & rhs.0)
    }
}

impl BitAndAssign for Sbi {
    fn bitand_assign(&mut self, rhs: Sbi) {
        self.0 &= rhs.0;
    }
}

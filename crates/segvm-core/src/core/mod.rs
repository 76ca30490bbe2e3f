mod hex;
pub(crate) mod macros;

pub use self::hex::Hex;

macros::impl_ops!(Linear, u32, "32-bit linear address inside the guest's flat space");

impl Linear {
    /// Returns the linear address as a host pointer value.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Rounds the address down to a multiple of `alignment`, which must be
    /// a power of two.
    pub fn align_down(self, alignment: u32) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self(self.0 & !(alignment - 1))
    }
}

impl TryFrom<u64> for Linear {
    type Error = crate::SegvmError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        u32::try_from(value)
            .map(Self)
            .map_err(|_| crate::SegvmError::AddressOutOfRange(value))
    }
}

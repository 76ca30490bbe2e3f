macro_rules! impl_base {
    ($name:ident, $type:ty) => {
        impl ::std::fmt::Debug for Hex<$type> {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                impl_base_fmt(f, self.0)
            }
        }

        impl ::std::fmt::Display for Hex<$type> {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                impl_base_fmt(f, self.0)
            }
        }
    };
}

fn impl_base_fmt<T>(f: &mut ::std::fmt::Formatter, data: T) -> ::std::fmt::Result
where
    T: Copy + ::std::fmt::LowerHex,
{
    match size_of::<T>() {
        1 => write!(f, "0x{:02x}", data),
        2 => write!(f, "0x{:04x}", data),
        4 => write!(f, "0x{:08x}", data),
        8 => write!(f, "0x{:016x}", data),
        _ => write!(f, "0x{:x}", data),
    }
}

impl ::std::fmt::Debug for Hex<&[u8]> {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        ::std::fmt::Display::fmt(self, f)
    }
}

impl ::std::fmt::Display for Hex<&[u8]> {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, " ")?;
            }

            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

/// A hexadecimal representation of a value.
///
/// Used for register values, selectors and instruction bytes in log
/// output.
///
/// # Examples
///
/// ```
/// # use segvm_core::Hex;
/// assert_eq!(format!("{}", Hex(0x40u16)), "0x0040");
/// assert_eq!(format!("{}", Hex(&[0x0fu8, 0xa1][..])), "0f a1");
/// ```
pub struct Hex<T>(pub T);

impl_base!(Hex, u8);
impl_base!(Hex, u16);
impl_base!(Hex, u32);
impl_base!(Hex, u64);
impl_base!(Hex, usize);

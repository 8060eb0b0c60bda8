//! Numeric aliases and checked conversions shared by the partitioner.
//!
//! `float` and `int` follow the enabled cargo features so the whole crate can
//! be switched between 32 and 64 bit arithmetic in one place.
mod impls;
use duplicate::duplicate_item;

mod inner {
    cfg_if::cfg_if! {
        if #[cfg(feature = "integer_as_i64")] {
            pub type int = i64;
            pub type uint = u64;
        } else {
            pub type int = i32;
            pub type uint = u32;
        }
    }
    #[cfg(feature = "float_as_f64")]
    pub type float = f64;
    #[cfg(not(feature = "float_as_f64"))]
    pub type float = f32;
}
pub use inner::{float, int, uint};

#[duplicate_item(
    trait_name method target;
    [CCi32] [i32] [i32];
    [CCu64] [u64] [u64];
    [CCusize] [usize] [usize];
    [CCf64] [f64] [f64];
    [CCint] [int] [int];
    [CCuint] [uint] [uint];
    [CCfloat] [float] [float];
)]
pub trait trait_name {
    fn method(&self) -> target;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_small_values() {
        assert_eq!(7usize.float(), 7.0);
        assert_eq!(3.9f64.usize(), 3);
        assert_eq!((-2.5f64).int(), -2);
        assert_eq!(12u64.i32(), 12);
        assert_eq!(true.usize(), 1);
    }

    #[test]
    #[should_panic]
    fn test_negative_to_unsigned_panics() {
        let _ = (-1i64).usize();
    }
}

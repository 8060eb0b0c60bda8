use crate::*;
#[cfg(not(feature = "float_as_f64"))]
use easy_cast::ConvApprox;
use easy_cast::{Conv, ConvFloat};

// integer sources convert exactly and panic when out of range
#[duplicate_item(
    source trait_name method target;
    [i32] [CCi32] [i32] [i32];
    [i64] [CCi32] [i32] [i32];
    [u32] [CCi32] [i32] [i32];
    [u64] [CCi32] [i32] [i32];
    [usize] [CCi32] [i32] [i32];
    [i32] [CCu64] [u64] [u64];
    [i64] [CCu64] [u64] [u64];
    [u32] [CCu64] [u64] [u64];
    [u64] [CCu64] [u64] [u64];
    [usize] [CCu64] [u64] [u64];
    [i32] [CCusize] [usize] [usize];
    [i64] [CCusize] [usize] [usize];
    [u32] [CCusize] [usize] [usize];
    [u64] [CCusize] [usize] [usize];
    [usize] [CCusize] [usize] [usize];
    [i32] [CCint] [int] [int];
    [i64] [CCint] [int] [int];
    [u32] [CCint] [int] [int];
    [u64] [CCint] [int] [int];
    [usize] [CCint] [int] [int];
    [i32] [CCuint] [uint] [uint];
    [i64] [CCuint] [uint] [uint];
    [u32] [CCuint] [uint] [uint];
    [u64] [CCuint] [uint] [uint];
    [usize] [CCuint] [uint] [uint];
)]
impl trait_name for source {
    fn method(&self) -> target {
        target::conv(*self)
    }
}

// float sources truncate toward zero
#[duplicate_item(
    source trait_name method target;
    [f32] [CCi32] [i32] [i32];
    [f64] [CCi32] [i32] [i32];
    [f32] [CCu64] [u64] [u64];
    [f64] [CCu64] [u64] [u64];
    [f32] [CCusize] [usize] [usize];
    [f64] [CCusize] [usize] [usize];
    [f32] [CCint] [int] [int];
    [f64] [CCint] [int] [int];
    [f32] [CCuint] [uint] [uint];
    [f64] [CCuint] [uint] [uint];
)]
impl trait_name for source {
    fn method(&self) -> target {
        target::conv_trunc(*self)
    }
}

#[duplicate_item(
    source;
    [i32];
    [i64];
    [u32];
    [u64];
    [usize];
    [f32];
    [f64];
)]
impl CCf64 for source {
    fn f64(&self) -> f64 {
        f64::conv(*self)
    }
}

#[duplicate_item(
    source;
    [i32];
    [i64];
    [u32];
    [u64];
    [usize];
    [f32];
    [f64];
)]
impl CCfloat for source {
    fn float(&self) -> float {
        #[cfg(feature = "float_as_f64")]
        return self.f64();
        #[cfg(not(feature = "float_as_f64"))]
        return f32::conv_approx(self.f64());
    }
}

impl CCusize for bool {
    fn usize(&self) -> usize {
        usize::from(*self)
    }
}

impl CCfloat for bool {
    fn float(&self) -> float {
        if *self {
            1.0
        } else {
            0.0
        }
    }
}

pub use bon::{bon, builder, Builder};
pub use colored::Colorize;
pub use derive_new::new;
pub use foldhash::{HashMapExt, HashSetExt};
pub use itertools::Itertools;
pub use log::{debug, info, warn};
pub use logging_timer::{finish, time, timer};
pub use num_cast::*;
pub use ordered_float::OrderedFloat;
pub use prettytable::{format, row, Table};
pub use rand::rngs::StdRng;
pub use rand::seq::SliceRandom;
pub use rand::{Rng, SeedableRng};
pub use rayon::prelude::*;
pub use std::cmp::Reverse;
pub use std::fmt;
pub use std::fs;
pub use std::fs::File;
pub use std::io;
pub use std::io::{BufRead, BufReader, BufWriter, Write};
pub use std::path::{Path, PathBuf};
pub use std::process::Command;
pub use std::sync::{Arc, Mutex};

pub type IndexMap<K, V> = indexmap::IndexMap<K, V, foldhash::fast::RandomState>;
pub type Set<T> = foldhash::HashSet<T>;
pub type Dict<K, V> = foldhash::HashMap<K, V>;
pub type Vector2 = (float, float);

/// Parallel map over independent work items followed by a sequential fold.
///
/// Each item is mapped on the rayon pool into its own buffer; the partial
/// results are then reduced in input order on the calling thread, so the
/// outcome does not depend on scheduling.
pub fn map_reduce<I, T, M, A, R>(items: Vec<I>, map: M, init: A, reduce: R) -> A
where
    I: Send,
    T: Send,
    M: Fn(I) -> T + Sync + Send,
    R: FnMut(A, T) -> A,
{
    let partials: Vec<T> = items.into_par_iter().map(map).collect();
    partials.into_iter().fold(init, reduce)
}

pub fn norm1(p1: Vector2, p2: Vector2) -> float {
    (p1.0 - p2.0).abs() + (p1.1 - p2.1).abs()
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Mean and population standard deviation.
pub fn mean_std(values: &[float]) -> (float, float) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len().float();
    let mean = values.iter().sum::<float>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<float>() / n;
    (mean, var.sqrt())
}

pub fn format_with_separator<T: CCfloat>(n: T, sep: char) -> String {
    let n = n.float();
    let integer_part = n.trunc() as i64;
    let digits = integer_part.abs().to_string();
    let mut formatted = String::new();
    let len = digits.len();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            formatted.push(sep);
        }
        formatted.push(c);
    }
    let sign = if integer_part < 0 { "-" } else { "" };
    if len <= 3 {
        format!("{}{:.3}", sign, n.abs())
    } else {
        format!("{}{}", sign, formatted)
    }
}

pub fn display_progress_step(step: int, total: int, message: &str) {
    info!(
        target:"internal",
        "{} {}",
        format!("[{}/{}]", step, total).bold().dimmed(),
        message.bold().bright_yellow()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_reduce_is_order_stable() {
        let total = map_reduce((0..100).collect_vec(), |x: i64| x * 2, Vec::new(), |mut acc, x| {
            acc.push(x);
            acc
        });
        assert_eq!(total.len(), 100);
        assert!(total.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(total.iter().sum::<i64>(), 9900);
    }

    #[test]
    fn test_mean_std() {
        let (m, s) = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((m - 5.0).abs() < 1e-12);
        assert!((s - 2.0).abs() < 1e-12);
        assert_eq!(mean_std(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_format_with_separator() {
        assert_eq!(format_with_separator(1234567.0, '_'), "1_234_567");
        assert_eq!(format_with_separator(12.5, ','), "12.500");
    }
}

use std::time::{Duration, Instant};

macro_rules! time_info {
    ($name:expr, $f:block) => {{
        let start = std::time::Instant::now();
        let result = $f;
        let end = std::time::Instant::now();
        log::info!("{} (took {:?})", $name, end.duration_since(start));
        result
    }};
}

macro_rules! time_debug {
    ($name:expr, $f:block) => {{
        let start = std::time::Instant::now();
        let result = $f;
        let end = std::time::Instant::now();
        log::debug!("{} (took {:?})", $name, end.duration_since(start));
        result
    }};
}

#[allow(unused_macros)]
macro_rules! time {
    ($f:block) => {{
        let start = std::time::Instant::now();
        let result = $f;
        let end = std::time::Instant::now();

        (result, end.duration_since(start))
    }};
}

/// Soft wall-clock cutoff, polled cooperatively by long running loops.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    start: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    pub fn new(budget: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.budget.map(|b| b.saturating_sub(self.elapsed()))
    }

    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(r) if r.is_zero())
    }
}

/// Mask selecting the lowest `width` bits of a 64 bit word.
pub fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1_u64 << width) - 1
    }
}

pub fn sign_extend(value: u64, width: u32) -> u64 {
    if width == 0 || width >= 64 {
        return value;
    }
    let shift = 64 - width;
    (((value << shift) as i64) >> shift) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_and_extensions() {
        assert_eq!(mask(8), 0xff);
        assert_eq!(mask(64), u64::MAX);
        assert_eq!(sign_extend(0x80, 8), 0xffff_ffff_ffff_ff80);
        assert_eq!(sign_extend(0x7f, 8), 0x7f);
    }

    #[test]
    fn deadline_without_budget_never_expires() {
        let deadline = Deadline::unlimited();
        assert!(!deadline.expired());
        assert!(deadline.remaining().is_none());

        let zero = Deadline::new(Some(Duration::ZERO));
        assert!(zero.expired());
    }
}

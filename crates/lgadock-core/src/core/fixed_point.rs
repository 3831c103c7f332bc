use rayon::prelude::*;
use serde::Deserialize;

/// Fraction bits of a fixed-point term (`TERMSCALE = 2^10`).
pub const TERM_BITS: u32 = 10;
/// Integer headroom reserved above a single term before it saturates.
pub const TERM_HEADROOM_BITS: u32 = 8;
/// Integer headroom reserved above an accumulated reduction before it saturates.
pub const REDUCE_HEADROOM_BITS: u32 = 4;
/// Cap for absurd energies so placeholder energies always rank last.
pub const MAX_ENERGY: f32 = f32::MAX / 100.0;
/// Cap for absurd gradient components.
pub const MAX_FORCE: f32 = f32::MAX / 100.0;

/// The two saturation regimes of the codec.
///
/// A reduction sums many terms and therefore gets more integer headroom than a
/// single term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Regime {
    Term,
    Reduction,
}

/// Process-wide numeric constants shared by the codec and the population store.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct NumericConfig {
    pub term_bits: u32,
    pub term_headroom_bits: u32,
    pub reduce_headroom_bits: u32,
    pub max_energy: f32,
    pub max_force: f32,
}

impl Default for NumericConfig {
    fn default() -> Self {
        Self {
            term_bits: TERM_BITS,
            term_headroom_bits: TERM_HEADROOM_BITS,
            reduce_headroom_bits: REDUCE_HEADROOM_BITS,
            max_energy: MAX_ENERGY,
            max_force: MAX_FORCE,
        }
    }
}

impl NumericConfig {
    pub fn scale(&self) -> f32 {
        (1u64 << self.term_bits.min(30)) as f32
    }

    /// Largest magnitude representable in the given regime.
    pub fn bound(&self, regime: Regime) -> f32 {
        let headroom = match regime {
            Regime::Term => self.term_headroom_bits,
            Regime::Reduction => self.reduce_headroom_bits,
        };
        let used = self.term_bits.checked_add(headroom).unwrap_or(u32::MAX);
        (1u64 << 31u32.saturating_sub(used)) as f32
    }

    /// Checks that the bit layout leaves a positive bound in both regimes.
    pub fn is_representable(&self) -> bool {
        let widest = self.term_headroom_bits.max(self.reduce_headroom_bits);
        let narrowest = self.term_headroom_bits.min(self.reduce_headroom_bits);
        self.term_bits.checked_add(widest).is_some_and(|used| used < 31)
            && narrowest > 0
            && self.max_energy.is_finite()
            && self.max_energy > 0.0
            && self.max_force.is_finite()
            && self.max_force > 0.0
    }
}

/// A physical scalar stored as a scaled integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FixedPointTerm(i32);

impl FixedPointTerm {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn raw(self) -> i32 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedPointCodec {
    scale: f32,
    inv_scale: f32,
    term_bound: f32,
    reduce_bound: f32,
    term_limit: i32,
    reduce_limit: i32,
    max_energy: f32,
    max_force: f32,
}

impl FixedPointCodec {
    pub fn new(config: &NumericConfig) -> Self {
        let scale = config.scale();
        let term_bound = config.bound(Regime::Term);
        let reduce_bound = config.bound(Regime::Reduction);
        Self {
            scale,
            inv_scale: 1.0 / scale,
            term_bound,
            reduce_bound,
            term_limit: (term_bound * scale) as i32,
            reduce_limit: (reduce_bound * scale) as i32,
            max_energy: config.max_energy,
            max_force: config.max_force,
        }
    }

    #[inline]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    #[inline]
    pub fn bound(&self, regime: Regime) -> f32 {
        match regime {
            Regime::Term => self.term_bound,
            Regime::Reduction => self.reduce_bound,
        }
    }

    #[inline]
    fn limit(&self, regime: Regime) -> i32 {
        match regime {
            Regime::Term => self.term_limit,
            Regime::Reduction => self.reduce_limit,
        }
    }

    /// Encodes a single term, saturating at the term bound.
    #[inline]
    pub fn encode(&self, value: f32) -> FixedPointTerm {
        self.encode_in(value, Regime::Term)
    }

    /// Clamps to the regime's bound, scales, and truncates toward zero.
    ///
    /// NaN saturates to the positive bound so it ranks as the worst value.
    #[inline]
    pub fn encode_in(&self, value: f32, regime: Regime) -> FixedPointTerm {
        let bound = self.bound(regime);
        let clamped = if value.is_nan() {
            bound
        } else {
            value.clamp(-bound, bound)
        };
        FixedPointTerm((clamped * self.scale) as i32)
    }

    #[inline]
    pub fn decode(&self, term: FixedPointTerm) -> f32 {
        term.0 as f32 * self.inv_scale
    }

    /// Adds one term to a running reduction, saturating at the reduction bound.
    #[inline]
    pub fn accumulate(&self, acc: FixedPointTerm, term: FixedPointTerm) -> FixedPointTerm {
        let limit = self.reduce_limit;
        FixedPointTerm(acc.0.saturating_add(term.0).clamp(-limit, limit))
    }

    /// Sums terms exactly and saturates the total once at the reduction bound.
    pub fn reduce<I>(&self, terms: I) -> FixedPointTerm
    where
        I: IntoIterator<Item = FixedPointTerm>,
    {
        let total: i64 = terms.into_iter().map(|t| i64::from(t.0)).sum();
        self.saturate(total, Regime::Reduction)
    }

    /// Lane-parallel form of [`FixedPointCodec::reduce`]; the result does not depend
    /// on how the work is split.
    pub fn reduce_par(&self, terms: &[FixedPointTerm]) -> FixedPointTerm {
        let total: i64 = terms.par_iter().map(|t| i64::from(t.0)).sum();
        self.saturate(total, Regime::Reduction)
    }

    /// Whether `term` sits on the regime's limit in either direction.
    #[inline]
    pub fn is_saturated(&self, term: FixedPointTerm, regime: Regime) -> bool {
        term.0.unsigned_abs() >= self.limit(regime).unsigned_abs()
    }

    /// Energy of a reduced total. A total clamped at the reduction limit, positive
    /// or negative, carries no usable value and becomes the worst sentinel.
    #[inline]
    pub fn energy_of_reduction(&self, total: FixedPointTerm) -> f32 {
        if self.is_saturated(total, Regime::Reduction) {
            self.worst_energy()
        } else {
            self.cap_energy(self.decode(total))
        }
    }

    #[inline]
    fn saturate(&self, raw: i64, regime: Regime) -> FixedPointTerm {
        let limit = i64::from(self.limit(regime));
        FixedPointTerm(raw.clamp(-limit, limit) as i32)
    }

    /// Maps implausible energies (NaN, infinite or beyond the cap in either
    /// direction) to the positive cap, the worst possible fitness.
    #[inline]
    pub fn cap_energy(&self, energy: f32) -> f32 {
        if energy.is_nan() || energy.abs() > self.max_energy {
            self.max_energy
        } else {
            energy
        }
    }

    /// Clamps a gradient component to the force cap; NaN contributes no force.
    #[inline]
    pub fn cap_force(&self, force: f32) -> f32 {
        if force.is_nan() {
            0.0
        } else {
            force.clamp(-self.max_force, self.max_force)
        }
    }

    #[inline]
    pub fn worst_energy(&self) -> f32 {
        self.max_energy
    }
}

impl Default for FixedPointCodec {
    fn default() -> Self {
        Self::new(&NumericConfig::default())
    }
}

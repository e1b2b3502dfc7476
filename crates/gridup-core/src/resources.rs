//! Resource quantities and resource lists.
//!
//! Quantities use Kubernetes notation on the wire ("100m", "5Gi", "2") and
//! are stored as integer milli-units internally, so cpu arithmetic stays
//! exact down to a millicore and memory down to a milli-byte.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const MILLI: i64 = 1000;

const KIB: i64 = 1024;
const MIB: i64 = 1024 * KIB;
const GIB: i64 = 1024 * MIB;
const TIB: i64 = 1024 * GIB;

/// Error returned when a quantity string cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid quantity {0:?}")]
pub struct ParseQuantityError(pub String);

/// A resource quantity in milli-units.
///
/// One whole unit (a core, a byte, a pod) is 1000 milli-units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Quantity(i64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    pub fn from_milli(milli: i64) -> Self {
        Quantity(milli)
    }

    pub fn from_units(units: i64) -> Self {
        Quantity(units * MILLI)
    }

    pub fn from_gib(gib: i64) -> Self {
        Quantity(gib * GIB * MILLI)
    }

    /// Raw milli-unit value.
    pub fn milli(self) -> i64 {
        self.0
    }

    /// Whole units as a float (cores, bytes, pods).
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / MILLI as f64
    }

    /// Whole units, rounded up. Matches how pod counts are compared.
    pub fn units(self) -> i64 {
        (self.0 + MILLI - 1) / MILLI
    }

    /// Value in GiB as a float; meaningful for memory quantities.
    pub fn gib(self) -> f64 {
        self.as_f64() / GIB as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, rhs: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(rhs.0).max(0))
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 + rhs.0)
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        self.0 += rhs.0;
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 - rhs.0)
    }
}

impl FromStr for Quantity {
    type Err = ParseQuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseQuantityError(s.to_string()));
        }
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);
        let value: f64 = number
            .parse()
            .map_err(|_| ParseQuantityError(s.to_string()))?;
        let multiplier: i64 = match suffix {
            "" => MILLI,
            "m" => 1,
            "k" => 1_000 * MILLI,
            "M" => 1_000_000 * MILLI,
            "G" => 1_000_000_000 * MILLI,
            "T" => 1_000_000_000_000 * MILLI,
            "Ki" => KIB * MILLI,
            "Mi" => MIB * MILLI,
            "Gi" => GIB * MILLI,
            "Ti" => TIB * MILLI,
            _ => return Err(ParseQuantityError(s.to_string())),
        };
        Ok(Quantity((value * multiplier as f64).round() as i64))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let milli = self.0;
        if milli % (GIB * MILLI) == 0 && milli != 0 {
            write!(f, "{}Gi", milli / (GIB * MILLI))
        } else if milli % (MIB * MILLI) == 0 && milli != 0 {
            write!(f, "{}Mi", milli / (MIB * MILLI))
        } else if milli % MILLI == 0 {
            write!(f, "{}", milli / MILLI)
        } else {
            write!(f, "{milli}m")
        }
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct QuantityVisitor;

        impl Visitor<'_> for QuantityVisitor {
            type Value = Quantity;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a quantity string like \"100m\" or \"5Gi\", or a number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Quantity, E> {
                v.parse().map_err(de::Error::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quantity, E> {
                Ok(Quantity::from_units(v as i64))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quantity, E> {
                Ok(Quantity::from_units(v))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Quantity, E> {
                Ok(Quantity::from_milli((v * MILLI as f64).round() as i64))
            }
        }

        deserializer.deserialize_any(QuantityVisitor)
    }
}

/// Cpu, memory, and pod-count quantities for a node or a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceList {
    pub cpu: Quantity,
    pub memory: Quantity,
    pub pods: Quantity,
}

impl ResourceList {
    pub const ZERO: ResourceList = ResourceList {
        cpu: Quantity::ZERO,
        memory: Quantity::ZERO,
        pods: Quantity::ZERO,
    };

    pub fn new(cpu: Quantity, memory: Quantity) -> Self {
        ResourceList {
            cpu,
            memory,
            pods: Quantity::ZERO,
        }
    }

    /// True when every component of `self` fits within `other`.
    pub fn fits_within(&self, other: &ResourceList) -> bool {
        self.cpu <= other.cpu && self.memory <= other.memory && self.pods <= other.pods
    }

    pub fn saturating_sub(&self, other: &ResourceList) -> ResourceList {
        ResourceList {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory: self.memory.saturating_sub(other.memory),
            pods: self.pods.saturating_sub(other.pods),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu.is_zero() && self.memory.is_zero() && self.pods.is_zero()
    }
}

impl AddAssign for ResourceList {
    fn add_assign(&mut self, rhs: ResourceList) {
        self.cpu += rhs.cpu;
        self.memory += rhs.memory;
        self.pods += rhs.pods;
    }
}

impl Add for ResourceList {
    type Output = ResourceList;

    fn add(mut self, rhs: ResourceList) -> ResourceList {
        self += rhs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_millicores() {
        let q: Quantity = "100m".parse().unwrap();
        assert_eq!(q.milli(), 100);
    }

    #[test]
    fn parses_whole_units() {
        let q: Quantity = "2".parse().unwrap();
        assert_eq!(q.milli(), 2000);
        assert_eq!(q.units(), 2);
    }

    #[test]
    fn parses_binary_suffixes() {
        let q: Quantity = "5Gi".parse().unwrap();
        assert_eq!(q.milli(), 5 * GIB * MILLI);
        assert!((q.gib() - 5.0).abs() < f64::EPSILON);

        let q: Quantity = "512Mi".parse().unwrap();
        assert_eq!(q.milli(), 512 * MIB * MILLI);
    }

    #[test]
    fn parses_decimal_suffixes() {
        let q: Quantity = "1k".parse().unwrap();
        assert_eq!(q.units(), 1000);
    }

    #[test]
    fn parses_fractional_values() {
        let q: Quantity = "1.5Gi".parse().unwrap();
        assert_eq!(q.milli(), 3 * GIB * MILLI / 2);

        let q: Quantity = "0.5".parse().unwrap();
        assert_eq!(q.milli(), 500);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Quantity>().is_err());
        assert!("5Xi".parse::<Quantity>().is_err());
        assert!("abc".parse::<Quantity>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for raw in ["100m", "2", "5Gi", "512Mi"] {
            let q: Quantity = raw.parse().unwrap();
            let again: Quantity = q.to_string().parse().unwrap();
            assert_eq!(q, again, "round-trip of {raw}");
        }
    }

    #[test]
    fn saturating_sub_floors_at_zero() {
        let small = Quantity::from_units(1);
        let big = Quantity::from_units(5);
        assert_eq!(small.saturating_sub(big), Quantity::ZERO);
    }

    #[test]
    fn deserializes_from_string_and_number() {
        #[derive(Deserialize)]
        struct Holder {
            q: Quantity,
        }
        let from_str: Holder = serde_json::from_str(r#"{"q": "250m"}"#).unwrap();
        assert_eq!(from_str.q.milli(), 250);

        let from_num: Holder = serde_json::from_str(r#"{"q": 110}"#).unwrap();
        assert_eq!(from_num.q.units(), 110);
    }

    #[test]
    fn resource_list_fit_check() {
        let requests = ResourceList {
            cpu: "100m".parse().unwrap(),
            memory: "1Gi".parse().unwrap(),
            pods: Quantity::from_units(1),
        };
        let allocatable = ResourceList {
            cpu: "2".parse().unwrap(),
            memory: "8Gi".parse().unwrap(),
            pods: Quantity::from_units(110),
        };
        assert!(requests.fits_within(&allocatable));
        assert!(!allocatable.fits_within(&requests));
    }

    #[test]
    fn resource_list_accumulates() {
        let mut total = ResourceList::ZERO;
        total += ResourceList::new("100m".parse().unwrap(), "1Gi".parse().unwrap());
        total += ResourceList::new("400m".parse().unwrap(), "3Gi".parse().unwrap());
        assert_eq!(total.cpu.milli(), 500);
        assert_eq!(total.memory, "4Gi".parse().unwrap());
    }
}

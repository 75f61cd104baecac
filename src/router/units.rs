//! Unit strings carried in the `unit` tag or meta key.
//!
//! A unit is an optional SI prefix, a known measure and an optional `/s`
//! rate suffix. Parsing accepts common spellings (`bytes`, `kilobyte/s`,
//! `MHz`) and [`Unit::short`] renders the canonical form (`B`, `kB/s`,
//! `MHz`).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Base,
    Nano,
    Micro,
    Milli,
    Kilo,
    Mega,
    Giga,
    Tera,
    Peta,
    Exa,
}

impl Prefix {
    const ALL: [Prefix; 10] = [
        Prefix::Base,
        Prefix::Nano,
        Prefix::Micro,
        Prefix::Milli,
        Prefix::Kilo,
        Prefix::Mega,
        Prefix::Giga,
        Prefix::Tera,
        Prefix::Peta,
        Prefix::Exa,
    ];

    fn exponent(self) -> i32 {
        match self {
            Prefix::Base => 0,
            Prefix::Nano => -9,
            Prefix::Micro => -6,
            Prefix::Milli => -3,
            Prefix::Kilo => 3,
            Prefix::Mega => 6,
            Prefix::Giga => 9,
            Prefix::Tera => 12,
            Prefix::Peta => 15,
            Prefix::Exa => 18,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Prefix::Base => "",
            Prefix::Nano => "n",
            Prefix::Micro => "u",
            Prefix::Milli => "m",
            Prefix::Kilo => "k",
            Prefix::Mega => "M",
            Prefix::Giga => "G",
            Prefix::Tera => "T",
            Prefix::Peta => "P",
            Prefix::Exa => "E",
        }
    }

    fn long_name(self) -> &'static str {
        match self {
            Prefix::Base => "",
            Prefix::Nano => "nano",
            Prefix::Micro => "micro",
            Prefix::Milli => "milli",
            Prefix::Kilo => "kilo",
            Prefix::Mega => "mega",
            Prefix::Giga => "giga",
            Prefix::Tera => "tera",
            Prefix::Peta => "peta",
            Prefix::Exa => "exa",
        }
    }

    /// Accepts a symbol (`G`, `K`, `u`, `µ`) or a long name (`giga`).
    /// The empty string is the base prefix.
    pub fn parse(s: &str) -> Option<Prefix> {
        match s {
            "K" => return Some(Prefix::Kilo),
            "µ" => return Some(Prefix::Micro),
            _ => {}
        }
        let lower = s.to_ascii_lowercase();
        Prefix::ALL
            .into_iter()
            .find(|p| p.symbol() == s || (*p != Prefix::Base && p.long_name() == lower))
    }
}

/// Canonical measure and its accepted spellings.
const MEASURES: &[(&str, &[&str])] = &[
    ("B", &["B", "byte", "bytes"]),
    ("Flops", &["Flops", "flops", "FLOPS", "flop", "Flop"]),
    ("s", &["s", "sec", "secs", "second", "seconds"]),
    ("Hz", &["Hz", "hz", "hertz", "Hertz"]),
    ("W", &["W", "watt", "watts", "Watt"]),
    ("J", &["J", "joule", "joules", "Joule"]),
    ("C", &["C", "degC", "celsius", "Celsius"]),
    ("%", &["%", "percent"]),
    ("pkts", &["pkts", "packets", "pkt"]),
    ("req", &["req", "requests"]),
];

fn measure(s: &str) -> Option<&'static str> {
    MEASURES
        .iter()
        .find(|(_, aliases)| aliases.contains(&s))
        .map(|(canonical, _)| *canonical)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unit {
    prefix: Prefix,
    measure: &'static str,
    per_second: bool,
}

impl Unit {
    pub fn parse(s: &str) -> Option<Unit> {
        let s = s.trim();
        let (body, per_second) = match s.strip_suffix("/s").or_else(|| s.strip_suffix("ps")) {
            Some(body) if !body.is_empty() => (body, true),
            _ => (s, false),
        };

        // A bare measure wins, so `s` is seconds and not a prefix.
        if let Some(m) = measure(body) {
            return Some(Unit {
                prefix: Prefix::Base,
                measure: m,
                per_second,
            });
        }

        Prefix::ALL
            .into_iter()
            .filter(|p| *p != Prefix::Base)
            .flat_map(|p| {
                let long = p.long_name();
                let symbols: &[&str] = match p {
                    Prefix::Kilo => &["k", "K"],
                    Prefix::Micro => &["u", "µ"],
                    _ => &[p.symbol()],
                };
                symbols
                    .iter()
                    .copied()
                    .chain(std::iter::once(long))
                    .filter_map(move |sym| body.strip_prefix(sym).map(|rest| (p, rest)))
                    .collect::<Vec<_>>()
            })
            .find_map(|(prefix, rest)| {
                measure(rest).map(|m| Unit {
                    prefix,
                    measure: m,
                    per_second,
                })
            })
    }

    pub fn short(&self) -> String {
        self.to_string()
    }

    /// Factor that converts a value in `self` into the same measure with
    /// `prefix`, and the resulting unit.
    pub fn rescale(&self, prefix: Prefix) -> (f64, Unit) {
        let factor = 10f64.powi(self.prefix.exponent() - prefix.exponent());
        (
            factor,
            Unit {
                prefix,
                ..*self
            },
        )
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix.symbol(), self.measure)?;
        if self.per_second {
            f.write_str("/s")?;
        }
        Ok(())
    }
}

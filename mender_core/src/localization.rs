use crate::coverage::CoverageRecord;
use crate::scenario::SpectrumMetric;
use crate::source::Location;
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

/// Execution spectrum of one location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Spectrum {
    /// Failing tests that executed the location.
    pub ef: u32,
    /// Passing tests that executed the location.
    pub ep: u32,
    /// Failing tests that did not.
    pub nf: u32,
    /// Passing tests that did not.
    pub np: u32,
}

impl Spectrum {
    pub fn score(&self, metric: SpectrumMetric) -> f64 {
        let ef = f64::from(self.ef);
        let ep = f64::from(self.ep);
        let nf = f64::from(self.nf);
        let np = f64::from(self.np);

        match metric {
            // `weighted` ranks with Ochiai.
            SpectrumMetric::Weighted | SpectrumMetric::Ochiai => {
                let denom = ((ef + nf) * (ef + ep)).sqrt();
                if ef > 0.0 && denom > 0.0 { ef / denom } else { 0.0 }
            }
            SpectrumMetric::Tarantula => {
                let fail_ratio = if ef + nf > 0.0 { ef / (ef + nf) } else { 0.0 };
                let pass_ratio = if ep + np > 0.0 { ep / (ep + np) } else { 0.0 };
                if fail_ratio + pass_ratio > 0.0 {
                    fail_ratio / (fail_ratio + pass_ratio)
                } else {
                    0.0
                }
            }
            SpectrumMetric::Jaccard => {
                let denom = ef + nf + ep;
                if denom > 0.0 { ef / denom } else { 0.0 }
            }
            SpectrumMetric::Genprog => match (self.ef > 0, self.ep > 0) {
                (true, false) => 1.0,
                (true, true) => 0.1,
                _ => 0.0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedLocation {
    pub location: Location,
    pub score: f64,
    pub spectrum: Spectrum,
}

/// Locations ordered by descending suspiciousness, ties broken by (file, line).
///
/// The ranking is a plain value: it can be iterated any number of times and
/// shared read-only between workers.
#[derive(Debug, Clone, Default)]
pub struct Localization {
    ranked: Vec<RankedLocation>,
}

impl Localization {
    /// Ranks every line in `coverage`, keeping only `restrict_to` files when
    /// that list is non-empty.
    pub fn from_coverage(
        coverage: &CoverageRecord,
        metric: SpectrumMetric,
        restrict_to: &[String],
    ) -> Self {
        let keep: HashSet<&str> = restrict_to.iter().map(String::as_str).collect();
        let failing = coverage.failing().count() as u32;
        let passing = coverage.passing().count() as u32;

        let mut ranked: Vec<RankedLocation> = coverage
            .locations()
            .into_iter()
            .filter(|loc| keep.is_empty() || keep.contains(loc.file.as_str()))
            .map(|location| {
                let ef = coverage.failing().filter(|t| t.executed(&location)).count() as u32;
                let ep = coverage.passing().filter(|t| t.executed(&location)).count() as u32;
                let spectrum = Spectrum {
                    ef,
                    ep,
                    nf: failing - ef,
                    np: passing - ep,
                };
                RankedLocation {
                    score: spectrum.score(metric),
                    location,
                    spectrum,
                }
            })
            .collect();

        ranked.sort_by(|a, b| match b.score.total_cmp(&a.score) {
            Ordering::Equal => a.location.cmp(&b.location),
            other => other,
        });
        if let Some(top) = ranked.first() {
            debug!(
                "localized {} locations, most suspicious {} ({:.3})",
                ranked.len(),
                top.location,
                top.score
            );
        }
        Self { ranked }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RankedLocation> {
        self.ranked.iter()
    }

    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RankedLocation> {
        self.ranked.get(index)
    }
}

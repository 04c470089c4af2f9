//! Per-request parameter generators.
//!
//! For each parameter flagged per-request, the configuration layer builds
//! one generator: a constant, a random variate cast into the parameter
//! type, or a probability map (sorted cumulative buckets; value arrays
//! inside a bucket are consumed round-robin). Workload-level parameters
//! stay fixed after configuration.

use crate::config::{GeneratedParamSpec, PmapEntrySpec, WlParamSpec};
use crate::errors::{Error, Result};
use crate::randgen::{self, RandomGen, RandomVariate};
use crate::wlparam::{ParamDescr, ParamType, ParamValue};

/// Probability closure tolerance: |sum(p) - 1.0| must stay below this.
pub const PMAP_EPSILON: f64 = 1e-6;

struct PmapBucket {
    /// Upper cumulative bound of this bucket.
    cumulative: f64,
    values: Vec<ParamValue>,
    next: usize,
}

enum PgenKind {
    Fixed(ParamValue),
    Raw {
        gen: Box<dyn RandomGen>,
    },
    Variate {
        gen: Box<dyn RandomGen>,
        var: Box<dyn RandomVariate>,
    },
    Pmap {
        gen: Box<dyn RandomGen>,
        buckets: Vec<PmapBucket>,
    },
}

struct Pgen {
    descr_idx: usize,
    kind: PgenKind,
}

/// All per-request generators of one workload, ordered like the
/// per-request descriptors.
pub struct PgenSet {
    pgens: Vec<Pgen>,
}

fn build_pmap(
    descr: &ParamDescr,
    entries: &[PmapEntrySpec],
) -> Result<Vec<PmapBucket>> {
    if entries.is_empty() {
        return Err(Error::invalid_value(
            format!("param '{}'", descr.name),
            "probability map must not be empty",
        ));
    }

    let mut buckets = Vec::with_capacity(entries.len());
    let mut total = 0.0;
    for entry in entries {
        let values = match (&entry.value, &entry.valarray) {
            (Some(_), Some(_)) => {
                return Err(Error::invalid_value(
                    format!("param '{}'", descr.name),
                    "pmap entry has both 'value' and 'valarray'",
                ))
            }
            (None, None) => {
                return Err(Error::invalid_value(
                    format!("param '{}'", descr.name),
                    "pmap entry has neither 'value' nor 'valarray'",
                ))
            }
            (Some(v), None) => vec![v.clone()],
            (None, Some(vs)) => {
                if vs.is_empty() {
                    return Err(Error::invalid_value(
                        format!("param '{}'", descr.name),
                        "pmap 'valarray' must not be empty",
                    ));
                }
                vs.clone()
            }
        };
        for value in &values {
            descr.check(value)?;
        }
        if !(entry.probability > 0.0) || entry.probability > 1.0 {
            return Err(Error::invalid_value(
                format!("param '{}'", descr.name),
                format!("pmap probability {} outside (0, 1]", entry.probability),
            ));
        }
        total += entry.probability;
        buckets.push(PmapBucket {
            cumulative: total,
            values,
            next: 0,
        });
    }

    if (total - 1.0).abs() >= PMAP_EPSILON {
        return Err(Error::invalid_value(
            format!("param '{}'", descr.name),
            format!("pmap probabilities sum to {total}, expected 1.0"),
        ));
    }

    Ok(buckets)
}

fn build_generated(descr: &ParamDescr, spec: &GeneratedParamSpec) -> Result<PgenKind> {
    let gen = randgen::create_generator(&spec.randgen)?;
    match (&spec.randvar, &spec.pmap) {
        (Some(_), Some(_)) => Err(Error::invalid_value(
            format!("param '{}'", descr.name),
            "'randvar' and 'pmap' are mutually exclusive",
        )),
        (Some(var_spec), None) => {
            if descr.ptype == ParamType::String || descr.ptype == ParamType::Bool {
                return Err(Error::invalid_value(
                    format!("param '{}'", descr.name),
                    format!("{:?} parameters cannot use a random variate", descr.ptype),
                ));
            }
            Ok(PgenKind::Variate {
                gen,
                var: randgen::create_variate(var_spec)?,
            })
        }
        (None, Some(entries)) => Ok(PgenKind::Pmap {
            gen,
            buckets: build_pmap(descr, entries)?,
        }),
        (None, None) => {
            if descr.ptype == ParamType::String {
                return Err(Error::invalid_value(
                    format!("param '{}'", descr.name),
                    "string parameters require a pmap or a constant",
                ));
            }
            Ok(PgenKind::Raw { gen })
        }
    }
}

impl PgenSet {
    /// Build the generator list for a workload's per-request parameters.
    ///
    /// `specs` yields (descriptor index, spec) pairs; descriptors without a
    /// spec fall back to their default value.
    pub fn build(
        descrs: &[ParamDescr],
        spec_for: impl Fn(&str) -> Option<WlParamSpec>,
    ) -> Result<PgenSet> {
        let mut pgens = Vec::new();
        for (idx, descr) in descrs.iter().enumerate() {
            if !descr.per_request {
                continue;
            }
            let kind = match spec_for(&descr.name) {
                Some(WlParamSpec::Const(value)) => {
                    descr.check(&value)?;
                    PgenKind::Fixed(value)
                }
                Some(WlParamSpec::Generated(gen_spec)) => build_generated(descr, &gen_spec)?,
                None => match &descr.default {
                    Some(value) => PgenKind::Fixed(value.clone()),
                    None => {
                        return Err(Error::invalid_value(
                            format!("param '{}'", descr.name),
                            "required parameter missing and has no default",
                        ))
                    }
                },
            };
            pgens.push(Pgen {
                descr_idx: idx,
                kind,
            });
        }
        Ok(PgenSet { pgens })
    }

    /// Generate one value per per-request parameter, range-checked.
    pub fn generate(&mut self, descrs: &[ParamDescr]) -> Result<Vec<ParamValue>> {
        let mut values = Vec::with_capacity(self.pgens.len());
        for pgen in &mut self.pgens {
            let descr = &descrs[pgen.descr_idx];
            let value = match &mut pgen.kind {
                PgenKind::Fixed(v) => v.clone(),
                PgenKind::Raw { gen } => raw_value(descr, gen.as_mut()),
                PgenKind::Variate { gen, var } => {
                    let x = var.sample(gen.as_mut());
                    match descr.ptype {
                        ParamType::Int => ParamValue::Int(x as i64),
                        ParamType::Float => ParamValue::Float(x),
                        // Rejected at build time.
                        _ => ParamValue::Float(x),
                    }
                }
                PgenKind::Pmap { gen, buckets } => {
                    let u = gen.generate_double();
                    let idx = buckets
                        .partition_point(|b| b.cumulative <= u)
                        .min(buckets.len() - 1);
                    let bucket = &mut buckets[idx];
                    let value = bucket.values[bucket.next % bucket.values.len()].clone();
                    bucket.next = bucket.next.wrapping_add(1);
                    value
                }
            };
            descr.check(&value)?;
            values.push(value);
        }
        Ok(values)
    }
}

fn raw_value(descr: &ParamDescr, gen: &mut dyn RandomGen) -> ParamValue {
    match descr.ptype {
        ParamType::Bool => ParamValue::Bool(gen.generate() & 1 == 1),
        ParamType::Int => match &descr.range {
            Some(crate::wlparam::ParamRange::Int { min, max }) => {
                let span = (max - min) as u64 + 1;
                ParamValue::Int(min + (gen.generate() % span) as i64)
            }
            _ => ParamValue::Int(gen.generate() as i64),
        },
        ParamType::Float => ParamValue::Float(gen.generate_double()),
        // Rejected at build time.
        ParamType::String => ParamValue::Str(String::new()),
    }
}

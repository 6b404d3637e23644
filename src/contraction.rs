//! Labeled-index tensor contractions.
//!
//! Each tensor axis is named by one character. A label shared by both operands
//! and absent from the output is summed; a label shared by both operands and
//! present in the output is a batch index; all other labels are free.

use crate::prelude::*;
use itertools::Itertools;
use std::collections::HashMap;

/* #region engine trait */

/// Pairwise multiply-accumulate over dense, row-major tensors.
///
/// The engine also owns the device that every tensor of a run is allocated on.
#[allow(clippy::too_many_arguments)]
pub trait ContractionEngine: Sync {
    fn device(&self) -> &DeviceTsr;

    /// `out[out_labels] (+)= coeff * a[a_labels] * b[b_labels]`.
    fn contract(
        &self,
        out: &mut Tsr,
        out_labels: &str,
        a: &Tsr,
        a_labels: &str,
        b: &Tsr,
        b_labels: &str,
        coeff: f64,
        accumulate: bool,
    ) -> Result<()>;

    /// `out[out_labels] (+)= coeff * a[a_labels]`, a pure relabeling of axes.
    fn sum(&self, out: &mut Tsr, out_labels: &str, a: &Tsr, a_labels: &str, coeff: f64, accumulate: bool)
    -> Result<()>;

    fn zeros(&self, shape: &[usize]) -> Tsr {
        rt::zeros((shape.to_vec(), self.device()))
    }

    /// Contract into a freshly allocated tensor shaped by the label extents.
    fn contract_new(&self, out_labels: &str, a: &Tsr, a_labels: &str, b: &Tsr, b_labels: &str, coeff: f64)
    -> Result<Tsr> {
        let extents = label_extents(&[(a, a_labels), (b, b_labels)])?;
        let shape = out_labels
            .chars()
            .map(|c| {
                extents.get(&c).copied().ok_or_else(|| CcError::InvalidLabels(format!("output label `{c}` in {out_labels}")))
            })
            .collect::<Result<Vec<usize>>>()?;
        let mut out = self.zeros(&shape);
        self.contract(&mut out, out_labels, a, a_labels, b, b_labels, coeff, false)?;
        Ok(out)
    }

    /// Relabel into a freshly allocated tensor.
    fn sum_new(&self, out_labels: &str, a: &Tsr, a_labels: &str, coeff: f64) -> Result<Tsr> {
        let extents = label_extents(&[(a, a_labels)])?;
        let shape = out_labels.chars().map(|c| extents.get(&c).copied().unwrap_or(0)).collect::<Vec<usize>>();
        let mut out = self.zeros(&shape);
        self.sum(&mut out, out_labels, a, a_labels, coeff, false)?;
        Ok(out)
    }
}

/// Accumulate `coeff * Π factors` into `out`.
///
/// The product is evaluated left to right; every intermediate keeps only the
/// labels still needed by the output or by a later factor.
pub fn contract_chain(
    engine: &dyn ContractionEngine,
    out: &mut Tsr,
    out_labels: &str,
    coeff: f64,
    factors: &[(&Tsr, &str)],
) -> Result<()> {
    match factors {
        [] => Err(CcError::InvalidLabels(format!("empty product for {out_labels}"))),
        [(a, la)] => engine.sum(out, out_labels, a, la, coeff, true),
        [(a, la), (b, lb)] => engine.contract(out, out_labels, a, la, b, lb, coeff, true),
        [(a, la), (b, lb), rest @ ..] => {
            let needed = rest.iter().flat_map(|(_, l)| l.chars()).chain(out_labels.chars()).collect::<String>();
            let keep = la.chars().chain(lb.chars()).filter(|c| needed.contains(*c)).unique().collect::<String>();
            let partial = engine.contract_new(&keep, a, la, b, lb, 1.0)?;
            let mut remaining = vec![(&partial, keep.as_str())];
            remaining.extend_from_slice(rest);
            contract_chain(engine, out, out_labels, coeff, &remaining)
        },
    }
}

/* #endregion */

/* #region dense implementation */

#[derive(Clone, Default)]
pub struct DenseContraction {
    device: DeviceTsr,
}

impl DenseContraction {
    pub fn new(device: DeviceTsr) -> Self {
        Self { device }
    }
}

impl ContractionEngine for DenseContraction {
    fn device(&self) -> &DeviceTsr {
        &self.device
    }

    fn contract(
        &self,
        out: &mut Tsr,
        out_labels: &str,
        a: &Tsr,
        a_labels: &str,
        b: &Tsr,
        b_labels: &str,
        coeff: f64,
        accumulate: bool,
    ) -> Result<()> {
        let plan = PairPlan::new(out_labels, a_labels, b_labels)?;
        let extents = label_extents(&[(a, a_labels), (b, b_labels)])?;
        let out_shape = out.shape().to_vec();
        let expected = out_labels.chars().map(|c| extents[&c]).collect::<Vec<usize>>();
        if out_shape != expected {
            return Err(CcError::shape_mismatch(format!("output of contraction {out_labels}"), &expected, &out_shape));
        }
        let extent = |labels: &[char]| labels.iter().map(|c| extents[c]).product::<usize>();
        let (nbatch, m, k, n) = (extent(&plan.batch), extent(&plan.free_a), extent(&plan.summed), extent(&plan.free_b));

        if !accumulate {
            out.fill(0.0);
        }
        if nbatch * m * k * n == 0 {
            return Ok(());
        }

        // a -> [batch, free_a, summed], b -> [batch, summed, free_b]
        let a_order = [plan.batch.as_slice(), &plan.free_a, &plan.summed].concat();
        let b_order = [plan.batch.as_slice(), &plan.summed, &plan.free_b].concat();
        let a3 = a.transpose(positions(&a_order, &a_labels.chars().collect_vec())).into_shape(vec![nbatch, m, k]);
        let b3 = b.transpose(positions(&b_order, &b_labels.chars().collect_vec())).into_shape(vec![nbatch, k, n]);

        // [batch, free_a, free_b] -> output order
        let prod_order = [plan.batch.as_slice(), &plan.free_a, &plan.free_b].concat();
        let prod_shape = prod_order.iter().map(|c| extents[c]).collect::<Vec<usize>>();
        let product = (&a3 % &b3)
            .into_shape(prod_shape)
            .into_transpose(positions(&out_labels.chars().collect_vec(), &prod_order));
        *out += coeff * product.view();
        Ok(())
    }

    fn sum(
        &self,
        out: &mut Tsr,
        out_labels: &str,
        a: &Tsr,
        a_labels: &str,
        coeff: f64,
        accumulate: bool,
    ) -> Result<()> {
        check_unique(out_labels)?;
        check_unique(a_labels)?;
        if out_labels.len() != a_labels.len() || !out_labels.chars().all(|c| a_labels.contains(c)) {
            return Err(CcError::InvalidLabels(format!("{a_labels} cannot be relabeled to {out_labels}")));
        }
        let perm = positions(&out_labels.chars().collect_vec(), &a_labels.chars().collect_vec());
        let expected = perm.iter().map(|&p| a.shape()[p]).collect::<Vec<usize>>();
        if out.shape().as_slice() != expected.as_slice() {
            return Err(CcError::shape_mismatch(format!("output of relabel {out_labels}"), &expected, out.shape()));
        }
        if !accumulate {
            out.fill(0.0);
        }
        *out += coeff * a.transpose(perm);
        Ok(())
    }
}

/// Classification of the labels of one pairwise contraction.
struct PairPlan {
    batch: Vec<char>,
    free_a: Vec<char>,
    summed: Vec<char>,
    free_b: Vec<char>,
}

impl PairPlan {
    fn new(out_labels: &str, a_labels: &str, b_labels: &str) -> Result<Self> {
        check_unique(out_labels)?;
        check_unique(a_labels)?;
        check_unique(b_labels)?;
        let mut plan = PairPlan { batch: vec![], free_a: vec![], summed: vec![], free_b: vec![] };
        for c in a_labels.chars() {
            match (b_labels.contains(c), out_labels.contains(c)) {
                (true, true) => plan.batch.push(c),
                (true, false) => plan.summed.push(c),
                (false, true) => plan.free_a.push(c),
                (false, false) => {
                    return Err(CcError::InvalidLabels(format!("label `{c}` of {a_labels} is neither summed nor kept")));
                },
            }
        }
        for c in b_labels.chars().filter(|&c| !a_labels.contains(c)) {
            if !out_labels.contains(c) {
                return Err(CcError::InvalidLabels(format!("label `{c}` of {b_labels} is neither summed nor kept")));
            }
            plan.free_b.push(c);
        }
        if let Some(c) = out_labels.chars().find(|&c| !a_labels.contains(c) && !b_labels.contains(c)) {
            return Err(CcError::InvalidLabels(format!("output label `{c}` of {out_labels} is not an input label")));
        }
        Ok(plan)
    }
}

fn check_unique(labels: &str) -> Result<()> {
    if labels.chars().all_unique() {
        Ok(())
    } else {
        Err(CcError::InvalidLabels(format!("repeated label in {labels}")))
    }
}

/// Extent of every label, checking that shared labels agree.
fn label_extents(operands: &[(&Tsr, &str)]) -> Result<HashMap<char, usize>> {
    let mut extents = HashMap::new();
    for (tsr, labels) in operands {
        if tsr.shape().len() != labels.chars().count() {
            return Err(CcError::InvalidLabels(format!("{labels} does not match a tensor of rank {}", tsr.shape().len())));
        }
        for (c, &n) in labels.chars().zip(tsr.shape().iter()) {
            match extents.insert(c, n) {
                Some(prev) if prev != n => {
                    return Err(CcError::shape_mismatch(format!("extent of label `{c}`"), &[prev], &[n]));
                },
                _ => {},
            }
        }
    }
    Ok(extents)
}

/// Position in `source` of every label of `target`.
fn positions(target: &[char], source: &[char]) -> Vec<usize> {
    target.iter().map(|c| source.iter().position(|s| s == c).unwrap_or(0)).collect()
}

/* #endregion */

#![allow(non_snake_case)]

//! Similarity-transformed Hamiltonian `H̄ = e^{-T} H e^{T}` in the space of
//! singles and doubles, as a linear operator for an external eigensolver.

use crate::ccsd::{CcsdContext, register_ccsd_intermediates};
use crate::contraction::contract_chain;
use crate::prelude::*;
use itertools::{Itertools, iproduct};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/* #region elements */

/// `W_mnij + ¼ τ_efij <mn||ef>`
fn build_Hmnij(ctx: &CcsdContext, cache: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    let mut H = cache.get("Wmnij")?.as_ref().clone();
    ctx.term(&mut H, "mnij", 0.25, &[(ctx.v("oovv")?, "mnef"), (&*cache.get("tau")?, "efij")])?;
    Ok(H)
}

/// `W_abef + ¼ τ_abmn <mn||ef>`
fn build_Habef(ctx: &CcsdContext, cache: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    let mut H = cache.get("Wabef")?.as_ref().clone();
    ctx.term(&mut H, "abef", 0.25, &[(ctx.v("oovv")?, "mnef"), (&*cache.get("tau")?, "abmn")])?;
    Ok(H)
}

fn build_Hmbej(ctx: &CcsdContext, cache: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    let mut H = cache.get("Wmbej")?.as_ref().clone();
    ctx.term(&mut H, "mbej", -0.5, &[(ctx.v("oovv")?, "mnef"), (ctx.t2, "fbjn")])?;
    Ok(H)
}

fn build_Hmnie(ctx: &CcsdContext, _: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    let mut H = ctx.v("ooov")?.clone();
    ctx.term(&mut H, "mnie", 1.0, &[(ctx.v("oovv")?, "mnfe"), (ctx.t1, "fi")])?;
    Ok(H)
}

fn build_Hamef(ctx: &CcsdContext, _: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    let mut H = ctx.v("vovv")?.clone();
    ctx.term(&mut H, "amef", -1.0, &[(ctx.v("oovv")?, "nmef"), (ctx.t1, "an")])?;
    Ok(H)
}

fn build_Hmbij(ctx: &CcsdContext, cache: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    let engine = ctx.engine;
    let (t1, t2, oovv) = (ctx.t1, ctx.t2, ctx.v("oovv")?);
    let mut H = ctx.v("ovoo")?.clone();
    ctx.term(&mut H, "mbij", -1.0, &[(&*cache.get("Fme")?, "me"), (t2, "beij")])?;
    ctx.term(&mut H, "mbij", -1.0, &[(t1, "bn"), (&*cache.get("Hmnij")?, "mnij")])?;
    ctx.term(&mut H, "mbij", 0.5, &[(ctx.v("ovvv")?, "mbef"), (&*cache.get("tau")?, "efij")])?;

    // P(ij) over the ring contractions
    let mut x = engine.contract_new("mbij", ctx.v("ooov")?, "mnie", t2, "bejn", 1.0)?;
    ctx.term(&mut x, "mbij", 1.0, &[(t1, "ei"), (ctx.v("ovvo")?, "mbej")])?;
    ctx.term(&mut x, "mbij", -1.0, &[(t1, "ei"), (t2, "bfnj"), (oovv, "mnef")])?;
    engine.sum(&mut H, "mbij", &x, "mbij", 1.0, true)?;
    engine.sum(&mut H, "mbij", &x, "mbji", -1.0, true)?;
    Ok(H)
}

fn build_Habei(ctx: &CcsdContext, cache: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    let engine = ctx.engine;
    let (t1, t2, oovv) = (ctx.t1, ctx.t2, ctx.v("oovv")?);
    let mut H = ctx.v("vvvo")?.clone();
    ctx.term(&mut H, "abei", 0.5, &[(ctx.v("oovo")?, "mnei"), (&*cache.get("tau")?, "abmn")])?;
    ctx.term(&mut H, "abei", -1.0, &[(&*cache.get("Fme")?, "me"), (t2, "abmi")])?;
    ctx.term(&mut H, "abei", 1.0, &[(&*cache.get("Habef")?, "abef"), (t1, "fi")])?;

    // P(ab) over the ring contractions
    let mut x = engine.contract_new("abei", ctx.v("ovvv")?, "mbef", t2, "afmi", 1.0)?;
    ctx.term(&mut x, "abei", 1.0, &[(t1, "am"), (ctx.v("ovvo")?, "mbei")])?;
    ctx.term(&mut x, "abei", -1.0, &[(t1, "am"), (t2, "bfni"), (oovv, "mnef")])?;
    engine.sum(&mut H, "abei", &x, "abei", -1.0, true)?;
    engine.sum(&mut H, "abei", &x, "baei", 1.0, true)?;
    Ok(H)
}

/// Elements of `H̄` held by the cache in cached mode.
const ELEMENTS: [&str; 10] =
    ["Fae_eff", "Fmi_eff", "Fme", "Hmnij", "Habef", "Hmbej", "Hmnie", "Hamef", "Hmbij", "Habei"];

/* #endregion */

/* #region direct expansion */

/// Bare inputs of `H̄`: Fock blocks, antisymmetrized integral blocks and the
/// CCSD amplitudes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Foo,
    Fvv,
    Fov,
    V(&'static str),
    T1,
    T2,
}

use Operand::*;

/// `coeff * Π factors`, each factor with its index labels.
type Chain = (f64, Vec<(Operand, String)>);

fn chain(coeff: f64, factors: &[(Operand, &str)]) -> Chain {
    (coeff, factors.iter().map(|&(op, labels)| (op, labels.to_string())).collect())
}

/// Every pairwise product of the chains of `left` and `right`.
fn product(left: Vec<Chain>, right: &[Chain]) -> Vec<Chain> {
    iproduct!(left, right)
        .map(|((c1, mut f1), (c2, f2))| {
            f1.extend(f2.iter().cloned());
            (c1 * c2, f1)
        })
        .collect()
}

fn times(chains: Vec<Chain>, coeff: f64, extra: &[(Operand, &str)]) -> Vec<Chain> {
    product(chains, &[chain(coeff, extra)])
}

/// `τ_abij = t_abij + t_ai t_bj - t_bi t_aj`
fn tau([a, b, i, j]: [char; 4]) -> Vec<Chain> {
    let pair = |x: char, y: char| String::from_iter([x, y]);
    vec![
        (1.0, vec![(T2, String::from_iter([a, b, i, j]))]),
        (1.0, vec![(T1, pair(a, i)), (T1, pair(b, j))]),
        (-1.0, vec![(T1, pair(b, i)), (T1, pair(a, j))]),
    ]
}

fn Fme_chains() -> Vec<Chain> {
    vec![chain(1.0, &[(Fov, "me")]), chain(1.0, &[(V("oovv"), "mnef"), (T1, "fn")])]
}

fn Fae_eff_chains() -> Vec<Chain> {
    let oovv = (V("oovv"), "mnef");
    let mut chains = vec![
        chain(1.0, &[(Fvv, "ae")]),
        chain(-0.5, &[(Fov, "me"), (T1, "am")]),
        chain(1.0, &[(V("ovvv"), "mafe"), (T1, "fm")]),
        chain(-0.5, &[oovv, (T2, "afmn")]),
        chain(-0.25, &[oovv, (T1, "am"), (T1, "fn")]),
        chain(0.25, &[oovv, (T1, "fm"), (T1, "an")]),
    ];
    chains.extend(times(Fme_chains(), -0.5, &[(T1, "am")]));
    chains
}

fn Fmi_eff_chains() -> Vec<Chain> {
    let oovv = (V("oovv"), "mnef");
    let mut chains = vec![
        chain(1.0, &[(Foo, "mi")]),
        chain(0.5, &[(Fov, "me"), (T1, "ei")]),
        chain(1.0, &[(V("ooov"), "mnie"), (T1, "en")]),
        chain(0.5, &[oovv, (T2, "efin")]),
        chain(0.25, &[oovv, (T1, "ei"), (T1, "fn")]),
        chain(-0.25, &[oovv, (T1, "fi"), (T1, "en")]),
    ];
    chains.extend(times(Fme_chains(), 0.5, &[(T1, "ei")]));
    chains
}

fn Hmnij_chains() -> Vec<Chain> {
    let mut chains = vec![
        chain(1.0, &[(V("oooo"), "mnij")]),
        chain(1.0, &[(V("ooov"), "mnie"), (T1, "ej")]),
        chain(-1.0, &[(V("ooov"), "mnje"), (T1, "ei")]),
    ];
    chains.extend(times(tau(['e', 'f', 'i', 'j']), 0.5, &[(V("oovv"), "mnef")]));
    chains
}

fn Habef_chains() -> Vec<Chain> {
    let mut chains = vec![
        chain(1.0, &[(V("vvvv"), "abef")]),
        chain(-1.0, &[(V("vovv"), "amef"), (T1, "bm")]),
        chain(1.0, &[(V("vovv"), "bmef"), (T1, "am")]),
    ];
    chains.extend(times(tau(['a', 'b', 'm', 'n']), 0.5, &[(V("oovv"), "mnef")]));
    chains
}

fn Hmbej_chains() -> Vec<Chain> {
    let oovv = (V("oovv"), "mnef");
    vec![
        chain(1.0, &[(V("ovvo"), "mbej")]),
        chain(1.0, &[(V("ovvv"), "mbef"), (T1, "fj")]),
        chain(-1.0, &[(V("oovo"), "mnej"), (T1, "bn")]),
        chain(-1.0, &[oovv, (T2, "fbjn")]),
        chain(-1.0, &[oovv, (T1, "fj"), (T1, "bn")]),
    ]
}

fn Hmnie_chains() -> Vec<Chain> {
    vec![chain(1.0, &[(V("ooov"), "mnie")]), chain(1.0, &[(V("oovv"), "mnfe"), (T1, "fi")])]
}

fn Hamef_chains() -> Vec<Chain> {
    vec![chain(1.0, &[(V("vovv"), "amef")]), chain(-1.0, &[(V("oovv"), "nmef"), (T1, "an")])]
}

fn Hmbij_chains() -> Vec<Chain> {
    let oovv = (V("oovv"), "mnef");
    let mut chains = vec![
        chain(1.0, &[(V("ovoo"), "mbij")]),
        // P(ij) over the ring contractions
        chain(1.0, &[(V("ooov"), "mnie"), (T2, "bejn")]),
        chain(1.0, &[(T1, "ei"), (V("ovvo"), "mbej")]),
        chain(-1.0, &[(T1, "ei"), (T2, "bfnj"), oovv]),
        chain(-1.0, &[(V("ooov"), "mnje"), (T2, "bein")]),
        chain(-1.0, &[(T1, "ej"), (V("ovvo"), "mbei")]),
        chain(1.0, &[(T1, "ej"), (T2, "bfni"), oovv]),
    ];
    chains.extend(times(Fme_chains(), -1.0, &[(T2, "beij")]));
    chains.extend(times(Hmnij_chains(), -1.0, &[(T1, "bn")]));
    chains.extend(times(tau(['e', 'f', 'i', 'j']), 0.5, &[(V("ovvv"), "mbef")]));
    chains
}

fn Habei_chains() -> Vec<Chain> {
    let oovv = (V("oovv"), "mnef");
    let mut chains = vec![
        chain(1.0, &[(V("vvvo"), "abei")]),
        // P(ab) over the ring contractions
        chain(-1.0, &[(V("ovvv"), "mbef"), (T2, "afmi")]),
        chain(-1.0, &[(T1, "am"), (V("ovvo"), "mbei")]),
        chain(1.0, &[(T1, "am"), (T2, "bfni"), oovv]),
        chain(1.0, &[(V("ovvv"), "maef"), (T2, "bfmi")]),
        chain(1.0, &[(T1, "bm"), (V("ovvo"), "maei")]),
        chain(-1.0, &[(T1, "bm"), (T2, "afni"), oovv]),
    ];
    chains.extend(times(tau(['a', 'b', 'm', 'n']), 0.5, &[(V("oovo"), "mnei")]));
    chains.extend(times(Fme_chains(), -1.0, &[(T2, "abmi")]));
    chains.extend(times(Habef_chains(), 1.0, &[(T1, "fi")]));
    chains
}

/// An element of `H̄` as bare chains, with the element's own index labels.
fn element_chains(name: &str) -> Result<(&'static str, Vec<Chain>)> {
    Ok(match name {
        "Fae_eff" => ("ae", Fae_eff_chains()),
        "Fmi_eff" => ("mi", Fmi_eff_chains()),
        "Fme" => ("me", Fme_chains()),
        "Hmnij" => ("mnij", Hmnij_chains()),
        "Habef" => ("abef", Habef_chains()),
        "Hmbej" => ("mbej", Hmbej_chains()),
        "Hmnie" => ("mnie", Hmnie_chains()),
        "Hamef" => ("amef", Hamef_chains()),
        "Hmbij" => ("mbij", Hmbij_chains()),
        "Habei" => ("abei", Habei_chains()),
        _ => return Err(CcError::UnregisteredIntermediate(name.to_string())),
    })
}

/// Rename the element labels `own` to `used`, and every summed label to one
/// not in `taken`. The new summed labels are added to `taken`.
fn relabel(chains: Vec<Chain>, own: &str, used: &str, taken: &mut HashSet<char>) -> Result<Vec<Chain>> {
    if own.len() != used.len() {
        return Err(CcError::InvalidLabels(format!("element {own} used as {used}")));
    }
    let mut map: HashMap<char, char> = own.chars().zip(used.chars()).collect();
    let summed = chains
        .iter()
        .flat_map(|(_, factors)| factors.iter().flat_map(|(_, labels)| labels.chars()))
        .filter(|c| !map.contains_key(c))
        .unique()
        .collect_vec();
    let fresh = ('a'..='z').chain('A'..='Z').filter(|c| !taken.contains(c)).take(summed.len()).collect_vec();
    if fresh.len() < summed.len() {
        return Err(CcError::InvalidLabels(format!("out of index labels expanding {own}")));
    }
    taken.extend(fresh.iter().copied());
    map.extend(summed.into_iter().zip(fresh));

    let rename = |labels: &str| labels.chars().map(|c| map[&c]).collect::<String>();
    Ok(chains
        .into_iter()
        .map(|(coeff, factors)| (coeff, factors.into_iter().map(|(op, labels)| (op, rename(&labels))).collect()))
        .collect())
}

/* #endregion */

/* #region sigma terms */

#[derive(Debug, Clone, Copy)]
enum Factor {
    /// Held by the cache in cached mode, expanded into bare chains in direct
    /// mode.
    Element(&'static str),
    Bare(Operand),
}

/// `σ[rank, out] += coeff * Π factors * trial[rank, labels]`.
///
/// The transpose swaps the roles of `out` and `trial`.
struct SigmaTerm {
    out: (usize, &'static str),
    coeff: f64,
    factors: Vec<(Factor, &'static str)>,
    trial: (usize, &'static str),
}

impl SigmaTerm {
    /// The term as a sum of products of bare operands.
    fn expand(&self) -> Result<Vec<(f64, Vec<(Factor, String)>)>> {
        let mut taken: HashSet<char> = self
            .out
            .1
            .chars()
            .chain(self.trial.1.chars())
            .chain(self.factors.iter().flat_map(|(_, labels)| labels.chars()))
            .collect();
        let mut chains = vec![(self.coeff, vec![])];
        for &(factor, labels) in &self.factors {
            let options = match factor {
                Factor::Element(name) => {
                    let (own, element) = element_chains(name)?;
                    relabel(element, own, labels, &mut taken)?
                },
                Factor::Bare(op) => vec![chain(1.0, &[(op, labels)])],
            };
            chains = product(chains, &options);
        }
        Ok(chains
            .into_iter()
            .map(|(coeff, factors)| (coeff, factors.into_iter().map(|(op, l)| (Factor::Bare(op), l)).collect()))
            .collect())
    }

    /// The term as a single product over the cached elements.
    fn held(&self) -> Vec<(f64, Vec<(Factor, String)>)> {
        vec![(self.coeff, self.factors.iter().map(|&(factor, labels)| (factor, labels.to_string())).collect())]
    }
}

fn sigma_terms() -> Vec<SigmaTerm> {
    use Factor::*;
    let term = |out, coeff, factors, trial| SigmaTerm { out, coeff, factors, trial };
    let (t2, oovv) = (Bare(T2), Bare(V("oovv")));
    vec![
        // singles
        term((1, "ai"), 1.0, vec![(Element("Fae_eff"), "ae")], (1, "ei")),
        term((1, "ai"), -1.0, vec![(Element("Fmi_eff"), "mi")], (1, "am")),
        term((1, "ai"), 1.0, vec![(Element("Fme"), "me")], (2, "aeim")),
        term((1, "ai"), 1.0, vec![(Element("Hmbej"), "maei")], (1, "em")),
        term((1, "ai"), 0.5, vec![(Element("Hamef"), "amef")], (2, "efim")),
        term((1, "ai"), -0.5, vec![(Element("Hmnie"), "mnie")], (2, "aemn")),
        // doubles, before antisymmetrization
        term((2, "abij"), 2.0, vec![(Element("Fae_eff"), "be")], (2, "aeij")),
        term((2, "abij"), -2.0, vec![(Element("Fmi_eff"), "mj")], (2, "abim")),
        term((2, "abij"), 0.5, vec![(Element("Hmnij"), "mnij")], (2, "abmn")),
        term((2, "abij"), 0.5, vec![(Element("Habef"), "abef")], (2, "efij")),
        term((2, "abij"), 4.0, vec![(Element("Hmbej"), "mbej")], (2, "aeim")),
        term((2, "abij"), 2.0, vec![(Element("Habei"), "abej")], (1, "ei")),
        term((2, "abij"), -2.0, vec![(Element("Hmbij"), "mbij")], (1, "am")),
        term((2, "abij"), -2.0, vec![(Element("Hamef"), "amef"), (t2, "fbij")], (1, "em")),
        term((2, "abij"), 2.0, vec![(Element("Hmnie"), "mnie"), (t2, "abnj")], (1, "em")),
        term((2, "abij"), -1.0, vec![(oovv, "mnef"), (t2, "aeij")], (2, "bfmn")),
        term((2, "abij"), -1.0, vec![(oovv, "mnef"), (t2, "abim")], (2, "efjn")),
    ]
}

/// Starting from `first`, repeatedly take the factor sharing the most labels
/// with those already in the product.
fn contraction_order<'t>(first: (&'t Tsr, String), mut rest: Vec<(&'t Tsr, String)>) -> Vec<(&'t Tsr, String)> {
    let mut seen: HashSet<char> = first.1.chars().collect();
    let mut ordered = vec![first];
    loop {
        let shared = |labels: &String| Reverse(labels.chars().filter(|c| seen.contains(c)).count());
        let Some(next) = rest.iter().position_min_by_key(|(_, labels)| shared(labels)) else {
            break;
        };
        let factor = rest.remove(next);
        seen.extend(factor.1.chars());
        ordered.push(factor);
    }
    ordered
}

/* #endregion */

/* #region operator */

/// `H̄` restricted to singles and doubles.
///
/// In cached mode the elements of `H̄` are built once, on first use, and kept
/// for the lifetime of the operator. In direct mode nothing is stored: every
/// application contracts the trial vector with products of Fock blocks,
/// integral blocks and amplitudes.
pub struct SimilarityTransformedHamiltonian<'a> {
    engine: &'a dyn ContractionEngine,
    context: CcsdContext<'a>,
    mode: EvaluationMode,
    cache: Option<IntermediateCache<CcsdContext<'a>>>,
    diagonal: AmplitudeVector,
}

fn hbar_cache<'a>(context: CcsdContext<'a>) -> IntermediateCache<CcsdContext<'a>> {
    let mut cache = IntermediateCache::new(context);
    register_ccsd_intermediates(&mut cache);
    cache
        .register("Hmnij", build_Hmnij)
        .register("Habef", build_Habef)
        .register("Hmbej", build_Hmbej)
        .register("Hmnie", build_Hmnie)
        .register("Hamef", build_Hamef)
        .register("Hmbij", build_Hmbij)
        .register("Habei", build_Habei);
    cache
}

impl<'a> SimilarityTransformedHamiltonian<'a> {
    /// Operator for converged CCSD `amplitudes`.
    pub fn new(
        space: &OrbitalSpace,
        fock: &'a FockBlocks,
        ints: &'a IntegralBlocks,
        engine: &'a dyn ContractionEngine,
        amplitudes: &'a AmplitudeVector,
        mode: EvaluationMode,
    ) -> Result<Self> {
        fock.check(space)?;
        let diagonal = Denominators::new(space, 2, 0.0, engine.device()).as_amplitudes().clone();
        diagonal.check_compatible(amplitudes)?;
        let context = CcsdContext::new(engine, fock, ints, amplitudes)?;
        let cache = match mode {
            EvaluationMode::CachedIntermediate => Some(hbar_cache(context)),
            EvaluationMode::Direct => None,
        };
        Ok(Self { engine, context, mode, cache, diagonal })
    }

    pub fn mode(&self) -> EvaluationMode {
        self.mode
    }

    /// `σ = H̄ r`, excluding the reference energy.
    pub fn right_apply(&self, trial: &AmplitudeVector) -> Result<AmplitudeVector> {
        let timer = std::time::Instant::now();
        let sigma = self.apply(trial, false)?;
        tracing::debug!("Time elapsed (H̄ right apply, {:?}): {:?}", self.mode, timer.elapsed());
        Ok(sigma)
    }

    /// `λ = l H̄`, the transpose of [`right_apply`](Self::right_apply).
    pub fn left_apply(&self, trial: &AmplitudeVector) -> Result<AmplitudeVector> {
        let timer = std::time::Instant::now();
        let lambda = self.apply(trial, true)?;
        tracing::debug!("Time elapsed (H̄ left apply, {:?}): {:?}", self.mode, timer.elapsed());
        Ok(lambda)
    }

    /// Orbital-energy differences `D`, the usual Davidson preconditioner.
    pub fn diagonal_guess(&self) -> AmplitudeVector {
        self.diagonal.clone()
    }

    /// Number of intermediates held across applications (zero in direct mode).
    pub fn intermediates_built(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.ready_count())
    }

    /// `None` for the occupied-virtual Fock block of canonical orbitals.
    fn tensor<'s>(&'s self, factor: Factor, elements: &'s HashMap<&str, Arc<Tsr>>) -> Result<Option<&'s Tsr>> {
        let ctx = &self.context;
        Ok(match factor {
            Factor::Element(name) => {
                let held = elements.get(name).ok_or_else(|| CcError::UnregisteredIntermediate(name.to_string()))?;
                Some(&**held)
            },
            Factor::Bare(Foo) => Some(&ctx.fock.oo),
            Factor::Bare(Fvv) => Some(&ctx.fock.vv),
            Factor::Bare(Fov) => ctx.fock.ov.as_ref(),
            Factor::Bare(V(sig)) => Some(ctx.v(sig)?),
            Factor::Bare(T1) => Some(ctx.t1),
            Factor::Bare(T2) => Some(ctx.t2),
        })
    }

    fn apply(&self, trial: &AmplitudeVector, transpose: bool) -> Result<AmplitudeVector> {
        self.diagonal.check_compatible(trial)?;
        let elements = match &self.cache {
            Some(cache) => ELEMENTS.iter().map(|&name| Ok((name, cache.get(name)?))).collect::<Result<HashMap<_, _>>>()?,
            None => HashMap::new(),
        };

        let mut result = trial.zeros_like();
        for term in sigma_terms() {
            let ((src, src_labels), (dst, dst_labels)) = match transpose {
                false => (term.trial, term.out),
                true => (term.out, term.trial),
            };
            let products = match self.cache {
                Some(_) => term.held(),
                None => term.expand()?,
            };
            let out = result.get_mut(dst)?;
            for (coeff, factors) in products {
                let factors = factors
                    .into_iter()
                    .map(|(factor, labels)| Ok(self.tensor(factor, &elements)?.map(|t| (t, labels))))
                    .collect::<Result<Vec<_>>>()?;
                // products with the occupied-virtual Fock block vanish for canonical orbitals
                let Some(factors) = factors.into_iter().collect::<Option<Vec<_>>>() else {
                    continue;
                };
                let chain = contraction_order((trial.get(src)?, src_labels.to_string()), factors);
                let chain = chain.iter().map(|(t, labels)| (*t, labels.as_str())).collect_vec();
                contract_chain(self.engine, out, dst_labels, coeff, &chain)?;
            }
        }
        result.antisymmetrize_doubles(self.engine)?;
        Ok(result)
    }
}

/* #endregion */

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::*;

    struct Fixture {
        engine: DenseContraction,
        space: OrbitalSpace,
        fock: FockBlocks,
        ints: IntegralBlocks,
    }

    fn fixture(non_canonical: bool) -> Fixture {
        let engine = DenseContraction::default();
        let space = toy_space(2, 3);
        let ints = toy_integrals(&space, 3, 61, &engine);
        let fock = match non_canonical {
            true => random_fock(&space, 60, engine.device()),
            false => FockBlocks::canonical(&space, engine.device()),
        };
        Fixture { engine, space, fock, ints }
    }

    fn operator<'a>(f: &'a Fixture, t: &'a AmplitudeVector, mode: EvaluationMode) -> SimilarityTransformedHamiltonian<'a> {
        SimilarityTransformedHamiltonian::new(&f.space, &f.fock, &f.ints, &f.engine, t, mode).unwrap()
    }

    const MODES: [EvaluationMode; 2] = [EvaluationMode::Direct, EvaluationMode::CachedIntermediate];

    #[test]
    fn test_left_apply_is_transpose_of_right_apply() {
        let f = fixture(true);
        let t = random_amplitudes(&f.space, 2, 62, f.engine.device());
        let l = random_amplitudes(&f.space, 2, 63, f.engine.device());
        let r = random_amplitudes(&f.space, 2, 64, f.engine.device());
        for mode in MODES {
            let hbar = operator(&f, &t, mode);
            let lhs = l.dot(&hbar.right_apply(&r).unwrap()).unwrap();
            let rhs = hbar.left_apply(&l).unwrap().dot(&r).unwrap();
            assert!((lhs - rhs).abs() < 1e-12 * lhs.abs().max(1.0), "{mode:?}: {lhs} vs {rhs}");
        }
    }

    #[test]
    fn test_direct_apply_matches_cached_elements() {
        for non_canonical in [false, true] {
            let f = fixture(non_canonical);
            let t = random_amplitudes(&f.space, 2, 65, f.engine.device());
            let direct = operator(&f, &t, EvaluationMode::Direct);
            let cached = operator(&f, &t, EvaluationMode::CachedIntermediate);
            let r = random_amplitudes(&f.space, 2, 66, f.engine.device());

            assert_eq!(cached.intermediates_built(), 0);
            assert_amplitudes_close(&direct.right_apply(&r).unwrap(), &cached.right_apply(&r).unwrap(), 1e-12);
            let built = cached.intermediates_built();
            let Habef = cached.cache.as_ref().unwrap().get("Habef").unwrap();

            assert_amplitudes_close(&direct.left_apply(&r).unwrap(), &cached.left_apply(&r).unwrap(), 1e-12);
            assert_eq!(cached.intermediates_built(), built);
            assert!(Arc::ptr_eq(&Habef, &cached.cache.as_ref().unwrap().get("Habef").unwrap()));
            assert!(direct.cache.is_none());
            assert_eq!(direct.intermediates_built(), 0);
        }
    }

    #[test]
    fn test_direct_terms_contain_only_bare_operands() {
        for term in sigma_terms() {
            let out_labels: HashSet<char> = term.out.1.chars().collect();
            for (_, factors) in term.expand().unwrap() {
                assert!(factors.iter().all(|(factor, _)| matches!(factor, Factor::Bare(_))));
                // every label is either free or summed over exactly two tensors
                let labels = factors.iter().flat_map(|(_, l)| l.chars()).chain(term.trial.1.chars()).counts();
                for (c, n) in labels {
                    assert_eq!(n, if out_labels.contains(&c) { 1 } else { 2 }, "label {c} in {:?}", term.out);
                }
            }
        }
    }

    #[test]
    fn test_relabel_keeps_summed_labels_apart() {
        let mut taken: HashSet<char> = "aimeb".chars().collect();
        let chains = relabel(Fme_chains(), "me", "ai", &mut taken).unwrap();
        assert_eq!(chains[0].1, vec![(Fov, "ai".to_string())]);
        let (_, factors) = &chains[1];
        let (oovv, t1) = (&factors[0].1, &factors[1].1);
        assert_eq!(&oovv[..1], "a");
        assert_eq!(&oovv[2..3], "i");
        assert!(oovv[1..2].chars().chain(oovv[3..].chars()).all(|c| !"aimeb".contains(c)));
        assert_eq!(t1.chars().rev().collect::<String>(), format!("{}{}", &oovv[1..2], &oovv[3..]));
        assert!(relabel(Fme_chains(), "me", "abc", &mut taken).is_err());
    }

    #[test]
    fn test_right_apply_is_jacobian_of_converged_residual() {
        let f = fixture(false);
        let ccsd = Ccsd::new(&f.space, &f.fock, &f.ints, &f.engine).unwrap();
        let config = CcConfig {
            mixer: MixerKind::Diis,
            max_iterations: 100,
            energy_tolerance: 1e-12,
            amplitude_tolerance: 1e-10,
            ..Default::default()
        };
        let t = IterationEngine::new(&ccsd, &config).unwrap().run(None).unwrap();
        assert!(t.converged());
        let t = t.amplitudes;
        let r = random_amplitudes(&f.space, 2, 67, f.engine.device());

        // d/dε [R(T + ε r) + D ∘ (T + ε r)] by central differences
        let eps = 1e-4;
        let shifted = |sign: f64| {
            let mut x = t.clone();
            x.add(&r, sign * eps).unwrap();
            ccsd.residual(&x, EvaluationMode::Direct).unwrap()
        };
        let mut jacobian = shifted(1.0).sub(&shifted(-1.0)).unwrap();
        jacobian.scale(0.5 / eps);

        for mode in MODES {
            let hbar = operator(&f, &t, mode);
            let mut expected = jacobian.clone();
            expected.add(&hbar.diagonal_guess().hadamard(&r).unwrap(), 1.0).unwrap();
            assert_amplitudes_close(&hbar.right_apply(&r).unwrap(), &expected, 1e-7);
        }
    }

    #[test]
    fn test_trial_vector_shape_is_checked() {
        let f = fixture(false);
        let t = AmplitudeVector::zeros(&f.space, 2, f.engine.device());
        let hbar = operator(&f, &t, EvaluationMode::Direct);
        let wrong = AmplitudeVector::zeros(&toy_space(2, 2), 2, f.engine.device());
        assert!(matches!(hbar.right_apply(&wrong), Err(CcError::ShapeMismatch { .. })));

        // all orbital-energy differences, not a unit vector
        let guess = hbar.diagonal_guess();
        assert_eq!(guess.max_rank(), 2);
        let denominators = Denominators::new(&f.space, 2, 0.0, f.engine.device());
        assert_amplitudes_close(&guess, denominators.as_amplitudes(), 1e-15);
    }
}

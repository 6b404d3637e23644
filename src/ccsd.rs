#![allow(non_snake_case)]

//! Spin-orbital CCSD amplitude equations.
//!
//! Amplitudes are stored as `t1[a,i]` and `t2[a,b,i,j]`, integrals as
//! antisymmetrized `<pq||rs>` blocks. Doubles terms are accumulated without
//! permutation operators (each `P(ab)` or `P(ij)` contributes a factor 2) and
//! projected onto the antisymmetric subspace once at the end.

use crate::contraction::contract_chain;
use crate::prelude::*;
use crate::tiling::TiledLadder;

/* #region equations trait */

/// Residual and energy of a truncated coupled-cluster model.
pub trait AmplitudeEquations {
    fn orbital_space(&self) -> &OrbitalSpace;

    fn max_rank(&self) -> usize;

    fn engine(&self) -> &dyn ContractionEngine;

    /// `R(T) = H̄(T) - D ∘ T`, with `D` the orbital-energy differences.
    fn residual(&self, amplitudes: &AmplitudeVector, mode: EvaluationMode) -> Result<AmplitudeVector>;

    fn energy(&self, amplitudes: &AmplitudeVector) -> Result<f64>;

    /// Correlation energy resolved per occupied pair, `[No, No]`.
    fn pair_energy(&self, amplitudes: &AmplitudeVector) -> Result<Tsr>;
}

/* #endregion */

/* #region shared context and intermediates */

/// Fixed inputs of one CCSD operator instance.
#[derive(Clone, Copy)]
pub(crate) struct CcsdContext<'a> {
    pub engine: &'a dyn ContractionEngine,
    pub fock: &'a FockBlocks,
    pub ints: &'a IntegralBlocks,
    pub t1: &'a Tsr,
    pub t2: &'a Tsr,
}

impl<'a> CcsdContext<'a> {
    pub fn new(
        engine: &'a dyn ContractionEngine,
        fock: &'a FockBlocks,
        ints: &'a IntegralBlocks,
        amplitudes: &'a AmplitudeVector,
    ) -> Result<Self> {
        Ok(Self { engine, fock, ints, t1: amplitudes.get(1)?, t2: amplitudes.get(2)? })
    }

    pub fn v(&self, sig: &str) -> Result<&'a Tsr> {
        self.ints.get(sig)
    }

    /// `out += coeff * Π factors`
    pub fn term(&self, out: &mut Tsr, out_labels: &str, coeff: f64, factors: &[(&Tsr, &str)]) -> Result<()> {
        contract_chain(self.engine, out, out_labels, coeff, factors)
    }

    pub fn nocc(&self) -> usize {
        self.t1.shape()[1]
    }

    pub fn nvir(&self) -> usize {
        self.t1.shape()[0]
    }
}

/// `τ_abij = t_abij + factor (t_ai t_bj - t_bi t_aj)`
pub(crate) fn build_tau_with(engine: &dyn ContractionEngine, t1: &Tsr, t2: &Tsr, factor: f64) -> Result<Tsr> {
    let mut tau = t2.clone();
    engine.contract(&mut tau, "abij", t1, "ai", t1, "bj", factor, true)?;
    engine.contract(&mut tau, "abij", t1, "bi", t1, "aj", -factor, true)?;
    Ok(tau)
}

fn build_tau(ctx: &CcsdContext, _: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    build_tau_with(ctx.engine, ctx.t1, ctx.t2, 1.0)
}

fn build_tau_tilde(ctx: &CcsdContext, _: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    build_tau_with(ctx.engine, ctx.t1, ctx.t2, 0.5)
}

fn build_Fme(ctx: &CcsdContext, _: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    let mut Fme = match &ctx.fock.ov {
        Some(f_ov) => f_ov.clone(),
        None => ctx.engine.zeros(&[ctx.nocc(), ctx.nvir()]),
    };
    ctx.term(&mut Fme, "me", 1.0, &[(ctx.v("oovv")?, "mnef"), (ctx.t1, "fn")])?;
    Ok(Fme)
}

fn build_Fae(ctx: &CcsdContext, cache: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    let tau_tilde = cache.get("tau_tilde")?;
    let mut Fae = ctx.fock.vv.clone();
    if let Some(f_ov) = &ctx.fock.ov {
        ctx.term(&mut Fae, "ae", -0.5, &[(f_ov, "me"), (ctx.t1, "am")])?;
    }
    ctx.term(&mut Fae, "ae", 1.0, &[(ctx.v("ovvv")?, "mafe"), (ctx.t1, "fm")])?;
    ctx.term(&mut Fae, "ae", -0.5, &[(ctx.v("oovv")?, "mnef"), (&*tau_tilde, "afmn")])?;
    Ok(Fae)
}

fn build_Fmi(ctx: &CcsdContext, cache: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    let tau_tilde = cache.get("tau_tilde")?;
    let mut Fmi = ctx.fock.oo.clone();
    if let Some(f_ov) = &ctx.fock.ov {
        ctx.term(&mut Fmi, "mi", 0.5, &[(f_ov, "me"), (ctx.t1, "ei")])?;
    }
    ctx.term(&mut Fmi, "mi", 1.0, &[(ctx.v("ooov")?, "mnie"), (ctx.t1, "en")])?;
    ctx.term(&mut Fmi, "mi", 0.5, &[(ctx.v("oovv")?, "mnef"), (&*tau_tilde, "efin")])?;
    Ok(Fmi)
}

/// `F_ae - ½ t_am F_me`, the one-body vertex of the doubles equation.
fn build_Fae_eff(ctx: &CcsdContext, cache: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    let mut Fae = cache.get("Fae")?.as_ref().clone();
    ctx.term(&mut Fae, "ae", -0.5, &[(&*cache.get("Fme")?, "me"), (ctx.t1, "am")])?;
    Ok(Fae)
}

/// `F_mi + ½ t_ei F_me`
fn build_Fmi_eff(ctx: &CcsdContext, cache: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    let mut Fmi = cache.get("Fmi")?.as_ref().clone();
    ctx.term(&mut Fmi, "mi", 0.5, &[(&*cache.get("Fme")?, "me"), (ctx.t1, "ei")])?;
    Ok(Fmi)
}

fn build_Wmnij(ctx: &CcsdContext, cache: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    let engine = ctx.engine;
    let mut Wmnij = ctx.v("oooo")?.clone();
    let x = engine.contract_new("mnij", ctx.v("ooov")?, "mnie", ctx.t1, "ej", 1.0)?;
    engine.sum(&mut Wmnij, "mnij", &x, "mnij", 1.0, true)?;
    engine.sum(&mut Wmnij, "mnij", &x, "mnji", -1.0, true)?;
    ctx.term(&mut Wmnij, "mnij", 0.25, &[(ctx.v("oovv")?, "mnef"), (&*cache.get("tau")?, "efij")])?;
    Ok(Wmnij)
}

fn build_Wabef(ctx: &CcsdContext, cache: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    let engine = ctx.engine;
    let timer = std::time::Instant::now();
    let mut Wabef = ctx.v("vvvv")?.clone();
    let y = engine.contract_new("abef", ctx.v("vovv")?, "amef", ctx.t1, "bm", 1.0)?;
    engine.sum(&mut Wabef, "abef", &y, "abef", -1.0, true)?;
    engine.sum(&mut Wabef, "abef", &y, "baef", 1.0, true)?;
    ctx.term(&mut Wabef, "abef", 0.25, &[(ctx.v("oovv")?, "mnef"), (&*cache.get("tau")?, "abmn")])?;
    tracing::debug!("Time elapsed (Wabef): {:?}", timer.elapsed());
    Ok(Wabef)
}

/// Ring vertex of the amplitude equations (half `t2` in the last term).
fn build_Wmbej(ctx: &CcsdContext, _: &IntermediateCache<CcsdContext>) -> Result<Tsr> {
    let (t1, t2, oovv) = (ctx.t1, ctx.t2, ctx.v("oovv")?);
    let mut Wmbej = ctx.v("ovvo")?.clone();
    ctx.term(&mut Wmbej, "mbej", 1.0, &[(ctx.v("ovvv")?, "mbef"), (t1, "fj")])?;
    ctx.term(&mut Wmbej, "mbej", -1.0, &[(ctx.v("oovo")?, "mnej"), (t1, "bn")])?;
    ctx.term(&mut Wmbej, "mbej", -0.5, &[(oovv, "mnef"), (t2, "fbjn")])?;
    ctx.term(&mut Wmbej, "mbej", -1.0, &[(oovv, "mnef"), (t1, "fj"), (t1, "bn")])?;
    Ok(Wmbej)
}

/// Register the intermediates of the CCSD equations.
pub(crate) fn register_ccsd_intermediates(cache: &mut IntermediateCache<CcsdContext>) {
    cache
        .register("tau", build_tau)
        .register("tau_tilde", build_tau_tilde)
        .register("Fme", build_Fme)
        .register("Fae", build_Fae)
        .register("Fmi", build_Fmi)
        .register("Fae_eff", build_Fae_eff)
        .register("Fmi_eff", build_Fmi_eff)
        .register("Wmnij", build_Wmnij)
        .register("Wabef", build_Wabef)
        .register("Wmbej", build_Wmbej);
}

/* #endregion */

/* #region CCSD */

pub struct Ccsd<'a> {
    space: &'a OrbitalSpace,
    fock: &'a FockBlocks,
    ints: &'a IntegralBlocks,
    engine: &'a dyn ContractionEngine,
    denominators: Denominators,
    tile_width: Option<usize>,
}

impl<'a> Ccsd<'a> {
    pub fn new(
        space: &'a OrbitalSpace,
        fock: &'a FockBlocks,
        ints: &'a IntegralBlocks,
        engine: &'a dyn ContractionEngine,
    ) -> Result<Self> {
        fock.check(space)?;
        let oovv = ints.get("oovv")?;
        util::check_shape("integral block oovv", oovv, &[space.nocc(), space.nocc(), space.nvir(), space.nvir()])?;
        let denominators = Denominators::new(space, 2, 0.0, engine.device());
        Ok(Self { space, fock, ints, engine, denominators, tile_width: None })
    }

    /// Take over the settings of `config` that shape the equations.
    ///
    /// An occupied-virtual Fock block is only accepted with non-canonical
    /// orbitals enabled.
    pub fn with_config(self, config: &CcConfig) -> Result<Self> {
        config.validate()?;
        if self.fock.ov.is_some() && !config.use_non_canonical_orbitals {
            return Err(CcError::InvalidConfig(
                "Fock blocks carry an occupied-virtual part but non-canonical orbitals are disabled".into(),
            ));
        }
        self.with_tile_width(config.integrals_tile_size)
    }

    /// Evaluate the ladder term in tiles of `width` virtuals in cached mode.
    ///
    /// Requires the integrals to carry their Coulomb vertex.
    pub fn with_tile_width(mut self, width: Option<usize>) -> Result<Self> {
        if width == Some(0) {
            return Err(CcError::InvalidConfig("integrals tile size must be positive".into()));
        }
        if width.is_some() && self.ints.vertex().is_none() {
            return Err(CcError::MissingBlock("Coulomb vertex required by integrals tile size".into()));
        }
        self.tile_width = width;
        Ok(self)
    }

    fn direct_residual(&self, ctx: &CcsdContext) -> Result<(Tsr, Tsr)> {
        let (t1, t2) = (ctx.t1, ctx.t2);
        let f_oo = &self.fock.oo;
        let f_vv = &self.fock.vv;
        let v = |sig: &str| ctx.v(sig);
        let oovv = v("oovv")?;

        let timer = std::time::Instant::now();
        let mut r1 = self.engine.zeros(t1.shape());
        if let Some(f_ov) = &self.fock.ov {
            self.engine.sum(&mut r1, "ai", f_ov, "ia", 1.0, true)?;
            ctx.term(&mut r1, "ai", -1.0, &[(f_ov, "me"), (t1, "ei"), (t1, "am")])?;
            ctx.term(&mut r1, "ai", 1.0, &[(f_ov, "me"), (t2, "aeim")])?;
        }
        ctx.term(&mut r1, "ai", 1.0, &[(f_vv, "ae"), (t1, "ei")])?;
        ctx.term(&mut r1, "ai", -1.0, &[(f_oo, "mi"), (t1, "am")])?;
        ctx.term(&mut r1, "ai", 1.0, &[(v("ovvv")?, "mafe"), (t1, "fm"), (t1, "ei")])?;
        ctx.term(&mut r1, "ai", -0.5, &[(oovv, "mnef"), (t2, "afmn"), (t1, "ei")])?;
        ctx.term(&mut r1, "ai", -1.0, &[(oovv, "mnef"), (t1, "ei"), (t1, "am"), (t1, "fn")])?;
        ctx.term(&mut r1, "ai", -1.0, &[(v("ooov")?, "mnie"), (t1, "en"), (t1, "am")])?;
        ctx.term(&mut r1, "ai", -0.5, &[(oovv, "mnef"), (t2, "efin"), (t1, "am")])?;
        ctx.term(&mut r1, "ai", 1.0, &[(oovv, "mnef"), (t1, "fn"), (t2, "aeim")])?;
        ctx.term(&mut r1, "ai", -1.0, &[(v("ovov")?, "naif"), (t1, "fn")])?;
        ctx.term(&mut r1, "ai", -0.5, &[(v("ovvv")?, "maef"), (t2, "efim")])?;
        ctx.term(&mut r1, "ai", -0.5, &[(v("oovo")?, "nmei"), (t2, "aemn")])?;
        tracing::debug!("Time elapsed (direct rhs1): {:?}", timer.elapsed());

        let timer = std::time::Instant::now();
        let tau = build_tau_with(self.engine, t1, t2, 1.0)?;
        let mut r2 = self.engine.sum_new("abij", oovv, "ijab", 1.0)?;
        // particle one-body
        ctx.term(&mut r2, "abij", 2.0, &[(f_vv, "be"), (t2, "aeij")])?;
        ctx.term(&mut r2, "abij", 2.0, &[(v("ovvv")?, "mbfe"), (t1, "fm"), (t2, "aeij")])?;
        ctx.term(&mut r2, "abij", -1.0, &[(oovv, "mnef"), (t2, "bfmn"), (t2, "aeij")])?;
        ctx.term(&mut r2, "abij", -2.0, &[(oovv, "mnef"), (t1, "fn"), (t1, "bm"), (t2, "aeij")])?;
        // hole one-body
        ctx.term(&mut r2, "abij", -2.0, &[(f_oo, "mj"), (t2, "abim")])?;
        ctx.term(&mut r2, "abij", -2.0, &[(v("ooov")?, "mnje"), (t1, "en"), (t2, "abim")])?;
        ctx.term(&mut r2, "abij", -1.0, &[(oovv, "mnef"), (t2, "efjn"), (t2, "abim")])?;
        ctx.term(&mut r2, "abij", -2.0, &[(oovv, "mnef"), (t1, "fn"), (t1, "ej"), (t2, "abim")])?;
        if let Some(f_ov) = &self.fock.ov {
            ctx.term(&mut r2, "abij", -2.0, &[(f_ov, "me"), (t1, "bm"), (t2, "aeij")])?;
            ctx.term(&mut r2, "abij", -2.0, &[(f_ov, "me"), (t1, "ej"), (t2, "abim")])?;
        }
        // hole-hole and particle-particle ladders
        ctx.term(&mut r2, "abij", 0.5, &[(v("oooo")?, "mnij"), (&tau, "abmn")])?;
        ctx.term(&mut r2, "abij", 1.0, &[(v("ooov")?, "mnie"), (t1, "ej"), (&tau, "abmn")])?;
        ctx.term(&mut r2, "abij", 0.25, &[(oovv, "mnef"), (&tau, "efij"), (&tau, "abmn")])?;
        ctx.term(&mut r2, "abij", 0.5, &[(v("vvvv")?, "abef"), (&tau, "efij")])?;
        ctx.term(&mut r2, "abij", -1.0, &[(v("vovv")?, "amef"), (t1, "bm"), (&tau, "efij")])?;
        // rings
        ctx.term(&mut r2, "abij", 4.0, &[(v("ovvo")?, "mbej"), (t2, "aeim")])?;
        ctx.term(&mut r2, "abij", 4.0, &[(v("ovvv")?, "mbef"), (t1, "fj"), (t2, "aeim")])?;
        ctx.term(&mut r2, "abij", -4.0, &[(v("oovo")?, "mnej"), (t1, "bn"), (t2, "aeim")])?;
        ctx.term(&mut r2, "abij", -2.0, &[(oovv, "mnef"), (t2, "fbjn"), (t2, "aeim")])?;
        ctx.term(&mut r2, "abij", -4.0, &[(oovv, "mnef"), (t1, "fj"), (t1, "bn"), (t2, "aeim")])?;
        ctx.term(&mut r2, "abij", -4.0, &[(v("ovvo")?, "mbej"), (t1, "ei"), (t1, "am")])?;
        // singles couplings
        ctx.term(&mut r2, "abij", 2.0, &[(v("vvvo")?, "abej"), (t1, "ei")])?;
        ctx.term(&mut r2, "abij", -2.0, &[(v("ovoo")?, "mbij"), (t1, "am")])?;
        tracing::debug!("Time elapsed (direct rhs2): {:?}", timer.elapsed());

        Ok((r1, r2))
    }

    fn cached_residual(&self, cache: &IntermediateCache<CcsdContext>) -> Result<(Tsr, Tsr)> {
        let ctx = cache.context();
        let (t1, t2) = (ctx.t1, ctx.t2);
        let v = |sig: &str| ctx.v(sig);

        let timer = std::time::Instant::now();
        let mut r1 = self.engine.zeros(t1.shape());
        if let Some(f_ov) = &self.fock.ov {
            self.engine.sum(&mut r1, "ai", f_ov, "ia", 1.0, true)?;
        }
        ctx.term(&mut r1, "ai", 1.0, &[(&*cache.get("Fae")?, "ae"), (t1, "ei")])?;
        ctx.term(&mut r1, "ai", -1.0, &[(&*cache.get("Fmi")?, "mi"), (t1, "am")])?;
        ctx.term(&mut r1, "ai", 1.0, &[(&*cache.get("Fme")?, "me"), (t2, "aeim")])?;
        ctx.term(&mut r1, "ai", -1.0, &[(v("ovov")?, "naif"), (t1, "fn")])?;
        ctx.term(&mut r1, "ai", -0.5, &[(v("ovvv")?, "maef"), (t2, "efim")])?;
        ctx.term(&mut r1, "ai", -0.5, &[(v("oovo")?, "nmei"), (t2, "aemn")])?;
        tracing::debug!("Time elapsed (cached rhs1): {:?}", timer.elapsed());

        let timer = std::time::Instant::now();
        let tau_owner = cache.get("tau")?;
        let tau: &Tsr = &tau_owner;
        let mut r2 = self.engine.sum_new("abij", v("oovv")?, "ijab", 1.0)?;
        ctx.term(&mut r2, "abij", 2.0, &[(&*cache.get("Fae_eff")?, "be"), (t2, "aeij")])?;
        ctx.term(&mut r2, "abij", -2.0, &[(&*cache.get("Fmi_eff")?, "mj"), (t2, "abim")])?;
        ctx.term(&mut r2, "abij", 0.5, &[(&*cache.get("Wmnij")?, "mnij"), (tau, "abmn")])?;
        match self.tile_width {
            Some(width) => TiledLadder::new(self.engine, self.space, self.ints, width)?.accumulate(&mut r2, t1, tau)?,
            None => ctx.term(&mut r2, "abij", 0.5, &[(&*cache.get("Wabef")?, "abef"), (tau, "efij")])?,
        }
        ctx.term(&mut r2, "abij", 4.0, &[(&*cache.get("Wmbej")?, "mbej"), (t2, "aeim")])?;
        ctx.term(&mut r2, "abij", -4.0, &[(v("ovvo")?, "mbej"), (t1, "ei"), (t1, "am")])?;
        ctx.term(&mut r2, "abij", 2.0, &[(v("vvvo")?, "abej"), (t1, "ei")])?;
        ctx.term(&mut r2, "abij", -2.0, &[(v("ovoo")?, "mbij"), (t1, "am")])?;
        tracing::debug!("Time elapsed (cached rhs2): {:?}", timer.elapsed());

        Ok((r1, r2))
    }
}

impl AmplitudeEquations for Ccsd<'_> {
    fn orbital_space(&self) -> &OrbitalSpace {
        self.space
    }

    fn max_rank(&self) -> usize {
        2
    }

    fn engine(&self) -> &dyn ContractionEngine {
        self.engine
    }

    fn residual(&self, amplitudes: &AmplitudeVector, mode: EvaluationMode) -> Result<AmplitudeVector> {
        self.denominators.as_amplitudes().check_compatible(amplitudes)?;
        let ctx = CcsdContext::new(self.engine, self.fock, self.ints, amplitudes)?;
        let (r1, r2) = match mode {
            EvaluationMode::Direct => self.direct_residual(&ctx)?,
            EvaluationMode::CachedIntermediate => {
                let mut cache = IntermediateCache::new(ctx);
                register_ccsd_intermediates(&mut cache);
                let residual = self.cached_residual(&cache)?;
                tracing::trace!("CCSD intermediates built: {}", cache.ready_count());
                residual
            },
        };
        let mut residual = AmplitudeVector::from_blocks(vec![r1, r2])?;
        residual.antisymmetrize_doubles(self.engine)?;
        residual.add(&self.denominators.as_amplitudes().hadamard(amplitudes)?, -1.0)?;
        Ok(residual)
    }

    fn energy(&self, amplitudes: &AmplitudeVector) -> Result<f64> {
        let mut e_corr = self.pair_energy(amplitudes)?.sum_all();
        if let Some(f_ov) = &self.fock.ov {
            let f_vo = self.engine.sum_new("ai", f_ov, "ia", 1.0)?;
            e_corr += (&f_vo * amplitudes.get(1)?).sum_all();
        }
        Ok(e_corr)
    }

    fn pair_energy(&self, amplitudes: &AmplitudeVector) -> Result<Tsr> {
        let (t1, t2) = (amplitudes.get(1)?, amplitudes.get(2)?);
        let oovv = self.ints.get("oovv")?;
        let nocc = self.space.nocc();
        let mut e_ij = self.engine.zeros(&[nocc, nocc]);
        contract_chain(self.engine, &mut e_ij, "ij", 0.25, &[(oovv, "ijab"), (t2, "abij")])?;
        contract_chain(self.engine, &mut e_ij, "ij", 0.5, &[(oovv, "ijab"), (t1, "ai"), (t1, "bj")])?;
        Ok(e_ij)
    }
}

/* #endregion */

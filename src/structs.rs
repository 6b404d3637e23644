use crate::prelude::*;

/* #region orbital space and Fock blocks */

/// Occupied and virtual orbital energies of one run.
#[derive(Debug, Clone)]
pub struct OrbitalSpace {
    pub eps_occ: Vec<f64>,
    pub eps_vir: Vec<f64>,
}

impl OrbitalSpace {
    pub fn new(eps_occ: Vec<f64>, eps_vir: Vec<f64>) -> Self {
        Self { eps_occ, eps_vir }
    }

    pub fn nocc(&self) -> usize {
        self.eps_occ.len()
    }

    pub fn nvir(&self) -> usize {
        self.eps_vir.len()
    }

    /// Shape `[Nv; k] ++ [No; k]` of the rank-`k` amplitude block.
    pub fn rank_shape(&self, rank: usize) -> Vec<usize> {
        let mut shape = vec![self.nvir(); rank];
        shape.extend(std::iter::repeat_n(self.nocc(), rank));
        shape
    }
}

/// Fock matrix blocks in the molecular-orbital basis.
///
/// `ov` is only present with non-canonical orbitals.
#[derive(Debug, Clone)]
pub struct FockBlocks {
    pub oo: Tsr,
    pub vv: Tsr,
    pub ov: Option<Tsr>,
}

impl FockBlocks {
    /// Diagonal Fock blocks of canonical (Hartree-Fock) orbitals.
    pub fn canonical(space: &OrbitalSpace, device: &DeviceTsr) -> Self {
        let diag = |eps: &[f64]| {
            let n = eps.len();
            let mut data = vec![0.0; n * n];
            eps.iter().enumerate().for_each(|(p, &e)| data[p * n + p] = e);
            util::tensor_from_vec(data, &[n, n], device)
        };
        Self { oo: diag(&space.eps_occ), vv: diag(&space.eps_vir), ov: None }
    }

    pub fn check(&self, space: &OrbitalSpace) -> Result<()> {
        let (nocc, nvir) = (space.nocc(), space.nvir());
        util::check_shape("Fock oo block", &self.oo, &[nocc, nocc])?;
        util::check_shape("Fock vv block", &self.vv, &[nvir, nvir])?;
        if let Some(ov) = &self.ov {
            util::check_shape("Fock ov block", ov, &[nocc, nvir])?;
        }
        Ok(())
    }
}

/* #endregion */

/* #region configuration */

/// How the residual and the similarity-transformed Hamiltonian are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    /// Every term from bare Fock, integral and amplitude blocks.
    Direct,
    /// Terms contracted against memoized dressed intermediates.
    CachedIntermediate,
}

impl std::str::FromStr for EvaluationMode {
    type Err = CcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "cached" | "cachedintermediate" | "cached-intermediate" | "intermediates" => Ok(Self::CachedIntermediate),
            _ => Err(CcError::InvalidConfig(format!("unknown evaluation mode `{s}`"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CcConfig {
    pub mixer: MixerKind,
    /// Weight of the newest estimate in the linear mixer.
    pub mixing_ratio: f64,
    /// History capacity of the DIIS mixer.
    pub max_residua: usize,
    pub max_iterations: usize,
    pub energy_tolerance: f64,
    pub amplitude_tolerance: f64,
    pub level_shift: f64,
    pub evaluation_mode: EvaluationMode,
    /// Width of the virtual tiles of the ladder term; `None` means one tile.
    pub integrals_tile_size: Option<usize>,
    pub antisymmetrize_integrals: bool,
    pub use_non_canonical_orbitals: bool,
}

impl Default for CcConfig {
    fn default() -> Self {
        Self {
            mixer: MixerKind::Linear,
            mixing_ratio: 1.0,
            max_residua: 4,
            max_iterations: 16,
            energy_tolerance: 1.0e-6,
            amplitude_tolerance: 1.0e-5,
            level_shift: 0.0,
            evaluation_mode: EvaluationMode::CachedIntermediate,
            integrals_tile_size: None,
            antisymmetrize_integrals: false,
            use_non_canonical_orbitals: false,
        }
    }
}

impl CcConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, x: f64| {
            if x > 0.0 && x.is_finite() {
                Ok(())
            } else {
                Err(CcError::InvalidConfig(format!("{name} must be positive and finite, got {x}")))
            }
        };
        positive("energy tolerance", self.energy_tolerance)?;
        positive("amplitude tolerance", self.amplitude_tolerance)?;
        if !self.level_shift.is_finite() {
            return Err(CcError::InvalidConfig(format!("level shift must be finite, got {}", self.level_shift)));
        }
        if !(self.mixing_ratio > 0.0 && self.mixing_ratio <= 1.0) {
            return Err(CcError::InvalidConfig(format!("mixing ratio must lie in (0, 1], got {}", self.mixing_ratio)));
        }
        if self.max_residua == 0 {
            return Err(CcError::InvalidConfig("DIIS history capacity must be at least 1".into()));
        }
        if self.integrals_tile_size == Some(0) {
            return Err(CcError::InvalidConfig("integrals tile size must be positive".into()));
        }
        if self.evaluation_mode == EvaluationMode::Direct && self.integrals_tile_size.is_some() {
            return Err(CcError::InvalidConfig("integrals tile size only applies to cached evaluation".into()));
        }
        Ok(())
    }
}

/* #endregion */

/* #region results */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    Converged,
    /// The iteration budget ran out; the last amplitudes are still returned.
    MaxIterationsReached,
}

#[derive(Debug)]
pub struct CcResults {
    pub e_corr: f64,
    pub amplitudes: AmplitudeVector,
    pub status: ConvergenceStatus,
    pub niter: usize,
    /// Per occupied pair energies, `[No, No]`.
    pub pair_energy: Tsr,
}

impl CcResults {
    pub fn converged(&self) -> bool {
        self.status == ConvergenceStatus::Converged
    }
}

/* #endregion */

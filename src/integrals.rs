//! Two-electron integral blocks over occupied/virtual orbital spaces.

use crate::prelude::*;
use itertools::iproduct;
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

/* #region signatures */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Space {
    Occ,
    Vir,
}

impl Space {
    pub fn range(&self, space: &OrbitalSpace) -> Range<usize> {
        match self {
            Space::Occ => 0..space.nocc(),
            Space::Vir => space.nocc()..space.nocc() + space.nvir(),
        }
    }

    pub fn len(&self, space: &OrbitalSpace) -> usize {
        self.range(space).len()
    }
}

/// Occupied/virtual signature of a 4-index integral block, written `oovv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(pub [Space; 4]);

impl Signature {
    /// All 16 signatures.
    pub fn all() -> impl Iterator<Item = Signature> {
        let spaces = [Space::Occ, Space::Vir];
        iproduct!(spaces, spaces, spaces, spaces).map(|(p, q, r, s)| Signature([p, q, r, s]))
    }

    pub fn shape(&self, space: &OrbitalSpace) -> Vec<usize> {
        self.0.iter().map(|s| s.len(space)).collect()
    }

    /// Signature of the exchange partner `<pq|sr>`.
    pub fn swap_last(&self) -> Signature {
        let [p, q, r, s] = self.0;
        Signature([p, q, s, r])
    }

    /// Hole/particle spelling, `HHPP` for `oovv`.
    pub fn hole_particle(&self) -> String {
        self.0.iter().map(|s| if *s == Space::Occ { 'H' } else { 'P' }).collect()
    }
}

impl std::str::FromStr for Signature {
    type Err = CcError;

    fn from_str(s: &str) -> Result<Self> {
        let spaces = s
            .chars()
            .map(|c| match c.to_ascii_lowercase() {
                'o' | 'h' => Ok(Space::Occ),
                'v' | 'p' => Ok(Space::Vir),
                _ => Err(CcError::InvalidSignature(s.to_string())),
            })
            .collect::<Result<Vec<Space>>>()?;
        let spaces: [Space; 4] = spaces.try_into().map_err(|_| CcError::InvalidSignature(s.to_string()))?;
        Ok(Signature(spaces))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: String = self.0.iter().map(|s| if *s == Space::Occ { 'o' } else { 'v' }).collect();
        write!(f, "{s}")
    }
}

/* #endregion */

/* #region coulomb vertex */

/// Factorized Coulomb integrals `Γ[G, p, q]` over the full orbital range
/// (occupied first), with `<pq|rs> = Σ_G Γ[G,p,r] Γ[G,q,s]`.
#[derive(Debug, Clone)]
pub struct CoulombVertex {
    gamma: Tsr,
}

impl CoulombVertex {
    pub fn new(gamma: Tsr, space: &OrbitalSpace) -> Result<Self> {
        let norb = space.nocc() + space.nvir();
        let naux = gamma.shape().first().copied().unwrap_or(0);
        util::check_shape("Coulomb vertex", &gamma, &[naux, norb, norb])?;
        Ok(Self { gamma })
    }

    pub fn naux(&self) -> usize {
        self.gamma.shape()[0]
    }

    /// `Γ[G, p, q]` restricted to `p ∈ x`, `q ∈ y`.
    pub fn block(&self, x: Space, y: Space, space: &OrbitalSpace) -> Result<Tsr> {
        util::slice_block(&self.gamma, &[0..self.naux(), x.range(space), y.range(space)])
    }

    /// `Γ[G, p, q]` for explicit orbital ranges.
    pub fn slice(&self, p: Range<usize>, q: Range<usize>) -> Result<Tsr> {
        util::slice_block(&self.gamma, &[0..self.naux(), p, q])
    }
}

/* #endregion */

/* #region producers */

/// Upstream source of orbital energies, Fock blocks and integral blocks.
pub trait IntegralProducer {
    fn orbital_space(&self) -> &OrbitalSpace;

    /// Block `sig`; element `[p,q,r,s]` holds `<pq|rs>` or `<pq||rs>` as produced.
    fn block(&self, sig: Signature) -> Result<Tsr>;

    fn fock(&self, non_canonical: bool) -> Result<FockBlocks>;

    fn vertex(&self) -> Option<&CoulombVertex> {
        None
    }
}

/// Bare Coulomb blocks contracted from a factorized vertex.
pub struct VertexIntegrals {
    space: OrbitalSpace,
    vertex: CoulombVertex,
    fock: Option<FockBlocks>,
    engine: DenseContraction,
}

impl VertexIntegrals {
    pub fn new(space: OrbitalSpace, vertex: CoulombVertex, device: &DeviceTsr) -> Self {
        Self { space, vertex, fock: None, engine: DenseContraction::new(device.clone()) }
    }

    /// Fock blocks returned when non-canonical orbitals are requested.
    pub fn with_fock(mut self, fock: FockBlocks) -> Self {
        self.fock = Some(fock);
        self
    }
}

impl IntegralProducer for VertexIntegrals {
    fn orbital_space(&self) -> &OrbitalSpace {
        &self.space
    }

    fn block(&self, sig: Signature) -> Result<Tsr> {
        let [p, q, r, s] = sig.0;
        let gamma_pr = self.vertex.block(p, r, &self.space)?;
        let gamma_qs = self.vertex.block(q, s, &self.space)?;
        self.engine.contract_new("pqrs", &gamma_pr, "Gpr", &gamma_qs, "Gqs", 1.0)
    }

    fn fock(&self, non_canonical: bool) -> Result<FockBlocks> {
        match (&self.fock, non_canonical) {
            (Some(fock), true) => Ok(fock.clone()),
            _ => Ok(FockBlocks::canonical(&self.space, self.engine.device())),
        }
    }

    fn vertex(&self) -> Option<&CoulombVertex> {
        Some(&self.vertex)
    }
}

/// Blocks stored as `.npy` files in one directory, named like
/// `HHPPCoulombIntegrals.npy`, next to `HoleEigenEnergies.npy` and
/// `ParticleEigenEnergies.npy`.
pub struct NpyIntegrals {
    dir: PathBuf,
    space: OrbitalSpace,
    vertex: Option<CoulombVertex>,
    device: DeviceTsr,
}

impl NpyIntegrals {
    pub fn open(dir: &Path, device: &DeviceTsr) -> Result<Self> {
        let eps_occ = util::tensor_to_vec(&util::tensor_from_file(&dir.join("HoleEigenEnergies.npy"), device)?);
        let eps_vir = util::tensor_to_vec(&util::tensor_from_file(&dir.join("ParticleEigenEnergies.npy"), device)?);
        let space = OrbitalSpace::new(eps_occ, eps_vir);
        let vertex_path = dir.join("CoulombVertex.npy");
        let vertex = match vertex_path.exists() {
            true => Some(CoulombVertex::new(util::tensor_from_file(&vertex_path, device)?, &space)?),
            false => None,
        };
        tracing::info!("Orbital space from {}: {} occupied, {} virtual", dir.display(), space.nocc(), space.nvir());
        Ok(Self { dir: dir.to_path_buf(), space, vertex, device: device.clone() })
    }

    fn read(&self, name: &str) -> Result<Tsr> {
        let path = self.dir.join(format!("{name}.npy"));
        if !path.exists() {
            return Err(CcError::MissingBlock(path.display().to_string()));
        }
        util::tensor_from_file(&path, &self.device)
    }
}

impl IntegralProducer for NpyIntegrals {
    fn orbital_space(&self) -> &OrbitalSpace {
        &self.space
    }

    fn block(&self, sig: Signature) -> Result<Tsr> {
        self.read(&format!("{}CoulombIntegrals", sig.hole_particle()))
    }

    fn fock(&self, non_canonical: bool) -> Result<FockBlocks> {
        if !non_canonical {
            return Ok(FockBlocks::canonical(&self.space, &self.device));
        }
        let fock = FockBlocks {
            oo: self.read("HHFockMatrix")?,
            vv: self.read("PPFockMatrix")?,
            ov: Some(self.read("HPFockMatrix")?),
        };
        fock.check(&self.space)?;
        Ok(fock)
    }

    fn vertex(&self) -> Option<&CoulombVertex> {
        self.vertex.as_ref()
    }
}

/* #endregion */

/* #region integral blocks */

/// The 16 antisymmetrized blocks `<pq||rs>`, read-only after construction.
pub struct IntegralBlocks {
    blocks: HashMap<Signature, Tsr>,
    vertex: Option<CoulombVertex>,
}

impl IntegralBlocks {
    /// Fock and integral blocks of a producer, read as `config` asks for them.
    pub fn load(
        producer: &dyn IntegralProducer,
        config: &CcConfig,
        engine: &dyn ContractionEngine,
    ) -> Result<(FockBlocks, Self)> {
        let fock = producer.fock(config.use_non_canonical_orbitals)?;
        let ints = Self::from_producer(producer, config.antisymmetrize_integrals, engine)?;
        Ok((fock, ints))
    }

    /// Collect all blocks of a producer.
    ///
    /// With `antisymmetrize` the produced blocks are taken as bare Coulomb
    /// integrals and turned into `<pq||rs> = <pq|rs> - <pq|sr>`.
    pub fn from_producer(
        producer: &dyn IntegralProducer,
        antisymmetrize: bool,
        engine: &dyn ContractionEngine,
    ) -> Result<Self> {
        let timer = std::time::Instant::now();
        let blocks = Signature::all().map(|sig| Ok((sig, producer.block(sig)?))).collect::<Result<HashMap<_, _>>>()?;
        let ints = Self::from_blocks(producer.orbital_space(), blocks, antisymmetrize, engine)?;
        tracing::debug!("Time elapsed (integral blocks): {:?}", timer.elapsed());
        Ok(Self { vertex: producer.vertex().cloned(), ..ints })
    }

    pub fn from_blocks(
        space: &OrbitalSpace,
        blocks: HashMap<Signature, Tsr>,
        antisymmetrize: bool,
        engine: &dyn ContractionEngine,
    ) -> Result<Self> {
        for sig in Signature::all() {
            let block = blocks.get(&sig).ok_or_else(|| CcError::MissingBlock(sig.to_string()))?;
            util::check_shape(&format!("integral block {sig}"), block, &sig.shape(space))?;
        }
        if !antisymmetrize {
            return Ok(Self { blocks, vertex: None });
        }
        let antisymmetrized = Signature::all()
            .map(|sig| {
                let mut block = blocks[&sig].clone();
                engine.sum(&mut block, "pqrs", &blocks[&sig.swap_last()], "pqsr", -1.0, true)?;
                Ok((sig, block))
            })
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self { blocks: antisymmetrized, vertex: None })
    }

    /// Block by its `oovv`-style name.
    pub fn get(&self, sig: &str) -> Result<&Tsr> {
        self.block(sig.parse()?)
    }

    pub fn block(&self, sig: Signature) -> Result<&Tsr> {
        self.blocks.get(&sig).ok_or_else(|| CcError::MissingBlock(sig.to_string()))
    }

    pub fn vertex(&self) -> Option<&CoulombVertex> {
        self.vertex.as_ref()
    }
}

/* #endregion */

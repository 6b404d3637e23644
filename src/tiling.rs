#![allow(non_snake_case)]

//! Tiled evaluation of the particle-particle ladder
//! `R_abij += ½ Σ_ef W_abef X_efij` without materializing `W_abef`.

use crate::prelude::*;
use std::ops::Range;

/* #region tiles */

/// Pair of virtual index ranges `[a, a+w)` and `[b, b+w)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileDescriptor {
    pub a: Range<usize>,
    pub b: Range<usize>,
}

impl TileDescriptor {
    pub fn is_diagonal(&self) -> bool {
        self.a == self.b
    }
}

/// Tiles `(a, b)` with `a ≤ b` covering the virtual range; the trailing tile
/// may be narrower than `width`.
pub fn tile_pairs(nvir: usize, width: usize) -> Vec<TileDescriptor> {
    let ranges = (0..nvir).step_by(width.max(1)).map(|start| start..(start + width).min(nvir)).collect::<Vec<_>>();
    let mut tiles = vec![];
    for (ia, a) in ranges.iter().enumerate() {
        for b in ranges[ia..].iter() {
            tiles.push(TileDescriptor { a: a.clone(), b: b.clone() });
        }
    }
    tiles
}

/// Widest tile whose `w × w × Nv × Nv` integral slice fits into `memory_bytes`.
pub fn tile_width_for_budget(memory_bytes: usize, nvir: usize) -> usize {
    let nvir = nvir.max(1);
    let elements = memory_bytes / std::mem::size_of::<f64>() / (nvir * nvir);
    ((elements as f64).sqrt().floor() as usize).clamp(1, nvir)
}

/* #endregion */

/* #region tiled ladder */

/// Ladder term with the T1-dressed
/// `W_abef = <ab||ef> - P(ab) t_bm <am||ef> + ¼ τ_abmn <mn||ef>`,
/// rebuilt tile by tile from the Coulomb vertex.
pub struct TiledLadder<'a> {
    engine: &'a dyn ContractionEngine,
    space: &'a OrbitalSpace,
    vertex: &'a CoulombVertex,
    oovv: &'a Tsr,
    width: usize,
}

impl<'a> TiledLadder<'a> {
    pub fn new(
        engine: &'a dyn ContractionEngine,
        space: &'a OrbitalSpace,
        ints: &'a IntegralBlocks,
        width: usize,
    ) -> Result<Self> {
        if width == 0 {
            return Err(CcError::InvalidConfig("integrals tile size must be positive".into()));
        }
        let vertex = ints.vertex().ok_or_else(|| CcError::MissingBlock("Coulomb vertex for tiled ladder".into()))?;
        Ok(Self { engine, space, vertex, oovv: ints.get("oovv")?, width })
    }

    pub fn tiles(&self) -> Vec<TileDescriptor> {
        tile_pairs(self.space.nvir(), self.width)
    }

    /// `r2 += ½ Σ_ef W_abef x_efij`; `x` is `τ` in the amplitude equations.
    ///
    /// `x` must be antisymmetric, so each unordered tile pair is evaluated once.
    pub fn accumulate(&self, r2: &mut Tsr, t1: &Tsr, x: &Tsr) -> Result<()> {
        util::check_shape("tiled ladder residual", r2, &self.space.rank_shape(2))?;
        let timer = std::time::Instant::now();
        let tiles = self.tiles();
        let gamma_ov = self.vertex.block(Space::Occ, Space::Vir, self.space)?;

        let contributions = tiles
            .par_iter()
            .map(|tile| self.tile_contribution(tile, t1, x, &gamma_ov))
            .collect::<Result<Vec<Tsr>>>()?;

        // serial scatter, one writer per destination block
        for (tile, contrib) in tiles.iter().zip(contributions) {
            *&mut r2.i_mut((tile.a.clone(), tile.b.clone())) += contrib.view();
            if !tile.is_diagonal() {
                *&mut r2.i_mut((tile.b.clone(), tile.a.clone())) += contrib.transpose([1, 0, 3, 2]);
            }
        }
        tracing::debug!("Time elapsed (tiled ladder, {} tiles of width {}): {:?}", tiles.len(), self.width, timer.elapsed());
        Ok(())
    }

    /// Dressed vertex `Γ'[G,a,e] = Γ[G,a,e] - Σ_k t_ak Γ[G,k,e]` for `a` in `range`.
    fn dressed_vertex(&self, range: &Range<usize>, t1: &Tsr, gamma_ov: &Tsr) -> Result<Tsr> {
        let (nocc, nvir) = (self.space.nocc(), self.space.nvir());
        let mut gamma = self.vertex.slice(nocc + range.start..nocc + range.end, nocc..nocc + nvir)?;
        let t1_rows = t1.i(range.clone()).into_contig(RowMajor);
        self.engine.contract(&mut gamma, "Gae", &t1_rows, "ak", gamma_ov, "Gke", -1.0, true)?;
        Ok(gamma)
    }

    /// Local `w × w × No × No` contribution of one tile.
    fn tile_contribution(&self, tile: &TileDescriptor, t1: &Tsr, x: &Tsr, gamma_ov: &Tsr) -> Result<Tsr> {
        let engine = self.engine;

        // Γ'_ae Γ'_bf - Γ'_af Γ'_be
        //   = <ab||ef> - P(ab) t_bm <am||ef> + t_am t_bn <mn||ef>
        let gamma_a = self.dressed_vertex(&tile.a, t1, gamma_ov)?;
        let gamma_b = self.dressed_vertex(&tile.b, t1, gamma_ov)?;
        let mut W_abef = engine.contract_new("abef", &gamma_a, "Gae", &gamma_b, "Gbf", 1.0)?;
        engine.contract(&mut W_abef, "abef", &gamma_a, "Gaf", &gamma_b, "Gbe", -1.0, true)?;

        // (¼ τ_abmn - t_am t_bn) <mn||ef>
        let tau_ab = x.i((tile.a.clone(), tile.b.clone())).into_contig(RowMajor);
        let t1_a = t1.i(tile.a.clone()).into_contig(RowMajor);
        let t1_b = t1.i(tile.b.clone()).into_contig(RowMajor);
        let mut z_abmn = engine.sum_new("abmn", &tau_ab, "abmn", 0.25)?;
        engine.contract(&mut z_abmn, "abmn", &t1_a, "am", &t1_b, "bn", -1.0, true)?;
        engine.contract(&mut W_abef, "abef", &z_abmn, "abmn", self.oovv, "mnef", 1.0, true)?;

        engine.contract_new("abij", &W_abef, "abef", x, "efij", 0.5)
    }
}

/* #endregion */

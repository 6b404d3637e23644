//! Deterministic toy systems shared by the unit tests.

use crate::prelude::*;
use itertools::{Itertools, iproduct};

/// Reproducible values in `[-0.5, 0.5)`.
pub fn pseudo_random(n: usize, seed: u64) -> Vec<f64> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64 - 0.5
        })
        .collect()
}

pub fn toy_space(nocc: usize, nvir: usize) -> OrbitalSpace {
    let eps_occ = (0..nocc).map(|i| -1.0 + 0.1 * i as f64).collect();
    let eps_vir = (0..nvir).map(|a| 0.5 + 0.1 * a as f64).collect();
    OrbitalSpace::new(eps_occ, eps_vir)
}

/// Vertex with `Γ[G,p,q] = Γ[G,q,p]`, so the derived integrals are hermitian.
pub fn random_vertex(space: &OrbitalSpace, naux: usize, seed: u64, device: &DeviceTsr) -> CoulombVertex {
    let norb = space.nocc() + space.nvir();
    let raw = pseudo_random(naux * norb * norb, seed);
    let mut data = vec![0.0; naux * norb * norb];
    for g in 0..naux {
        for p in 0..norb {
            for q in 0..norb {
                let (x, y) = (g * norb * norb + p * norb + q, g * norb * norb + q * norb + p);
                data[x] = 0.3 * (raw[x] + raw[y]);
            }
        }
    }
    let gamma = util::tensor_from_vec(data, &[naux, norb, norb], device);
    CoulombVertex::new(gamma, space).unwrap()
}

pub fn random_vertex_integrals(space: &OrbitalSpace, naux: usize, seed: u64, device: &DeviceTsr) -> VertexIntegrals {
    VertexIntegrals::new(space.clone(), random_vertex(space, naux, seed, device), device)
}

/// Fock blocks of non-canonical orbitals: orbital energies on the diagonal
/// plus small symmetric couplings and an occupied-virtual block.
pub fn random_fock(space: &OrbitalSpace, seed: u64, device: &DeviceTsr) -> FockBlocks {
    let symmetric = |eps: &[f64], seed: u64| {
        let n = eps.len();
        let raw = pseudo_random(n * n, seed);
        let mut data = vec![0.0; n * n];
        for p in 0..n {
            for q in 0..n {
                data[p * n + q] = if p == q { eps[p] } else { 0.02 * (raw[p * n + q] + raw[q * n + p]) };
            }
        }
        util::tensor_from_vec(data, &[n, n], device)
    };
    let (nocc, nvir) = (space.nocc(), space.nvir());
    let ov = pseudo_random(nocc * nvir, seed + 2).into_iter().map(|x| 0.05 * x).collect();
    FockBlocks {
        oo: symmetric(&space.eps_occ, seed),
        vv: symmetric(&space.eps_vir, seed + 1),
        ov: Some(util::tensor_from_vec(ov, &[nocc, nvir], device)),
    }
}

/// Small singles and antisymmetric doubles.
pub fn random_amplitudes(space: &OrbitalSpace, max_rank: usize, seed: u64, device: &DeviceTsr) -> AmplitudeVector {
    let engine = DenseContraction::new(device.clone());
    let blocks = (1..=max_rank)
        .map(|rank| {
            let shape = space.rank_shape(rank);
            let data = pseudo_random(shape.iter().product(), seed + rank as u64).into_iter().map(|x| 0.1 * x).collect();
            util::tensor_from_vec(data, &shape, device)
        })
        .collect();
    let mut amplitudes = AmplitudeVector::from_blocks(blocks).unwrap();
    amplitudes.antisymmetrize_doubles(&engine).unwrap();
    amplitudes
}

/// Antisymmetrized integrals derived from a random vertex, vertex attached.
pub fn toy_integrals(space: &OrbitalSpace, naux: usize, seed: u64, engine: &DenseContraction) -> IntegralBlocks {
    let producer = random_vertex_integrals(space, naux, seed, engine.device());
    IntegralBlocks::from_producer(&producer, true, engine).unwrap()
}

pub fn assert_amplitudes_close(a: &AmplitudeVector, b: &AmplitudeVector, tol: f64) {
    for (rank, (x, y)) in a.blocks().iter().zip(b.blocks()).enumerate() {
        let diff = util::max_abs_diff(x, y).unwrap();
        assert!(diff < tol, "rank {} blocks differ by {diff:e}", rank + 1);
    }
}

/// Correlation energy of the lowest state of a two-electron system, from the
/// Hamiltonian over all determinants `|pq>`, `p < q`.
///
/// The one-body part is recovered from the Fock blocks as
/// `h_pq = f_pq - Σ_k <pk||qk>`, so the reference determinant `|01>` has
/// zero correlation energy by construction.
pub fn two_electron_full_ci(space: &OrbitalSpace, fock: &FockBlocks, ints: &IntegralBlocks) -> f64 {
    assert_eq!(space.nocc(), 2, "two electrons expected");
    let (nocc, norb) = (space.nocc(), space.nocc() + space.nvir());
    let device = fock.oo.device();
    let (occ, vir) = (0..nocc, nocc..norb);

    let mut f: Tsr = rt::zeros(([norb, norb], device));
    f.i_mut((occ.clone(), occ.clone())).assign(&fock.oo);
    f.i_mut((vir.clone(), vir.clone())).assign(&fock.vv);
    if let Some(f_ov) = &fock.ov {
        f.i_mut((occ.clone(), vir.clone())).assign(f_ov);
        f.i_mut((vir, occ)).assign(&f_ov.t());
    }
    let mut v: Tsr = rt::zeros(([norb, norb, norb, norb], device));
    for sig in Signature::all() {
        let [p, q, r, s] = sig.0.map(|x| x.range(space));
        v.i_mut((p, q, r, s)).assign(ints.block(sig).unwrap());
    }

    let h = |p: usize, q: usize| f[[p, q]] - (0..nocc).map(|k| v[[p, k, q, k]]).sum::<f64>();
    let delta = |x: usize, y: usize| if x == y { 1.0 } else { 0.0 };
    let pairs = (0..norb).tuple_combinations::<(usize, usize)>().collect_vec();
    let data = iproduct!(&pairs, &pairs)
        .map(|(&(p, q), &(r, s))| {
            h(p, r) * delta(q, s) + h(q, s) * delta(p, r) - h(p, s) * delta(q, r) - h(q, r) * delta(p, s)
                + v[[p, q, r, s]]
        })
        .collect_vec();
    let hamiltonian = util::tensor_from_vec(data, &[pairs.len(), pairs.len()], device);

    let (w, _): (Tsr, Tsr) = rt::linalg::eigh(&hamiltonian).into();
    w.min_all() - hamiltonian[[0, 0]]
}

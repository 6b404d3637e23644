#![allow(clippy::deref_addrof)]

pub mod prelude;

pub mod amplitudes;
pub mod ccsd;
pub mod contraction;
pub mod diis;
pub mod error;
pub mod hbar;
pub mod integrals;
pub mod intermediates;
pub mod iteration;
pub mod mixer;
pub mod structs;
pub mod tiling;
pub mod util;

#[cfg(test)]
mod test_support;

#[cfg(test)]
fn two_electron_toy() -> (structs::OrbitalSpace, integrals::IntegralBlocks) {
    use crate::prelude::*;
    use std::collections::HashMap;

    let engine = DenseContraction::default();
    let space = OrbitalSpace::new(vec![-1.0, -0.9], vec![0.5, 0.6]);
    let mut blocks = Signature::all()
        .map(|sig| {
            let shape = sig.shape(&space);
            (sig, util::tensor_from_vec(vec![0.0; shape.iter().product()], &shape, engine.device()))
        })
        .collect::<HashMap<_, _>>();
    // <01||01> and its antisymmetric partners, in oovv and the hermitian vvoo
    let mut v = vec![0.0; 16];
    for (p, q, r, s, x) in [(0, 1, 0, 1, 0.1), (1, 0, 0, 1, -0.1), (0, 1, 1, 0, -0.1), (1, 0, 1, 0, 0.1)] {
        v[((p * 2 + q) * 2 + r) * 2 + s] = x;
    }
    for sig in ["oovv", "vvoo"] {
        blocks.insert(sig.parse().unwrap(), util::tensor_from_vec(v.clone(), &[2, 2, 2, 2], engine.device()));
    }
    let ints = IntegralBlocks::from_blocks(&space, blocks, false, &engine).unwrap();
    (space, ints)
}

#[test]
fn playground_toy_single_iteration() {
    use crate::prelude::*;

    let engine = DenseContraction::default();
    let (space, ints) = two_electron_toy();
    let fock = FockBlocks::canonical(&space, engine.device());
    let ccsd = Ccsd::new(&space, &fock, &ints, &engine).unwrap();

    for mode in [EvaluationMode::Direct, EvaluationMode::CachedIntermediate] {
        let config = CcConfig { max_iterations: 1, evaluation_mode: mode, ..Default::default() };
        let results = IterationEngine::new(&ccsd, &config).unwrap().run(None).unwrap();
        assert_eq!(results.status, ConvergenceStatus::MaxIterationsReached);

        let t2 = util::tensor_to_vec(results.amplitudes.get(2).unwrap());
        // [a=0, b=1, i=0, j=1], denominator 0.5 + 0.6 + 1.0 + 0.9
        assert!((t2[5] + 0.1 / 3.0).abs() < 1e-14);
        assert!((t2[6] - 0.1 / 3.0).abs() < 1e-14);
        let t1 = util::tensor_to_vec(results.amplitudes.get(1).unwrap());
        assert!(t1.iter().all(|&x| x == 0.0));
        assert!((results.e_corr + 0.01 / 3.0).abs() < 1e-14);
        println!("Toy energy after one iteration ({mode:?}): {}", results.e_corr);
    }
}

#[test]
fn playground_toy_converged() {
    use crate::prelude::*;

    let engine = DenseContraction::default();
    let (space, ints) = two_electron_toy();
    let fock = FockBlocks::canonical(&space, engine.device());
    let ccsd = Ccsd::new(&space, &fock, &ints, &engine).unwrap();
    let config = CcConfig { mixer: MixerKind::Diis, max_iterations: 40, ..Default::default() };
    let results = IterationEngine::new(&ccsd, &config).unwrap().run(None).unwrap();
    assert!(results.converged());
    assert!(results.e_corr < -0.01 / 3.0 * 0.9 && results.e_corr > -0.01 / 3.0 * 1.1);
    assert!((results.pair_energy.sum_all() - results.e_corr).abs() < 1e-14);
    println!("Toy CCSD Corr Energy: {}", results.e_corr);
}

#[test]
fn playground_vertex_ccsd() {
    use crate::prelude::*;
    use crate::test_support::*;

    let engine = DenseContraction::default();
    let space = toy_space(3, 5);
    let producer = random_vertex_integrals(&space, 4, 71, engine.device());
    let config = CcConfig {
        mixer: MixerKind::Diis,
        max_iterations: 50,
        energy_tolerance: 1e-10,
        amplitude_tolerance: 1e-8,
        integrals_tile_size: Some(2),
        antisymmetrize_integrals: true,
        ..Default::default()
    };
    let (fock, ints) = IntegralBlocks::load(&producer, &config, &engine).unwrap();

    let tiled = Ccsd::new(&space, &fock, &ints, &engine).unwrap().with_config(&config).unwrap();
    let results = IterationEngine::new(&tiled, &config).unwrap().run(None).unwrap();
    assert!(results.converged());
    println!("CCSD Corr Energy (tiled): {}", results.e_corr);

    let dir = std::env::temp_dir().join(format!("ccsolver-playground-{}", std::process::id()));
    util::store_amplitudes(&dir, "Ccsd", &results.amplitudes).unwrap();
    let seed = util::load_seed_amplitudes(&dir, "Ccsd", &space, 2, engine.device()).unwrap();
    std::fs::remove_dir_all(&dir).unwrap();

    let config = CcConfig { evaluation_mode: EvaluationMode::Direct, integrals_tile_size: None, ..config };
    let direct = Ccsd::new(&space, &fock, &ints, &engine).unwrap().with_config(&config).unwrap();
    let restarted = IterationEngine::new(&direct, &config).unwrap().run(seed).unwrap();
    assert!(restarted.converged());
    assert!(restarted.niter < results.niter);
    assert!((restarted.e_corr - results.e_corr).abs() < 1e-9);

    let hbar = SimilarityTransformedHamiltonian::new(
        &space,
        &fock,
        &ints,
        &engine,
        &restarted.amplitudes,
        EvaluationMode::CachedIntermediate,
    )
    .unwrap();
    let guess = hbar.diagonal_guess();
    let sigma = hbar.right_apply(&guess).unwrap();
    println!("<D|H̄|D> = {}", guess.dot(&sigma).unwrap());
}

//! The fixed-point amplitude iteration.

use crate::prelude::*;

/// Drives `T <- mix(-R'(T) / (D + s))` until the energy and the amplitudes
/// both stop changing.
pub struct IterationEngine<'a> {
    equations: &'a dyn AmplitudeEquations,
    config: &'a CcConfig,
}

/// `|x - prev| / |x|`, zero when both vanish.
fn relative_change(x: f64, prev: f64) -> f64 {
    match (x == 0.0, x == prev) {
        (_, true) => 0.0,
        (true, false) => f64::INFINITY,
        (false, false) => (x - prev).abs() / x.abs(),
    }
}

impl<'a> IterationEngine<'a> {
    /// Configuration errors are reported here, before any iteration is done.
    pub fn new(equations: &'a dyn AmplitudeEquations, config: &'a CcConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { equations, config })
    }

    /// Iterate from `seed`, or from zero amplitudes.
    pub fn run(&self, seed: Option<AmplitudeVector>) -> Result<CcResults> {
        let cfg = self.config;
        let eqs = self.equations;
        let space = eqs.orbital_space();
        let device = eqs.engine().device();

        let zeros = AmplitudeVector::zeros(space, eqs.max_rank(), device);
        let mut amplitudes = match seed {
            Some(seed) => {
                zeros.check_compatible(&seed)?;
                seed
            },
            None => zeros,
        };
        if cfg.max_iterations == 0 {
            let e_corr = eqs.energy(&amplitudes)?;
            tracing::info!("No iterations requested, energy of the starting amplitudes: {e_corr:.12}");
            let pair_energy = eqs.pair_energy(&amplitudes)?;
            return Ok(CcResults { e_corr, amplitudes, status: ConvergenceStatus::Converged, niter: 0, pair_energy });
        }

        let denominators = Denominators::new(space, eqs.max_rank(), cfg.level_shift, device);
        let mut mixer = cfg.mixer.build(cfg);
        tracing::info!(
            "Amplitude iteration: mixer {:?}, evaluation {:?}, level shift {}",
            cfg.mixer,
            cfg.evaluation_mode,
            cfg.level_shift
        );

        // the first iteration is compared against zero energy, seeded or not
        let mut e_corr = 0.0;
        for niter in 1..=cfg.max_iterations {
            let timer = std::time::Instant::now();

            let mut estimate = eqs.residual(&amplitudes, cfg.evaluation_mode)?;
            if cfg.level_shift != 0.0 {
                estimate.add(&amplitudes, -cfg.level_shift)?;
            }
            denominators.precondition(&mut estimate)?;
            let change = estimate.sub(&amplitudes)?;
            let change_norm = change.norm_squared();
            mixer.append(estimate, change)?;
            amplitudes = mixer.current()?;

            let e_prev = e_corr;
            e_corr = eqs.energy(&amplitudes)?;
            let de = relative_change(e_corr, e_prev);
            let norm = amplitudes.norm_squared();
            let dt = if change_norm == 0.0 { 0.0 } else { change_norm / norm };

            tracing::info!("Iteration {niter:3}: energy {e_corr:.12}, rel. energy change {de:.3e}, rel. |ΔT|² {dt:.3e}");
            tracing::debug!("Time elapsed (iteration {niter}): {:?}", timer.elapsed());

            if de < cfg.energy_tolerance && dt < cfg.amplitude_tolerance.powi(2) {
                tracing::info!("Converged in {niter} iterations.");
                let pair_energy = eqs.pair_energy(&amplitudes)?;
                return Ok(CcResults { e_corr, amplitudes, status: ConvergenceStatus::Converged, niter, pair_energy });
            }
        }

        tracing::warn!("Not converged within {} iterations.", cfg.max_iterations);
        let pair_energy = eqs.pair_energy(&amplitudes)?;
        Ok(CcResults {
            e_corr,
            amplitudes,
            status: ConvergenceStatus::MaxIterationsReached,
            niter: cfg.max_iterations,
            pair_energy,
        })
    }
}

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

    fn fixture() -> Fixture {
        let engine = DenseContraction::default();
        let space = toy_space(2, 3);
        let ints = toy_integrals(&space, 3, 51, &engine);
        let fock = FockBlocks::canonical(&space, engine.device());
        Fixture { engine, space, fock, ints }
    }

    fn solve(f: &Fixture, config: &CcConfig, seed: Option<AmplitudeVector>) -> CcResults {
        let ccsd = Ccsd::new(&f.space, &f.fock, &f.ints, &f.engine).unwrap();
        IterationEngine::new(&ccsd, config).unwrap().run(seed).unwrap()
    }

    /// `H̄(T) = B + c T∘T + D∘T` over ranks 1 to 3, so `R(T) = B + c T∘T` and
    /// the solution obeys `D∘T = -(B + c T∘T)`.
    struct Quadratic {
        space: OrbitalSpace,
        engine: DenseContraction,
        rhs: AmplitudeVector,
        coupling: f64,
    }

    impl AmplitudeEquations for Quadratic {
        fn orbital_space(&self) -> &OrbitalSpace {
            &self.space
        }

        fn max_rank(&self) -> usize {
            3
        }

        fn engine(&self) -> &dyn ContractionEngine {
            &self.engine
        }

        fn residual(&self, amplitudes: &AmplitudeVector, _mode: EvaluationMode) -> Result<AmplitudeVector> {
            let mut r = self.rhs.clone();
            r.add(&amplitudes.hadamard(amplitudes)?, self.coupling)?;
            Ok(r)
        }

        fn energy(&self, amplitudes: &AmplitudeVector) -> Result<f64> {
            amplitudes.dot(&self.rhs)
        }

        fn pair_energy(&self, amplitudes: &AmplitudeVector) -> Result<Tsr> {
            let nocc = self.space.nocc();
            let mut pairs = self.engine.zeros(&[nocc, nocc]);
            pairs[[0, 0]] = self.energy(amplitudes)?;
            Ok(pairs)
        }
    }

    #[test]
    fn test_diis_solves_triples_rank_equations() {
        let engine = DenseContraction::default();
        let space = toy_space(2, 3);
        let rhs = random_amplitudes(&space, 3, 61, engine.device());
        let eqs = Quadratic { space: space.clone(), engine: engine.clone(), rhs, coupling: 0.5 };

        let config = CcConfig {
            mixer: MixerKind::Diis,
            max_residua: 3,
            max_iterations: 50,
            energy_tolerance: 1e-12,
            amplitude_tolerance: 1e-10,
            level_shift: 0.1,
            ..Default::default()
        };
        let diis = IterationEngine::new(&eqs, &config).unwrap().run(None).unwrap();
        assert!(diis.converged());
        assert_eq!(diis.amplitudes.max_rank(), 3);
        assert_eq!(diis.amplitudes.get(3).unwrap().shape().as_slice(), &[3, 3, 3, 2, 2, 2]);
        let denominators = Denominators::new(&space, 3, 0.0, engine.device());
        let mut equation = eqs.residual(&diis.amplitudes, EvaluationMode::Direct).unwrap();
        equation.add(&denominators.as_amplitudes().hadamard(&diis.amplitudes).unwrap(), 1.0).unwrap();
        assert!(equation.norm_squared() < 1e-16);

        let linear = CcConfig { mixer: MixerKind::Linear, ..config };
        let linear = IterationEngine::new(&eqs, &linear).unwrap().run(None).unwrap();
        assert!(linear.converged());
        assert!((linear.e_corr - diis.e_corr).abs() < 1e-12);
        assert_amplitudes_close(&linear.amplitudes, &diis.amplitudes, 1e-9);
    }

    #[test]
    fn test_relative_change() {
        assert_eq!(relative_change(0.0, 0.0), 0.0);
        assert_eq!(relative_change(0.0, 1.0), f64::INFINITY);
        assert!((relative_change(-2.0, -1.0) - 0.5).abs() < 1e-15);
    }

    #[test]
    fn test_zero_iterations_returns_seed_energy() {
        let f = fixture();
        let ccsd = Ccsd::new(&f.space, &f.fock, &f.ints, &f.engine).unwrap();
        let seed = random_amplitudes(&f.space, 2, 52, f.engine.device());
        let config = CcConfig { max_iterations: 0, ..Default::default() };
        let results = IterationEngine::new(&ccsd, &config).unwrap().run(Some(seed.clone())).unwrap();
        assert!(results.converged());
        assert_eq!(results.niter, 0);
        assert_eq!(results.e_corr, ccsd.energy(&seed).unwrap());
        assert_amplitudes_close(&results.amplitudes, &seed, 1e-15);
    }

    #[test]
    fn test_converged_amplitudes_are_a_fixed_point() {
        let f = fixture();
        let tight =
            CcConfig { max_iterations: 60, energy_tolerance: 1e-11, amplitude_tolerance: 1e-9, ..Default::default() };
        let first = solve(&f, &tight, None);
        assert!(first.converged());
        assert!(first.e_corr < 0.0);

        // the first restarted iteration still sees a full energy change against zero
        let restart = solve(&f, &CcConfig::default(), Some(first.amplitudes.clone()));
        assert!(restart.converged());
        assert_eq!(restart.niter, 2);
        assert!((restart.e_corr - first.e_corr).abs() < 1e-10);
    }

    #[test]
    fn test_mixers_and_modes_reach_the_same_solution() {
        let f = fixture();
        let reference = CcConfig {
            max_iterations: 60,
            energy_tolerance: 1e-10,
            amplitude_tolerance: 1e-8,
            evaluation_mode: EvaluationMode::Direct,
            ..Default::default()
        };
        let linear = solve(&f, &reference, None);
        assert!(linear.converged());
        let diis_config =
            CcConfig { mixer: MixerKind::Diis, evaluation_mode: EvaluationMode::CachedIntermediate, ..reference.clone() };
        let diis = solve(&f, &diis_config, None);
        let shifted_config = CcConfig { level_shift: 0.2, mixing_ratio: 0.8, max_iterations: 200, ..reference.clone() };
        let shifted = solve(&f, &shifted_config, None);
        for other in [&diis, &shifted] {
            assert!(other.converged());
            assert!((other.e_corr - linear.e_corr).abs() < 1e-8);
        }
    }

    #[test]
    fn test_iteration_budget_exhaustion_is_a_status() {
        let f = fixture();
        let config =
            CcConfig { max_iterations: 2, energy_tolerance: 1e-14, amplitude_tolerance: 1e-14, ..Default::default() };
        let results = solve(&f, &config, None);
        assert_eq!(results.status, ConvergenceStatus::MaxIterationsReached);
        assert_eq!(results.niter, 2);
        assert!(results.e_corr.is_finite() && results.e_corr != 0.0);
    }

    #[test]
    fn test_invalid_configuration_aborts_before_iterating() {
        let f = fixture();
        let ccsd = Ccsd::new(&f.space, &f.fock, &f.ints, &f.engine).unwrap();
        let config = CcConfig { integrals_tile_size: Some(0), ..Default::default() };
        assert!(matches!(IterationEngine::new(&ccsd, &config), Err(CcError::InvalidConfig(_))));

        let config = CcConfig::default();
        let engine = IterationEngine::new(&ccsd, &config).unwrap();
        let wrong_seed = AmplitudeVector::zeros(&toy_space(2, 2), 2, f.engine.device());
        assert!(matches!(engine.run(Some(wrong_seed)), Err(CcError::ShapeMismatch { .. })));
    }
}

use ccsolver_rstsr::prelude::*;
use ccsolver_rstsr::*;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct CliParser {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, action = clap::ArgAction::Count, global = true, help = "Increase log verbosity (-v debug, -vv trace)")]
    verbose: u8,
}

#[derive(Args, Debug)]
struct CliArgs {
    #[clap(short, long = "input", help = "Directory with orbital energies, Coulomb integrals and Fock matrices (.npy)")]
    input_dir: PathBuf,

    #[clap(long, help = "Treat the integral files as bare Coulomb integrals and antisymmetrize them")]
    antisymmetrize: bool,

    #[clap(long = "non-canonical", help = "Read the Fock matrices instead of assuming canonical orbitals")]
    non_canonical: bool,

    #[clap(long, default_value = "Ccsd", help = "Name prefix of amplitude files")]
    name: String,
}

#[derive(Args, Debug)]
struct CliArgsIteration {
    #[clap(flatten)]
    input: CliArgs,

    #[clap(long, default_value = "linear", help = "Mixer: linear or diis")]
    mixer: MixerKind,

    #[clap(long = "mixing-ratio", default_value_t = 1.0)]
    mixing_ratio: f64,

    #[clap(long = "max-residua", default_value_t = 4, help = "DIIS history capacity")]
    max_residua: usize,

    #[clap(long = "max-iterations", default_value_t = 16)]
    max_iterations: usize,

    #[clap(long = "energy-tolerance", default_value_t = 1.0e-6)]
    energy_tolerance: f64,

    #[clap(long = "amplitude-tolerance", default_value_t = 1.0e-5)]
    amplitude_tolerance: f64,

    #[clap(long = "level-shift", default_value_t = 0.0)]
    level_shift: f64,

    #[clap(long, default_value = "cached", help = "Evaluation mode: direct or cached")]
    mode: EvaluationMode,

    #[clap(long = "tile-size", help = "Width of the virtual tiles of the ladder term (requires CoulombVertex.npy)")]
    tile_size: Option<usize>,

    #[clap(long = "tile-memory", help = "Memory budget in bytes per ladder tile, used when --tile-size is absent")]
    tile_memory: Option<usize>,

    #[clap(long, help = "Directory to start from stored amplitudes")]
    seed: Option<PathBuf>,

    #[clap(short, long = "output", help = "Directory to store the final amplitudes")]
    output_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[clap(name = "ccsd", about = "Iterate the CCSD amplitude equations")]
    Ccsd(CliArgsIteration),

    #[clap(name = "energy", about = "Evaluate the CCSD energy of stored amplitudes")]
    Energy {
        #[clap(flatten)]
        input: CliArgs,

        #[clap(long, help = "Directory with the stored amplitudes")]
        seed: PathBuf,
    },
}

fn load_integrals(
    producer: &NpyIntegrals,
    config: &CcConfig,
    engine: &DenseContraction,
) -> Result<(FockBlocks, IntegralBlocks)> {
    let timer = std::time::Instant::now();
    let blocks = IntegralBlocks::load(producer, config, engine)?;
    tracing::info!("Time elapsed (loading integrals): {:?}", timer.elapsed());
    Ok(blocks)
}

fn load_seed(dir: &Path, name: &str, space: &OrbitalSpace, device: &DeviceTsr) -> Result<Option<AmplitudeVector>> {
    let seed = util::load_seed_amplitudes(dir, name, space, 2, device)?;
    if seed.is_none() {
        tracing::warn!("No {name} amplitudes found in {}, starting from zero", dir.display());
    }
    Ok(seed)
}

fn run_ccsd(args: CliArgsIteration) -> Result<()> {
    let engine = DenseContraction::default();
    let producer = NpyIntegrals::open(&args.input.input_dir, engine.device())?;
    let space = producer.orbital_space().clone();

    let tile_size = match (args.tile_size, args.tile_memory) {
        (Some(width), _) => Some(width),
        (None, Some(bytes)) => Some(tiling::tile_width_for_budget(bytes, space.nvir())),
        (None, None) => None,
    };
    let config = CcConfig {
        mixer: args.mixer,
        mixing_ratio: args.mixing_ratio,
        max_residua: args.max_residua,
        max_iterations: args.max_iterations,
        energy_tolerance: args.energy_tolerance,
        amplitude_tolerance: args.amplitude_tolerance,
        level_shift: args.level_shift,
        evaluation_mode: args.mode,
        integrals_tile_size: tile_size,
        antisymmetrize_integrals: args.input.antisymmetrize,
        use_non_canonical_orbitals: args.input.non_canonical,
    };

    let (fock, ints) = load_integrals(&producer, &config, &engine)?;
    let ccsd = Ccsd::new(&space, &fock, &ints, &engine)?.with_config(&config)?;
    let engine_loop = IterationEngine::new(&ccsd, &config)?;
    let seed = match &args.seed {
        Some(dir) => load_seed(dir, &args.input.name, &space, engine.device())?,
        None => None,
    };

    let timer = std::time::Instant::now();
    let results = engine_loop.run(seed)?;
    tracing::info!("Time elapsed (ccsd iteration): {:?}", timer.elapsed());

    println!("CCSD Corr Energy: {}", results.e_corr);
    if !results.converged() {
        println!("CCSD not converged after {} iterations.", results.niter);
    }
    if let Some(dir) = &args.output_dir {
        util::store_amplitudes(dir, &args.input.name, &results.amplitudes)?;
    }
    Ok(())
}

fn run_energy(input: CliArgs, seed: PathBuf) -> Result<()> {
    let engine = DenseContraction::default();
    let producer = NpyIntegrals::open(&input.input_dir, engine.device())?;
    let space = producer.orbital_space().clone();
    let config = CcConfig {
        max_iterations: 0,
        antisymmetrize_integrals: input.antisymmetrize,
        use_non_canonical_orbitals: input.non_canonical,
        ..Default::default()
    };
    let (fock, ints) = load_integrals(&producer, &config, &engine)?;
    let amplitudes = util::load_seed_amplitudes(&seed, &input.name, &space, 2, engine.device())?
        .ok_or_else(|| CcError::MissingSeed(seed.display().to_string()))?;

    let ccsd = Ccsd::new(&space, &fock, &ints, &engine)?.with_config(&config)?;
    let results = IterationEngine::new(&ccsd, &config)?.run(Some(amplitudes))?;
    println!("CCSD Corr Energy: {}", results.e_corr);
    Ok(())
}

fn main() -> Result<()> {
    let args = CliParser::parse();
    util::init_logger(args.verbose);

    match args.command {
        Command::Ccsd(cli_args) => run_ccsd(cli_args),
        Command::Energy { input, seed } => run_energy(input, seed),
    }
}
